//! Workflow graph types.
//!
//! A workflow graph is the per-pipeline DAG of jobs. Edges may point into
//! other pipelines; those endpoints are written `sd@<pipeline>:<job>`.

use crate::build::ParentKey;
use crate::ids::PipelineId;
use schemars::JsonSchema;
use schemars::r#gen::SchemaGenerator;
use schemars::schema::Schema;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

const REMOTE_PREFIX: &str = "sd@";
const START_MARKER_PREFIX: char = '~';

/// How a node combines the reports of the parents feeding it.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum JoinType {
    /// Every parent must succeed.
    #[default]
    And,
    /// One successful parent is enough.
    Or,
}

impl fmt::Display for JoinType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JoinType::And => write!(f, "and"),
            JoinType::Or => write!(f, "or"),
        }
    }
}

/// Reference to a job, optionally qualified with the pipeline it lives in.
///
/// An unqualified reference always means "the pipeline owning the graph".
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct JobRef {
    pub pipeline_id: Option<PipelineId>,
    pub name: String,
}

impl JobRef {
    pub fn local(name: impl Into<String>) -> Self {
        Self {
            pipeline_id: None,
            name: name.into(),
        }
    }

    pub fn remote(pipeline_id: PipelineId, name: impl Into<String>) -> Self {
        Self {
            pipeline_id: Some(pipeline_id),
            name: name.into(),
        }
    }

    /// Synthetic start markers such as `~commit` or `~pr`.
    pub fn is_start_marker(&self) -> bool {
        self.pipeline_id.is_none() && self.name.starts_with(START_MARKER_PREFIX)
    }

    /// Pipeline this reference points into, relative to `owner`.
    pub fn pipeline_in(&self, owner: PipelineId) -> PipelineId {
        self.pipeline_id.unwrap_or(owner)
    }

    /// Fully qualified key for this job, relative to `owner`.
    pub fn qualify(&self, owner: PipelineId) -> ParentKey {
        ParentKey::new(self.pipeline_in(owner), self.name.clone())
    }
}

impl fmt::Display for JobRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.pipeline_id {
            Some(pipeline_id) => write!(f, "{REMOTE_PREFIX}{pipeline_id}:{}", self.name),
            None => write!(f, "{}", self.name),
        }
    }
}

impl FromStr for JobRef {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let Some(rest) = s.strip_prefix(REMOTE_PREFIX) else {
            if s.is_empty() {
                return Err("empty job reference".to_string());
            }
            return Ok(Self::local(s));
        };

        let (pipeline, name) = rest
            .split_once(':')
            .ok_or_else(|| format!("remote job reference without job name: {s}"))?;
        if name.is_empty() {
            return Err(format!("remote job reference without job name: {s}"));
        }
        let pipeline_id = pipeline
            .parse::<PipelineId>()
            .map_err(|e| format!("invalid pipeline in {s}: {e}"))?;

        Ok(Self::remote(pipeline_id, name))
    }
}

impl TryFrom<String> for JobRef {
    type Error = String;

    fn try_from(value: String) -> std::result::Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<JobRef> for String {
    fn from(value: JobRef) -> Self {
        value.to_string()
    }
}

impl JsonSchema for JobRef {
    fn schema_name() -> String {
        "JobRef".to_string()
    }

    fn json_schema(generator: &mut SchemaGenerator) -> Schema {
        String::json_schema(generator)
    }
}

/// A directed edge of the workflow graph.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct Edge {
    pub src: JobRef,
    pub dest: JobRef,
    #[serde(default)]
    pub join: JoinType,
}

/// Immutable per-pipeline DAG of jobs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct WorkflowGraph {
    #[serde(default)]
    pub nodes: Vec<JobRef>,
    #[serde(default)]
    pub edges: Vec<Edge>,
}

impl WorkflowGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an edge, registering both endpoints as nodes.
    pub fn with_edge(mut self, src: JobRef, dest: JobRef, join: JoinType) -> Self {
        for node in [&src, &dest] {
            if !self.nodes.contains(node) {
                self.nodes.push(node.clone());
            }
        }
        self.edges.push(Edge { src, dest, join });
        self
    }

    /// Add a node without edges.
    pub fn with_node(mut self, node: JobRef) -> Self {
        if !self.nodes.contains(&node) {
            self.nodes.push(node);
        }
        self
    }

    /// Edges leaving the local job `job`.
    pub fn outgoing<'a>(&'a self, job: &'a str) -> impl Iterator<Item = &'a Edge> + 'a {
        self.edges
            .iter()
            .filter(move |e| e.src.pipeline_id.is_none() && e.src.name == job)
    }

    /// Edges entering the local job `job`.
    pub fn incoming<'a>(&'a self, job: &'a str) -> impl Iterator<Item = &'a Edge> + 'a {
        self.edges
            .iter()
            .filter(move |e| e.dest.pipeline_id.is_none() && e.dest.name == job)
    }

    /// Names of the local, non-marker jobs.
    pub fn job_names(&self) -> impl Iterator<Item = &str> {
        self.nodes
            .iter()
            .filter(|n| n.pipeline_id.is_none() && !n.is_start_marker())
            .map(|n| n.name.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_remote_ref_roundtrip() {
        let pipeline_id = PipelineId::new();
        let job = JobRef::remote(pipeline_id, "deploy");
        let text = job.to_string();
        assert!(text.starts_with("sd@pip_"));
        assert_eq!(text.parse::<JobRef>().unwrap(), job);
    }

    #[test]
    fn test_local_ref_parse() {
        let job: JobRef = "build".parse().unwrap();
        assert_eq!(job, JobRef::local("build"));
        assert!(!job.is_start_marker());
        assert!(JobRef::local("~commit").is_start_marker());
    }

    #[test]
    fn test_invalid_refs() {
        assert!("".parse::<JobRef>().is_err());
        assert!("sd@nope".parse::<JobRef>().is_err());
        assert!("sd@not-a-uuid:deploy".parse::<JobRef>().is_err());
    }

    #[test]
    fn test_graph_edges() {
        let remote = PipelineId::new();
        let graph = WorkflowGraph::new()
            .with_edge(JobRef::local("~commit"), JobRef::local("build"), JoinType::Or)
            .with_edge(JobRef::local("build"), JobRef::local("test"), JoinType::And)
            .with_edge(
                JobRef::local("build"),
                JobRef::remote(remote, "deploy"),
                JoinType::And,
            );

        assert_eq!(graph.outgoing("build").count(), 2);
        assert_eq!(graph.incoming("test").count(), 1);
        assert_eq!(graph.incoming("deploy").count(), 0);
        assert_eq!(graph.job_names().collect::<Vec<_>>(), vec!["build", "test"]);
    }

    #[test]
    fn test_graph_deserializes_remote_edges() {
        let pipeline_id = PipelineId::new();
        let json = format!(
            r#"{{"nodes":["build","sd@{pipeline_id}:deploy"],"edges":[{{"src":"build","dest":"sd@{pipeline_id}:deploy","join":"or"}}]}}"#
        );
        let graph: WorkflowGraph = serde_json::from_str(&json).unwrap();
        assert_eq!(graph.edges[0].dest, JobRef::remote(pipeline_id, "deploy"));
        assert_eq!(graph.edges[0].join, JoinType::Or);
    }
}

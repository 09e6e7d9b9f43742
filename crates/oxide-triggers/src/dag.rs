//! Workflow graph validation.

use oxide_core::pipeline::Pipeline;
use oxide_core::workflow::JobRef;
use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use std::collections::HashMap;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GraphError {
    #[error("Cycle detected in workflow of pipeline {0}")]
    CycleDetected(String),
    #[error("Edge references unknown job: {0}")]
    UnknownJob(String),
    #[error("Start marker {0} cannot be an edge destination")]
    MarkerDestination(String),
}

impl From<GraphError> for oxide_core::Error {
    fn from(err: GraphError) -> Self {
        oxide_core::Error::Configuration(err.to_string())
    }
}

/// Checks that a pipeline's workflow graph can drive trigger resolution.
pub struct GraphValidator;

impl GraphValidator {
    pub fn new() -> Self {
        Self
    }

    /// Validate the workflow graph of a pipeline.
    pub fn validate(&self, pipeline: &Pipeline) -> Result<(), GraphError> {
        let graph = &pipeline.workflow_graph;
        let mut dag = DiGraph::<&JobRef, ()>::new();
        let mut index: HashMap<&JobRef, NodeIndex> = HashMap::new();

        for node in &graph.nodes {
            index.entry(node).or_insert_with(|| dag.add_node(node));
        }

        for edge in &graph.edges {
            if edge.dest.is_start_marker() {
                return Err(GraphError::MarkerDestination(edge.dest.to_string()));
            }
            let src = Self::node(&mut dag, &mut index, &edge.src)?;
            let dest = Self::node(&mut dag, &mut index, &edge.dest)?;
            dag.add_edge(src, dest, ());
        }

        toposort(&dag, None).map_err(|_| GraphError::CycleDetected(pipeline.name.clone()))?;
        Ok(())
    }

    fn node<'a>(
        dag: &mut DiGraph<&'a JobRef, ()>,
        index: &mut HashMap<&'a JobRef, NodeIndex>,
        job: &'a JobRef,
    ) -> Result<NodeIndex, GraphError> {
        if let Some(idx) = index.get(job) {
            return Ok(*idx);
        }
        // Remote endpoints are declared by the pipeline that owns them.
        if job.pipeline_id.is_none() {
            return Err(GraphError::UnknownJob(job.to_string()));
        }
        let idx = dag.add_node(job);
        index.insert(job, idx);
        Ok(idx)
    }
}

impl Default for GraphValidator {
    fn default() -> Self {
        Self::new()
    }
}

//! Test fixtures for creating sample pipelines and builds.

use chrono::Utc;
use oxide_core::build::{Build, BuildStatus, ParentBuilds};
use oxide_core::event::{Event, NewEvent};
use oxide_core::ids::{BuildId, JobId, PipelineId};
use oxide_core::pipeline::Pipeline;
use oxide_core::workflow::{JobRef, JoinType, WorkflowGraph};

/// Factory for creating test pipelines.
pub struct PipelineFixture;

impl PipelineFixture {
    pub fn new(owner: &str, name: &str, graph: WorkflowGraph) -> Pipeline {
        Self::with_id(PipelineId::new(), owner, name, graph)
    }

    pub fn with_id(id: PipelineId, owner: &str, name: &str, graph: WorkflowGraph) -> Pipeline {
        Pipeline {
            id,
            name: name.to_string(),
            owner: owner.to_string(),
            workflow_graph: graph,
        }
    }

    /// `~commit → build, test`; `build, test → deploy` joined with `join`.
    pub fn fan_in(join: JoinType) -> Pipeline {
        let graph = WorkflowGraph::new()
            .with_edge(JobRef::local("~commit"), JobRef::local("build"), JoinType::Or)
            .with_edge(JobRef::local("~commit"), JobRef::local("test"), JoinType::Or)
            .with_edge(JobRef::local("build"), JobRef::local("deploy"), join)
            .with_edge(JobRef::local("test"), JobRef::local("deploy"), join);
        Self::new("octo", "fan-in", graph)
    }

    /// `~commit → a → v1 → v2 → b`, where `v1` and `v2` are meant to be
    /// registered as virtual.
    pub fn virtual_chain() -> Pipeline {
        let graph = WorkflowGraph::new()
            .with_edge(JobRef::local("~commit"), JobRef::local("a"), JoinType::Or)
            .with_edge(JobRef::local("a"), JobRef::local("v1"), JoinType::And)
            .with_edge(JobRef::local("v1"), JobRef::local("v2"), JoinType::And)
            .with_edge(JobRef::local("v2"), JobRef::local("b"), JoinType::And);
        Self::new("octo", "virtual-chain", graph)
    }

    /// `count` shards that all feed `merge` through an AND join.
    pub fn shards(count: usize) -> Pipeline {
        let graph = (0..count).fold(WorkflowGraph::new(), |graph, i| {
            let shard = format!("shard-{i}");
            graph
                .with_edge(JobRef::local("~commit"), JobRef::local(shard.clone()), JoinType::Or)
                .with_edge(JobRef::local(shard), JobRef::local("merge"), JoinType::And)
        });
        Self::new("octo", "shards", graph)
    }
}

/// Factory for creating test events.
pub struct EventFixture;

impl EventFixture {
    /// A commit event starting a new causal chain in `pipeline`.
    pub fn commit(pipeline: &Pipeline) -> NewEvent {
        NewEvent {
            pipeline_id: pipeline.id,
            causal_root: None,
            parent_event_id: None,
            origin_build: None,
            sha: "4f2a9c1d8e7b".to_string(),
            git_ref: Some("refs/heads/main".to_string()),
        }
    }
}

/// Factory for creating test builds.
pub struct BuildFixture;

impl BuildFixture {
    /// A build of `job_name` in `event` that finished with `status`.
    pub fn finished(event: &Event, job_id: JobId, job_name: &str, status: BuildStatus) -> Build {
        Build {
            id: BuildId::new(),
            pipeline_id: event.pipeline_id,
            job_id,
            job_name: job_name.to_string(),
            event_id: event.id,
            status,
            parent_builds: ParentBuilds::new(),
            parent_build_ids: vec![],
            sha: event.sha.clone(),
            created_at: Utc::now(),
        }
    }
}

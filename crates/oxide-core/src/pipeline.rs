//! Pipeline and job types.

use crate::ids::{JobId, PipelineId};
use crate::workflow::WorkflowGraph;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Pipeline {
    pub id: PipelineId,
    pub name: String,
    /// Repository owner; pipelines with different owners do not trust each
    /// other implicitly.
    pub owner: String,
    pub workflow_graph: WorkflowGraph,
}

impl Pipeline {
    pub fn same_owner(&self, other: &Pipeline) -> bool {
        self.owner == other.owner
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Job {
    pub id: JobId,
    pub pipeline_id: PipelineId,
    pub name: String,
    /// A join point with no executable steps.
    #[serde(default, rename = "virtual")]
    pub is_virtual: bool,
}

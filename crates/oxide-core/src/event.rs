//! Events: one causal run of a pipeline's workflow.

use crate::ids::{BuildId, EventId, PipelineId};
use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Event {
    pub id: EventId,
    pub pipeline_id: PipelineId,
    /// First event of the causal chain; equal to `id` for a chain root.
    pub causal_root: EventId,
    pub parent_event_id: Option<EventId>,
    /// Build whose completion created this event, for cross-pipeline chains.
    pub origin_build: Option<BuildId>,
    pub sha: String,
    pub git_ref: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub processing_error: Option<String>,
}

impl Event {
    pub fn is_open(&self) -> bool {
        self.completed_at.is_none()
    }
}

/// Request to create an event.
#[derive(Debug, Clone)]
pub struct NewEvent {
    pub pipeline_id: PipelineId,
    /// `None` starts a new causal chain rooted at the created event.
    pub causal_root: Option<EventId>,
    pub parent_event_id: Option<EventId>,
    pub origin_build: Option<BuildId>,
    pub sha: String,
    pub git_ref: Option<String>,
}

impl NewEvent {
    /// An event in `pipeline_id` continuing the causal chain of `parent`.
    pub fn downstream_of(parent: &Event, pipeline_id: PipelineId, origin_build: Option<BuildId>) -> Self {
        Self {
            pipeline_id,
            causal_root: Some(parent.causal_root),
            parent_event_id: Some(parent.id),
            origin_build,
            sha: parent.sha.clone(),
            git_ref: parent.git_ref.clone(),
        }
    }
}

/// Filter for listing events.
#[derive(Debug, Clone)]
pub struct EventQuery {
    pub pipeline_id: PipelineId,
    pub causal_root: Option<EventId>,
    pub open_only: bool,
    pub limit: u32,
}

impl EventQuery {
    pub fn matches(&self, event: &Event) -> bool {
        event.pipeline_id == self.pipeline_id
            && self.causal_root.is_none_or(|root| event.causal_root == root)
            && (!self.open_only || event.is_open())
    }
}

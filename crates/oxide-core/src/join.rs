//! Persisted join records.

use crate::build::{ParentBuild, ParentBuilds, ParentKey};
use crate::ids::{EventId, PipelineId};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identity of one unresolved join.
///
/// `scope` is the event for joins inside one pipeline and the causal root for
/// joins fed from other pipelines, whose destination event may not exist yet.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JoinKey {
    pub scope: EventId,
    pub pipeline_id: PipelineId,
    pub job_name: String,
}

impl JoinKey {
    pub fn new(scope: EventId, pipeline_id: PipelineId, job_name: impl Into<String>) -> Self {
        Self {
            scope,
            pipeline_id,
            job_name: job_name.into(),
        }
    }
}

impl fmt::Display for JoinKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.scope, self.pipeline_id, self.job_name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum JoinState {
    Open,
    Fired,
    Blocked { reason: String },
}

impl JoinState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JoinState::Open => "open",
            JoinState::Fired => "fired",
            JoinState::Blocked { .. } => "blocked",
        }
    }
}

/// Accumulated state of a join.
///
/// Reports are kept while the join is open or blocked. Firing consumes them:
/// they move onto the started build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingJoin {
    pub key: JoinKey,
    pub parent_builds: ParentBuilds,
    pub state: JoinState,
}

impl PendingJoin {
    pub fn open(key: JoinKey) -> Self {
        Self {
            key,
            parent_builds: ParentBuilds::new(),
            state: JoinState::Open,
        }
    }

    pub fn is_open(&self) -> bool {
        self.state == JoinState::Open
    }

    pub fn is_fired(&self) -> bool {
        self.state == JoinState::Fired
    }

    /// Transition an open join to fired and hand out its reports.
    pub fn fire(&mut self) -> Option<ParentBuilds> {
        if !self.is_open() {
            return None;
        }
        self.state = JoinState::Fired;
        Some(std::mem::take(&mut self.parent_builds))
    }

    /// Reopen a fired join with the reports it fired with.
    pub fn reopen(&mut self, parent_builds: ParentBuilds) -> bool {
        if !self.is_fired() {
            return false;
        }
        self.state = JoinState::Open;
        self.parent_builds = parent_builds;
        true
    }

    /// Merge a report. Settled joins are left untouched.
    pub fn merge(&mut self, parent: ParentKey, build: ParentBuild) -> bool {
        if !self.is_open() {
            return false;
        }
        self.parent_builds.record(parent, build);
        true
    }
}

//! Build and parent-build types.

use crate::ids::{BuildId, EventId, JobId, PipelineId};
use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use schemars::r#gen::SchemaGenerator;
use schemars::schema::Schema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// One execution of one job within one event.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Build {
    pub id: BuildId,
    pub pipeline_id: PipelineId,
    pub job_id: JobId,
    pub job_name: String,
    pub event_id: EventId,
    pub status: BuildStatus,
    /// Parent reports that satisfied the join this build was started from.
    #[serde(default)]
    pub parent_builds: ParentBuilds,
    #[serde(default)]
    pub parent_build_ids: Vec<BuildId>,
    pub sha: String,
    pub created_at: DateTime<Utc>,
}

impl Build {
    /// Key under which this build reports into downstream joins.
    pub fn parent_key(&self) -> ParentKey {
        ParentKey::new(self.pipeline_id, self.job_name.clone())
    }
}

/// Request to create a build.
#[derive(Debug, Clone)]
pub struct NewBuild {
    pub pipeline_id: PipelineId,
    pub job_id: JobId,
    pub job_name: String,
    pub event_id: EventId,
    pub status: BuildStatus,
    pub parent_builds: ParentBuilds,
    pub sha: String,
}

impl NewBuild {
    /// Parent build ids in a stable order.
    pub fn parent_build_ids(&self) -> Vec<BuildId> {
        self.parent_builds.build_ids()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum BuildStatus {
    Created,
    Queued,
    Running,
    Success,
    Failure,
    Aborted,
    Unstable,
    Blocked,
    Skipped,
}

impl BuildStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            BuildStatus::Success
                | BuildStatus::Failure
                | BuildStatus::Aborted
                | BuildStatus::Unstable
                | BuildStatus::Blocked
                | BuildStatus::Skipped
        )
    }

    /// Only a plain success satisfies a join.
    pub fn is_success(&self) -> bool {
        matches!(self, BuildStatus::Success)
    }
}

impl fmt::Display for BuildStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BuildStatus::Created => "created",
            BuildStatus::Queued => "queued",
            BuildStatus::Running => "running",
            BuildStatus::Success => "success",
            BuildStatus::Failure => "failure",
            BuildStatus::Aborted => "aborted",
            BuildStatus::Unstable => "unstable",
            BuildStatus::Blocked => "blocked",
            BuildStatus::Skipped => "skipped",
        };
        write!(f, "{s}")
    }
}

/// Fully qualified identity of a parent job: `(pipeline, job name)`.
///
/// Serialized as `sd@<pipeline>:<job>` so that parent maps stay plain JSON
/// objects.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ParentKey {
    pub pipeline_id: PipelineId,
    pub job_name: String,
}

impl ParentKey {
    pub fn new(pipeline_id: PipelineId, job_name: impl Into<String>) -> Self {
        Self {
            pipeline_id,
            job_name: job_name.into(),
        }
    }
}

impl fmt::Display for ParentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sd@{}:{}", self.pipeline_id, self.job_name)
    }
}

impl FromStr for ParentKey {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let (pipeline, job_name) = s
            .strip_prefix("sd@")
            .and_then(|rest| rest.split_once(':'))
            .ok_or_else(|| format!("invalid parent key: {s}"))?;
        let pipeline_id = pipeline
            .parse::<PipelineId>()
            .map_err(|e| format!("invalid pipeline in parent key {s}: {e}"))?;
        Ok(Self::new(pipeline_id, job_name))
    }
}

impl TryFrom<String> for ParentKey {
    type Error = String;

    fn try_from(value: String) -> std::result::Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ParentKey> for String {
    fn from(value: ParentKey) -> Self {
        value.to_string()
    }
}

impl JsonSchema for ParentKey {
    fn schema_name() -> String {
        "ParentKey".to_string()
    }

    fn json_schema(generator: &mut SchemaGenerator) -> Schema {
        String::json_schema(generator)
    }
}

/// What one parent reported into a join.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct ParentBuild {
    /// `None` for virtual parents, which never have builds.
    pub build_id: Option<BuildId>,
    pub event_id: EventId,
    pub status: BuildStatus,
}

/// Accumulated parent reports, keyed by `(pipeline, job name)`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(transparent)]
pub struct ParentBuilds(BTreeMap<ParentKey, ParentBuild>);

impl ParentBuilds {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge one report; a report for an existing key replaces it.
    pub fn record(&mut self, key: ParentKey, build: ParentBuild) -> Option<ParentBuild> {
        self.0.insert(key, build)
    }

    pub fn get(&self, key: &ParentKey) -> Option<&ParentBuild> {
        self.0.get(key)
    }

    pub fn contains(&self, key: &ParentKey) -> bool {
        self.0.contains_key(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ParentKey, &ParentBuild)> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Ids of the real (non-virtual) parent builds.
    pub fn build_ids(&self) -> Vec<BuildId> {
        self.0.values().filter_map(|b| b.build_id).collect()
    }
}

impl FromIterator<(ParentKey, ParentBuild)> for ParentBuilds {
    fn from_iter<T: IntoIterator<Item = (ParentKey, ParentBuild)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

//! Port traits (hexagonal architecture).
//!
//! These traits define the collaborators the trigger engine consumes. Their
//! implementations live in adapters (`oxide-db`) or in the embedding service.

use crate::build::{Build, NewBuild, ParentBuild, ParentBuilds, ParentKey};
use crate::event::{Event, EventQuery, NewEvent};
use crate::ids::*;
use crate::join::{JoinKey, PendingJoin};
use crate::pipeline::{Job, Pipeline};
use crate::Result;
use async_trait::async_trait;

/// Creates and looks up events.
#[async_trait]
pub trait EventFactory: Send + Sync {
    /// Create a new event.
    async fn create(&self, event: NewEvent) -> Result<Event>;

    /// Get an event by ID.
    async fn get(&self, id: EventId) -> Result<Option<Event>>;

    /// List events matching a query, newest first.
    async fn list(&self, query: &EventQuery) -> Result<Vec<Event>>;

    /// Attach a processing error to an event.
    async fn record_error(&self, id: EventId, message: &str) -> Result<()>;
}

/// Creates and looks up builds.
#[async_trait]
pub trait BuildFactory: Send + Sync {
    /// Create a build.
    async fn create(&self, build: NewBuild) -> Result<Build>;

    /// Get a build by ID.
    async fn get(&self, id: BuildId) -> Result<Option<Build>>;
}

/// Looks up jobs.
#[async_trait]
pub trait JobFactory: Send + Sync {
    /// Get a job by ID.
    async fn get(&self, id: JobId) -> Result<Option<Job>>;

    /// Find a job by pipeline and name.
    async fn find(&self, pipeline_id: PipelineId, name: &str) -> Result<Option<Job>>;
}

/// Looks up pipelines and their workflow graphs.
#[async_trait]
pub trait PipelineFactory: Send + Sync {
    /// Get a pipeline by ID.
    async fn get(&self, id: PipelineId) -> Result<Option<Pipeline>>;
}

/// Trust boundary between pipelines of different owners.
#[async_trait]
pub trait Authorizer: Send + Sync {
    /// Fails with [`crate::Error::Forbidden`] if `destination` does not
    /// accept triggers from `source`.
    async fn authorize_external(&self, source: &Pipeline, destination: &Pipeline) -> Result<()>;
}

/// Storage for unresolved joins.
///
/// Implementations must make `merge` atomic (the returned snapshot includes
/// every report merged before it) and `claim`/`block` compare-and-swap
/// operations on an open join.
#[async_trait]
pub trait JoinStateStore: Send + Sync {
    /// Merge a parent report and return the resulting record. Settled joins
    /// are returned unchanged.
    async fn merge(&self, key: &JoinKey, parent: ParentKey, build: ParentBuild)
    -> Result<PendingJoin>;

    /// Current record, if any report has been merged.
    async fn snapshot(&self, key: &JoinKey) -> Result<Option<PendingJoin>>;

    /// Transition an open join to fired, consuming its reports. Returns
    /// `false` if it was not open.
    async fn claim(&self, key: &JoinKey) -> Result<bool>;

    /// Reopen a fired join whose build could not be created, restoring the
    /// reports it fired with.
    async fn release(&self, key: &JoinKey, parent_builds: &ParentBuilds) -> Result<()>;

    /// Transition an open join to blocked. Returns `false` if it was not open.
    async fn block(&self, key: &JoinKey, reason: &str) -> Result<bool>;

    /// Delete the fired and blocked joins scoped to `scope`. Open joins are
    /// kept. Returns the number of records removed.
    async fn prune(&self, scope: EventId) -> Result<u64>;
}

//! Trigger strategies.
//!
//! Every edge is resolved by one of six strategies, `{Local, Remote,
//! External} × {And, Or}`. They share the join bookkeeping and differ in where
//! the started build lives: the reporting event for local edges, an event of
//! the destination pipeline in the same causal chain for remote and external
//! ones.

use crate::config::TriggerEngineConfig;
use crate::join::{JoinDecision, JoinRequirement};
use crate::locks::KeyedLocks;
use crate::parent_builds::ParentBuildsTracker;
use oxide_core::build::{Build, BuildStatus, NewBuild, ParentBuild, ParentBuilds, ParentKey};
use oxide_core::event::{Event, EventQuery, NewEvent};
use oxide_core::ids::{EventId, PipelineId};
use oxide_core::join::JoinKey;
use oxide_core::pipeline::{Job, Pipeline};
use oxide_core::ports::{Authorizer, BuildFactory, EventFactory, JoinStateStore};
use oxide_core::workflow::JoinType;
use oxide_core::{Error, Result};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Where the destination of an edge lives relative to its source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TriggerScope {
    /// Same pipeline.
    Local,
    /// Another pipeline of the same owner.
    Remote,
    /// A pipeline of another owner.
    External,
}

/// The strategy an edge is resolved with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TriggerKind {
    pub scope: TriggerScope,
    pub join: JoinType,
}

impl TriggerKind {
    pub fn new(scope: TriggerScope, join: JoinType) -> Self {
        Self { scope, join }
    }

    /// Pick the strategy for an edge from `source` into `destination`.
    pub fn classify(source: &Pipeline, destination: &Pipeline, join: JoinType) -> Self {
        let scope = if source.id == destination.id {
            TriggerScope::Local
        } else if source.same_owner(destination) {
            TriggerScope::Remote
        } else {
            TriggerScope::External
        };
        Self { scope, join }
    }
}

impl fmt::Display for TriggerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let scope = match self.scope {
            TriggerScope::Local => "local",
            TriggerScope::Remote => "remote",
            TriggerScope::External => "external",
        };
        write!(f, "{scope}-{}", self.join)
    }
}

/// One parent report travelling along one edge.
#[derive(Debug, Clone)]
pub struct TriggerRequest<'a> {
    /// Event the reporting job ran in.
    pub event: &'a Event,
    pub source: &'a Pipeline,
    pub destination: &'a Pipeline,
    pub next_job: &'a Job,
    pub requirement: &'a JoinRequirement,
    pub parent: ParentKey,
    pub report: ParentBuild,
}

impl TriggerRequest<'_> {
    fn next_job_key(&self) -> ParentKey {
        ParentKey::new(self.destination.id, self.next_job.name.clone())
    }

    /// Joins fed from several pipelines are scoped to the causal chain, since
    /// the destination event may not exist until the join fires.
    fn join_key(&self) -> JoinKey {
        let scope = if self.requirement.is_cross_pipeline(self.destination.id) {
            self.event.causal_root
        } else {
            self.event.id
        };
        JoinKey::new(scope, self.destination.id, self.next_job.name.clone())
    }
}

/// Result of resolving one edge.
#[derive(Debug, Clone)]
pub enum TriggerOutcome {
    /// The join fired and a build was created.
    Started(Build),
    /// The join still waits for other parents.
    Waiting,
    /// An earlier report already fired or blocked the join.
    Settled(ParentKey),
    /// The join can never fire; the job will not run.
    Blocked { job: ParentKey, reason: String },
    /// A virtual job settled; its own outgoing edges must be resolved as if
    /// it had finished with `status` in `event`. `replay` is set when the
    /// join was settled by an earlier report and is only being re-entered.
    Virtual {
        event: Event,
        job: Job,
        status: BuildStatus,
        replay: bool,
    },
}

/// Resolves edges with the strategy selected for them.
///
/// Locating or creating the destination event of a remote or external edge
/// is serialized per causal chain and destination pipeline inside this
/// resolver only. Several processes resolving into the same pipeline can
/// still race and create one event each; deployments sharing a
/// `JoinStateStore` across processes need an `EventFactory` whose `create`
/// deduplicates on `(causal_root, pipeline_id)` of open events.
pub struct TriggerResolver {
    tracker: ParentBuildsTracker,
    events: Arc<dyn EventFactory>,
    builds: Arc<dyn BuildFactory>,
    authorizer: Arc<dyn Authorizer>,
    event_locks: KeyedLocks<(EventId, PipelineId)>,
    config: TriggerEngineConfig,
}

impl TriggerResolver {
    pub fn new(
        joins: Arc<dyn JoinStateStore>,
        events: Arc<dyn EventFactory>,
        builds: Arc<dyn BuildFactory>,
        authorizer: Arc<dyn Authorizer>,
        config: TriggerEngineConfig,
    ) -> Self {
        Self {
            tracker: ParentBuildsTracker::new(joins),
            events,
            builds,
            authorizer,
            event_locks: KeyedLocks::new(),
            config,
        }
    }

    /// Resolve one edge with the strategy `kind`.
    pub async fn resolve(
        &self,
        kind: TriggerKind,
        request: TriggerRequest<'_>,
    ) -> Result<TriggerOutcome> {
        if let Some(declared) = request.requirement.join_type(&request.parent)
            && declared != kind.join
        {
            return Err(Error::Configuration(format!(
                "{} declares {} as a {declared} parent but the edge is {}",
                request.next_job_key(),
                request.parent,
                kind.join
            )));
        }

        if kind.scope == TriggerScope::External {
            self.authorizer
                .authorize_external(request.source, request.destination)
                .await?;
        }

        let key = request.join_key();
        let decision = self
            .tracker
            .report(&key, request.requirement, request.parent.clone(), request.report)
            .await?;

        match decision {
            JoinDecision::NotReady => Ok(TriggerOutcome::Waiting),
            JoinDecision::Blocked(reason) => self.on_blocked(kind, &request, reason).await,
            JoinDecision::Settled { fired } => self.on_settled(kind, &request, fired).await,
            JoinDecision::Ready(parent_builds) => {
                let consumed = parent_builds.clone();
                match self.on_ready(kind, &request, parent_builds).await {
                    Ok(outcome) => Ok(outcome),
                    Err(e) => {
                        if self.config.release_claim_on_failure
                            && let Err(release_err) = self.tracker.release(&key, &consumed).await
                        {
                            warn!(join = %key, error = %release_err, "Failed to reopen join");
                        }
                        Err(e)
                    }
                }
            }
        }
    }

    async fn on_ready(
        &self,
        kind: TriggerKind,
        request: &TriggerRequest<'_>,
        parent_builds: ParentBuilds,
    ) -> Result<TriggerOutcome> {
        let event = match kind.scope {
            TriggerScope::Local => request.event.clone(),
            TriggerScope::Remote | TriggerScope::External => {
                self.destination_event(request).await?
            }
        };

        if request.next_job.is_virtual {
            debug!(
                job = %request.next_job_key(),
                event_id = %event.id,
                "Virtual job satisfied, propagating"
            );
            return Ok(TriggerOutcome::Virtual {
                event,
                job: request.next_job.clone(),
                status: BuildStatus::Success,
                replay: false,
            });
        }

        let build = self
            .builds
            .create(NewBuild {
                pipeline_id: request.destination.id,
                job_id: request.next_job.id,
                job_name: request.next_job.name.clone(),
                event_id: event.id,
                status: BuildStatus::Queued,
                parent_builds,
                sha: event.sha.clone(),
            })
            .await?;

        info!(
            build_id = %build.id,
            job = %request.next_job_key(),
            event_id = %event.id,
            trigger = %kind,
            "Build started"
        );
        Ok(TriggerOutcome::Started(build))
    }

    async fn on_blocked(
        &self,
        kind: TriggerKind,
        request: &TriggerRequest<'_>,
        reason: String,
    ) -> Result<TriggerOutcome> {
        let job = request.next_job_key();
        if request.next_job.is_virtual {
            match self.virtual_event(kind, request).await? {
                Some(event) => {
                    return Ok(TriggerOutcome::Virtual {
                        event,
                        job: request.next_job.clone(),
                        status: BuildStatus::Blocked,
                        replay: false,
                    });
                }
                None => debug!(job = %job, "No destination event to carry a blocked virtual job"),
            }
        }
        Ok(TriggerOutcome::Blocked { job, reason })
    }

    /// A report into a join settled earlier. Virtual jobs are re-entered so
    /// that descendants reopened after a failed start can still fire.
    async fn on_settled(
        &self,
        kind: TriggerKind,
        request: &TriggerRequest<'_>,
        fired: bool,
    ) -> Result<TriggerOutcome> {
        let job = request.next_job_key();
        if request.next_job.is_virtual
            && let Some(event) = self.virtual_event(kind, request).await?
        {
            debug!(job = %job, event_id = %event.id, fired, "Re-entering settled virtual job");
            return Ok(TriggerOutcome::Virtual {
                event,
                job: request.next_job.clone(),
                status: if fired {
                    BuildStatus::Success
                } else {
                    BuildStatus::Blocked
                },
                replay: true,
            });
        }
        Ok(TriggerOutcome::Settled(job))
    }

    /// Event an already-settled virtual job lives in. Never creates one.
    async fn virtual_event(
        &self,
        kind: TriggerKind,
        request: &TriggerRequest<'_>,
    ) -> Result<Option<Event>> {
        match kind.scope {
            TriggerScope::Local => Ok(Some(request.event.clone())),
            TriggerScope::Remote | TriggerScope::External => {
                self.find_destination_event(request).await
            }
        }
    }

    /// Locate the open event of the destination pipeline in this causal
    /// chain, or create it.
    async fn destination_event(&self, request: &TriggerRequest<'_>) -> Result<Event> {
        let lock_key = (request.event.causal_root, request.destination.id);
        let _guard = self.event_locks.lock(&lock_key).await;

        if let Some(event) = self.find_destination_event(request).await? {
            info!(
                event_id = %event.id,
                pipeline_id = %request.destination.id,
                "Reusing destination event"
            );
            return Ok(event);
        }

        let event = self
            .events
            .create(NewEvent::downstream_of(
                request.event,
                request.destination.id,
                request.report.build_id,
            ))
            .await?;
        info!(
            event_id = %event.id,
            pipeline_id = %request.destination.id,
            parent_event_id = %request.event.id,
            "Created destination event"
        );
        Ok(event)
    }

    async fn find_destination_event(&self, request: &TriggerRequest<'_>) -> Result<Option<Event>> {
        let query = EventQuery {
            pipeline_id: request.destination.id,
            causal_root: Some(request.event.causal_root),
            open_only: true,
            limit: self.config.event_lookup_limit,
        };
        Ok(self
            .events
            .list(&query)
            .await?
            .into_iter()
            .find(|e| query.matches(e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pipeline(owner: &str) -> Pipeline {
        Pipeline {
            id: PipelineId::new(),
            name: format!("{owner}-pipeline"),
            owner: owner.to_string(),
            workflow_graph: Default::default(),
        }
    }

    #[test]
    fn test_classify_scopes() {
        let a = pipeline("octo");
        let b = pipeline("octo");
        let c = pipeline("other");

        assert_eq!(
            TriggerKind::classify(&a, &a, JoinType::And),
            TriggerKind::new(TriggerScope::Local, JoinType::And)
        );
        assert_eq!(
            TriggerKind::classify(&a, &b, JoinType::Or).scope,
            TriggerScope::Remote
        );
        assert_eq!(
            TriggerKind::classify(&a, &c, JoinType::And).scope,
            TriggerScope::External
        );
    }

    #[test]
    fn test_kind_display() {
        let kind = TriggerKind::new(TriggerScope::Remote, JoinType::Or);
        assert_eq!(kind.to_string(), "remote-or");
    }
}

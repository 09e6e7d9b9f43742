//! Accumulation of parent reports into pending joins.

use crate::join::{JoinDecision, JoinEvaluator, JoinRequirement};
use oxide_core::build::{ParentBuild, ParentBuilds, ParentKey};
use oxide_core::join::{JoinKey, PendingJoin};
use oxide_core::ports::JoinStateStore;
use oxide_core::{Error, Result};
use std::sync::Arc;
use tracing::{debug, info};

/// Records parent reports and turns them into join decisions.
///
/// The merge is a single atomic store operation and the transition to
/// fired is a compare-and-swap, so concurrent reporters into one join agree
/// on exactly one winner.
#[derive(Clone)]
pub struct ParentBuildsTracker {
    store: Arc<dyn JoinStateStore>,
}

impl ParentBuildsTracker {
    pub fn new(store: Arc<dyn JoinStateStore>) -> Self {
        Self { store }
    }

    /// Merge one parent report into the join identified by `key`.
    ///
    /// Fails with a configuration error if `parent` is not declared by the
    /// requirement.
    pub async fn record(
        &self,
        key: &JoinKey,
        requirement: &JoinRequirement,
        parent: ParentKey,
        build: ParentBuild,
    ) -> Result<PendingJoin> {
        if !requirement.contains(&parent) {
            return Err(Error::Configuration(format!(
                "{parent} is not a declared parent of {}",
                key.job_name
            )));
        }

        let join = self.store.merge(key, parent.clone(), build).await?;
        debug!(
            join = %key,
            parent = %parent,
            status = %build.status,
            reported = join.parent_builds.len(),
            required = requirement.len(),
            "Parent report recorded"
        );
        Ok(join)
    }

    /// Reports accumulated so far for `key`.
    pub async fn snapshot(&self, key: &JoinKey) -> Result<ParentBuilds> {
        Ok(self
            .store
            .snapshot(key)
            .await?
            .map(|join| join.parent_builds)
            .unwrap_or_default())
    }

    /// Record a report and decide the join.
    ///
    /// `Ready` is returned to exactly one caller per join. Callers that lose
    /// the claim, or report into a join settled earlier, get `Settled`.
    pub async fn report(
        &self,
        key: &JoinKey,
        requirement: &JoinRequirement,
        parent: ParentKey,
        build: ParentBuild,
    ) -> Result<JoinDecision> {
        let join = self.record(key, requirement, parent, build).await?;
        if !join.is_open() {
            debug!(join = %key, state = join.state.as_str(), "Join already settled");
            return Ok(JoinDecision::Settled {
                fired: join.is_fired(),
            });
        }

        match JoinEvaluator::evaluate(requirement, &join.parent_builds) {
            JoinDecision::Ready(snapshot) => match self.claim(key).await {
                Ok(()) => {
                    info!(join = %key, parents = snapshot.len(), "Join fired");
                    Ok(JoinDecision::Ready(snapshot))
                }
                Err(Error::ConcurrencyConflict(reason)) => {
                    debug!(join = %key, reason = %reason, "Join claimed by a concurrent report");
                    self.settled(key).await
                }
                Err(e) => Err(e),
            },
            JoinDecision::Blocked(reason) => {
                if self.store.block(key, &reason).await? {
                    info!(join = %key, reason = %reason, "Join blocked");
                    Ok(JoinDecision::Blocked(reason))
                } else {
                    self.settled(key).await
                }
            }
            decision => Ok(decision),
        }
    }

    /// Reopen a fired join whose build could not be started, restoring the
    /// reports it fired with.
    pub async fn release(&self, key: &JoinKey, parent_builds: &ParentBuilds) -> Result<()> {
        self.store.release(key, parent_builds).await?;
        info!(join = %key, parents = parent_builds.len(), "Join reopened");
        Ok(())
    }

    async fn claim(&self, key: &JoinKey) -> Result<()> {
        if self.store.claim(key).await? {
            Ok(())
        } else {
            Err(Error::ConcurrencyConflict(format!("join {key} is no longer open")))
        }
    }

    /// Decision for a report that lost the race to settle `key`.
    async fn settled(&self, key: &JoinKey) -> Result<JoinDecision> {
        Ok(match self.store.snapshot(key).await? {
            Some(join) if join.is_open() => JoinDecision::NotReady,
            Some(join) => JoinDecision::Settled {
                fired: join.is_fired(),
            },
            None => JoinDecision::NotReady,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryJoinStateStore;
    use oxide_core::build::BuildStatus;
    use oxide_core::ids::{BuildId, EventId, PipelineId};
    use oxide_core::workflow::JoinType;

    fn setup(join: JoinType) -> (ParentBuildsTracker, JoinKey, JoinRequirement) {
        let pipeline_id = PipelineId::new();
        let key = JoinKey::new(EventId::new(), pipeline_id, "deploy");
        let requirement = JoinRequirement::new()
            .with_parent(ParentKey::new(pipeline_id, "build"), join)
            .with_parent(ParentKey::new(pipeline_id, "test"), join);
        let tracker = ParentBuildsTracker::new(Arc::new(InMemoryJoinStateStore::new()));
        (tracker, key, requirement)
    }

    fn report(key: &JoinKey, status: BuildStatus) -> ParentBuild {
        ParentBuild {
            build_id: Some(BuildId::new()),
            event_id: key.scope,
            status,
        }
    }

    #[tokio::test]
    async fn test_unknown_parent_is_rejected() {
        let (tracker, key, requirement) = setup(JoinType::And);
        let stranger = ParentKey::new(PipelineId::new(), "lint");

        let err = tracker
            .record(&key, &requirement, stranger, report(&key, BuildStatus::Success))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
        assert!(tracker.snapshot(&key).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_and_join_fires_once() {
        let (tracker, key, requirement) = setup(JoinType::And);
        let build = ParentKey::new(key.pipeline_id, "build");
        let test = ParentKey::new(key.pipeline_id, "test");
        let build_report = report(&key, BuildStatus::Success);

        let first = tracker
            .report(&key, &requirement, build.clone(), build_report)
            .await
            .unwrap();
        assert_eq!(first, JoinDecision::NotReady);

        let second = tracker
            .report(&key, &requirement, test.clone(), report(&key, BuildStatus::Success))
            .await
            .unwrap();
        assert!(matches!(second, JoinDecision::Ready(_)));

        // Redelivery of a completion after the join fired.
        let again = tracker
            .report(&key, &requirement, build, build_report)
            .await
            .unwrap();
        assert_eq!(again, JoinDecision::Settled { fired: true });
        assert!(tracker.snapshot(&key).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_blocked_is_reported_once() {
        let (tracker, key, requirement) = setup(JoinType::And);
        let build = ParentKey::new(key.pipeline_id, "build");
        let failure = report(&key, BuildStatus::Failure);

        let first = tracker
            .report(&key, &requirement, build.clone(), failure)
            .await
            .unwrap();
        assert!(matches!(first, JoinDecision::Blocked(_)));

        let again = tracker
            .report(&key, &requirement, build, failure)
            .await
            .unwrap();
        assert_eq!(again, JoinDecision::Settled { fired: false });
    }

    #[tokio::test]
    async fn test_release_allows_refire() {
        let (tracker, key, requirement) = setup(JoinType::Or);
        let build = ParentKey::new(key.pipeline_id, "build");
        let success = report(&key, BuildStatus::Success);

        let first = tracker
            .report(&key, &requirement, build.clone(), success)
            .await
            .unwrap();
        let JoinDecision::Ready(consumed) = first else {
            panic!("expected the join to fire, got {first:?}");
        };

        tracker.release(&key, &consumed).await.unwrap();
        assert_eq!(tracker.snapshot(&key).await.unwrap(), consumed);
        let retried = tracker
            .report(&key, &requirement, build, success)
            .await
            .unwrap();
        assert!(matches!(retried, JoinDecision::Ready(_)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_reports_fire_exactly_once() {
        let pipeline_id = PipelineId::new();
        let key = JoinKey::new(EventId::new(), pipeline_id, "deploy");
        let parents: Vec<ParentKey> = (0..16)
            .map(|i| ParentKey::new(pipeline_id, format!("shard-{i}")))
            .collect();
        let requirement = parents.iter().fold(JoinRequirement::new(), |r, p| {
            r.with_parent(p.clone(), JoinType::And)
        });
        let tracker = ParentBuildsTracker::new(Arc::new(InMemoryJoinStateStore::new()));

        let mut handles = Vec::new();
        for parent in parents {
            let tracker = tracker.clone();
            let key = key.clone();
            let requirement = requirement.clone();
            handles.push(tokio::spawn(async move {
                tracker
                    .report(&key, &requirement, parent, report(&key, BuildStatus::Success))
                    .await
            }));
        }

        let mut fired = 0;
        for handle in handles {
            match handle.await.unwrap().unwrap() {
                JoinDecision::Ready(_) => fired += 1,
                JoinDecision::NotReady | JoinDecision::Settled { fired: true } => {}
                other => panic!("unexpected decision {other:?}"),
            }
        }
        assert_eq!(fired, 1);
    }
}

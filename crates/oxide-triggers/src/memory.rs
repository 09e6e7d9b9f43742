//! In-memory join state store.
//!
//! Suitable for a single scheduler process and for tests. All operations run
//! under one mutex, which makes `merge` atomic and `claim`/`block` proper
//! compare-and-swap transitions.

use async_trait::async_trait;
use oxide_core::Result;
use oxide_core::build::{ParentBuild, ParentBuilds, ParentKey};
use oxide_core::ids::EventId;
use oxide_core::join::{JoinKey, JoinState, PendingJoin};
use oxide_core::ports::JoinStateStore;
use std::collections::HashMap;
use tokio::sync::Mutex;

#[derive(Debug, Default)]
pub struct InMemoryJoinStateStore {
    joins: Mutex<HashMap<JoinKey, PendingJoin>>,
}

impl InMemoryJoinStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of join records held.
    pub async fn len(&self) -> usize {
        self.joins.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.joins.lock().await.is_empty()
    }

}

#[async_trait]
impl JoinStateStore for InMemoryJoinStateStore {
    async fn merge(
        &self,
        key: &JoinKey,
        parent: ParentKey,
        build: ParentBuild,
    ) -> Result<PendingJoin> {
        let mut joins = self.joins.lock().await;
        let join = joins
            .entry(key.clone())
            .or_insert_with(|| PendingJoin::open(key.clone()));
        join.merge(parent, build);
        Ok(join.clone())
    }

    async fn snapshot(&self, key: &JoinKey) -> Result<Option<PendingJoin>> {
        Ok(self.joins.lock().await.get(key).cloned())
    }

    async fn claim(&self, key: &JoinKey) -> Result<bool> {
        let mut joins = self.joins.lock().await;
        Ok(joins.get_mut(key).and_then(PendingJoin::fire).is_some())
    }

    async fn release(&self, key: &JoinKey, parent_builds: &ParentBuilds) -> Result<()> {
        if let Some(join) = self.joins.lock().await.get_mut(key) {
            join.reopen(parent_builds.clone());
        }
        Ok(())
    }

    async fn block(&self, key: &JoinKey, reason: &str) -> Result<bool> {
        let mut joins = self.joins.lock().await;
        match joins.get_mut(key) {
            Some(join) if join.is_open() => {
                join.state = JoinState::Blocked {
                    reason: reason.to_string(),
                };
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn prune(&self, scope: EventId) -> Result<u64> {
        let mut joins = self.joins.lock().await;
        let before = joins.len();
        joins.retain(|key, join| key.scope != scope || join.is_open());
        Ok((before - joins.len()) as u64)
    }
}

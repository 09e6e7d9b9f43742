//! PostgreSQL implementation of JoinStateStore.

use async_trait::async_trait;
use oxide_core::build::{ParentBuild, ParentBuilds, ParentKey};
use oxide_core::ids::EventId;
use oxide_core::join::{JoinKey, JoinState, PendingJoin};
use oxide_core::ports::JoinStateStore;
use oxide_core::{Error, Result};
use sqlx::{PgPool, Row};
use tracing::debug;

/// PostgreSQL implementation of JoinStateStore.
///
/// Reports are merged server-side into a `jsonb` object, so concurrent
/// mergers are serialized by the row lock taken by `ON CONFLICT DO UPDATE`.
pub struct PgJoinStateStore {
    pool: PgPool,
}

impl PgJoinStateStore {
    /// Create a new PgJoinStateStore.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn row_to_join(key: &JoinKey, r: &sqlx::postgres::PgRow) -> Result<PendingJoin> {
        let parent_builds: ParentBuilds = serde_json::from_value(r.get("parent_builds"))?;
        let state_str: String = r.get("state");
        let state = match state_str.as_str() {
            "open" => JoinState::Open,
            "fired" => JoinState::Fired,
            "blocked" => JoinState::Blocked {
                reason: r
                    .get::<Option<String>, _>("blocked_reason")
                    .unwrap_or_default(),
            },
            other => {
                return Err(Error::Database(format!(
                    "unknown join state {other} for {key}"
                )));
            }
        };

        Ok(PendingJoin {
            key: key.clone(),
            parent_builds,
            state,
        })
    }
}

#[async_trait]
impl JoinStateStore for PgJoinStateStore {
    async fn merge(
        &self,
        key: &JoinKey,
        parent: ParentKey,
        build: ParentBuild,
    ) -> Result<PendingJoin> {
        let build_json = serde_json::to_value(build)?;

        let row = sqlx::query(
            r#"INSERT INTO pending_joins (scope, pipeline_id, job_name, parent_builds)
               VALUES ($1, $2, $3, jsonb_build_object($4::text, $5::jsonb))
               ON CONFLICT (scope, pipeline_id, job_name) DO UPDATE SET
                   parent_builds = CASE
                       WHEN pending_joins.state = 'open'
                       THEN pending_joins.parent_builds || EXCLUDED.parent_builds
                       ELSE pending_joins.parent_builds
                   END,
                   updated_at = NOW()
               RETURNING parent_builds, state, blocked_reason"#,
        )
        .bind(key.scope.as_uuid())
        .bind(key.pipeline_id.as_uuid())
        .bind(&key.job_name)
        .bind(parent.to_string())
        .bind(&build_json)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        Self::row_to_join(key, &row)
    }

    async fn snapshot(&self, key: &JoinKey) -> Result<Option<PendingJoin>> {
        let row = sqlx::query(
            "SELECT parent_builds, state, blocked_reason FROM pending_joins WHERE scope = $1 AND pipeline_id = $2 AND job_name = $3",
        )
        .bind(key.scope.as_uuid())
        .bind(key.pipeline_id.as_uuid())
        .bind(&key.job_name)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        match row {
            Some(r) => Ok(Some(Self::row_to_join(key, &r)?)),
            None => Ok(None),
        }
    }

    async fn claim(&self, key: &JoinKey) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE pending_joins SET state = 'fired', parent_builds = '{}'::jsonb, updated_at = NOW() WHERE scope = $1 AND pipeline_id = $2 AND job_name = $3 AND state = 'open'",
        )
        .bind(key.scope.as_uuid())
        .bind(key.pipeline_id.as_uuid())
        .bind(&key.job_name)
        .execute(&self.pool)
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        Ok(result.rows_affected() == 1)
    }

    async fn release(&self, key: &JoinKey, parent_builds: &ParentBuilds) -> Result<()> {
        let parent_builds_json = serde_json::to_value(parent_builds)?;

        let result = sqlx::query(
            "UPDATE pending_joins SET state = 'open', parent_builds = $4, updated_at = NOW() WHERE scope = $1 AND pipeline_id = $2 AND job_name = $3 AND state = 'fired'",
        )
        .bind(key.scope.as_uuid())
        .bind(key.pipeline_id.as_uuid())
        .bind(&key.job_name)
        .bind(&parent_builds_json)
        .execute(&self.pool)
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        if result.rows_affected() == 0 {
            debug!(join = %key, "Release of a join that was not fired");
        }
        Ok(())
    }

    async fn block(&self, key: &JoinKey, reason: &str) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE pending_joins SET state = 'blocked', blocked_reason = $4, updated_at = NOW() WHERE scope = $1 AND pipeline_id = $2 AND job_name = $3 AND state = 'open'",
        )
        .bind(key.scope.as_uuid())
        .bind(key.pipeline_id.as_uuid())
        .bind(&key.job_name)
        .bind(reason)
        .execute(&self.pool)
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        Ok(result.rows_affected() == 1)
    }

    async fn prune(&self, scope: EventId) -> Result<u64> {
        let result = sqlx::query("DELETE FROM pending_joins WHERE scope = $1 AND state <> 'open'")
            .bind(scope.as_uuid())
            .execute(&self.pool)
            .await
            .map_err(|e| Error::Database(e.to_string()))?;

        debug!(scope = %scope, removed = result.rows_affected(), "Pruned settled joins");
        Ok(result.rows_affected())
    }
}

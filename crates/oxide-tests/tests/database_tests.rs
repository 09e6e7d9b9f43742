//! Database integration tests.
//!
//! Run with: `cargo test -p oxide-tests --test database_tests --features integration`

#![cfg(feature = "integration")]

use oxide_core::build::{BuildStatus, ParentBuild, ParentKey};
use oxide_core::ids::{BuildId, EventId, PipelineId};
use oxide_core::join::{JoinKey, JoinState};
use oxide_core::ports::JoinStateStore;
use oxide_core::workflow::JoinType;
use oxide_db::PgJoinStateStore;
use oxide_tests::{PipelineFixture, TestContext};
use oxide_triggers::TriggerEngineConfig;
use std::sync::Arc;

fn report(status: BuildStatus) -> ParentBuild {
    ParentBuild {
        build_id: Some(BuildId::new()),
        event_id: EventId::new(),
        status,
    }
}

#[tokio::test]
async fn test_join_merge_accumulates_reports() {
    let ctx = TestContext::postgres_only()
        .await
        .expect("Failed to create context");
    let store = ctx.db.join_states();

    let pipeline_id = PipelineId::new();
    let key = JoinKey::new(EventId::new(), pipeline_id, "deploy");

    let first = store
        .merge(&key, ParentKey::new(pipeline_id, "build"), report(BuildStatus::Success))
        .await
        .expect("Failed to merge");
    assert_eq!(first.parent_builds.len(), 1);
    assert_eq!(first.state, JoinState::Open);

    let second = store
        .merge(&key, ParentKey::new(pipeline_id, "test"), report(BuildStatus::Failure))
        .await
        .expect("Failed to merge");
    assert_eq!(second.parent_builds.len(), 2);

    let snapshot = store
        .snapshot(&key)
        .await
        .expect("Failed to read join")
        .expect("Join not found");
    assert_eq!(snapshot, second);
}

#[tokio::test]
async fn test_join_claim_is_exclusive() {
    let ctx = TestContext::postgres_only()
        .await
        .expect("Failed to create context");
    let store = ctx.db.join_states();

    let pipeline_id = PipelineId::new();
    let key = JoinKey::new(EventId::new(), pipeline_id, "deploy");
    let opened = store
        .merge(&key, ParentKey::new(pipeline_id, "build"), report(BuildStatus::Success))
        .await
        .expect("Failed to merge");

    assert!(store.claim(&key).await.expect("Failed to claim"));
    assert!(!store.claim(&key).await.expect("Failed to claim"));
    assert!(!store.block(&key, "late").await.expect("Failed to block"));

    // Firing consumes the reports; later reports are not merged.
    let after = store
        .merge(&key, ParentKey::new(pipeline_id, "test"), report(BuildStatus::Success))
        .await
        .expect("Failed to merge");
    assert_eq!(after.state, JoinState::Fired);
    assert!(after.parent_builds.is_empty());

    store
        .release(&key, &opened.parent_builds)
        .await
        .expect("Failed to release");
    let reopened = store
        .snapshot(&key)
        .await
        .expect("Failed to read join")
        .expect("Join not found");
    assert_eq!(reopened.state, JoinState::Open);
    assert_eq!(reopened.parent_builds, opened.parent_builds);
    assert!(store.claim(&key).await.expect("Failed to claim"));
}

#[tokio::test]
async fn test_prune_removes_settled_joins() {
    let ctx = TestContext::postgres_only()
        .await
        .expect("Failed to create context");
    let store = ctx.db.join_states();

    let scope = EventId::new();
    let pipeline_id = PipelineId::new();
    let fired = JoinKey::new(scope, pipeline_id, "deploy");
    let open = JoinKey::new(scope, pipeline_id, "notify");
    for key in [&fired, &open] {
        store
            .merge(key, ParentKey::new(pipeline_id, "build"), report(BuildStatus::Success))
            .await
            .expect("Failed to merge");
    }
    assert!(store.claim(&fired).await.expect("Failed to claim"));

    let removed = store.prune(scope).await.expect("Failed to prune");
    assert_eq!(removed, 1);
    assert!(store.snapshot(&fired).await.expect("Failed to read join").is_none());
    assert!(store.snapshot(&open).await.expect("Failed to read join").is_some());
}

#[tokio::test]
async fn test_join_block_keeps_reason() {
    let ctx = TestContext::postgres_only()
        .await
        .expect("Failed to create context");
    let store = ctx.db.join_states();

    let pipeline_id = PipelineId::new();
    let key = JoinKey::new(EventId::new(), pipeline_id, "deploy");
    store
        .merge(&key, ParentKey::new(pipeline_id, "build"), report(BuildStatus::Failure))
        .await
        .expect("Failed to merge");

    assert!(store.block(&key, "build failed").await.expect("Failed to block"));
    let join = store
        .snapshot(&key)
        .await
        .expect("Failed to read join")
        .expect("Join not found");
    assert_eq!(
        join.state,
        JoinState::Blocked {
            reason: "build failed".to_string()
        }
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_completions_on_postgres() {
    let pg = TestContext::postgres_only()
        .await
        .expect("Failed to create context");
    let store: Arc<dyn JoinStateStore> = Arc::new(PgJoinStateStore::new(pg.db.pool().clone()));
    let ctx = Arc::new(TestContext::with_join_store(store, TriggerEngineConfig::default()));

    let pipeline = PipelineFixture::shards(8);
    ctx.add_pipeline(&pipeline, &[]).await;
    let event = ctx.commit(&pipeline).await.expect("Failed to create event");

    let mut handles = Vec::new();
    for i in 0..8 {
        let build = ctx
            .finish(&event, &format!("shard-{i}"), BuildStatus::Success)
            .await
            .expect("Failed to finish build");
        let ctx = ctx.clone();
        handles.push(tokio::spawn(async move {
            ctx.dispatcher.on_build_finished(&build).await
        }));
    }

    for handle in handles {
        handle
            .await
            .expect("Dispatch task panicked")
            .expect("Dispatch failed");
    }
    assert_eq!(ctx.builds.for_job(pipeline.id, "merge").await.len(), 1);
}

#[tokio::test]
async fn test_and_join_on_postgres() {
    let pg = TestContext::postgres_only()
        .await
        .expect("Failed to create context");
    let ctx = TestContext::with_join_store(
        Arc::new(pg.db.join_states()),
        TriggerEngineConfig::default(),
    );

    let pipeline = PipelineFixture::fan_in(JoinType::And);
    ctx.add_pipeline(&pipeline, &[]).await;
    let event = ctx.commit(&pipeline).await.expect("Failed to create event");

    ctx.complete(&event, "build", BuildStatus::Success)
        .await
        .expect("Dispatch failed");
    let report = ctx
        .complete(&event, "test", BuildStatus::Success)
        .await
        .expect("Dispatch failed");

    assert_eq!(report.started.len(), 1);
    assert_eq!(report.started[0].parent_builds.len(), 2);
}

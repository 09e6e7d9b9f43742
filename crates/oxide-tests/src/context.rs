//! Test contexts wiring the trigger engine to test collaborators.

use crate::containers::PostgresContainer;
use crate::fixtures::{BuildFixture, EventFixture};
use crate::helpers::{InMemoryBuilds, InMemoryEvents, InMemoryJobs, InMemoryPipelines, OwnerAllowlist};
use oxide_core::build::{Build, BuildStatus};
use oxide_core::event::Event;
use oxide_core::pipeline::Pipeline;
use oxide_core::ports::{EventFactory, JobFactory, JoinStateStore};
use oxide_core::{Error, Result};
use oxide_db::Database;
use oxide_triggers::{
    DispatchReport, InMemoryJoinStateStore, TriggerDispatcher, TriggerEngineConfig, TriggerPorts,
};
use std::sync::Arc;

/// Trigger engine over in-memory collaborators.
pub struct TestContext {
    pub pipelines: Arc<InMemoryPipelines>,
    pub events: Arc<InMemoryEvents>,
    pub builds: Arc<InMemoryBuilds>,
    pub jobs: Arc<InMemoryJobs>,
    pub authorizer: Arc<OwnerAllowlist>,
    pub dispatcher: TriggerDispatcher,
}

impl TestContext {
    pub fn new() -> Self {
        Self::with_config(TriggerEngineConfig::default())
    }

    pub fn with_config(config: TriggerEngineConfig) -> Self {
        Self::with_join_store(Arc::new(InMemoryJoinStateStore::new()), config)
    }

    /// Context using `joins` for join state, e.g. a Postgres-backed store.
    pub fn with_join_store(joins: Arc<dyn JoinStateStore>, config: TriggerEngineConfig) -> Self {
        crate::init_test_logging();

        let pipelines = Arc::new(InMemoryPipelines::new());
        let events = Arc::new(InMemoryEvents::new());
        let builds = Arc::new(InMemoryBuilds::new());
        let jobs = Arc::new(InMemoryJobs::new());
        let authorizer = Arc::new(OwnerAllowlist::new());

        let dispatcher = TriggerDispatcher::new(
            TriggerPorts {
                pipelines: pipelines.clone(),
                events: events.clone(),
                builds: builds.clone(),
                jobs: jobs.clone(),
                authorizer: authorizer.clone(),
                joins,
            },
            config,
        );

        Self {
            pipelines,
            events,
            builds,
            jobs,
            authorizer,
            dispatcher,
        }
    }

    /// Register a pipeline and a job for each local node of its graph.
    pub async fn add_pipeline(&self, pipeline: &Pipeline, virtual_jobs: &[&str]) {
        for name in pipeline.workflow_graph.job_names() {
            self.jobs
                .register(pipeline.id, name, virtual_jobs.contains(&name))
                .await;
        }
        self.pipelines.insert(pipeline.clone()).await;
    }

    /// Start a new causal chain in `pipeline`.
    pub async fn commit(&self, pipeline: &Pipeline) -> Result<Event> {
        self.events.create(EventFixture::commit(pipeline)).await
    }

    /// Record a finished build of `job_name` in `event`.
    pub async fn finish(&self, event: &Event, job_name: &str, status: BuildStatus) -> Result<Build> {
        let job = self
            .jobs
            .find(event.pipeline_id, job_name)
            .await?
            .ok_or_else(|| Error::JobNotFound(job_name.to_string()))?;
        let build = BuildFixture::finished(event, job.id, job_name, status);
        self.builds.insert(build.clone()).await;
        Ok(build)
    }

    /// Finish `job_name` in `event` and dispatch its completion.
    pub async fn complete(
        &self,
        event: &Event,
        job_name: &str,
        status: BuildStatus,
    ) -> Result<DispatchReport> {
        let build = self.finish(event, job_name, status).await?;
        self.dispatcher.on_build_finished(&build).await
    }

    /// Finish a build the engine started and dispatch its completion.
    pub async fn complete_build(&self, build: &Build, status: BuildStatus) -> Result<DispatchReport> {
        let finished = Build {
            status,
            ..build.clone()
        };
        self.dispatcher.on_build_finished(&finished).await
    }

    /// Create context with only PostgreSQL.
    pub async fn postgres_only() -> anyhow::Result<PostgresOnlyContext> {
        crate::init_test_logging();

        let postgres = PostgresContainer::start().await?;
        let db = Database::connect(postgres.connection_string()).await?;
        db.migrate().await?;

        Ok(PostgresOnlyContext { postgres, db })
    }
}

impl Default for TestContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Minimal context with only PostgreSQL.
pub struct PostgresOnlyContext {
    pub postgres: PostgresContainer,
    pub db: Database,
}

impl PostgresOnlyContext {
    pub fn db_url(&self) -> &str {
        self.postgres.connection_string()
    }
}

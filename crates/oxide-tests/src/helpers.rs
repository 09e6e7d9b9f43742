//! In-memory collaborators for driving the trigger engine in tests.

use async_trait::async_trait;
use chrono::Utc;
use oxide_core::build::{Build, NewBuild};
use oxide_core::event::{Event, EventQuery, NewEvent};
use oxide_core::ids::{BuildId, EventId, JobId, PipelineId};
use oxide_core::pipeline::{Job, Pipeline};
use oxide_core::ports::{Authorizer, BuildFactory, EventFactory, JobFactory, PipelineFactory};
use oxide_core::{Error, Result};
use std::collections::{HashMap, HashSet};
use tokio::sync::RwLock;

/// Events kept in creation order.
#[derive(Default)]
pub struct InMemoryEvents {
    events: RwLock<Vec<Event>>,
}

impl InMemoryEvents {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn all(&self) -> Vec<Event> {
        self.events.read().await.clone()
    }

    pub async fn for_pipeline(&self, pipeline_id: PipelineId) -> Vec<Event> {
        self.events
            .read()
            .await
            .iter()
            .filter(|e| e.pipeline_id == pipeline_id)
            .cloned()
            .collect()
    }

    /// Mark an event as completed so it is no longer reused.
    pub async fn close(&self, id: EventId) {
        if let Some(event) = self.events.write().await.iter_mut().find(|e| e.id == id) {
            event.completed_at = Some(Utc::now());
        }
    }
}

#[async_trait]
impl EventFactory for InMemoryEvents {
    async fn create(&self, new: NewEvent) -> Result<Event> {
        let id = EventId::new();
        let event = Event {
            id,
            pipeline_id: new.pipeline_id,
            causal_root: new.causal_root.unwrap_or(id),
            parent_event_id: new.parent_event_id,
            origin_build: new.origin_build,
            sha: new.sha,
            git_ref: new.git_ref,
            created_at: Utc::now(),
            completed_at: None,
            processing_error: None,
        };
        self.events.write().await.push(event.clone());
        Ok(event)
    }

    async fn get(&self, id: EventId) -> Result<Option<Event>> {
        Ok(self.events.read().await.iter().find(|e| e.id == id).cloned())
    }

    async fn list(&self, query: &EventQuery) -> Result<Vec<Event>> {
        Ok(self
            .events
            .read()
            .await
            .iter()
            .rev()
            .filter(|e| query.matches(e))
            .take(query.limit as usize)
            .cloned()
            .collect())
    }

    async fn record_error(&self, id: EventId, message: &str) -> Result<()> {
        let mut events = self.events.write().await;
        let event = events
            .iter_mut()
            .find(|e| e.id == id)
            .ok_or_else(|| Error::EventNotFound(id.to_string()))?;
        event.processing_error = Some(message.to_string());
        Ok(())
    }
}

/// Builds, with switchable failures per job name.
#[derive(Default)]
pub struct InMemoryBuilds {
    builds: RwLock<Vec<Build>>,
    failing_jobs: RwLock<HashSet<String>>,
}

impl InMemoryBuilds {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a build as-is, bypassing failure injection.
    pub async fn insert(&self, build: Build) {
        self.builds.write().await.push(build);
    }

    pub async fn all(&self) -> Vec<Build> {
        self.builds.read().await.clone()
    }

    pub async fn for_job(&self, pipeline_id: PipelineId, job_name: &str) -> Vec<Build> {
        self.builds
            .read()
            .await
            .iter()
            .filter(|b| b.pipeline_id == pipeline_id && b.job_name == job_name)
            .cloned()
            .collect()
    }

    /// Make creation of builds for `job_name` fail until [`Self::recover`].
    pub async fn fail_job(&self, job_name: &str) {
        self.failing_jobs.write().await.insert(job_name.to_string());
    }

    pub async fn recover(&self, job_name: &str) {
        self.failing_jobs.write().await.remove(job_name);
    }
}

#[async_trait]
impl BuildFactory for InMemoryBuilds {
    async fn create(&self, new: NewBuild) -> Result<Build> {
        if self.failing_jobs.read().await.contains(&new.job_name) {
            return Err(Error::Storage(format!(
                "build store rejected {}",
                new.job_name
            )));
        }

        let build = Build {
            id: BuildId::new(),
            parent_build_ids: new.parent_build_ids(),
            pipeline_id: new.pipeline_id,
            job_id: new.job_id,
            job_name: new.job_name,
            event_id: new.event_id,
            status: new.status,
            parent_builds: new.parent_builds,
            sha: new.sha,
            created_at: Utc::now(),
        };
        self.builds.write().await.push(build.clone());
        Ok(build)
    }

    async fn get(&self, id: BuildId) -> Result<Option<Build>> {
        Ok(self.builds.read().await.iter().find(|b| b.id == id).cloned())
    }
}

#[derive(Default)]
pub struct InMemoryJobs {
    jobs: RwLock<HashMap<(PipelineId, String), Job>>,
}

impl InMemoryJobs {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, pipeline_id: PipelineId, name: &str, is_virtual: bool) -> Job {
        let job = Job {
            id: JobId::new(),
            pipeline_id,
            name: name.to_string(),
            is_virtual,
        };
        self.jobs
            .write()
            .await
            .insert((pipeline_id, name.to_string()), job.clone());
        job
    }
}

#[async_trait]
impl JobFactory for InMemoryJobs {
    async fn get(&self, id: JobId) -> Result<Option<Job>> {
        Ok(self.jobs.read().await.values().find(|j| j.id == id).cloned())
    }

    async fn find(&self, pipeline_id: PipelineId, name: &str) -> Result<Option<Job>> {
        Ok(self
            .jobs
            .read()
            .await
            .get(&(pipeline_id, name.to_string()))
            .cloned())
    }
}

#[derive(Default)]
pub struct InMemoryPipelines {
    pipelines: RwLock<HashMap<PipelineId, Pipeline>>,
}

impl InMemoryPipelines {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, pipeline: Pipeline) {
        self.pipelines.write().await.insert(pipeline.id, pipeline);
    }
}

#[async_trait]
impl PipelineFactory for InMemoryPipelines {
    async fn get(&self, id: PipelineId) -> Result<Option<Pipeline>> {
        Ok(self.pipelines.read().await.get(&id).cloned())
    }
}

/// Authorizer that only lets explicitly allowed owner pairs through.
#[derive(Default)]
pub struct OwnerAllowlist {
    allowed: RwLock<HashSet<(String, String)>>,
}

impl OwnerAllowlist {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allow pipelines of `source` to trigger pipelines of `destination`.
    pub async fn allow(&self, source: &str, destination: &str) {
        self.allowed
            .write()
            .await
            .insert((source.to_string(), destination.to_string()));
    }
}

#[async_trait]
impl Authorizer for OwnerAllowlist {
    async fn authorize_external(&self, source: &Pipeline, destination: &Pipeline) -> Result<()> {
        let pair = (source.owner.clone(), destination.owner.clone());
        if self.allowed.read().await.contains(&pair) {
            Ok(())
        } else {
            Err(Error::Forbidden(format!(
                "{} may not trigger {}",
                source.owner, destination.owner
            )))
        }
    }
}

//! Completion dispatch.
//!
//! Entry point of the trigger engine. A finished build is turned into parent
//! reports on every outgoing edge of its job; satisfied virtual jobs are fed
//! back into the same worklist until the chain settles.

use crate::config::TriggerEngineConfig;
use crate::dag::GraphValidator;
use crate::join::JoinRequirement;
use crate::triggers::{TriggerKind, TriggerOutcome, TriggerRequest, TriggerResolver};
use oxide_core::build::{Build, BuildStatus, ParentBuild, ParentKey};
use oxide_core::event::Event;
use oxide_core::ids::{BuildId, EventId, PipelineId};
use oxide_core::pipeline::Pipeline;
use oxide_core::ports::{
    Authorizer, BuildFactory, EventFactory, JobFactory, JoinStateStore, PipelineFactory,
};
use oxide_core::workflow::Edge;
use oxide_core::{Error, Result};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Collaborators of the dispatcher.
#[derive(Clone)]
pub struct TriggerPorts {
    pub pipelines: Arc<dyn PipelineFactory>,
    pub events: Arc<dyn EventFactory>,
    pub builds: Arc<dyn BuildFactory>,
    pub jobs: Arc<dyn JobFactory>,
    pub authorizer: Arc<dyn Authorizer>,
    pub joins: Arc<dyn JoinStateStore>,
}

/// An edge that could not be resolved. Other edges of the same completion
/// are unaffected.
#[derive(Debug, Clone)]
pub struct EdgeFailure {
    pub source: ParentKey,
    pub destination: ParentKey,
    pub error: Error,
}

/// What one completion caused.
#[derive(Debug, Default)]
pub struct DispatchReport {
    /// Builds created.
    pub started: Vec<Build>,
    /// Jobs whose join can no longer fire.
    pub blocked: Vec<ParentKey>,
    /// Jobs still waiting on other parents.
    pub waiting: Vec<ParentKey>,
    /// Jobs whose join an earlier report already fired or blocked.
    pub settled: Vec<ParentKey>,
    /// Virtual jobs that completed and were propagated.
    pub virtual_completed: Vec<ParentKey>,
    pub failures: Vec<EdgeFailure>,
}

impl DispatchReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// A job completion waiting to be propagated.
#[derive(Debug)]
struct Completion {
    event: Event,
    pipeline_id: PipelineId,
    job_name: String,
    build_id: Option<BuildId>,
    status: BuildStatus,
    /// Virtual jobs between the real build and this completion.
    path: Vec<ParentKey>,
}

impl Completion {
    fn parent_key(&self) -> ParentKey {
        ParentKey::new(self.pipeline_id, self.job_name.clone())
    }

    fn report(&self) -> ParentBuild {
        ParentBuild {
            build_id: self.build_id,
            event_id: self.event.id,
            status: self.status,
        }
    }
}

/// Resolves the downstream effects of finished builds.
pub struct TriggerDispatcher {
    pipelines: Arc<dyn PipelineFactory>,
    events: Arc<dyn EventFactory>,
    jobs: Arc<dyn JobFactory>,
    joins: Arc<dyn JoinStateStore>,
    resolver: TriggerResolver,
    validator: GraphValidator,
    config: TriggerEngineConfig,
}

impl TriggerDispatcher {
    pub fn new(ports: TriggerPorts, config: TriggerEngineConfig) -> Self {
        let resolver = TriggerResolver::new(
            ports.joins.clone(),
            ports.events.clone(),
            ports.builds,
            ports.authorizer,
            config.clone(),
        );
        Self {
            pipelines: ports.pipelines,
            events: ports.events,
            jobs: ports.jobs,
            joins: ports.joins,
            resolver,
            validator: GraphValidator::new(),
            config,
        }
    }

    /// Handle the completion of `build`.
    ///
    /// Redelivering the same completion is safe: joins that already fired or
    /// blocked are not re-evaluated. Settled virtual jobs are walked through
    /// again, so a job reopened after a failed start can still fire. A
    /// virtual job reached again along its own path is a cycle and fails the
    /// edge with a configuration error.
    pub async fn on_build_finished(&self, build: &Build) -> Result<DispatchReport> {
        if !build.status.is_terminal() {
            return Err(Error::Validation(format!(
                "build {} is still {}",
                build.id, build.status
            )));
        }

        let event = self
            .events
            .get(build.event_id)
            .await?
            .ok_or_else(|| Error::EventNotFound(build.event_id.to_string()))?;

        info!(
            build_id = %build.id,
            job = %build.parent_key(),
            status = %build.status,
            event_id = %event.id,
            "Resolving triggers for finished build"
        );

        let mut pipelines = HashMap::new();
        let mut visited = HashSet::new();
        let mut report = DispatchReport::default();
        let mut worklist = VecDeque::from([Completion {
            event,
            pipeline_id: build.pipeline_id,
            job_name: build.job_name.clone(),
            build_id: Some(build.id),
            status: build.status,
            path: Vec::new(),
        }]);

        while let Some(completion) = worklist.pop_front() {
            let source = match self.pipeline(&mut pipelines, completion.pipeline_id).await {
                Ok(pipeline) => pipeline,
                Err(e) => {
                    self.record_event_error(&completion.event, &e).await;
                    return Err(e);
                }
            };

            for (destination_id, edges) in Self::group_edges(&source, &completion.job_name) {
                let destination = match self.pipeline(&mut pipelines, destination_id).await {
                    Ok(pipeline) => pipeline,
                    Err(e) => {
                        for edge in edges {
                            let failure = EdgeFailure {
                                source: completion.parent_key(),
                                destination: edge.dest.qualify(source.id),
                                error: e.clone(),
                            };
                            self.record_failure(&mut report, &completion.event, failure)
                                .await;
                        }
                        continue;
                    }
                };

                for edge in edges {
                    let destination_key = edge.dest.qualify(source.id);
                    let outcome = self
                        .trigger_edge(&source, &destination, &completion, edge)
                        .await;

                    match outcome {
                        Ok(TriggerOutcome::Started(build)) => report.started.push(build),
                        Ok(TriggerOutcome::Waiting) => report.waiting.push(destination_key),
                        Ok(TriggerOutcome::Settled(job)) => report.settled.push(job),
                        Ok(TriggerOutcome::Blocked { job, reason }) => {
                            debug!(job = %job, reason = %reason, "Job will not run");
                            report.blocked.push(job);
                        }
                        Ok(TriggerOutcome::Virtual {
                            event,
                            job,
                            status,
                            replay,
                        }) => {
                            let error = if completion.path.contains(&destination_key) {
                                Some(Error::Configuration(format!(
                                    "virtual job {destination_key} is part of a cycle"
                                )))
                            } else if completion.path.len() >= self.config.max_virtual_depth {
                                Some(Error::Configuration(format!(
                                    "virtual propagation exceeded depth {}",
                                    self.config.max_virtual_depth
                                )))
                            } else {
                                None
                            };
                            if let Some(error) = error {
                                let failure = EdgeFailure {
                                    source: completion.parent_key(),
                                    destination: destination_key,
                                    error,
                                };
                                self.record_failure(&mut report, &completion.event, failure)
                                    .await;
                                continue;
                            }

                            // Another branch of this completion already propagated it.
                            if !visited.insert((event.id, destination_key.clone())) {
                                report.settled.push(destination_key);
                                continue;
                            }

                            if replay {
                                report.settled.push(destination_key.clone());
                            } else if status.is_success() {
                                report.virtual_completed.push(destination_key.clone());
                            } else {
                                report.blocked.push(destination_key.clone());
                            }
                            let mut path = completion.path.clone();
                            path.push(destination_key);
                            worklist.push_back(Completion {
                                event,
                                pipeline_id: job.pipeline_id,
                                job_name: job.name,
                                build_id: None,
                                status,
                                path,
                            });
                        }
                        Err(error) => {
                            let failure = EdgeFailure {
                                source: completion.parent_key(),
                                destination: destination_key,
                                error,
                            };
                            self.record_failure(&mut report, &completion.event, failure)
                                .await;
                        }
                    }
                }
            }
        }

        info!(
            build_id = %build.id,
            started = report.started.len(),
            waiting = report.waiting.len(),
            settled = report.settled.len(),
            blocked = report.blocked.len(),
            failures = report.failures.len(),
            "Trigger resolution finished"
        );
        Ok(report)
    }

    /// Drop the fired and blocked joins scoped to a closed event.
    ///
    /// Completions redelivered afterwards are no longer deduplicated against
    /// those joins. Joins fed from several pipelines are scoped to the causal
    /// root, so they go away with the root event.
    pub async fn prune_joins(&self, event_id: EventId) -> Result<u64> {
        let event = self
            .events
            .get(event_id)
            .await?
            .ok_or_else(|| Error::EventNotFound(event_id.to_string()))?;
        if event.is_open() {
            return Err(Error::Validation(format!("event {event_id} is still open")));
        }

        let removed = self.joins.prune(event.id).await?;
        info!(event_id = %event.id, removed, "Pruned settled joins");
        Ok(removed)
    }

    async fn trigger_edge(
        &self,
        source: &Pipeline,
        destination: &Pipeline,
        completion: &Completion,
        edge: &Edge,
    ) -> Result<TriggerOutcome> {
        let job = self
            .jobs
            .find(destination.id, &edge.dest.name)
            .await?
            .ok_or_else(|| Error::JobNotFound(edge.dest.qualify(source.id).to_string()))?;

        let requirement =
            JoinRequirement::for_job(&destination.workflow_graph, destination.id, &job.name)?;
        let kind = TriggerKind::classify(source, destination, edge.join);

        debug!(
            source = %completion.parent_key(),
            destination = %edge.dest.qualify(source.id),
            trigger = %kind,
            "Resolving edge"
        );

        self.resolver
            .resolve(
                kind,
                TriggerRequest {
                    event: &completion.event,
                    source,
                    destination,
                    next_job: &job,
                    requirement: &requirement,
                    parent: completion.parent_key(),
                    report: completion.report(),
                },
            )
            .await
    }

    /// Outgoing edges of `job`, grouped by destination pipeline with the
    /// source pipeline first.
    fn group_edges<'a>(source: &'a Pipeline, job: &'a str) -> Vec<(PipelineId, Vec<&'a Edge>)> {
        let mut local = Vec::new();
        let mut remote: BTreeMap<PipelineId, Vec<&Edge>> = BTreeMap::new();
        for edge in source.workflow_graph.outgoing(job) {
            match edge.dest.pipeline_in(source.id) {
                id if id == source.id => local.push(edge),
                id => remote.entry(id).or_default().push(edge),
            }
        }

        let mut groups = Vec::with_capacity(remote.len() + 1);
        if !local.is_empty() {
            groups.push((source.id, local));
        }
        groups.extend(remote);
        groups
    }

    async fn pipeline(
        &self,
        cache: &mut HashMap<PipelineId, Arc<Pipeline>>,
        id: PipelineId,
    ) -> Result<Arc<Pipeline>> {
        if let Some(pipeline) = cache.get(&id) {
            return Ok(pipeline.clone());
        }
        let pipeline = self
            .pipelines
            .get(id)
            .await?
            .ok_or_else(|| Error::PipelineNotFound(id.to_string()))?;
        self.validator.validate(&pipeline)?;

        let pipeline = Arc::new(pipeline);
        cache.insert(id, pipeline.clone());
        Ok(pipeline)
    }

    async fn record_failure(&self, report: &mut DispatchReport, event: &Event, failure: EdgeFailure) {
        warn!(
            source = %failure.source,
            destination = %failure.destination,
            error = %failure.error,
            "Failed to resolve trigger"
        );
        if failure.error.is_configuration() {
            self.record_event_error(event, &failure.error).await;
        }
        report.failures.push(failure);
    }

    async fn record_event_error(&self, event: &Event, error: &Error) {
        if let Err(e) = self.events.record_error(event.id, &error.to_string()).await {
            warn!(event_id = %event.id, error = %e, "Failed to record event error");
        }
    }
}

//! Join requirements and readiness evaluation.
//!
//! A node's requirement is the set of parents feeding it, each tagged with
//! the join type of its edge. AND parents must all succeed; any one of the OR
//! parents is enough. With both present, the node needs the AND group
//! satisfied and at least one OR success.

use oxide_core::build::{ParentBuilds, ParentKey};
use oxide_core::ids::PipelineId;
use oxide_core::workflow::{JoinType, WorkflowGraph};
use oxide_core::{Error, Result};
use std::collections::BTreeMap;

/// Parents a job waits for, as declared by the graph of its own pipeline.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JoinRequirement {
    parents: BTreeMap<ParentKey, JoinType>,
}

impl JoinRequirement {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a parent with the join type of its edge.
    pub fn with_parent(mut self, parent: ParentKey, join: JoinType) -> Self {
        self.parents.insert(parent, join);
        self
    }

    /// Build the requirement of `job` from the incoming edges of `graph`,
    /// which belongs to `pipeline_id`. Start markers are satisfied by the
    /// event itself and are not part of any join.
    pub fn for_job(graph: &WorkflowGraph, pipeline_id: PipelineId, job: &str) -> Result<Self> {
        let mut parents = BTreeMap::new();
        for edge in graph.incoming(job).filter(|e| !e.src.is_start_marker()) {
            let key = edge.src.qualify(pipeline_id);
            if let Some(previous) = parents.insert(key.clone(), edge.join)
                && previous != edge.join
            {
                return Err(Error::Configuration(format!(
                    "{key} feeds {job} with both {previous} and {} joins",
                    edge.join
                )));
            }
        }

        if parents.is_empty() {
            return Err(Error::Configuration(format!(
                "job {job} of pipeline {pipeline_id} declares no parents"
            )));
        }
        Ok(Self { parents })
    }

    pub fn join_type(&self, parent: &ParentKey) -> Option<JoinType> {
        self.parents.get(parent).copied()
    }

    pub fn contains(&self, parent: &ParentKey) -> bool {
        self.parents.contains_key(parent)
    }

    pub fn len(&self) -> usize {
        self.parents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parents.is_empty()
    }

    /// Whether any parent lives outside `pipeline_id`.
    pub fn is_cross_pipeline(&self, pipeline_id: PipelineId) -> bool {
        self.parents.keys().any(|k| k.pipeline_id != pipeline_id)
    }

    fn group(&self, join: JoinType) -> impl Iterator<Item = &ParentKey> {
        self.parents
            .iter()
            .filter(move |(_, j)| **j == join)
            .map(|(k, _)| k)
    }
}

/// Readiness of a join.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JoinDecision {
    /// More reports are needed.
    NotReady,
    /// The join is satisfied by these reports.
    Ready(ParentBuilds),
    /// No future report can satisfy the join.
    Blocked(String),
    /// An earlier report already settled the join, firing it when `fired`
    /// and blocking it otherwise.
    Settled { fired: bool },
}

/// Stateless evaluator of join readiness.
pub struct JoinEvaluator;

impl JoinEvaluator {
    pub fn evaluate(requirement: &JoinRequirement, snapshot: &ParentBuilds) -> JoinDecision {
        if requirement.is_empty() {
            return JoinDecision::Blocked("join has no declared parents".to_string());
        }

        let status = |key: &ParentKey| {
            snapshot
                .get(key)
                .map(|b| b.status)
                .filter(|s| s.is_terminal())
        };

        let mut and_satisfied = true;
        for key in requirement.group(JoinType::And) {
            match status(key) {
                Some(s) if s.is_success() => {}
                Some(s) => {
                    return JoinDecision::Blocked(format!("{key} finished with status {s}"));
                }
                None => and_satisfied = false,
            }
        }

        let mut or_parents = requirement.group(JoinType::Or).peekable();
        let or_satisfied = if or_parents.peek().is_none() {
            true
        } else {
            let mut any_success = false;
            let mut all_reported = true;
            for key in or_parents {
                match status(key) {
                    Some(s) if s.is_success() => any_success = true,
                    Some(_) => {}
                    None => all_reported = false,
                }
            }
            if !any_success && all_reported {
                return JoinDecision::Blocked("no OR parent succeeded".to_string());
            }
            any_success
        };

        if and_satisfied && or_satisfied {
            JoinDecision::Ready(snapshot.clone())
        } else {
            JoinDecision::NotReady
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use oxide_core::build::{BuildStatus, ParentBuild};
    use oxide_core::ids::{BuildId, EventId};
    use oxide_core::workflow::JobRef;

    struct Fixture {
        pipeline_id: PipelineId,
        event_id: EventId,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                pipeline_id: PipelineId::new(),
                event_id: EventId::new(),
            }
        }

        fn key(&self, job: &str) -> ParentKey {
            ParentKey::new(self.pipeline_id, job)
        }

        fn requirement(&self, parents: &[(&str, JoinType)]) -> JoinRequirement {
            parents
                .iter()
                .fold(JoinRequirement::new(), |r, (job, join)| {
                    r.with_parent(self.key(job), *join)
                })
        }

        fn report(&self, snapshot: &mut ParentBuilds, job: &str, status: BuildStatus) {
            snapshot.record(
                self.key(job),
                ParentBuild {
                    build_id: Some(BuildId::new()),
                    event_id: self.event_id,
                    status,
                },
            );
        }
    }

    #[test]
    fn test_and_waits_for_all_parents() {
        let f = Fixture::new();
        let req = f.requirement(&[("a", JoinType::And), ("b", JoinType::And)]);
        let mut snapshot = ParentBuilds::new();

        f.report(&mut snapshot, "a", BuildStatus::Success);
        assert_eq!(JoinEvaluator::evaluate(&req, &snapshot), JoinDecision::NotReady);

        f.report(&mut snapshot, "b", BuildStatus::Success);
        assert!(matches!(
            JoinEvaluator::evaluate(&req, &snapshot),
            JoinDecision::Ready(s) if s.len() == 2
        ));
    }

    #[test]
    fn test_and_blocks_on_first_failure() {
        let f = Fixture::new();
        let req = f.requirement(&[("a", JoinType::And), ("b", JoinType::And)]);
        let mut snapshot = ParentBuilds::new();

        f.report(&mut snapshot, "b", BuildStatus::Aborted);
        assert!(matches!(
            JoinEvaluator::evaluate(&req, &snapshot),
            JoinDecision::Blocked(_)
        ));

        f.report(&mut snapshot, "a", BuildStatus::Success);
        assert!(matches!(
            JoinEvaluator::evaluate(&req, &snapshot),
            JoinDecision::Blocked(_)
        ));
    }

    #[test]
    fn test_or_fires_on_first_success() {
        let f = Fixture::new();
        let req = f.requirement(&[("a", JoinType::Or), ("b", JoinType::Or)]);
        let mut snapshot = ParentBuilds::new();

        f.report(&mut snapshot, "b", BuildStatus::Success);
        assert!(matches!(
            JoinEvaluator::evaluate(&req, &snapshot),
            JoinDecision::Ready(_)
        ));
    }

    #[test]
    fn test_or_failure_does_not_fail_fast() {
        let f = Fixture::new();
        let req = f.requirement(&[("a", JoinType::Or), ("b", JoinType::Or)]);
        let mut snapshot = ParentBuilds::new();

        f.report(&mut snapshot, "a", BuildStatus::Failure);
        assert_eq!(JoinEvaluator::evaluate(&req, &snapshot), JoinDecision::NotReady);

        f.report(&mut snapshot, "b", BuildStatus::Success);
        assert!(matches!(
            JoinEvaluator::evaluate(&req, &snapshot),
            JoinDecision::Ready(_)
        ));
    }

    #[test]
    fn test_or_blocks_when_exhausted() {
        let f = Fixture::new();
        let req = f.requirement(&[("a", JoinType::Or), ("b", JoinType::Or)]);
        let mut snapshot = ParentBuilds::new();

        f.report(&mut snapshot, "a", BuildStatus::Failure);
        f.report(&mut snapshot, "b", BuildStatus::Unstable);
        assert_eq!(
            JoinEvaluator::evaluate(&req, &snapshot),
            JoinDecision::Blocked("no OR parent succeeded".to_string())
        );
    }

    #[test]
    fn test_mixed_groups() {
        let f = Fixture::new();
        let req = f.requirement(&[
            ("a", JoinType::And),
            ("b", JoinType::And),
            ("c", JoinType::Or),
            ("d", JoinType::Or),
        ]);
        let mut snapshot = ParentBuilds::new();

        f.report(&mut snapshot, "c", BuildStatus::Success);
        f.report(&mut snapshot, "a", BuildStatus::Success);
        assert_eq!(JoinEvaluator::evaluate(&req, &snapshot), JoinDecision::NotReady);

        f.report(&mut snapshot, "b", BuildStatus::Success);
        assert!(matches!(
            JoinEvaluator::evaluate(&req, &snapshot),
            JoinDecision::Ready(_)
        ));
    }

    #[test]
    fn test_mixed_groups_need_an_or_success() {
        let f = Fixture::new();
        let req = f.requirement(&[("a", JoinType::And), ("c", JoinType::Or)]);
        let mut snapshot = ParentBuilds::new();

        f.report(&mut snapshot, "a", BuildStatus::Success);
        assert_eq!(JoinEvaluator::evaluate(&req, &snapshot), JoinDecision::NotReady);

        f.report(&mut snapshot, "c", BuildStatus::Failure);
        assert!(matches!(
            JoinEvaluator::evaluate(&req, &snapshot),
            JoinDecision::Blocked(_)
        ));
    }

    #[test]
    fn test_running_reports_are_ignored() {
        let f = Fixture::new();
        let req = f.requirement(&[("a", JoinType::And)]);
        let mut snapshot = ParentBuilds::new();

        f.report(&mut snapshot, "a", BuildStatus::Running);
        assert_eq!(JoinEvaluator::evaluate(&req, &snapshot), JoinDecision::NotReady);
    }

    #[test]
    fn test_requirement_from_graph() {
        let pipeline_id = PipelineId::new();
        let upstream = PipelineId::new();
        let graph = WorkflowGraph::new()
            .with_edge(JobRef::local("~commit"), JobRef::local("build"), JoinType::Or)
            .with_edge(JobRef::local("build"), JobRef::local("deploy"), JoinType::And)
            .with_edge(JobRef::remote(upstream, "test"), JobRef::local("deploy"), JoinType::And);

        let req = JoinRequirement::for_job(&graph, pipeline_id, "deploy").unwrap();
        assert_eq!(req.len(), 2);
        assert!(req.contains(&ParentKey::new(upstream, "test")));
        assert!(req.is_cross_pipeline(pipeline_id));

        let err = JoinRequirement::for_job(&graph, pipeline_id, "build").unwrap_err();
        assert!(err.is_configuration());
    }

    #[test]
    fn test_conflicting_join_types_rejected() {
        let pipeline_id = PipelineId::new();
        let graph = WorkflowGraph::new()
            .with_edge(JobRef::local("a"), JobRef::local("b"), JoinType::And)
            .with_edge(JobRef::local("a"), JobRef::local("b"), JoinType::Or);

        assert!(JoinRequirement::for_job(&graph, pipeline_id, "b").is_err());
    }
}

//! Trigger resolution and join evaluation for Oxide CI workflows.
//!
//! When a build finishes, [`TriggerDispatcher`] works out which downstream
//! jobs become runnable: it accumulates parent reports per join, decides AND
//! and OR joins, creates builds exactly once per satisfied join, and carries
//! completions through virtual jobs and across pipelines.

pub mod config;
pub mod dag;
pub mod dispatcher;
pub mod join;
pub mod locks;
pub mod memory;
pub mod parent_builds;
pub mod triggers;

pub use config::TriggerEngineConfig;
pub use dispatcher::{DispatchReport, EdgeFailure, TriggerDispatcher, TriggerPorts};
pub use join::{JoinDecision, JoinEvaluator, JoinRequirement};
pub use memory::InMemoryJoinStateStore;
pub use parent_builds::ParentBuildsTracker;
pub use triggers::{TriggerKind, TriggerOutcome, TriggerScope};

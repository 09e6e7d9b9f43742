//! Test infrastructure for the Oxide CI trigger engine.
//!
//! Provides in-memory implementations of the engine's collaborators, fixtures
//! for common workflow shapes, and a testcontainers-based PostgreSQL context
//! for exercising the join-state store.
//!
//! # Usage
//!
//! ```ignore
//! use oxide_tests::TestContext;
//!
//! #[tokio::test]
//! async fn test_something() {
//!     let ctx = TestContext::new();
//!     // Register pipelines, then ctx.complete(&event, "build", BuildStatus::Success)
//! }
//! ```

pub mod containers;
pub mod context;
pub mod fixtures;
pub mod helpers;

pub use context::TestContext;
pub use fixtures::*;
pub use helpers::*;

/// Initialize test logging (call once per test binary).
pub fn init_test_logging() {
    use tracing_subscriber::{fmt, EnvFilter};

    let _ = fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("warn,oxide_triggers=debug,oxide_tests=debug")),
        )
        .with_test_writer()
        .try_init();
}

//! Error types for the Oxide CI trigger engine.

use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum Error {
    // Graph and definition errors
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Pipeline not found: {0}")]
    PipelineNotFound(String),

    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("Event not found: {0}")]
    EventNotFound(String),

    // Trigger resolution errors
    #[error("Concurrency conflict: {0}")]
    ConcurrencyConflict(String),

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    // Infrastructure errors
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl Error {
    /// Whether this error comes from a broken workflow definition rather
    /// than from the infrastructure.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Error::Configuration(_) | Error::PipelineNotFound(_) | Error::JobNotFound(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

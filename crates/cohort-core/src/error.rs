use thiserror::Error;

/// A convenience `Result` alias using [`CohortError`].
pub type CohortResult<T> = Result<T, CohortError>;

/// Top-level error type for the Cohort crates.
///
/// Unknown ids and empty pools are not errors: the orchestrator reports them
/// through logs and `bool`/`Option` returns. These variants cover the few
/// failures a caller has to act on.
#[derive(Error, Debug)]
pub enum CohortError {
    /// Configuration could not be parsed or failed validation.
    #[error("Config error: {0}")]
    Config(String),

    /// A bounded registry is full.
    #[error("Capacity exceeded: {0}")]
    Capacity(String),

    /// An operation referenced an entity that does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// An internal fault inside the orchestration cycle.
    #[error("Orchestrator error: {0}")]
    Orchestrator(String),

    /// A JSON serialization or deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A standard I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

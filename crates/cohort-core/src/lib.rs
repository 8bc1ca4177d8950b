//! Core error definitions and logging setup shared by the Cohort crates.
//!
//! # Main types
//!
//! - [`CohortError`]: Unified error enum for orchestration subsystems.
//! - [`CohortResult`]: Convenience alias for `Result<T, CohortError>`.
//! - [`logging::init`]: Installs the `tracing` subscriber used by hosts and tests.

/// Error enum and result alias.
pub mod error;
/// Tracing subscriber initialisation.
pub mod logging;

pub use error::{CohortError, CohortResult};

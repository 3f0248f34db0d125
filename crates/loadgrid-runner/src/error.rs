//! Runner error types.

use thiserror::Error;

/// Errors that can occur in the local control loop.
///
/// Only configuration mistakes surface here; per-instance task errors are
/// captured, deduplicated, and reported through events instead.
#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("unknown user class: {0}")]
    UnknownClass(String),
}

pub type RunnerResult<T> = Result<T, RunnerError>;

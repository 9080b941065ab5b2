//! Container engine error types.

use std::time::Duration;

use thiserror::Error;

pub type EngineResult<T> = Result<T, EngineError>;

/// Errors from container engine calls.
///
/// `NotFound` is kept distinct from every other failure: reconciliation
/// reports a missing container as `not_found` but any other failure as `error`.
#[derive(Debug, Clone, Error)]
pub enum EngineError {
    #[error("container not found: {0}")]
    NotFound(String),

    #[error("image not found: {0}")]
    ImageNotFound(String),

    #[error("engine command failed: {0}")]
    Command(String),

    #[error("engine call timed out after {0:?}")]
    Timeout(Duration),

    #[error("failed to invoke engine: {0}")]
    Spawn(String),

    #[error("unexpected engine output: {0}")]
    Parse(String),
}

impl EngineError {
    /// True if the referenced container does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

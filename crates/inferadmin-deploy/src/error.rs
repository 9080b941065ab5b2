//! Deployment service error types.

use inferadmin_dispatch::DispatchError;
use inferadmin_engine::EngineError;
use inferadmin_state::StateError;
use thiserror::Error;

pub type DeployResult<T> = Result<T, DeployError>;

#[derive(Debug, Error)]
pub enum DeployError {
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("image is not managed by inferadmin: {0}")]
    ImageNotManaged(String),

    #[error("model not found at {0}")]
    ModelNotFound(String),

    #[error("filesystem error: {0}")]
    Io(String),

    #[error("state store error: {0}")]
    State(#[from] StateError),

    #[error("container engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("dispatch error: {0}")]
    Dispatch(#[from] DispatchError),
}

impl DeployError {
    pub(crate) fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            id: id.into(),
        }
    }
}

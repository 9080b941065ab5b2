//! Dispatcher error types.

use thiserror::Error;

use crate::dispatcher::PoolKind;

pub type DispatchResult<T> = Result<T, DispatchError>;

/// Failures of the offload mechanism itself.
///
/// Errors returned *by* an offloaded operation are not wrapped: an operation
/// returning `Result<T, E>` resolves to `Ok(Result<T, E>)`.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("{0} pool queue is full")]
    Saturated(PoolKind),

    #[error("dispatcher is shut down")]
    ShutDown,

    #[error("blocking operation panicked: {0}")]
    Panicked(String),

    #[error("worker dropped the operation before completing it")]
    Cancelled,

    #[error("failed to spawn worker thread: {0}")]
    Spawn(String),
}

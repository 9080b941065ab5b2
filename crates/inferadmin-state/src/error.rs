//! Error types for the record store.

use thiserror::Error;

/// Result type alias for record store operations.
pub type StateResult<T> = Result<T, StateError>;

/// Errors surfaced by record store operations.
///
/// Read failures on the backing document are not represented here: they are
/// logged and recovered as an empty collection by [`crate::RecordStore::list_all`].
#[derive(Debug, Error)]
pub enum StateError {
    #[error("state directory error: {0}")]
    Io(String),

    #[error("write error: {0}")]
    Write(String),

    #[error("serialization error: {0}")]
    Serialize(String),

    #[error("duplicate record id: {0}")]
    DuplicateId(String),

    #[error("not found: {0}")]
    NotFound(String),
}

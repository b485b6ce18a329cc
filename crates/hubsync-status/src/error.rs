//! Error types for hubsync-status

use hubsync_core::HandlerError;
use thiserror::Error;

/// Result type for hubsync-status operations
pub type Result<T> = std::result::Result<T, Error>;

/// Failure reported by a status repository
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// The store is temporarily unavailable (connection, lock, conflict).
    /// Nothing from the failed transaction was applied.
    #[error("transient storage error: {0}")]
    Transient(String),

    /// Stored data could not be read back
    #[error("corrupt stored data: {0}")]
    Corrupt(String),
}

impl StoreError {
    /// Create a transient store error
    pub fn transient(msg: impl Into<String>) -> Self {
        StoreError::Transient(msg.into())
    }

    /// Create a corrupt-data store error
    pub fn corrupt(msg: impl Into<String>) -> Self {
        StoreError::Corrupt(msg.into())
    }
}

/// Errors from bundle decoding and status handlers
#[derive(Debug, Error)]
pub enum Error {
    /// Bundle payload could not be encoded or decoded
    #[error("bundle codec error: {0}")]
    Codec(#[from] bincode::Error),

    /// Repository failure
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Status name outside the vocabulary
    #[error("unknown status value: {0}")]
    UnknownStatus(String),
}

impl From<StoreError> for HandlerError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Transient(msg) => HandlerError::Transient(msg),
            StoreError::Corrupt(msg) => HandlerError::Malformed(msg),
        }
    }
}

impl From<Error> for HandlerError {
    fn from(err: Error) -> Self {
        match err {
            Error::Store(store) => store.into(),
            other => HandlerError::Malformed(other.to_string()),
        }
    }
}

fn _assert_error_send_sync<T: Send + Sync>() {}
fn _error_is_send_sync() {
    _assert_error_send_sync::<Error>();
    _assert_error_send_sync::<StoreError>();
}

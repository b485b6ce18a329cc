//! Error types for database operations.

use hubsync_status::StoreError;
use thiserror::Error;

/// Errors that can occur during database operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Native DB error.
    #[error("Database error: {0}")]
    Database(String),

    /// A stored row could not be decoded.
    #[error("Corrupt row {id}: {reason}")]
    Corrupt {
        /// Primary key of the row.
        id: String,
        /// What was wrong with it.
        reason: String,
    },

    /// A source, policy or cluster name contains the key separator.
    #[error("Invalid name {name:?}: contains the key separator")]
    InvalidName {
        /// The rejected name.
        name: String,
    },

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for database operations.
pub type Result<T> = std::result::Result<T, Error>;

impl From<native_db::db_type::Error> for Error {
    fn from(err: native_db::db_type::Error) -> Self {
        Error::Database(err.to_string())
    }
}

impl From<Error> for StoreError {
    fn from(err: Error) -> Self {
        match err {
            Error::Corrupt { .. } | Error::InvalidName { .. } => {
                StoreError::Corrupt(err.to_string())
            }
            Error::Database(_) | Error::Io(_) => StoreError::Transient(err.to_string()),
        }
    }
}

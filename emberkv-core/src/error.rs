//! Error types for store operations.

use thiserror::Error;

/// Errors surfaced by [`Store`](crate::Store) operations.
#[derive(Error, Debug)]
pub enum StoreError {
    /// Key absent from its namespace, or present but already expired.
    #[error("{0}")]
    NotFound(String),

    /// Malformed arguments: mismatched field arrays, invalid list ranges,
    /// or a key unusable as a file name.
    #[error("{0}")]
    InvalidArgument(String),

    /// Filesystem failure while opening the database.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// Record serialization failed.
    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StoreError {
    /// Returns `true` if this error means the key (or field) was absent.
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound(_))
    }
}

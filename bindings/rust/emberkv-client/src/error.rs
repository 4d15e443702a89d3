//! Error types for the emberkv client.

use thiserror::Error;

/// Errors that can occur when using the emberkv client.
#[derive(Error, Debug)]
pub enum Error {
    /// Failed to connect to the server
    #[error("Connection error: {0}")]
    Connection(String),

    /// gRPC transport error
    #[error("Transport error: {0}")]
    Transport(#[from] tonic::transport::Error),

    /// The key, hash field, or list was absent on the server
    #[error("Not found: {0}")]
    NotFound(String),

    /// The server rejected the request arguments
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Any other gRPC status
    #[error("gRPC error: {0}")]
    Grpc(#[from] tonic::Status),

    /// JSON serialization error (requires `json` feature)
    #[cfg(feature = "json")]
    #[error("Serialization error: {0}")]
    Serialization(#[source] serde_json::Error),

    /// JSON deserialization error (requires `json` feature)
    #[cfg(feature = "json")]
    #[error("Deserialization error: {0}")]
    Deserialization(#[source] serde_json::Error),
}

impl Error {
    /// Returns `true` if this error means the requested key was absent.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }

    /// Creates an error from a tonic Status, mapping the store's NotFound
    /// and InvalidArgument codes to their dedicated variants.
    pub(crate) fn from_status(status: tonic::Status) -> Self {
        match status.code() {
            tonic::Code::NotFound => Error::NotFound(status.message().to_string()),
            tonic::Code::InvalidArgument => Error::InvalidArgument(status.message().to_string()),
            _ => Error::Grpc(status),
        }
    }
}

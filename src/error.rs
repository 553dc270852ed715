//! MemRag error types

use thiserror::Error;

/// MemRag error type
#[derive(Error, Debug)]
pub enum Error {
    /// Bad input shape; rejected synchronously and never retried
    #[error("Validation error: {0}")]
    Validation(String),

    /// Record or object does not exist. Normal control flow, not logged.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Vector length differs from the index dimension
    #[error("Dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    /// Embedding provider failed after bounded retries
    #[error("Embedding unavailable: {0}")]
    EmbeddingUnavailable(String),

    /// Cold tier could not be reached; hot tier keeps working
    #[error("Sync degraded: {0}")]
    SyncDegraded(String),

    /// Restore could not start (individual bad objects are reported, not raised)
    #[error("Restore error: {0}")]
    Restore(String),

    /// Permanent cold storage failure
    #[error("Storage error: {0}")]
    Storage(String),

    /// Transient cold storage failure, eligible for retry
    #[error("Storage unavailable: {0}")]
    StorageUnavailable(String),

    /// Object failed to decode
    #[error("Corrupt object: {0}")]
    Corrupt(String),

    /// Cooperative cancellation was requested
    #[error("Operation cancelled")]
    Cancelled,

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Cryptographic error
    #[error("Crypto error: {0}")]
    Crypto(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// HTTP error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether retrying the same operation may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::StorageUnavailable(_) | Error::EmbeddingUnavailable(_) => true,
            Error::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::Interrupted
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::WouldBlock
            ),
            Error::Http(e) => e.is_timeout() || e.is_connect(),
            _ => false,
        }
    }
}

/// Result type alias for MemRag operations
pub type Result<T> = std::result::Result<T, Error>;

//! Error types for the Gantry state store.

use thiserror::Error;

/// Result type alias for state store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors that can occur during state store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to open database: {0}")]
    Open(String),

    #[error("transaction error: {0}")]
    Transaction(String),

    #[error("table error: {0}")]
    Table(String),

    #[error("read error: {0}")]
    Read(String),

    #[error("write error: {0}")]
    Write(String),

    #[error("serialization error: {0}")]
    Serialize(String),

    #[error("deserialization error: {0}")]
    Deserialize(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// Lock-wait/deadlock analog. Retryable via [`crate::with_retries`].
    #[error("store contention: {0}")]
    Contention(String),
}

impl StoreError {
    /// Whether the operation that produced this error is worth retrying.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Contention(_))
    }
}

//! Error types for the pool manager.

use thiserror::Error;

/// Result type alias for pool operations.
pub type PoolResult<T> = Result<T, PoolError>;

/// Errors that can occur during pool management.
#[derive(Debug, Error)]
pub enum PoolError {
    #[error(transparent)]
    Store(#[from] gantry_store::StoreError),

    #[error("malformed job result: {0}")]
    BadJobResult(String),
}

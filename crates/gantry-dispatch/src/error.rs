//! Error types for the dispatcher.

use thiserror::Error;

/// Result type alias for dispatch operations.
pub type DispatchResult<T> = Result<T, DispatchError>;

/// Errors that can occur while dispatching device jobs.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error(transparent)]
    Store(#[from] gantry_store::StoreError),

    #[error("device {0} not found")]
    DeviceNotFound(u64),

    #[error("load balancer {0} not found")]
    LbNotFound(u64),

    #[error("malformed job result: {0}")]
    BadJobResult(String),
}

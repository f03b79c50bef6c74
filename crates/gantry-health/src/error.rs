//! Error types for the health scheduler.

use thiserror::Error;

/// Result type alias for health operations.
pub type HealthResult<T> = Result<T, HealthError>;

/// Errors that can occur during health scheduling and repair.
#[derive(Debug, Error)]
pub enum HealthError {
    #[error(transparent)]
    Store(#[from] gantry_store::StoreError),

    #[error(transparent)]
    Dispatch(#[from] gantry_dispatch::DispatchError),

    #[error("device {0} not found")]
    DeviceNotFound(u64),

    /// The spare pool is exhausted; the caller retries next cycle.
    #[error("no spare device available for rebuild")]
    NoSpareDevice,

    /// The unassigned floating-IP pool is exhausted.
    #[error("no floating ip available")]
    NoFloatingIp,

    /// The spare rejected the configuration or the IP could not be bound.
    #[error("rebuild onto device {0} failed")]
    RebuildFailed(u64),

    /// Too many diagnostics failures in one cycle; nothing was deleted.
    #[error("offline cycle aborted: {failed} failures over limit {limit}")]
    ErrorLimitExceeded { failed: u32, limit: u32 },
}

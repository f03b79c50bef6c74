//! Error types for the worker controller.

use thiserror::Error;

/// Result type alias for worker operations.
pub type WorkerResult<T> = Result<T, WorkerError>;

/// Errors raised by the compute-provisioning backend.
#[derive(Debug, Error)]
pub enum ComputeError {
    #[error("server not found: {0}")]
    ServerNotFound(String),

    #[error("floating ip not found: {0}")]
    IpNotFound(String),

    #[error("provisioning request failed: {0}")]
    Request(String),
}

/// Errors that can occur while handling worker jobs.
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error(transparent)]
    Store(#[from] gantry_store::StoreError),

    #[error(transparent)]
    Compute(#[from] ComputeError),

    #[error("server {0} never became active")]
    BuildTimedOut(String),

    #[error("post-build diagnostics failed for {0}")]
    DiagnosticsFailed(String),

    #[error("floating ip {ip} never bound to {server}")]
    IpBindTimedOut { ip: String, server: String },

    #[error("rate limit exceeded for {0}")]
    RateLimited(String),
}

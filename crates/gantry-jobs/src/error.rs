//! Error types for the job-queue transport.

use thiserror::Error;

/// Errors surfaced by a [`crate::JobTransport`].
///
/// Disconnection is its own variant because the caller's remediation
/// differs from a timeout: a lost job server is retried next cycle, while
/// an unresponsive worker marks the device in error.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("job server connection lost")]
    Disconnected,

    #[error("transport failure: {0}")]
    Other(String),
}

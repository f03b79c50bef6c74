//! Job-queue transport abstraction.
//!
//! A transport only knows how to hand a payload to a named worker and to
//! report whether that job has produced a result yet. Blocking-wait
//! semantics, retry bounds and outcome classification live in
//! [`crate::JobClient`].

use serde_json::Value;

use crate::error::TransportError;

/// Opaque handle for a submitted job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct JobHandle(pub u64);

/// State of a submitted job as seen by the transport.
#[derive(Debug, Clone, PartialEq)]
pub enum PollStatus {
    /// The worker has not produced a result yet.
    Pending,
    /// The worker returned this payload.
    Done(Value),
}

/// The queue protocol surface consumed by every Gantry component.
///
/// Implementations must be cheap to call from a poll loop; completion is
/// signalled asynchronously by the queue, never by blocking here.
pub trait JobTransport: Send + Sync {
    /// Hand a payload to the named worker. Returns a handle for polling.
    fn submit(&self, worker: &str, payload: &Value) -> Result<JobHandle, TransportError>;

    /// Check whether a job has reached a result.
    fn poll(&self, handle: JobHandle) -> Result<PollStatus, TransportError>;
}

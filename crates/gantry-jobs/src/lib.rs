//! gantry-jobs — job-queue client for the Gantry control plane.
//!
//! The underlying queue protocol signals completion asynchronously, so the
//! [`JobClient`] turns submit-then-poll into a blocking wait with a bounded
//! retry count. Callers always get one of three terminal outcomes:
//! completed, timed out, or disconnected — each implies a different
//! remediation and is surfaced distinctly.
//!
//! The [`protocol`] module carries the normative wire shapes shared by the
//! pool manager, the dispatcher and the worker controller.

pub mod client;
pub mod error;
pub mod mem;
pub mod protocol;
pub mod transport;

pub use client::{JobClient, JobOutcome};
pub use error::TransportError;
pub use mem::InMemoryQueue;
pub use transport::{JobHandle, JobTransport, PollStatus};

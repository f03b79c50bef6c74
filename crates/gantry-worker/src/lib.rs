//! gantry-worker — the pool-manager worker controller.
//!
//! Handles BUILD_DEVICE / DELETE_DEVICE / BUILD_IP / ASSIGN_IP / REMOVE_IP /
//! DELETE_IP jobs against a compute-provisioning API. Every handler echoes
//! the job payload back with `response: PASS|FAIL`; a failed build cleans up
//! its partial instance, a failed IP bind routes the address back through
//! the remove flow instead of leaving it stuck.

pub mod compute;
pub mod controller;
pub mod diagnostics;
pub mod error;
pub mod ratelimit;

pub use compute::{ComputeApi, MockCompute, ServerInfo, ServerStatus};
pub use controller::{WorkerConfig, WorkerController};
pub use error::{ComputeError, WorkerError, WorkerResult};
pub use ratelimit::RateLimiter;

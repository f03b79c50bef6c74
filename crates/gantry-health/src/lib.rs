//! gantry-health — health and repair scheduling.
//!
//! The ping cycle STATS-probes every Online device and reconciles node and
//! load-balancer statuses from what the workers report. The offline cycle
//! DIAGNOSTICS-probes spare devices and deletes the ones that stay dead,
//! with a safety valve that aborts the whole cycle when too many devices
//! fail at once (more likely a network partition than mass hardware death).
//! The repair cycle rebuilds failed devices onto spares from the pool.

pub mod error;
pub mod rebuild;
pub mod scheduler;

pub use error::{HealthError, HealthResult};
pub use rebuild::Rebuilder;
pub use scheduler::{HealthConfig, HealthScheduler, PingVerdict};

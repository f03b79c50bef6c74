//! gantry-pool — spare device and floating-IP pool management.
//!
//! The pool manager keeps the spare (Offline) device and unassigned VIP
//! pools at their configured sizes, drives the delete probe for devices
//! scheduled for removal, and expunges poisoned VIPs and long-deleted
//! load balancers.
//!
//! Periodic work is partitioned across control-plane replicas by a
//! minute/day shard clock, with a store-backed task lease underneath so a
//! drifting clock or resized fleet cannot double-run a destructive cycle.

pub mod error;
pub mod manager;
pub mod shard;

pub use error::{PoolError, PoolResult};
pub use manager::{PoolConfig, PoolManager, POOL_WORKER};
pub use shard::ShardClock;

//! gantry-store — embedded state store for the Gantry control plane.
//!
//! Backed by [redb](https://docs.rs/redb), holds devices, floating IPs,
//! load balancers, backend nodes, health monitors and the bookkeeping rows
//! (pool-building leases, task leases, counters, rate-limit events).
//!
//! # Architecture
//!
//! All domain types are JSON-serialized into redb's `&[u8]` value columns.
//! Composite keys (`{lb_id}:{node_id}`, `{action}:{millis}:{seq}`) enable
//! prefix scans for child records.
//!
//! The `StateStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`)
//! and can be shared across async tasks. Writers are serialized by redb, so
//! the multi-row pick operations (`pick_spare_device`, `assign_vip`) are
//! atomic without explicit row locks.

pub mod error;
pub mod retry;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StoreError, StoreResult};
pub use retry::with_retries;
pub use store::StateStore;
pub use types::*;

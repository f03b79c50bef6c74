//! redb table definitions for the Gantry state store.
//!
//! Each table uses `&str` keys and `&[u8]` values (JSON-serialized domain
//! types). Composite keys follow the pattern `{parent_id}:{child_id}`.

use redb::TableDefinition;

/// Devices keyed by `{device_id}`.
pub const DEVICES: TableDefinition<&str, &[u8]> = TableDefinition::new("devices");

/// Floating IPs keyed by `{vip_id}`.
pub const VIPS: TableDefinition<&str, &[u8]> = TableDefinition::new("vips");

/// Load balancers keyed by `{lb_id}`.
pub const LOAD_BALANCERS: TableDefinition<&str, &[u8]> = TableDefinition::new("load_balancers");

/// Backend nodes keyed by `{lb_id}:{node_id}`.
pub const LB_NODES: TableDefinition<&str, &[u8]> = TableDefinition::new("lb_nodes");

/// Health monitors keyed by `{lb_id}` (at most one per load balancer).
pub const MONITORS: TableDefinition<&str, &[u8]> = TableDefinition::new("monitors");

/// Pool-building leases keyed by `{server_id}`.
pub const POOL_LEASES: TableDefinition<&str, &[u8]> = TableDefinition::new("pool_leases");

/// Periodic-task ownership leases keyed by task name.
pub const TASK_LEASES: TableDefinition<&str, &[u8]> = TableDefinition::new("task_leases");

/// Monotonic counters keyed by counter name.
pub const COUNTERS: TableDefinition<&str, u64> = TableDefinition::new("counters");

/// Rate-limit ledger entries keyed by `{action}:{at_millis}:{seq}`.
pub const RATE_EVENTS: TableDefinition<&str, &[u8]> = TableDefinition::new("rate_events");

/// Alert records keyed by `{at_millis}:{seq}`.
pub const ALERTS: TableDefinition<&str, &[u8]> = TableDefinition::new("alerts");

/// Billing events keyed by `{at_millis}:{seq}`.
pub const BILLING: TableDefinition<&str, &[u8]> = TableDefinition::new("billing");

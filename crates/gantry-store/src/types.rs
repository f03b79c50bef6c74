//! Domain types for the Gantry state store.
//!
//! These types represent the persisted state of devices, floating IPs,
//! load balancers, backend nodes and health monitors, plus the bookkeeping
//! rows the schedulers consume. All types are serializable to/from JSON for
//! storage in redb tables.

use serde::{Deserialize, Serialize};

/// Unique identifier for a device (provisioned compute instance).
pub type DeviceId = u64;

/// Unique identifier for a floating IP.
pub type VipId = u64;

/// Unique identifier for a load balancer.
pub type LbId = u64;

/// Unique identifier for a backend node within a load balancer.
pub type NodeId = u64;

// ── Device ─────────────────────────────────────────────────────────

/// Machine state of a device. Authoritative for scheduling decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceStatus {
    /// Spare capacity in the pool; must have zero attachments.
    Offline,
    Online,
    Building,
    Error,
    /// Failed device held for the next rebuild attempt.
    ErrorRebuilding,
    /// Scheduled for removal; picked up by the delete probe.
    Deleted,
}

/// A provisioned compute instance capable of hosting load balancers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Device {
    pub id: DeviceId,
    /// Worker name on the job queue.
    pub name: String,
    /// Floating IP currently attached, if any.
    pub floating_ip: Option<String>,
    /// Availability zone the instance was built in.
    pub az: String,
    /// Flavor/type of the underlying instance.
    pub kind: String,
    pub status: DeviceStatus,
    /// Consecutive failed health pings (offline cycle).
    pub ping_count: u32,
    pub created_at: u64,
    pub updated_at: u64,
}

// ── Vip ────────────────────────────────────────────────────────────

/// What a floating IP is currently bound to.
///
/// `Poisoned` is terminal: the IP must never be reassigned, only deleted
/// by the expunge probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum VipBinding {
    Unassigned,
    Assigned { device: DeviceId },
    Poisoned,
}

/// A floating IP that can be attached to a device.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Vip {
    pub id: VipId,
    /// 32-bit integer encoding of the IPv4 address.
    pub ip: u32,
    pub binding: VipBinding,
}

impl Vip {
    /// Dotted-quad rendering of the encoded address.
    pub fn ip_string(&self) -> String {
        let ip = self.ip;
        format!(
            "{}.{}.{}.{}",
            (ip >> 24) & 0xff,
            (ip >> 16) & 0xff,
            (ip >> 8) & 0xff,
            ip & 0xff
        )
    }
}

// ── LoadBalancer ───────────────────────────────────────────────────

/// Lifecycle status of a load balancer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LbStatus {
    Build,
    Active,
    /// At least one backend node is in error.
    Degraded,
    Error,
    ErrorRebuilding,
    PendingUpdate,
    PendingDelete,
    Deleted,
    Suspended,
}

impl LbStatus {
    /// Statuses that still occupy a device.
    pub fn is_live(&self) -> bool {
        !matches!(self, LbStatus::Deleted)
    }
}

/// A tenant-facing load balancer. Many-to-many with devices (co-tenancy).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoadBalancer {
    pub id: LbId,
    pub name: String,
    /// Balancing algorithm, e.g. "ROUND_ROBIN".
    pub algorithm: String,
    pub port: u16,
    pub protocol: String,
    pub status: LbStatus,
    /// Human-readable failure detail surfaced to the tenant.
    pub errmsg: Option<String>,
    pub tenant_id: String,
    /// Devices this load balancer is attached to.
    pub devices: Vec<DeviceId>,
    pub created_at: u64,
    pub updated_at: u64,
}

// ── Backend node ───────────────────────────────────────────────────

/// Health state of a backend node as observed by the ping cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Online,
    Error,
}

/// A backend server behind a load balancer. Deleted with its parent.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LbNode {
    pub id: NodeId,
    pub lb_id: LbId,
    pub address: String,
    pub port: u16,
    pub weight: u32,
    pub backup: bool,
    pub enabled: bool,
    pub status: NodeStatus,
}

impl LbNode {
    /// Composite key for the nodes table.
    pub fn table_key(&self) -> String {
        node_key(self.lb_id, self.id)
    }
}

/// Build the `{lb_id}:{node_id}` composite key.
pub fn node_key(lb_id: LbId, node_id: NodeId) -> String {
    format!("{lb_id}:{node_id}")
}

// ── Health monitor ─────────────────────────────────────────────────

/// Health-monitor settings for a load balancer (at most one per LB).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Monitor {
    pub lb_id: LbId,
    /// Probe type: "CONNECT" or "HTTP".
    pub kind: String,
    pub delay: u32,
    pub timeout: u32,
    pub attempts: u32,
    /// HTTP path, only meaningful for HTTP monitors.
    pub path: Option<String>,
}

impl Monitor {
    /// The monitor created lazily when a load balancer has none.
    pub fn default_for(lb_id: LbId) -> Self {
        Self {
            lb_id,
            kind: "CONNECT".to_string(),
            delay: 30,
            timeout: 30,
            attempts: 2,
            path: None,
        }
    }
}

// ── Bookkeeping rows ───────────────────────────────────────────────

/// A replica's in-flight device-build lease. Prevents concurrent probes
/// across replicas from over-building the spare pool.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PoolLease {
    pub server_id: u32,
    pub qty: u32,
    pub created_at: u64,
}

/// Ownership lease for a periodic task: owner + expiry, acquired via
/// conditional update so two replicas cannot run the same cycle even if
/// their clocks drift.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskLease {
    pub task: String,
    pub owner: String,
    pub expires_at: u64,
}

/// One destructive-action attempt in the sliding-window rate-limit ledger.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RateEvent {
    pub action: String,
    pub at_millis: u64,
}

/// An alert persisted by the database alert driver.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AlertRecord {
    pub at_millis: u64,
    pub kind: String,
    pub device: Option<String>,
    pub message: String,
}

/// A fire-and-forget billing event.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BillingEvent {
    pub at_millis: u64,
    pub tenant_id: String,
    pub lb_id: LbId,
    pub payload: String,
}

//! Wire payload shapes for pool-manager and device-worker jobs.
//!
//! Field names are part of the queue protocol and must not change:
//! pool jobs carry `action`/`response`, device jobs carry `hpcs_action`,
//! `loadBalancers` and `hpcs_response`. Node conditions and backup flags
//! are serialized as the literal strings the workers expect.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Queue name the pool-manager worker listens on.
pub const POOL_WORKER: &str = "gantry_pool";

/// Positive response marker shared by both job families.
pub const PASS: &str = "PASS";
/// Negative response marker shared by both job families.
pub const FAIL: &str = "FAIL";

// ── Pool-manager jobs ──────────────────────────────────────────────

/// Actions understood by the pool-manager worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PoolAction {
    #[serde(rename = "BUILD_DEVICE")]
    BuildDevice,
    #[serde(rename = "DELETE_DEVICE")]
    DeleteDevice,
    #[serde(rename = "BUILD_IP")]
    BuildIp,
    #[serde(rename = "ASSIGN_IP")]
    AssignIp,
    #[serde(rename = "REMOVE_IP")]
    RemoveIp,
    #[serde(rename = "DELETE_IP")]
    DeleteIp,
}

/// A pool-manager job payload. Action-specific fields are optional; the
/// handler echoes the payload back with `response` (and result fields like
/// `name`/`az`/`ip`) filled in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolJob {
    pub action: PoolAction,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub az: Option<String>,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response: Option<String>,
}

impl PoolJob {
    pub fn new(action: PoolAction) -> Self {
        Self {
            action,
            name: None,
            address: None,
            az: None,
            kind: None,
            ip: None,
            response: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_ip(mut self, ip: impl Into<String>) -> Self {
        self.ip = Some(ip.into());
        self
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    pub fn from_value(value: &Value) -> Option<Self> {
        serde_json::from_value(value.clone()).ok()
    }
}

/// Whether a completed pool-job payload reports PASS.
pub fn pool_passed(payload: &Value) -> bool {
    payload.get("response").and_then(Value::as_str) == Some(PASS)
}

// ── Device-worker jobs ─────────────────────────────────────────────

/// Actions understood by the per-device HAProxy worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviceAction {
    #[serde(rename = "UPDATE")]
    Update,
    #[serde(rename = "DELETE")]
    Delete,
    #[serde(rename = "ARCHIVE")]
    Archive,
    #[serde(rename = "STATS")]
    Stats,
    #[serde(rename = "DISCOVER")]
    Discover,
    #[serde(rename = "DIAGNOSTICS")]
    Diagnostics,
}

/// Backend node entry inside a device job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeEntry {
    pub id: String,
    pub address: String,
    pub port: u16,
    pub weight: u32,
    /// "ENABLED" or "DISABLED".
    pub condition: String,
    /// "TRUE" or "FALSE".
    pub backup: String,
}

/// Health monitor entry inside a device job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitorEntry {
    #[serde(rename = "type")]
    pub kind: String,
    pub delay: u32,
    pub timeout: u32,
    pub attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

/// One load balancer's configuration inside a device job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LbEntry {
    pub id: String,
    pub name: String,
    pub protocol: String,
    pub algorithm: String,
    pub port: u16,
    pub nodes: Vec<NodeEntry>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub monitor: Option<MonitorEntry>,
}

/// A device-worker job payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceJob {
    pub hpcs_action: DeviceAction,
    #[serde(rename = "loadBalancers", default)]
    pub load_balancers: Vec<LbEntry>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hpcs_response: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hpcs_error: Option<String>,
    /// Per-node observed status, present in STATS responses.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nodes: Option<Vec<NodeObservation>>,
}

/// One node's observed status in a STATS response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeObservation {
    pub id: String,
    /// "UP" or "DOWN".
    pub status: String,
}

impl DeviceJob {
    pub fn new(action: DeviceAction) -> Self {
        Self {
            hpcs_action: action,
            load_balancers: Vec::new(),
            hpcs_response: None,
            hpcs_error: None,
            nodes: None,
        }
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    pub fn from_value(value: &Value) -> Option<Self> {
        serde_json::from_value(value.clone()).ok()
    }
}

/// Whether a completed device-job payload reports PASS.
pub fn device_passed(payload: &Value) -> bool {
    payload.get("hpcs_response").and_then(Value::as_str) == Some(PASS)
}

/// Extract the worker's error message from a failed device job.
pub fn device_error(payload: &Value) -> Option<String> {
    payload
        .get("hpcs_error")
        .and_then(Value::as_str)
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_job_uses_normative_field_names() {
        let job = PoolJob::new(PoolAction::AssignIp)
            .with_name("lb-device-3")
            .with_ip("15.0.0.9");
        let value = job.to_value();

        assert_eq!(value["action"], "ASSIGN_IP");
        assert_eq!(value["name"], "lb-device-3");
        assert_eq!(value["ip"], "15.0.0.9");
        assert!(value.get("response").is_none());
    }

    #[test]
    fn pool_pass_fail_detection() {
        let mut job = PoolJob::new(PoolAction::BuildDevice);
        job.response = Some(PASS.to_string());
        assert!(pool_passed(&job.to_value()));

        job.response = Some(FAIL.to_string());
        assert!(!pool_passed(&job.to_value()));

        assert!(!pool_passed(&PoolJob::new(PoolAction::BuildDevice).to_value()));
    }

    #[test]
    fn device_job_serializes_camel_case_lb_list() {
        let mut job = DeviceJob::new(DeviceAction::Update);
        job.load_balancers.push(LbEntry {
            id: "1".to_string(),
            name: "web".to_string(),
            protocol: "HTTP".to_string(),
            algorithm: "ROUND_ROBIN".to_string(),
            port: 80,
            nodes: vec![NodeEntry {
                id: "11".to_string(),
                address: "10.0.0.2".to_string(),
                port: 8080,
                weight: 1,
                condition: "ENABLED".to_string(),
                backup: "FALSE".to_string(),
            }],
            monitor: Some(MonitorEntry {
                kind: "CONNECT".to_string(),
                delay: 30,
                timeout: 30,
                attempts: 2,
                path: None,
            }),
        });

        let value = job.to_value();
        assert_eq!(value["hpcs_action"], "UPDATE");
        assert!(value.get("loadBalancers").is_some());
        let node = &value["loadBalancers"][0]["nodes"][0];
        assert_eq!(node["condition"], "ENABLED");
        assert_eq!(node["backup"], "FALSE");
        let monitor = &value["loadBalancers"][0]["monitor"];
        assert_eq!(monitor["type"], "CONNECT");
    }

    #[test]
    fn device_error_extraction() {
        let mut job = DeviceJob::new(DeviceAction::Update);
        job.hpcs_response = Some(FAIL.to_string());
        job.hpcs_error = Some("haproxy reload failed".to_string());
        let value = job.to_value();

        assert!(!device_passed(&value));
        assert_eq!(device_error(&value).unwrap(), "haproxy reload failed");
    }

    #[test]
    fn stats_response_roundtrip() {
        let mut job = DeviceJob::new(DeviceAction::Stats);
        job.hpcs_response = Some(PASS.to_string());
        job.nodes = Some(vec![
            NodeObservation { id: "11".to_string(), status: "UP".to_string() },
            NodeObservation { id: "12".to_string(), status: "DOWN".to_string() },
        ]);

        let back = DeviceJob::from_value(&job.to_value()).unwrap();
        assert_eq!(back.nodes.unwrap().len(), 2);
    }
}

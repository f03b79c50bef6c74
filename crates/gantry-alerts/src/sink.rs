//! Alert drivers and the fan-out sink.

use std::time::{SystemTime, UNIX_EPOCH};

use tracing::{debug, error, info};

use gantry_store::{AlertRecord, StateStore};

/// What class of event an alert reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertKind {
    /// A device or worker failed.
    Failure,
    /// A device was scheduled for deletion.
    Delete,
    /// A device was repaired/rebuilt.
    Repair,
    /// Backend node statuses changed on a load balancer.
    NodeChange,
}

impl AlertKind {
    fn as_str(&self) -> &'static str {
        match self {
            AlertKind::Failure => "failure",
            AlertKind::Delete => "delete",
            AlertKind::Repair => "repair",
            AlertKind::NodeChange => "node_change",
        }
    }
}

/// An alert delivery backend. Closed set, chosen by configuration.
#[derive(Debug, Clone)]
pub enum AlertDriver {
    /// Log-only driver.
    Dummy,
    /// Persist alerts as store rows.
    Database,
    /// Post events to a local datadog agent over HTTP.
    Datadog { agent_addr: String },
}

/// Fans one alert out to every configured driver.
#[derive(Clone)]
pub struct Alerter {
    drivers: Vec<AlertDriver>,
    store: StateStore,
}

impl Alerter {
    pub fn new(store: StateStore, drivers: Vec<AlertDriver>) -> Self {
        Self { drivers, store }
    }

    /// A device or worker failure.
    pub async fn send_alert(&self, device: &str, message: &str) {
        self.dispatch(AlertKind::Failure, Some(device), message).await;
    }

    /// A device scheduled for deletion.
    pub async fn send_delete(&self, device: &str, message: &str) {
        self.dispatch(AlertKind::Delete, Some(device), message).await;
    }

    /// A device repaired or rebuilt.
    pub async fn send_repair(&self, device: &str, message: &str) {
        self.dispatch(AlertKind::Repair, Some(device), message).await;
    }

    /// Node status changes, batched per load balancer into one message.
    pub async fn send_node_change(&self, message: &str) {
        self.dispatch(AlertKind::NodeChange, None, message).await;
    }

    async fn dispatch(&self, kind: AlertKind, device: Option<&str>, message: &str) {
        for driver in &self.drivers {
            match driver {
                AlertDriver::Dummy => {
                    info!(kind = kind.as_str(), ?device, %message, "alert");
                }
                AlertDriver::Database => {
                    let record = AlertRecord {
                        at_millis: epoch_millis(),
                        kind: kind.as_str().to_string(),
                        device: device.map(str::to_string),
                        message: message.to_string(),
                    };
                    if let Err(e) = self.store.put_alert(&record) {
                        error!(error = %e, "failed to persist alert");
                    }
                }
                AlertDriver::Datadog { agent_addr } => {
                    post_datadog_event(agent_addr, kind, device, message).await;
                }
            }
        }
    }
}

/// Post one event to a datadog agent. Failures are logged and dropped.
async fn post_datadog_event(agent_addr: &str, kind: AlertKind, device: Option<&str>, message: &str) {
    let body = serde_json::json!({
        "title": format!("gantry {}", kind.as_str()),
        "text": message,
        "tags": device.map(|d| vec![format!("device:{d}")]).unwrap_or_default(),
    });

    let stream = match tokio::net::TcpStream::connect(agent_addr).await {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, %agent_addr, "datadog agent unreachable");
            return;
        }
    };

    let io = hyper_util::rt::TokioIo::new(stream);
    let (mut sender, conn) = match hyper::client::conn::http1::handshake(io).await {
        Ok(pair) => pair,
        Err(e) => {
            error!(error = %e, %agent_addr, "datadog handshake failed");
            return;
        }
    };

    // Drive the connection in the background.
    tokio::spawn(async move {
        let _ = conn.await;
    });

    let req = http::Request::builder()
        .method("POST")
        .uri(format!("http://{agent_addr}/api/v1/events"))
        .header("host", agent_addr)
        .header("content-type", "application/json")
        .body(http_body_util::Full::new(bytes::Bytes::from(
            body.to_string(),
        )));

    let req = match req {
        Ok(r) => r,
        Err(e) => {
            error!(error = %e, "datadog request build failed");
            return;
        }
    };

    match sender.send_request(req).await {
        Ok(resp) if resp.status().is_success() => {
            debug!(%agent_addr, "datadog event posted");
        }
        Ok(resp) => {
            error!(status = %resp.status(), %agent_addr, "datadog event rejected");
        }
        Err(e) => {
            error!(error = %e, %agent_addr, "datadog event post failed");
        }
    }
}

fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn database_driver_persists_alerts() {
        let store = StateStore::open_in_memory().unwrap();
        let alerter = Alerter::new(store.clone(), vec![AlertDriver::Database]);

        alerter.send_alert("lb-device-1", "device unreachable").await;
        alerter.send_repair("lb-device-1", "rebuilt onto lb-device-2").await;

        let alerts = store.list_alerts().unwrap();
        assert_eq!(alerts.len(), 2);
        assert_eq!(alerts[0].kind, "failure");
        assert_eq!(alerts[0].device.as_deref(), Some("lb-device-1"));
        assert_eq!(alerts[1].kind, "repair");
    }

    #[tokio::test]
    async fn dummy_driver_writes_no_rows() {
        let store = StateStore::open_in_memory().unwrap();
        let alerter = Alerter::new(store.clone(), vec![AlertDriver::Dummy]);

        alerter.send_delete("lb-device-9", "ping limit reached").await;
        assert!(store.list_alerts().unwrap().is_empty());
    }

    #[tokio::test]
    async fn unreachable_datadog_agent_is_swallowed() {
        let store = StateStore::open_in_memory().unwrap();
        // Port 1 is not listening; delivery must fail silently.
        let alerter = Alerter::new(
            store,
            vec![AlertDriver::Datadog { agent_addr: "127.0.0.1:1".to_string() }],
        );
        alerter.send_node_change("lb 4: node 11 DOWN").await;
    }

    #[tokio::test]
    async fn fan_out_hits_every_driver() {
        let store = StateStore::open_in_memory().unwrap();
        let alerter = Alerter::new(
            store.clone(),
            vec![AlertDriver::Dummy, AlertDriver::Database],
        );
        alerter.send_node_change("lb 4: node 11 DOWN, node 12 UP").await;

        let alerts = store.list_alerts().unwrap();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].kind, "node_change");
        assert!(alerts[0].device.is_none());
    }
}

//! Billing sink — fire-and-forget usage events.

use std::time::{SystemTime, UNIX_EPOCH};

use tracing::{debug, error};

use gantry_store::{BillingEvent, LoadBalancer, StateStore};

/// Records usage events for active load balancers. Delivery failures are
/// logged, never raised: billing must not stall a scheduling cycle.
#[derive(Clone)]
pub struct BillingSink {
    store: StateStore,
}

impl BillingSink {
    pub fn new(store: StateStore) -> Self {
        Self { store }
    }

    /// Emit one usage event for a load balancer.
    pub fn record_usage(&self, lb: &LoadBalancer) {
        let event = BillingEvent {
            at_millis: epoch_millis(),
            tenant_id: lb.tenant_id.clone(),
            lb_id: lb.id,
            payload: serde_json::json!({
                "name": lb.name,
                "protocol": lb.protocol,
                "status": lb.status,
            })
            .to_string(),
        };
        match self.store.put_billing_event(&event) {
            Ok(()) => debug!(lb_id = lb.id, tenant = %lb.tenant_id, "usage event recorded"),
            Err(e) => error!(lb_id = lb.id, error = %e, "failed to record usage event"),
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
    use gantry_store::LbStatus;

    fn test_lb(id: u64) -> LoadBalancer {
        LoadBalancer {
            id,
            name: format!("lb-{id}"),
            algorithm: "ROUND_ROBIN".to_string(),
            port: 80,
            protocol: "HTTP".to_string(),
            status: LbStatus::Active,
            errmsg: None,
            tenant_id: "tenant-1".to_string(),
            devices: vec![1],
            created_at: 1000,
            updated_at: 1000,
        }
    }

    #[test]
    fn usage_events_are_persisted() {
        let store = StateStore::open_in_memory().unwrap();
        let billing = BillingSink::new(store.clone());

        billing.record_usage(&test_lb(1));
        billing.record_usage(&test_lb(2));

        let events = store.list_billing_events().unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].tenant_id, "tenant-1");
        assert!(events[0].payload.contains("\"protocol\":\"HTTP\""));
    }
}

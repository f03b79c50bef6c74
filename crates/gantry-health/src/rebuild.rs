//! Device rebuild — moves a failed device's load balancers onto a spare.

use std::time::{SystemTime, UNIX_EPOCH};

use tracing::{info, warn};

use gantry_alerts::Alerter;
use gantry_dispatch::Dispatcher;
use gantry_jobs::protocol::{POOL_WORKER, PoolAction, PoolJob, pool_passed};
use gantry_jobs::{JobClient, JobOutcome};
use gantry_store::*;

use crate::error::{HealthError, HealthResult};

/// Rebuilds failed devices onto spares from the pool.
pub struct Rebuilder {
    store: StateStore,
    jobs: JobClient,
    dispatcher: Dispatcher,
    alerter: Alerter,
}

impl Rebuilder {
    pub fn new(
        store: StateStore,
        jobs: JobClient,
        dispatcher: Dispatcher,
        alerter: Alerter,
    ) -> Self {
        Self {
            store,
            jobs,
            dispatcher,
            alerter,
        }
    }

    /// Rebuild one failed device. Picks a spare atomically, moves every
    /// attached load balancer onto it, pushes the configuration and binds a
    /// floating IP. Returns the spare's id.
    ///
    /// With no spare available the failed device and its load balancers are
    /// parked in ErrorRebuilding and `NoSpareDevice` comes back; the next
    /// repair cycle retries once the pool has been replenished.
    pub async fn rebuild_device(&self, failed_id: DeviceId) -> HealthResult<DeviceId> {
        let failed = self
            .store
            .get_device(failed_id)?
            .ok_or(HealthError::DeviceNotFound(failed_id))?;
        let now = epoch_secs();

        let spare = match self.store.pick_spare_device(now)? {
            Some(spare) => spare,
            None => {
                self.park_for_next_cycle(&failed, now)?;
                return Err(HealthError::NoSpareDevice);
            }
        };
        info!(failed = %failed.name, spare = %spare.name, "rebuilding device");

        // Move every attachment from the failed device to the spare.
        for mut lb in self.store.list_load_balancers_for_device(failed.id)? {
            lb.devices.retain(|&d| d != failed.id);
            if !lb.devices.contains(&spare.id) {
                lb.devices.push(spare.id);
            }
            lb.updated_at = now;
            self.store.put_load_balancer(&lb)?;
        }

        let mut gone = failed.clone();
        gone.status = DeviceStatus::Deleted;
        gone.updated_at = now;
        self.store.put_device(&gone)?;

        // Push the configuration; the dispatcher reconciles failure states.
        if !self.dispatcher.send_update(spare.id).await? {
            return Err(HealthError::RebuildFailed(spare.id));
        }

        self.bind_floating_ip(&spare).await?;
        self.store.increment_counter("rebuilds")?;
        self.alerter
            .send_repair(
                &failed.name,
                &format!("load balancers rebuilt onto {}", spare.name),
            )
            .await;
        Ok(spare.id)
    }

    /// Park the failed device and its load balancers for the next cycle.
    fn park_for_next_cycle(&self, failed: &Device, now: u64) -> HealthResult<()> {
        warn!(device = %failed.name, "spare pool exhausted, parking for next cycle");
        if failed.status != DeviceStatus::ErrorRebuilding {
            let mut parked = failed.clone();
            parked.status = DeviceStatus::ErrorRebuilding;
            parked.updated_at = now;
            self.store.put_device(&parked)?;
        }
        for mut lb in self.store.list_load_balancers_for_device(failed.id)? {
            if lb.status != LbStatus::ErrorRebuilding {
                lb.status = LbStatus::ErrorRebuilding;
                lb.updated_at = now;
                self.store.put_load_balancer(&lb)?;
            }
        }
        Ok(())
    }

    /// Bind a floating IP to the freshly configured spare and bring it
    /// Online. A failed bind poisons the vip for the expunge probe.
    async fn bind_floating_ip(&self, spare: &Device) -> HealthResult<()> {
        let Some(vip) = self.store.assign_vip(spare.id)? else {
            return Err(HealthError::NoFloatingIp);
        };
        let ip = vip.ip_string();
        let job = PoolJob::new(PoolAction::AssignIp)
            .with_name(&spare.name)
            .with_ip(ip.clone());

        match self.jobs.submit(POOL_WORKER, &job.to_value()).await {
            JobOutcome::Completed(result) if pool_passed(&result) => {
                let mut online = self
                    .store
                    .get_device(spare.id)?
                    .ok_or(HealthError::DeviceNotFound(spare.id))?;
                online.floating_ip = Some(ip);
                online.status = DeviceStatus::Online;
                online.updated_at = epoch_secs();
                self.store.put_device(&online)?;
                Ok(())
            }
            _ => {
                warn!(device = %spare.name, ip = %ip, "floating ip bind failed, poisoning vip");
                let mut poisoned = vip;
                poisoned.binding = VipBinding::Poisoned;
                self.store.put_vip(&poisoned)?;

                let mut broken = self
                    .store
                    .get_device(spare.id)?
                    .ok_or(HealthError::DeviceNotFound(spare.id))?;
                broken.status = DeviceStatus::Error;
                broken.updated_at = epoch_secs();
                self.store.put_device(&broken)?;
                Err(HealthError::RebuildFailed(spare.id))
            }
        }
    }
}

fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;
    use gantry_alerts::AlertDriver;
    use gantry_jobs::InMemoryQueue;
    use serde_json::{Value, json};
    use std::sync::Arc;
    use std::time::Duration;

    fn test_rebuilder() -> (Rebuilder, StateStore, Arc<InMemoryQueue>) {
        let store = StateStore::open_in_memory().unwrap();
        let queue = Arc::new(InMemoryQueue::new());
        let client = JobClient::new(queue.clone(), Duration::from_millis(1), 3);
        let alerter = Alerter::new(store.clone(), vec![AlertDriver::Database]);
        let dispatcher = Dispatcher::new(store.clone(), client.clone());
        let rebuilder = Rebuilder::new(store.clone(), client, dispatcher, alerter);
        (rebuilder, store, queue)
    }

    fn device(id: DeviceId, status: DeviceStatus) -> Device {
        Device {
            id,
            name: format!("lb-device-{id}"),
            floating_ip: None,
            az: "az-1".to_string(),
            kind: "standard".to_string(),
            status,
            ping_count: 0,
            created_at: 1000,
            updated_at: 1000,
        }
    }

    fn lb(id: LbId, devices: Vec<DeviceId>, status: LbStatus) -> LoadBalancer {
        LoadBalancer {
            id,
            name: format!("lb-{id}"),
            algorithm: "ROUND_ROBIN".to_string(),
            port: 80,
            protocol: "HTTP".to_string(),
            status,
            errmsg: None,
            tenant_id: "tenant-1".to_string(),
            devices,
            created_at: 1000,
            updated_at: 1000,
        }
    }

    fn register_pass(queue: &InMemoryQueue, worker: &str) {
        queue.register(worker, |payload: &Value| {
            let mut result = payload.clone();
            if payload.get("hpcs_action").is_some() {
                result["hpcs_response"] = json!("PASS");
            } else {
                result["response"] = json!("PASS");
            }
            result
        });
    }

    #[tokio::test]
    async fn rebuild_moves_lbs_and_brings_spare_online() {
        let (rebuilder, store, queue) = test_rebuilder();
        store.put_device(&device(1, DeviceStatus::Error)).unwrap();
        store.put_device(&device(2, DeviceStatus::Offline)).unwrap();
        store.put_load_balancer(&lb(10, vec![1], LbStatus::Error)).unwrap();
        store.put_load_balancer(&lb(11, vec![1], LbStatus::Error)).unwrap();
        store
            .put_vip(&Vip { id: 5, ip: (15 << 24) | 9, binding: VipBinding::Unassigned })
            .unwrap();
        register_pass(&queue, "lb-device-2");
        register_pass(&queue, POOL_WORKER);

        let spare = rebuilder.rebuild_device(1).await.unwrap();
        assert_eq!(spare, 2);

        // Attachments moved, lbs reconciled by the update.
        for id in [10, 11] {
            let moved = store.get_load_balancer(id).unwrap().unwrap();
            assert_eq!(moved.devices, vec![2]);
            assert_eq!(moved.status, LbStatus::Active);
        }

        assert_eq!(store.get_device(1).unwrap().unwrap().status, DeviceStatus::Deleted);
        let online = store.get_device(2).unwrap().unwrap();
        assert_eq!(online.status, DeviceStatus::Online);
        assert_eq!(online.floating_ip.as_deref(), Some("15.0.0.9"));
        assert_eq!(store.get_vip(5).unwrap().unwrap().binding, VipBinding::Assigned { device: 2 });

        assert_eq!(store.get_counter("rebuilds").unwrap(), 1);
        let alerts = store.list_alerts().unwrap();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].kind, "repair");
        // One ASSIGN_IP went to the pool worker.
        assert_eq!(queue.submitted_to(POOL_WORKER), 1);
    }

    #[tokio::test]
    async fn no_spare_parks_device_and_lbs() {
        let (rebuilder, store, _queue) = test_rebuilder();
        store.put_device(&device(1, DeviceStatus::Error)).unwrap();
        store.put_load_balancer(&lb(10, vec![1], LbStatus::Error)).unwrap();

        let err = rebuilder.rebuild_device(1).await.unwrap_err();
        assert!(matches!(err, HealthError::NoSpareDevice));

        assert_eq!(
            store.get_device(1).unwrap().unwrap().status,
            DeviceStatus::ErrorRebuilding
        );
        let parked = store.get_load_balancer(10).unwrap().unwrap();
        assert_eq!(parked.status, LbStatus::ErrorRebuilding);
        // Attachment untouched: nothing was moved.
        assert_eq!(parked.devices, vec![1]);
    }

    #[tokio::test]
    async fn failed_ip_bind_poisons_vip_and_errors_spare() {
        let (rebuilder, store, queue) = test_rebuilder();
        store.put_device(&device(1, DeviceStatus::Error)).unwrap();
        store.put_device(&device(2, DeviceStatus::Offline)).unwrap();
        store.put_load_balancer(&lb(10, vec![1], LbStatus::Error)).unwrap();
        store
            .put_vip(&Vip { id: 5, ip: (15 << 24) | 9, binding: VipBinding::Unassigned })
            .unwrap();
        register_pass(&queue, "lb-device-2");
        queue.register(POOL_WORKER, |payload: &Value| {
            let mut result = payload.clone();
            result["response"] = json!("FAIL");
            result
        });

        let err = rebuilder.rebuild_device(1).await.unwrap_err();
        assert!(matches!(err, HealthError::RebuildFailed(2)));

        assert_eq!(store.get_vip(5).unwrap().unwrap().binding, VipBinding::Poisoned);
        assert_eq!(store.get_device(2).unwrap().unwrap().status, DeviceStatus::Error);
    }

    #[tokio::test]
    async fn exhausted_vip_pool_is_an_error() {
        let (rebuilder, store, queue) = test_rebuilder();
        store.put_device(&device(1, DeviceStatus::Error)).unwrap();
        store.put_device(&device(2, DeviceStatus::Offline)).unwrap();
        register_pass(&queue, "lb-device-2");

        let err = rebuilder.rebuild_device(1).await.unwrap_err();
        assert!(matches!(err, HealthError::NoFloatingIp));
    }
}

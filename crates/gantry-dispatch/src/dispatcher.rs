//! Dispatcher — submits device jobs and reconciles statuses from results.

use std::time::{SystemTime, UNIX_EPOCH};

use tracing::{info, warn};

use gantry_jobs::protocol::{
    DeviceAction, DeviceJob, POOL_WORKER, PoolAction, PoolJob, device_error, device_passed,
    pool_passed,
};
use gantry_jobs::{JobClient, JobOutcome};
use gantry_store::*;

use crate::error::{DispatchError, DispatchResult};
use crate::payload::{build_update_payload, build_update_payload_excluding, lb_entry};

/// Pushes configuration to device workers and writes back the results.
pub struct Dispatcher {
    store: StateStore,
    jobs: JobClient,
}

impl Dispatcher {
    pub fn new(store: StateStore, jobs: JobClient) -> Self {
        Self { store, jobs }
    }

    /// Push the device's full configuration. Returns whether the worker
    /// accepted it; statuses are reconciled either way.
    pub async fn send_update(&self, device_id: DeviceId) -> DispatchResult<bool> {
        let device = self
            .store
            .get_device(device_id)?
            .ok_or(DispatchError::DeviceNotFound(device_id))?;
        let payload = build_update_payload(&self.store, &device)?;

        match self.jobs.submit(&device.name, &payload.to_value()).await {
            JobOutcome::Completed(result) if device_passed(&result) => {
                self.mark_update_success(&device)?;
                Ok(true)
            }
            JobOutcome::Completed(result) => {
                let msg = device_error(&result).unwrap_or_else(|| "update failed".to_string());
                self.mark_device_failed(&device, &msg)?;
                Ok(false)
            }
            JobOutcome::TimedOut => {
                self.mark_device_failed(&device, "no response from device worker")?;
                Ok(false)
            }
            JobOutcome::Disconnected => {
                // Queue outage, not a device fault. Leave state alone.
                warn!(device = %device.name, "job server unavailable, update not applied");
                Ok(false)
            }
        }
    }

    /// Remove one load balancer from its device. While other load balancers
    /// remain the job is an UPDATE retaining them; only an empty device gets
    /// a true DELETE, its floating IP released back to the pool.
    pub async fn send_delete(&self, device_id: DeviceId, lb_id: LbId) -> DispatchResult<bool> {
        let device = self
            .store
            .get_device(device_id)?
            .ok_or(DispatchError::DeviceNotFound(device_id))?;
        let mut lb = self
            .store
            .get_load_balancer(lb_id)?
            .ok_or(DispatchError::LbNotFound(lb_id))?;

        let remaining = self
            .store
            .list_load_balancers_for_device(device_id)?
            .into_iter()
            .filter(|other| other.id != lb_id)
            .count();

        let (payload, true_delete) = if remaining > 0 {
            (
                build_update_payload_excluding(&self.store, &device, Some(lb_id))?,
                false,
            )
        } else {
            (DeviceJob::new(DeviceAction::Delete), true)
        };

        match self.jobs.submit(&device.name, &payload.to_value()).await {
            JobOutcome::Completed(result) if device_passed(&result) => {
                let now = epoch_secs();
                if true_delete {
                    self.release_floating_ip(&device).await?;
                    let mut gone = device.clone();
                    gone.status = DeviceStatus::Deleted;
                    gone.floating_ip = None;
                    gone.updated_at = now;
                    self.store.put_device(&gone)?;
                    info!(device = %device.name, "device emptied and scheduled for deletion");
                }
                lb.status = LbStatus::Deleted;
                lb.updated_at = now;
                self.store.put_load_balancer(&lb)?;
                Ok(true)
            }
            JobOutcome::Completed(result) => {
                let msg = device_error(&result).unwrap_or_else(|| "delete failed".to_string());
                lb.status = LbStatus::Error;
                lb.errmsg = Some(msg.clone());
                lb.updated_at = epoch_secs();
                self.store.put_load_balancer(&lb)?;
                warn!(lb_id, device = %device.name, error = %msg, "delete rejected by worker");
                Ok(false)
            }
            JobOutcome::TimedOut => {
                lb.status = LbStatus::Error;
                lb.errmsg = Some("no response from device worker".to_string());
                lb.updated_at = epoch_secs();
                self.store.put_load_balancer(&lb)?;
                Ok(false)
            }
            JobOutcome::Disconnected => {
                // Queue outage, not a device fault. The lb stays in
                // PendingDelete and the next cycle retries.
                warn!(lb_id, device = %device.name, "job server unavailable, delete not applied");
                Ok(false)
            }
        }
    }

    /// Ask the device to archive a load balancer's logs before deletion.
    /// Best effort: a failure is logged, never propagated.
    pub async fn send_archive(&self, lb_id: LbId) -> DispatchResult<()> {
        let lb = self
            .store
            .get_load_balancer(lb_id)?
            .ok_or(DispatchError::LbNotFound(lb_id))?;
        let Some(&device_id) = lb.devices.first() else {
            return Ok(());
        };
        let Some(device) = self.store.get_device(device_id)? else {
            return Ok(());
        };

        let mut payload = DeviceJob::new(DeviceAction::Archive);
        payload.load_balancers.push(lb_entry(&self.store, &lb)?);

        match self.jobs.submit(&device.name, &payload.to_value()).await {
            JobOutcome::Completed(result) if device_passed(&result) => {
                info!(lb_id, device = %device.name, "logs archived");
            }
            other => {
                warn!(lb_id, device = %device.name, ?other, "archive failed, continuing");
            }
        }
        Ok(())
    }

    /// PASS: every attached live load balancer settles to Degraded (some
    /// node in error) or Active.
    fn mark_update_success(&self, device: &Device) -> DispatchResult<()> {
        let now = epoch_secs();
        for mut lb in self.store.list_load_balancers_for_device(device.id)? {
            let degraded = self
                .store
                .list_nodes_for_lb(lb.id)?
                .iter()
                .any(|n| n.status == NodeStatus::Error);
            let next = if degraded { LbStatus::Degraded } else { LbStatus::Active };
            if lb.status != next {
                lb.status = next;
                lb.errmsg = None;
                lb.updated_at = now;
                self.store.put_load_balancer(&lb)?;
            }
        }
        Ok(())
    }

    /// FAIL or timeout: the device and everything on it goes Error, with the
    /// worker's message surfaced on each load balancer.
    fn mark_device_failed(&self, device: &Device, msg: &str) -> DispatchResult<()> {
        let now = epoch_secs();
        let mut failed = device.clone();
        failed.status = DeviceStatus::Error;
        failed.updated_at = now;
        self.store.put_device(&failed)?;

        for mut lb in self.store.list_load_balancers_for_device(device.id)? {
            lb.status = LbStatus::Error;
            lb.errmsg = Some(msg.to_string());
            lb.updated_at = now;
            self.store.put_load_balancer(&lb)?;
        }
        warn!(device = %device.name, error = %msg, "device update failed");
        Ok(())
    }

    /// Return the device's floating IP to the unassigned pool via the pool
    /// worker. A failed release poisons the vip so it is expunged, never
    /// reused while possibly still bound.
    async fn release_floating_ip(&self, device: &Device) -> DispatchResult<()> {
        let Some(ip) = &device.floating_ip else {
            return Ok(());
        };
        let job = PoolJob::new(PoolAction::RemoveIp)
            .with_name(&device.name)
            .with_ip(ip.clone());
        let released = matches!(
            self.jobs.submit(POOL_WORKER, &job.to_value()).await,
            JobOutcome::Completed(result) if pool_passed(&result)
        );

        let vip = self
            .store
            .list_vips()?
            .into_iter()
            .find(|v| v.ip_string() == *ip);
        if let Some(mut vip) = vip {
            vip.binding = if released {
                VipBinding::Unassigned
            } else {
                VipBinding::Poisoned
            };
            self.store.put_vip(&vip)?;
            if !released {
                warn!(ip = %ip, "floating ip release failed, poisoned for expunge");
            }
        }
        Ok(())
    }
}

fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

//! Ping and offline cycles.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde_json::Value;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use gantry_alerts::Alerter;
use gantry_jobs::protocol::{DeviceAction, DeviceJob, device_error, device_passed};
use gantry_jobs::{JobClient, JobOutcome};
use gantry_pool::ShardClock;
use gantry_store::*;

use crate::error::{HealthError, HealthResult};
use crate::rebuild::Rebuilder;

/// Task-lease key for the health cycle.
const HEALTH_CYCLE_LEASE: &str = "health_cycle";

/// Health scheduler settings.
#[derive(Debug, Clone)]
pub struct HealthConfig {
    pub server_id: u32,
    pub server_count: u32,
    /// How often the cycle timer ticks.
    pub ping_interval: Duration,
    /// Consecutive diagnostics failures before an Offline device is deleted.
    pub ping_limit: u32,
    /// Abort the offline cycle when more devices than this fail at once.
    pub stats_device_error_limit: u32,
    /// Extended poll bound for the second-chance ping batch.
    pub ping_retry_bound: u32,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            server_id: 0,
            server_count: 1,
            ping_interval: Duration::from_secs(60),
            ping_limit: 10,
            stats_device_error_limit: 5,
            ping_retry_bound: 10,
        }
    }
}

/// How one device's ping resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PingVerdict {
    Healthy,
    Failed,
    /// The device was deleted between listing and the job result coming
    /// back. Benign race, nothing to do.
    AlreadyGone,
}

/// Drives the ping, offline and repair cycles.
pub struct HealthScheduler {
    store: StateStore,
    jobs: JobClient,
    alerter: Alerter,
    rebuilder: Rebuilder,
    config: HealthConfig,
    clock: ShardClock,
    owner: String,
}

impl HealthScheduler {
    pub fn new(
        store: StateStore,
        jobs: JobClient,
        alerter: Alerter,
        rebuilder: Rebuilder,
        config: HealthConfig,
    ) -> Self {
        let clock = ShardClock::new(config.server_id, config.server_count);
        let owner = format!("api-{}", config.server_id);
        Self {
            store,
            jobs,
            alerter,
            rebuilder,
            config,
            clock,
            owner,
        }
    }

    // ── Ping cycle ─────────────────────────────────────────────────

    /// STATS-probe every Online device. Timed-out probes get one second
    /// chance with an extended poll bound before counting as failures.
    pub async fn run_ping_cycle(&self) -> HealthResult<()> {
        let devices = self.store.list_devices_by_status(DeviceStatus::Online)?;
        if devices.is_empty() {
            return Ok(());
        }

        let payload = DeviceJob::new(DeviceAction::Stats).to_value();
        let jobs: Vec<(String, Value)> = devices
            .iter()
            .map(|d| (d.name.clone(), payload.clone()))
            .collect();
        let outcomes = self.jobs.submit_many(&jobs).await;

        let mut slow: Vec<&Device> = Vec::new();
        for (device, outcome) in devices.iter().zip(outcomes) {
            match outcome {
                JobOutcome::Completed(result) if device_passed(&result) => {
                    self.reconcile_nodes(device, &result).await?;
                }
                JobOutcome::Completed(result) => {
                    let msg = device_error(&result)
                        .unwrap_or_else(|| "stats probe failed".to_string());
                    self.record_ping_failure(device, &msg).await?;
                }
                JobOutcome::TimedOut => slow.push(device),
                JobOutcome::Disconnected => {
                    warn!(device = %device.name, "job server unavailable, ping skipped");
                }
            }
        }

        // Second-chance batch: a busy worker gets longer to answer before
        // its device is written off.
        for device in slow {
            debug!(device = %device.name, "retrying slow ping with extended bound");
            let outcome = self
                .jobs
                .submit_with_retries(&device.name, &payload, self.config.ping_retry_bound)
                .await;
            match outcome {
                JobOutcome::Completed(result) if device_passed(&result) => {
                    self.reconcile_nodes(device, &result).await?;
                }
                _ => {
                    self.record_ping_failure(device, "no response from device worker")
                        .await?;
                }
            }
        }
        Ok(())
    }

    /// Write back one failed ping: the device and everything on it goes
    /// Error and a single alert fires. A device that was deleted while the
    /// probe was in flight is left alone.
    pub async fn record_ping_failure(
        &self,
        device: &Device,
        msg: &str,
    ) -> HealthResult<PingVerdict> {
        // Re-read: the delete probe may have raced us.
        let current = match self.store.get_device(device.id)? {
            Some(d) if d.status != DeviceStatus::Deleted => d,
            _ => {
                debug!(device = %device.name, "ping failed but device already gone");
                return Ok(PingVerdict::AlreadyGone);
            }
        };

        let now = epoch_secs();
        let mut failed = current;
        failed.status = DeviceStatus::Error;
        failed.updated_at = now;
        self.store.put_device(&failed)?;

        for mut lb in self.store.list_load_balancers_for_device(device.id)? {
            lb.status = LbStatus::Error;
            lb.errmsg = Some(msg.to_string());
            lb.updated_at = now;
            self.store.put_load_balancer(&lb)?;
        }

        warn!(device = %device.name, error = %msg, "device failed ping");
        self.alerter.send_alert(&device.name, msg).await;
        Ok(PingVerdict::Failed)
    }

    /// Fold a PASS stats result into node and load-balancer statuses.
    /// All changes for one load balancer are batched into a single alert.
    async fn reconcile_nodes(&self, device: &Device, result: &Value) -> HealthResult<()> {
        let Some(job) = DeviceJob::from_value(result) else {
            warn!(device = %device.name, "unparseable stats result");
            return Ok(());
        };
        let Some(observations) = job.nodes else {
            return Ok(());
        };

        let now = epoch_secs();
        for mut lb in self.store.list_load_balancers_for_device(device.id)? {
            let mut changes: Vec<String> = Vec::new();
            for mut node in self.store.list_nodes_for_lb(lb.id)? {
                let Some(obs) = observations.iter().find(|o| o.id == node.id.to_string())
                else {
                    continue;
                };
                match (obs.status.as_str(), node.status) {
                    ("DOWN", NodeStatus::Online) => {
                        node.status = NodeStatus::Error;
                        self.store.put_node(&node)?;
                        changes.push(format!("node {} DOWN", node.id));
                    }
                    ("UP", NodeStatus::Error) => {
                        node.status = NodeStatus::Online;
                        self.store.put_node(&node)?;
                        changes.push(format!("node {} UP", node.id));
                    }
                    _ => {}
                }
            }
            if changes.is_empty() {
                continue;
            }

            let any_down = self
                .store
                .list_nodes_for_lb(lb.id)?
                .iter()
                .any(|n| n.status == NodeStatus::Error);
            // A device-level Error outranks node degradation.
            if any_down && lb.status != LbStatus::Error {
                lb.status = LbStatus::Degraded;
                lb.updated_at = now;
                self.store.put_load_balancer(&lb)?;
            } else if !any_down && lb.status == LbStatus::Degraded {
                lb.status = LbStatus::Active;
                lb.updated_at = now;
                self.store.put_load_balancer(&lb)?;
            }

            let message = format!("lb {}: {}", lb.id, changes.join(", "));
            info!(lb_id = lb.id, %message, "node status change");
            self.alerter.send_node_change(&message).await;
        }
        Ok(())
    }

    // ── Offline cycle ──────────────────────────────────────────────

    /// DIAGNOSTICS-probe every Offline (spare) device. A device that fails
    /// `ping_limit` consecutive cycles is handed to the delete probe. When
    /// more than `stats_device_error_limit` devices fail at once the cycle
    /// aborts untouched — mass failure looks like a partition, not
    /// simultaneous hardware death.
    pub async fn run_offline_cycle(&self) -> HealthResult<()> {
        let devices = self.store.list_devices_by_status(DeviceStatus::Offline)?;
        if devices.is_empty() {
            return Ok(());
        }

        let payload = DeviceJob::new(DeviceAction::Diagnostics).to_value();
        let jobs: Vec<(String, Value)> = devices
            .iter()
            .map(|d| (d.name.clone(), payload.clone()))
            .collect();
        let outcomes = self.jobs.submit_many(&jobs).await;

        let verdicts: Vec<(&Device, bool)> = devices
            .iter()
            .zip(&outcomes)
            .filter_map(|(device, outcome)| match outcome {
                // A queue outage says nothing about the device; skip it
                // rather than walking it toward deletion.
                JobOutcome::Disconnected => {
                    warn!(device = %device.name, "job server unavailable, diagnostics skipped");
                    None
                }
                JobOutcome::Completed(result) if device_passed(result) => Some((device, true)),
                _ => Some((device, false)),
            })
            .collect();

        let failed = verdicts.iter().filter(|(_, healthy)| !healthy).count() as u32;
        if failed > self.config.stats_device_error_limit {
            error!(
                failed,
                limit = self.config.stats_device_error_limit,
                "too many spare devices failing, aborting offline cycle"
            );
            return Err(HealthError::ErrorLimitExceeded {
                failed,
                limit: self.config.stats_device_error_limit,
            });
        }

        let now = epoch_secs();
        for (device, healthy) in verdicts {
            let mut updated = device.clone();
            if healthy {
                if updated.ping_count != 0 {
                    updated.ping_count = 0;
                    updated.updated_at = now;
                    self.store.put_device(&updated)?;
                }
                continue;
            }

            updated.ping_count += 1;
            updated.updated_at = now;
            if updated.ping_count >= self.config.ping_limit {
                updated.status = DeviceStatus::Deleted;
                warn!(
                    device = %device.name,
                    pings = updated.ping_count,
                    "spare device dead, scheduling deletion"
                );
                self.alerter
                    .send_delete(&device.name, "diagnostics ping limit reached")
                    .await;
            }
            self.store.put_device(&updated)?;
        }
        Ok(())
    }

    // ── Repair cycle ───────────────────────────────────────────────

    /// Rebuild every failed device onto a spare. Pool exhaustion is not an
    /// error worth more than a warning; the device stays queued for the
    /// next cycle.
    pub async fn run_repair_cycle(&self) -> HealthResult<()> {
        let mut failed = self.store.list_devices_by_status(DeviceStatus::Error)?;
        failed.extend(self.store.list_devices_by_status(DeviceStatus::ErrorRebuilding)?);

        for device in failed {
            match self.rebuilder.rebuild_device(device.id).await {
                Ok(spare) => {
                    info!(failed = %device.name, spare, "device rebuilt");
                }
                Err(HealthError::NoSpareDevice) => {
                    warn!(device = %device.name, "no spare available, rebuild deferred");
                }
                Err(e) => {
                    error!(device = %device.name, error = %e, "rebuild failed");
                }
            }
        }
        Ok(())
    }

    // ── Scheduling ─────────────────────────────────────────────────

    /// One timer tick: shard-gate, take the cycle lease, run every cycle.
    pub async fn tick(&self) {
        let now = epoch_secs();
        if !self.clock.fires_at_minute(ShardClock::minute_of(now)) {
            return;
        }

        let ttl = self.config.ping_interval.as_secs().max(1);
        match with_retries(|| {
            self.store
                .acquire_task_lease(HEALTH_CYCLE_LEASE, &self.owner, ttl, now)
        }) {
            Ok(true) => {}
            Ok(false) => {
                debug!("health cycle lease held elsewhere");
                return;
            }
            Err(e) => {
                error!(error = %e, "health cycle lease acquisition failed");
                return;
            }
        }

        if let Err(e) = self.run_ping_cycle().await {
            error!(error = %e, "ping cycle failed");
        }
        if let Err(e) = self.run_offline_cycle().await {
            error!(error = %e, "offline cycle failed");
        }
        if let Err(e) = self.run_repair_cycle().await {
            error!(error = %e, "repair cycle failed");
        }

        if let Err(e) = self
            .store
            .release_task_lease(HEALTH_CYCLE_LEASE, &self.owner)
        {
            error!(error = %e, "health cycle lease release failed");
        }
    }

    /// Run the health scheduler loop until shutdown.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_secs = self.config.ping_interval.as_secs(),
            server_id = self.config.server_id,
            "health scheduler started"
        );
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.config.ping_interval) => {
                    self.tick().await;
                }
                _ = shutdown.changed() => {
                    info!("health scheduler shutting down");
                    break;
                }
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

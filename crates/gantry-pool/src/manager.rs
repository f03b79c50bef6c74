//! Pool manager — keeps the spare device/VIP pools at size and drives the
//! delete and expunge probes.
//!
//! The device probe computes the pool deficit, subtracts builds already in
//! flight on other replicas (PoolBuilding leases), records its own lease
//! before dispatching, and releases it afterward regardless of outcome.
//! Delete and expunge probes are idempotent by construction: they re-query
//! current status each cycle, so a failed job is simply re-driven next time.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use gantry_jobs::protocol::{PoolAction, PoolJob, pool_passed};
use gantry_jobs::{JobClient, JobOutcome};
use gantry_store::*;

use crate::error::{PoolError, PoolResult};
use crate::shard::ShardClock;

pub use gantry_jobs::protocol::POOL_WORKER;

/// Task-lease key for the minute-keyed pool cycle.
const POOL_CYCLE_LEASE: &str = "pool_cycle";

/// Pool manager settings.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Target number of spare (Offline) devices.
    pub device_pool_size: u32,
    /// Target number of unassigned floating IPs.
    pub vip_pool_size: u32,
    pub server_id: u32,
    pub server_count: u32,
    /// How often the probe timer ticks.
    pub probe_interval: Duration,
    /// Deleted load balancers older than this are purged.
    pub expunge_after_days: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            device_pool_size: 10,
            vip_pool_size: 10,
            server_id: 0,
            server_count: 1,
            probe_interval: Duration::from_secs(60),
            expunge_after_days: 7,
        }
    }
}

/// Maintains the spare pools and reconciles build/delete job results.
pub struct PoolManager {
    store: StateStore,
    jobs: JobClient,
    config: PoolConfig,
    clock: ShardClock,
    owner: String,
}

impl PoolManager {
    pub fn new(store: StateStore, jobs: JobClient, config: PoolConfig) -> Self {
        let clock = ShardClock::new(config.server_id, config.server_count);
        let owner = format!("api-{}", config.server_id);
        Self {
            store,
            jobs,
            config,
            clock,
            owner,
        }
    }

    // ── Device probe ───────────────────────────────────────────────

    /// Top up the spare device pool. Returns the number of builds dispatched.
    pub async fn run_device_probe(&self) -> PoolResult<u32> {
        let offline = self.store.count_devices_by_status(DeviceStatus::Offline)?;
        let deficit = self.config.device_pool_size.saturating_sub(offline);
        if deficit == 0 {
            debug!(offline, "device pool at size");
            return Ok(0);
        }

        // Builds already requested by other replicas count against us.
        let in_flight = self.store.total_leased_qty()?;
        let remaining = deficit.saturating_sub(in_flight);
        if remaining == 0 {
            debug!(deficit, in_flight, "device deficit covered by in-flight builds");
            return Ok(0);
        }

        let now = epoch_secs();
        self.store.put_pool_lease(&PoolLease {
            server_id: self.config.server_id,
            qty: remaining,
            created_at: now,
        })?;

        // Release the lease no matter how the dispatch went.
        let result = self.dispatch_device_builds(remaining).await;
        if let Err(e) = self.store.delete_pool_lease(self.config.server_id) {
            error!(error = %e, "failed to release build lease");
        }
        result?;

        Ok(remaining)
    }

    async fn dispatch_device_builds(&self, qty: u32) -> PoolResult<()> {
        info!(qty, "building spare devices");
        let jobs: Vec<(String, serde_json::Value)> = (0..qty)
            .map(|_| {
                (
                    POOL_WORKER.to_string(),
                    PoolJob::new(PoolAction::BuildDevice).to_value(),
                )
            })
            .collect();

        let outcomes = self.jobs.submit_many(&jobs).await;
        let now = epoch_secs();
        for outcome in outcomes {
            match outcome {
                JobOutcome::Completed(result) if pool_passed(&result) => {
                    self.ingest_built_device(&result, now)?;
                }
                JobOutcome::Completed(_) => {
                    warn!("device build reported FAIL, no row created");
                }
                JobOutcome::TimedOut => warn!("device build timed out"),
                JobOutcome::Disconnected => warn!("job server lost during device build"),
            }
        }
        Ok(())
    }

    /// Insert a successfully built device as spare pool capacity.
    fn ingest_built_device(&self, result: &serde_json::Value, now: u64) -> PoolResult<()> {
        let job = PoolJob::from_value(result)
            .ok_or_else(|| PoolError::BadJobResult(result.to_string()))?;
        let name = job
            .name
            .ok_or_else(|| PoolError::BadJobResult("build result missing name".to_string()))?;

        let device = Device {
            id: self.store.allocate_id()?,
            name: name.clone(),
            floating_ip: job.address,
            az: job.az.unwrap_or_default(),
            kind: job.kind.unwrap_or_default(),
            status: DeviceStatus::Offline,
            ping_count: 0,
            created_at: now,
            updated_at: now,
        };
        self.store.put_device(&device)?;
        info!(device = %name, id = device.id, "spare device added to pool");
        Ok(())
    }

    // ── VIP probe ──────────────────────────────────────────────────

    /// Top up the unassigned VIP pool. No lease: contention risk on the VIP
    /// side is low enough that over-building is accepted.
    pub async fn run_vip_probe(&self) -> PoolResult<u32> {
        let unassigned = self.store.count_unassigned_vips()?;
        let deficit = self.config.vip_pool_size.saturating_sub(unassigned);
        if deficit == 0 {
            return Ok(0);
        }

        info!(qty = deficit, "building floating IPs");
        let jobs: Vec<(String, serde_json::Value)> = (0..deficit)
            .map(|_| {
                (
                    POOL_WORKER.to_string(),
                    PoolJob::new(PoolAction::BuildIp).to_value(),
                )
            })
            .collect();

        let outcomes = self.jobs.submit_many(&jobs).await;
        for outcome in outcomes {
            match outcome {
                JobOutcome::Completed(result) if pool_passed(&result) => {
                    let job = PoolJob::from_value(&result)
                        .ok_or_else(|| PoolError::BadJobResult(result.to_string()))?;
                    let ip_str = job.ip.ok_or_else(|| {
                        PoolError::BadJobResult("ip build result missing ip".to_string())
                    })?;
                    let Some(ip) = parse_ipv4(&ip_str) else {
                        warn!(ip = %ip_str, "unparseable ip in build result");
                        continue;
                    };
                    let vip = Vip {
                        id: self.store.allocate_id()?,
                        ip,
                        binding: VipBinding::Unassigned,
                    };
                    self.store.put_vip(&vip)?;
                    info!(ip = %ip_str, id = vip.id, "floating ip added to pool");
                }
                JobOutcome::Completed(_) => warn!("ip build reported FAIL"),
                JobOutcome::TimedOut => warn!("ip build timed out"),
                JobOutcome::Disconnected => warn!("job server lost during ip build"),
            }
        }
        Ok(deficit)
    }

    // ── Delete probe ───────────────────────────────────────────────

    /// Tear down devices scheduled for deletion. A failed delete leaves the
    /// row in Deleted so the next cycle retries it.
    pub async fn run_delete_probe(&self) -> PoolResult<u32> {
        let doomed = self.store.list_devices_by_status(DeviceStatus::Deleted)?;
        if doomed.is_empty() {
            return Ok(0);
        }

        info!(count = doomed.len(), "deleting devices");
        let jobs: Vec<(String, serde_json::Value)> = doomed
            .iter()
            .map(|d| {
                (
                    POOL_WORKER.to_string(),
                    PoolJob::new(PoolAction::DeleteDevice)
                        .with_name(&d.name)
                        .to_value(),
                )
            })
            .collect();

        let outcomes = self.jobs.submit_many(&jobs).await;
        let mut removed = 0;
        for (device, outcome) in doomed.iter().zip(outcomes) {
            match outcome {
                JobOutcome::Completed(result) if pool_passed(&result) => {
                    self.store.delete_device(device.id)?;
                    removed += 1;
                }
                JobOutcome::Completed(_) => {
                    warn!(device = %device.name, "device delete reported FAIL, will retry")
                }
                JobOutcome::TimedOut => {
                    warn!(device = %device.name, "device delete timed out, will retry")
                }
                JobOutcome::Disconnected => {
                    warn!(device = %device.name, "job server lost during delete, will retry")
                }
            }
        }
        Ok(removed)
    }

    // ── Expunge probes ─────────────────────────────────────────────

    /// Remove poisoned VIPs. A poisoned IP is never reassigned, only deleted.
    pub async fn run_vip_expunge(&self) -> PoolResult<u32> {
        let poisoned = self.store.list_poisoned_vips()?;
        if poisoned.is_empty() {
            return Ok(0);
        }

        info!(count = poisoned.len(), "expunging poisoned ips");
        let jobs: Vec<(String, serde_json::Value)> = poisoned
            .iter()
            .map(|v| {
                (
                    POOL_WORKER.to_string(),
                    PoolJob::new(PoolAction::DeleteIp)
                        .with_ip(v.ip_string())
                        .to_value(),
                )
            })
            .collect();

        let outcomes = self.jobs.submit_many(&jobs).await;
        let mut removed = 0;
        for (vip, outcome) in poisoned.iter().zip(outcomes) {
            match outcome {
                JobOutcome::Completed(result) if pool_passed(&result) => {
                    self.store.delete_vip(vip.id)?;
                    removed += 1;
                }
                _ => warn!(ip = %vip.ip_string(), "poisoned ip delete failed, will retry"),
            }
        }
        Ok(removed)
    }

    /// Purge load balancers deleted more than `expunge_after_days` ago,
    /// together with their nodes and monitor.
    pub fn run_lb_expunge(&self, now: u64) -> PoolResult<u32> {
        let horizon = self.config.expunge_after_days * 86_400;
        let mut purged = 0;
        for lb in self.store.list_load_balancers()? {
            if lb.status == LbStatus::Deleted && lb.updated_at + horizon <= now {
                self.store.delete_nodes_for_lb(lb.id)?;
                self.store.delete_monitor(lb.id)?;
                self.store.delete_load_balancer(lb.id)?;
                info!(lb_id = lb.id, "expunged deleted load balancer");
                purged += 1;
            }
        }
        Ok(purged)
    }

    // ── Scheduling ─────────────────────────────────────────────────

    /// One timer tick: shard-gate, take the cycle lease, run every probe.
    /// Probe errors are logged and swallowed so one bad cycle never kills
    /// the loop.
    pub async fn tick(&self) {
        let now = epoch_secs();
        if !self.clock.fires_at_minute(ShardClock::minute_of(now)) {
            return;
        }

        let ttl = self.config.probe_interval.as_secs().max(1);
        match with_retries(|| {
            self.store
                .acquire_task_lease(POOL_CYCLE_LEASE, &self.owner, ttl, now)
        }) {
            Ok(true) => {}
            Ok(false) => {
                debug!("pool cycle lease held elsewhere");
                return;
            }
            Err(e) => {
                error!(error = %e, "pool cycle lease acquisition failed");
                return;
            }
        }

        if let Err(e) = self.run_device_probe().await {
            error!(error = %e, "device probe failed");
        }
        if let Err(e) = self.run_vip_probe().await {
            error!(error = %e, "vip probe failed");
        }
        if let Err(e) = self.run_delete_probe().await {
            error!(error = %e, "delete probe failed");
        }
        if let Err(e) = self.run_vip_expunge().await {
            error!(error = %e, "vip expunge failed");
        }
        if self.clock.fires_at_day(ShardClock::day_of(now)) {
            if let Err(e) = self.run_lb_expunge(now) {
                error!(error = %e, "lb expunge failed");
            }
        }

        if let Err(e) = self.store.release_task_lease(POOL_CYCLE_LEASE, &self.owner) {
            error!(error = %e, "pool cycle lease release failed");
        }
    }

    /// Run the pool manager loop until shutdown.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_secs = self.config.probe_interval.as_secs(),
            server_id = self.config.server_id,
            "pool manager started"
        );
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.config.probe_interval) => {
                    self.tick().await;
                }
                _ = shutdown.changed() => {
                    info!("pool manager shutting down");
                    break;
                }
            }
        }
    }
}

/// Parse a dotted-quad IPv4 string into its 32-bit encoding.
fn parse_ipv4(s: &str) -> Option<u32> {
    let addr: std::net::Ipv4Addr = s.parse().ok()?;
    Some(u32::from(addr))
}

fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

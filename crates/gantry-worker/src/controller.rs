//! Worker controller — the pool-manager job dispatch table.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};
use tracing::{info, warn};

use gantry_jobs::protocol::{FAIL, PASS, PoolAction, PoolJob};
use gantry_store::StateStore;

use crate::compute::{ComputeApi, ServerInfo, ServerStatus};
use crate::diagnostics::{quorum_reachable, tcp_reachable};
use crate::error::{WorkerError, WorkerResult};
use crate::ratelimit::RateLimiter;

/// Worker controller settings.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Prefix for generated device names.
    pub device_name_prefix: String,
    /// Status polls allowed before a build counts as failed.
    pub build_poll_attempts: u32,
    pub build_poll_interval: Duration,
    /// Owner polls allowed before an IP bind counts as failed.
    pub assign_poll_attempts: u32,
    pub assign_poll_interval: Duration,
    /// Job-queue fleet addresses checked by post-build diagnostics.
    pub queue_servers: Vec<String>,
    /// Port probed on the new device itself; None skips the check.
    pub device_check_port: Option<u16>,
    pub probe_timeout: Duration,
    /// DELETE_DEVICE rate limit: ceiling per sliding window.
    pub delete_rate_ceiling: u32,
    pub delete_rate_window: Duration,
    pub delete_backoff_attempts: u32,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            device_name_prefix: "lb-device".to_string(),
            build_poll_attempts: 30,
            build_poll_interval: Duration::from_secs(2),
            assign_poll_attempts: 10,
            assign_poll_interval: Duration::from_secs(1),
            queue_servers: Vec::new(),
            device_check_port: None,
            probe_timeout: Duration::from_secs(2),
            delete_rate_ceiling: 5,
            delete_rate_window: Duration::from_secs(60),
            delete_backoff_attempts: 3,
        }
    }
}

/// Handles pool-manager jobs against a compute provider.
pub struct WorkerController {
    compute: Arc<dyn ComputeApi>,
    store: StateStore,
    config: WorkerConfig,
    delete_limiter: RateLimiter,
}

impl WorkerController {
    pub fn new(compute: Arc<dyn ComputeApi>, store: StateStore, config: WorkerConfig) -> Self {
        let delete_limiter = RateLimiter::new(
            store.clone(),
            "delete_device",
            config.delete_rate_ceiling,
            config.delete_rate_window,
            config.delete_backoff_attempts,
        );
        Self {
            compute,
            store,
            config,
            delete_limiter,
        }
    }

    /// Handle one job payload. Always returns the payload with `response`
    /// set; malformed payloads get a FAIL back rather than silence.
    pub async fn handle(&self, payload: &Value) -> Value {
        let Some(job) = PoolJob::from_value(payload) else {
            warn!(%payload, "unparseable pool job");
            let mut result = payload.clone();
            result["response"] = json!(FAIL);
            return result;
        };

        let mut result = payload.clone();
        let outcome: WorkerResult<()> = match job.action {
            PoolAction::BuildDevice => match self.build_device().await {
                Ok(info) => {
                    result["name"] = json!(info.name);
                    result["address"] = json!(info.address);
                    result["az"] = json!(info.az);
                    result["type"] = json!(info.kind);
                    Ok(())
                }
                Err(e) => Err(e),
            },
            PoolAction::DeleteDevice => self.delete_device(job.name.as_deref()).await,
            PoolAction::BuildIp => match self.compute.allocate_floating_ip() {
                Ok(ip) => {
                    result["ip"] = json!(ip);
                    Ok(())
                }
                Err(e) => Err(e.into()),
            },
            PoolAction::AssignIp => {
                self.assign_ip(job.ip.as_deref(), job.name.as_deref()).await
            }
            PoolAction::RemoveIp => match job.ip.as_deref() {
                Some(ip) => self.compute.release_floating_ip(ip).map_err(Into::into),
                None => Err(WorkerError::Compute(
                    crate::error::ComputeError::IpNotFound("<missing>".to_string()),
                )),
            },
            PoolAction::DeleteIp => match job.ip.as_deref() {
                Some(ip) => self.compute.delete_floating_ip(ip).map_err(Into::into),
                None => Err(WorkerError::Compute(
                    crate::error::ComputeError::IpNotFound("<missing>".to_string()),
                )),
            },
        };

        match outcome {
            Ok(()) => result["response"] = json!(PASS),
            Err(e) => {
                warn!(action = ?job.action, error = %e, "pool job failed");
                result["response"] = json!(FAIL);
            }
        }
        result
    }

    // ── BUILD_DEVICE ───────────────────────────────────────────────

    /// Create an instance, wait for it to go Active and verify it can see
    /// the queue fleet. Any failure tears the partial instance back down.
    async fn build_device(&self) -> WorkerResult<ServerInfo> {
        let suffix = self.store.allocate_id()?;
        let name = format!("{}-{suffix}", self.config.device_name_prefix);
        let info = self.compute.create_server(&name)?;
        info!(device = %name, "instance created, waiting for active");

        let mut active = false;
        for _ in 0..self.config.build_poll_attempts {
            match self.compute.server_status(&name)? {
                ServerStatus::Active => {
                    active = true;
                    break;
                }
                ServerStatus::Error => break,
                ServerStatus::Building => {
                    tokio::time::sleep(self.config.build_poll_interval).await;
                }
            }
        }
        if !active {
            self.cleanup_partial(&name);
            return Err(WorkerError::BuildTimedOut(name));
        }

        if !self.post_build_diagnostics(&info).await {
            self.cleanup_partial(&name);
            return Err(WorkerError::DiagnosticsFailed(name));
        }

        info!(device = %name, address = %info.address, "device built");
        Ok(info)
    }

    /// Device TCP check (when a port is configured) plus queue-fleet quorum.
    async fn post_build_diagnostics(&self, info: &ServerInfo) -> bool {
        if let Some(port) = self.config.device_check_port {
            let addr = format!("{}:{port}", info.address);
            if !tcp_reachable(&addr, self.config.probe_timeout).await {
                warn!(device = %info.name, %addr, "new device unreachable");
                return false;
            }
        }
        if !quorum_reachable(&self.config.queue_servers, self.config.probe_timeout).await {
            warn!(device = %info.name, "new device cannot reach queue quorum");
            return false;
        }
        true
    }

    /// Best-effort teardown of a half-built instance.
    fn cleanup_partial(&self, name: &str) {
        if let Err(e) = self.compute.delete_server(name) {
            warn!(device = %name, error = %e, "partial instance cleanup failed");
        }
    }

    // ── DELETE_DEVICE ──────────────────────────────────────────────

    async fn delete_device(&self, name: Option<&str>) -> WorkerResult<()> {
        let Some(name) = name else {
            return Err(WorkerError::Compute(
                crate::error::ComputeError::ServerNotFound("<missing>".to_string()),
            ));
        };
        self.delete_limiter.acquire().await?;
        self.compute.delete_server(name)?;
        info!(device = %name, "instance deleted");
        Ok(())
    }

    // ── ASSIGN_IP ──────────────────────────────────────────────────

    /// Associate an IP and poll until the provider confirms the bind. On
    /// failure the IP is released rather than left half-bound.
    async fn assign_ip(&self, ip: Option<&str>, server: Option<&str>) -> WorkerResult<()> {
        let (Some(ip), Some(server)) = (ip, server) else {
            return Err(WorkerError::Compute(
                crate::error::ComputeError::IpNotFound("<missing>".to_string()),
            ));
        };

        self.compute.assign_floating_ip(ip, server)?;
        let mut confirmed = false;
        for _ in 0..self.config.assign_poll_attempts {
            match self.compute.floating_ip_owner(ip)? {
                Some(owner) if owner == server => {
                    confirmed = true;
                    break;
                }
                _ => tokio::time::sleep(self.config.assign_poll_interval).await,
            }
        }

        if confirmed {
            // The provider says the bind took; when a check port is
            // configured, also require the address to answer on it.
            match self.config.device_check_port {
                None => {
                    info!(%ip, %server, "floating ip bound");
                    return Ok(());
                }
                Some(port) => {
                    let addr = format!("{ip}:{port}");
                    if tcp_reachable(&addr, self.config.probe_timeout).await {
                        info!(%ip, %server, "floating ip bound and reachable");
                        return Ok(());
                    }
                    warn!(%ip, %server, %addr, "bound ip unreachable, releasing");
                }
            }
        } else {
            warn!(%ip, %server, "bind never confirmed, releasing ip");
        }

        // Route the address back through the remove flow.
        if let Err(e) = self.compute.release_floating_ip(ip) {
            warn!(%ip, error = %e, "release after failed bind also failed");
        }
        Err(WorkerError::IpBindTimedOut {
            ip: ip.to_string(),
            server: server.to_string(),
        })
    }
}

//! gantryd — the Gantry daemon.
//!
//! Single binary that assembles the control plane:
//! - State store (redb)
//! - In-memory job queue with the embedded pool-manager worker
//! - Pool manager (spare device/VIP pools, delete and expunge probes)
//! - Health scheduler (ping/offline/repair cycles)
//! - Billing cycle
//!
//! # Usage
//!
//! ```text
//! gantryd standalone --data-dir /var/lib/gantry --server-id 0 --server-count 1
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::{error, info};

use gantry_alerts::{AlertDriver, Alerter, BillingSink};
use gantry_dispatch::Dispatcher;
use gantry_health::{HealthConfig, HealthScheduler, Rebuilder};
use gantry_jobs::protocol::POOL_WORKER;
use gantry_jobs::{InMemoryQueue, JobClient};
use gantry_pool::{PoolConfig, PoolManager, ShardClock};
use gantry_store::{LbStatus, StateStore};
use gantry_worker::{MockCompute, WorkerConfig, WorkerController};

#[derive(Parser)]
#[command(name = "gantryd", about = "Gantry load-balancer control plane")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run in standalone mode (single node, embedded queue and worker).
    Standalone {
        /// Data directory for persistent state.
        #[arg(long, default_value = "/var/lib/gantry")]
        data_dir: PathBuf,

        /// Use a scratch in-memory store instead of the data directory.
        #[arg(long)]
        ephemeral: bool,

        /// This replica's id for time-sharded scheduling.
        #[arg(long, default_value = "0")]
        server_id: u32,

        /// Total number of control-plane replicas.
        #[arg(long, default_value = "1")]
        server_count: u32,

        /// Target spare-device pool size.
        #[arg(long, default_value = "10")]
        device_pool_size: u32,

        /// Target unassigned floating-IP pool size.
        #[arg(long, default_value = "10")]
        vip_pool_size: u32,

        /// Pool probe interval in seconds.
        #[arg(long, default_value = "60")]
        probe_interval: u64,

        /// Health cycle interval in seconds.
        #[arg(long, default_value = "60")]
        ping_interval: u64,

        /// Diagnostics failures before a spare device is deleted.
        #[arg(long, default_value = "10")]
        ping_limit: u32,

        /// Offline-cycle abort threshold (failures per cycle).
        #[arg(long, default_value = "5")]
        error_limit: u32,

        /// Days a deleted load balancer is kept before expunge.
        #[arg(long, default_value = "7")]
        expunge_days: u64,

        /// Billing cycle interval in seconds.
        #[arg(long, default_value = "3600")]
        billing_interval: u64,

        /// Post an event to a datadog agent at this address on alerts.
        #[arg(long)]
        datadog_agent: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,gantryd=debug,gantry=debug".parse().expect("static filter")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Standalone {
            data_dir,
            ephemeral,
            server_id,
            server_count,
            device_pool_size,
            vip_pool_size,
            probe_interval,
            ping_interval,
            ping_limit,
            error_limit,
            expunge_days,
            billing_interval,
            datadog_agent,
        } => {
            run_standalone(StandaloneOpts {
                data_dir,
                ephemeral,
                server_id,
                server_count,
                device_pool_size,
                vip_pool_size,
                probe_interval,
                ping_interval,
                ping_limit,
                error_limit,
                expunge_days,
                billing_interval,
                datadog_agent,
            })
            .await
        }
    }
}

struct StandaloneOpts {
    data_dir: PathBuf,
    ephemeral: bool,
    server_id: u32,
    server_count: u32,
    device_pool_size: u32,
    vip_pool_size: u32,
    probe_interval: u64,
    ping_interval: u64,
    ping_limit: u32,
    error_limit: u32,
    expunge_days: u64,
    billing_interval: u64,
    datadog_agent: Option<String>,
}

async fn run_standalone(opts: StandaloneOpts) -> anyhow::Result<()> {
    info!("Gantry daemon starting in standalone mode");

    // ── State store ────────────────────────────────────────────

    let store = if opts.ephemeral {
        info!("using in-memory scratch store");
        StateStore::open_in_memory()?
    } else {
        std::fs::create_dir_all(&opts.data_dir)?;
        let db_path = opts.data_dir.join("gantry.redb");
        let store = StateStore::open(&db_path)?;
        info!(path = ?db_path, "state store opened");
        store
    };

    // ── Job queue + embedded worker ────────────────────────────

    let queue = Arc::new(InMemoryQueue::new());
    let jobs = JobClient::new(queue.clone(), Duration::from_secs(1), 30);

    let compute = Arc::new(MockCompute::new());
    let worker = Arc::new(WorkerController::new(
        compute,
        store.clone(),
        WorkerConfig::default(),
    ));
    info!("embedded pool worker initialized");

    // ── Sinks ──────────────────────────────────────────────────

    let mut drivers = vec![AlertDriver::Database];
    if let Some(agent_addr) = opts.datadog_agent {
        drivers.push(AlertDriver::Datadog { agent_addr });
    }
    let alerter = Alerter::new(store.clone(), drivers);
    let billing = BillingSink::new(store.clone());

    // ── Subsystems ─────────────────────────────────────────────

    let pool = PoolManager::new(
        store.clone(),
        jobs.clone(),
        PoolConfig {
            device_pool_size: opts.device_pool_size,
            vip_pool_size: opts.vip_pool_size,
            server_id: opts.server_id,
            server_count: opts.server_count,
            probe_interval: Duration::from_secs(opts.probe_interval),
            expunge_after_days: opts.expunge_days,
        },
    );
    info!(interval = opts.probe_interval, "pool manager initialized");

    let dispatcher = Dispatcher::new(store.clone(), jobs.clone());
    let rebuilder = Rebuilder::new(store.clone(), jobs.clone(), dispatcher, alerter.clone());
    let health = HealthScheduler::new(
        store.clone(),
        jobs.clone(),
        alerter,
        rebuilder,
        HealthConfig {
            server_id: opts.server_id,
            server_count: opts.server_count,
            ping_interval: Duration::from_secs(opts.ping_interval),
            ping_limit: opts.ping_limit,
            stats_device_error_limit: opts.error_limit,
            ping_retry_bound: 60,
        },
    );
    info!(interval = opts.ping_interval, "health scheduler initialized");

    // ── Background tasks ───────────────────────────────────────

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let worker_handle = tokio::spawn(run_worker_loop(
        queue.clone(),
        worker,
        shutdown_rx.clone(),
    ));
    let pool_handle = {
        let shutdown = shutdown_rx.clone();
        tokio::spawn(async move { pool.run(shutdown).await })
    };
    let health_handle = {
        let shutdown = shutdown_rx.clone();
        tokio::spawn(async move { health.run(shutdown).await })
    };
    let billing_handle = tokio::spawn(run_billing_loop(
        store,
        billing,
        ShardClock::new(opts.server_id, opts.server_count),
        Duration::from_secs(opts.billing_interval),
        shutdown_rx,
    ));

    // ── Shutdown ───────────────────────────────────────────────

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");
    let _ = shutdown_tx.send(true);

    let _ = worker_handle.await;
    let _ = pool_handle.await;
    let _ = health_handle.await;
    let _ = billing_handle.await;

    info!("Gantry daemon stopped");
    Ok(())
}

/// Drain pool-manager jobs from the embedded queue and run them through the
/// worker controller.
async fn run_worker_loop(
    queue: Arc<InMemoryQueue>,
    worker: Arc<WorkerController>,
    mut shutdown: watch::Receiver<bool>,
) {
    info!("embedded worker loop started");
    loop {
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_millis(100)) => {
                while let Some((handle, payload)) = queue.claim_pending(POOL_WORKER) {
                    let result = worker.handle(&payload).await;
                    queue.complete(handle, result);
                }
            }
            _ = shutdown.changed() => {
                info!("embedded worker loop shutting down");
                break;
            }
        }
    }
}

/// Emit one usage event per active load balancer, day-sharded across
/// replicas like the expunge probe.
async fn run_billing_loop(
    store: StateStore,
    billing: BillingSink,
    clock: ShardClock,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    info!(interval_secs = interval.as_secs(), "billing cycle started");
    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {
                let now = std::time::SystemTime::now()
                    .duration_since(std::time::UNIX_EPOCH)
                    .unwrap_or_default()
                    .as_secs();
                if !clock.fires_at_day(ShardClock::day_of(now)) {
                    continue;
                }
                match store.list_load_balancers() {
                    Ok(lbs) => {
                        for lb in lbs.iter().filter(|lb| lb.status == LbStatus::Active) {
                            billing.record_usage(lb);
                        }
                    }
                    Err(e) => error!(error = %e, "billing cycle failed to list load balancers"),
                }
            }
            _ = shutdown.changed() => {
                info!("billing cycle shutting down");
                break;
            }
        }
    }
}

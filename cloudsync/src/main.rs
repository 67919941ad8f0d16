//! cloudsync: periodic mirror of provider inventories.
//!
//! The daemon loads a provider inventory and an upstream snapshot, then:
//! - Syncs every provider on an interval (or once)
//! - Runs provider, region and child scopes in parallel under a worker bound
//! - Dispatches lifecycle tasks for provider-side work
//! - Writes an audit trail of every mirror change

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use cloudsync::driver::{DriverRegistry, MemoryCloud, MemoryDriver};
use cloudsync::inventory::{Inventory, InventoryFile};
use cloudsync::model::ResourceKind;
use cloudsync::{Engine, EngineConfig, MemoryStore, SyncAuditLogger, SyncContext, SyncRange};

/// cloudsync reconciliation daemon
#[derive(Parser, Debug)]
#[command(name = "cloudsync", version, about)]
struct Args {
    /// Provider inventory (JSON)
    #[arg(long, default_value = "demos/inventory.json")]
    inventory: PathBuf,

    /// Engine config file (JSON); flags below take precedence
    #[arg(long)]
    config: Option<PathBuf>,

    /// Seconds between provider syncs
    #[arg(long, default_value = "300")]
    interval: u64,

    /// Upper bound on concurrently running scope reconciles
    #[arg(long)]
    workers: Option<usize>,

    /// Let upstream renames follow into local names
    #[arg(long)]
    enable_sync_name: bool,

    /// Membership-only sync: add and remove mirrors, skip field updates
    #[arg(long)]
    xor: bool,

    /// Sync every provider once and exit
    #[arg(long)]
    once: bool,

    /// Append audit records to this file (JSON lines)
    #[arg(long)]
    audit_log: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "cloudsync=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => EngineConfig::load(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => EngineConfig::default(),
    };
    if let Some(workers) = args.workers {
        config.workers = workers;
    }
    if args.enable_sync_name {
        config.enable_sync_name = true;
    }

    let file = InventoryFile::load(&args.inventory)
        .with_context(|| format!("Failed to load inventory {}", args.inventory.display()))?;
    let cloud = match &file.snapshot {
        Some(path) => MemoryCloud::load(path)
            .await
            .with_context(|| format!("Failed to load snapshot {}", path.display()))?,
        None => MemoryCloud::new(),
    };
    let registry = build_registry(&file, Arc::new(cloud));
    let provider_ids: Vec<String> = file
        .providers
        .iter()
        .map(|e| e.provider.id.clone())
        .collect();
    let inventory = Arc::new(Inventory::from_file(file));

    let audit = match &args.audit_log {
        Some(path) => SyncAuditLogger::new(path),
        None => SyncAuditLogger::new_noop(),
    };

    info!(
        "Starting cloudsync: {} providers, {} workers, interval {}s",
        provider_ids.len(),
        config.workers,
        args.interval
    );

    let engine = Arc::new(
        Engine::builder(config)
            .store(Arc::new(MemoryStore::new()))
            .registry(registry)
            .inventory(inventory)
            .audit(audit)
            .build(),
    );

    // Create shutdown signal channel
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let range = SyncRange::all().with_xor(args.xor);

    let mut runner = tokio::spawn(run_loop(
        Arc::clone(&engine),
        provider_ids,
        range,
        Duration::from_secs(args.interval.max(1)),
        args.once,
        shutdown_rx,
    ));

    // Wait for shutdown signal or the end of a --once run
    let ctrl_c = signal::ctrl_c();
    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())
        .context("Failed to install SIGTERM handler")?;

    let finished = tokio::select! {
        _ = ctrl_c => { info!("Received SIGINT"); false }
        _ = sigterm.recv() => { info!("Received SIGTERM"); false }
        _ = &mut runner => true,
    };

    if !finished {
        let _ = shutdown_tx.send(true);
        let _ = runner.await;
    }

    // Queued tasks outlive the sync that queued them; give them a moment.
    if tokio::time::timeout(Duration::from_secs(10), engine.tasks().wait_idle())
        .await
        .is_err()
    {
        warn!("{} tasks still open at shutdown", engine.tasks().open_tasks().len());
    }

    info!("Shutdown complete");
    Ok(())
}

/// One in-memory driver serving every kind of every provider in the
/// inventory.
fn build_registry(file: &InventoryFile, cloud: Arc<MemoryCloud>) -> DriverRegistry {
    let driver = Arc::new(MemoryDriver::new(cloud));
    let mut registry = DriverRegistry::new();
    for entry in &file.providers {
        if entry.provider.kind.is_on_premise() {
            continue;
        }
        let kinds: &[ResourceKind] = if entry.kinds.is_empty() {
            ResourceKind::ALL
        } else {
            &entry.kinds
        };
        registry.register_all(entry.provider.kind, kinds, driver.clone());
        // Children are listed through their parent's driver.
        for kind in kinds {
            for child in kind.default_children() {
                registry.register(entry.provider.kind, *child, driver.clone());
            }
        }
    }
    registry
}

async fn run_loop(
    engine: Arc<Engine>,
    provider_ids: Vec<String>,
    range: SyncRange,
    interval: Duration,
    once: bool,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.changed() => break,
        }

        let ctx = SyncContext::from_shutdown("scheduler", shutdown.clone());
        for provider_id in &provider_ids {
            if ctx.is_cancelled() {
                break;
            }
            if !engine.scheduler().can_sync(provider_id) {
                info!(provider = %provider_id, "Previous sync still running, skipping");
                continue;
            }
            match engine
                .scheduler()
                .sync_provider_by_id(&ctx, provider_id, &range)
                .await
            {
                Ok(set) if set.has_errors() => {
                    warn!(provider = %provider_id, "Sync finished with errors: {}", set.summary())
                }
                Ok(_) => {}
                Err(e) => warn!(provider = %provider_id, "Skipping provider: {}", e),
            }
        }

        if once || ctx.is_cancelled() {
            break;
        }
    }
}

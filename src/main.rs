#![forbid(unsafe_code)]

//! `agent-fleet`: control plane daemon.
//!
//! Bootstraps configuration, storage, the cost ledger and the process
//! host, then runs the control loop alongside the IPC server for
//! `agent-fleet-ctl`, the retention task and the ledger compaction trigger.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use agent_fleet::audit::JsonlAuditWriter;
use agent_fleet::config_watcher::ConfigWatcher;
use agent_fleet::cost::{compaction, CostGuard, JsonlLedger};
use agent_fleet::escalation::KeywordSignalDetector;
use agent_fleet::host::{ProcessHost, TmuxHost};
use agent_fleet::ipc::spawn_ipc_server;
use agent_fleet::orchestrator::{Collaborators, ControlHandle, ControlLoop};
use agent_fleet::persistence::{db, retention, ConvoyRepo, WorkerRepo, WorkerStore};
use agent_fleet::settings::SettingsService;
use agent_fleet::tracker::CommandTracker;
use agent_fleet::{AppError, Result};

const COMMAND_QUEUE_DEPTH: usize = 64;

#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "agent-fleet", about = "Control plane for autonomous worker fleets", version, long_about = None)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long, default_value = "fleet.toml")]
    config: PathBuf,

    /// Log output format (text or json).
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    /// Disable hot reload of the configuration file.
    #[arg(long)]
    no_watch: bool,
}

fn main() -> Result<()> {
    let args = Cli::parse();
    init_tracing(args.log_format)?;
    info!("agent-fleet bootstrap");

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| AppError::Config(format!("failed to build tokio runtime: {err}")))?
        .block_on(run(args))
}

async fn run(args: Cli) -> Result<()> {
    // ── Load configuration ──────────────────────────────
    let settings = Arc::new(SettingsService::load(&args.config)?);
    let config = settings.current();
    info!(path = %args.config.display(), "configuration loaded");

    let _watcher = if args.no_watch {
        None
    } else {
        match ConfigWatcher::new(Arc::clone(&settings)) {
            Ok(watcher) => Some(watcher),
            Err(err) => {
                warn!(%err, "config hot reload disabled");
                None
            }
        }
    };

    // ── Storage ─────────────────────────────────────────
    let db = Arc::new(db::connect(&config.db_path).await?);
    info!(path = %config.db_path.display(), "database connected");
    let workers: Arc<dyn WorkerStore> = Arc::new(WorkerRepo::new(Arc::clone(&db)));
    let convoys = Arc::new(ConvoyRepo::new(Arc::clone(&db)));

    let ledger = Arc::new(JsonlLedger::open(&config.cost.ledger_path)?);
    let cost = Arc::new(CostGuard::open(ledger)?);
    info!(
        path = %config.cost.ledger_path.display(),
        total = cost.summary(0).total,
        "cost ledger replayed"
    );

    let host: Arc<dyn ProcessHost> = Arc::new(TmuxHost::new(config.host.clone()));
    report_live_workers(workers.as_ref(), host.as_ref()).await;

    let control = ControlLoop::new(
        Arc::clone(&settings),
        Collaborators {
            workers: Arc::clone(&workers),
            convoys,
            host,
            tracker: Arc::new(CommandTracker::new(config.tracker.clone())),
            signals: Arc::new(KeywordSignalDetector::with_defaults()?),
            cost,
            audit: Arc::new(JsonlAuditWriter::new(config.audit_dir.clone())?),
        },
    )?;

    // ── Background tasks ────────────────────────────────
    let ct = CancellationToken::new();
    let (command_tx, command_rx) = mpsc::channel(COMMAND_QUEUE_DEPTH);
    let (maintenance_tx, maintenance_rx) = mpsc::channel(1);

    let retention_handle =
        retention::spawn_retention_task(Arc::clone(&workers), config.retention_days, ct.clone());
    let compaction_handle = compaction::spawn_compaction_trigger(maintenance_tx, ct.clone());
    let ipc_handle = spawn_ipc_server(&config.ipc_name, ControlHandle::new(command_tx), ct.clone())?;
    let loop_handle = tokio::spawn(control.run(command_rx, maintenance_rx, ct.clone()));
    info!(ipc_name = %config.ipc_name, "agent-fleet ready");

    // ── Wait for shutdown signal ────────────────────────
    shutdown_signal().await;
    info!("shutdown signal received");
    ct.cancel();

    let (loop_result, ipc_result, retention_result, compaction_result) =
        tokio::join!(loop_handle, ipc_handle, retention_handle, compaction_handle);
    for result in [loop_result, ipc_result, retention_result, compaction_result] {
        if let Err(err) = result {
            error!(%err, "background task ended abnormally");
        }
    }
    db.close().await;
    info!("agent-fleet shut down");

    Ok(())
}

/// Log workers left live by a previous run. Their sessions keep running
/// across daemon restarts; the first tick re-probes them.
async fn report_live_workers(workers: &dyn WorkerStore, host: &dyn ProcessHost) {
    let live = match workers.list_live().await {
        Ok(live) => live,
        Err(err) => {
            warn!(%err, "failed to list live workers on startup");
            return;
        }
    };
    if live.is_empty() {
        info!("no live workers from a previous run");
        return;
    }
    let mut attached = 0_usize;
    for worker in &live {
        if host.is_running(&worker.id).await {
            attached += 1;
        }
    }
    info!(
        live = live.len(),
        attached,
        "found live workers from a previous run"
    );
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(err) => {
                tracing::warn!(%err, "failed to register SIGTERM handler, using ctrl-c only");
                let _ = ctrl_c.await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(err) = ctrl_c.await {
            tracing::error!(%err, "ctrl-c signal handler failed");
        }
    }
}

fn init_tracing(log_format: LogFormat) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = fmt().with_env_filter(env_filter);

    match log_format {
        LogFormat::Text => subscriber
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
        LogFormat::Json => subscriber
            .json()
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
    }

    Ok(())
}

//! Shared test helpers for control-loop integration tests.
//!
//! Builds a [`ControlLoop`] over in-memory stores, a scripted host and an
//! in-memory tracker, rooted in a temporary workspace, so individual test
//! modules can focus on behaviour rather than wiring.

use std::path::Path;
use std::sync::Arc;

use agent_fleet::audit::MemoryAuditLogger;
use agent_fleet::cost::{CostGuard, JsonlLedger};
use agent_fleet::escalation::KeywordSignalDetector;
use agent_fleet::host::MockHost;
use agent_fleet::models::convoy::{Convoy, ConvoyConfig};
use agent_fleet::orchestrator::{Collaborators, ControlLoop};
use agent_fleet::persistence::{InMemoryConvoyStore, InMemoryWorkerStore};
use agent_fleet::settings::SettingsService;
use agent_fleet::tracker::InMemoryTracker;
use agent_fleet::FleetConfig;

/// Build a `FleetConfig` rooted at `workspace_root` with `extra` TOML
/// appended after the top-level keys.
pub fn test_config(workspace_root: &Path, extra: &str) -> FleetConfig {
    let root = workspace_root.to_string_lossy().replace('\\', "\\\\");
    let toml = format!(
        r#"
default_workspace_root = '{root}'
ipc_name = "fleet-test"
tick_interval_seconds = 1

[cost]
ledger_path = '{root}/cost-ledger.jsonl'
{extra}
"#
    );
    FleetConfig::from_toml_str(&toml).expect("valid test config")
}

/// Everything a control-loop test needs to drive and inspect the fleet.
pub struct Harness {
    pub settings: Arc<SettingsService>,
    pub workers: Arc<InMemoryWorkerStore>,
    pub convoys: Arc<InMemoryConvoyStore>,
    pub host: Arc<MockHost>,
    pub tracker: Arc<InMemoryTracker>,
    pub cost: Arc<CostGuard>,
    pub audit: Arc<MemoryAuditLogger>,
    pub control: ControlLoop,
    pub temp: tempfile::TempDir,
}

impl Harness {
    /// Harness with default settings.
    pub fn new() -> Self {
        Self::with_config("")
    }

    /// Harness with `extra` TOML appended to the `[cost]` table and any
    /// tables that follow.
    pub fn with_config(extra: &str) -> Self {
        let temp = tempfile::tempdir().expect("tempdir");
        let config = test_config(temp.path(), extra);

        let ledger = JsonlLedger::open(config.cost.ledger_path.clone()).expect("ledger");
        let cost = Arc::new(CostGuard::open(Arc::new(ledger)).expect("cost guard"));
        let settings = Arc::new(SettingsService::from_config(config));
        let workers = Arc::new(InMemoryWorkerStore::new());
        let convoys = Arc::new(InMemoryConvoyStore::new());
        let host = Arc::new(MockHost::new());
        let tracker = Arc::new(InMemoryTracker::new());
        let audit = Arc::new(MemoryAuditLogger::default());

        let control = ControlLoop::new(
            Arc::clone(&settings),
            Collaborators {
                workers: workers.clone(),
                convoys: convoys.clone(),
                host: host.clone(),
                tracker: tracker.clone(),
                signals: Arc::new(KeywordSignalDetector::with_defaults().expect("signals")),
                cost: Arc::clone(&cost),
                audit: audit.clone(),
            },
        )
        .expect("control loop");

        Self {
            settings,
            workers,
            convoys,
            host,
            tracker,
            cost,
            audit,
            control,
            temp,
        }
    }

    /// Workspace root every worker runs in.
    pub fn workspace(&self) -> &Path {
        self.temp.path()
    }

    /// Create and start a convoy over `issues`.
    pub async fn start_convoy(&mut self, issues: &[&str], max_concurrent: u32) -> Convoy {
        let config = ConvoyConfig {
            max_concurrent,
            ..ConvoyConfig::default()
        };
        self.control
            .create_convoy(
                "sprint",
                issues.iter().map(|s| (*s).to_owned()).collect(),
                config,
                true,
            )
            .await
            .expect("create and start convoy")
    }
}

/// Worker id the scheduler assigns to an issue.
pub fn worker_id(convoy: &Convoy, issue: &str) -> String {
    format!("{}-{issue}", &convoy.id[..8])
}

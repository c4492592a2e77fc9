//! Fleet configuration parsing and validation.
//!
//! Sections marked hot-reloadable are re-read by
//! [`SettingsService::reload`](crate::settings::SettingsService::reload);
//! the remaining fields (storage paths, host, IPC name, tick interval) are
//! fixed for the lifetime of the process.

use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::cost::CostLimits;
use crate::health::HealthThresholds;
use crate::models::tier::{Specialist, Tier};
use crate::{AppError, Result};

/// Health thresholds in minutes. Hot-reloadable.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct HealthConfig {
    /// Idle minutes before a worker is considered stale.
    #[serde(default = "default_stale_minutes")]
    pub stale_minutes: u64,
    /// Idle minutes before a worker is in warning.
    #[serde(default = "default_warning_minutes")]
    pub warning_minutes: u64,
    /// Idle minutes before a worker is stuck.
    #[serde(default = "default_stuck_minutes")]
    pub stuck_minutes: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            stale_minutes: default_stale_minutes(),
            warning_minutes: default_warning_minutes(),
            stuck_minutes: default_stuck_minutes(),
        }
    }
}

impl HealthConfig {
    /// Validated millisecond thresholds.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` unless `stale < warning < stuck`.
    pub fn thresholds(&self) -> Result<HealthThresholds> {
        HealthThresholds::from_minutes(self.stale_minutes, self.warning_minutes, self.stuck_minutes)
    }
}

fn default_stale_minutes() -> u64 {
    5
}

fn default_warning_minutes() -> u64 {
    15
}

fn default_stuck_minutes() -> u64 {
    30
}

/// Automatic reactions to health transitions. Every flag defaults to off.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct AutoActionConfig {
    /// Send the nudge message when a worker enters `warning`.
    #[serde(default)]
    pub poke_on_warning: bool,
    /// Kill the session when a worker is `stuck`.
    #[serde(default)]
    pub kill_on_stuck: bool,
    /// Respawn a worker after an auto-kill.
    #[serde(default)]
    pub restart_on_kill: bool,
    /// Text delivered by a poke.
    #[serde(default = "default_nudge_message")]
    pub nudge_message: String,
}

impl Default for AutoActionConfig {
    fn default() -> Self {
        Self {
            poke_on_warning: false,
            kill_on_stuck: false,
            restart_on_kill: false,
            nudge_message: default_nudge_message(),
        }
    }
}

fn default_nudge_message() -> String {
    "Continue working on the current task. Pick up where you left off.".into()
}

/// Minimum stuck duration per tier before stuck escalation fires.
///
/// The top tier has no entry: it never auto-escalates.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct StuckMinutesTable {
    /// Gate for `low` workers.
    #[serde(default = "default_low_stuck_minutes")]
    pub low: u64,
    /// Gate for `mid` workers.
    #[serde(default = "default_mid_stuck_minutes")]
    pub mid: u64,
}

impl Default for StuckMinutesTable {
    fn default() -> Self {
        Self {
            low: default_low_stuck_minutes(),
            mid: default_mid_stuck_minutes(),
        }
    }
}

impl StuckMinutesTable {
    /// Gate for a tier, `None` for the top tier.
    #[must_use]
    pub fn for_tier(&self, tier: Tier) -> Option<u64> {
        match tier {
            Tier::Low => Some(self.low),
            Tier::Mid => Some(self.mid),
            Tier::High => None,
        }
    }
}

fn default_low_stuck_minutes() -> u64 {
    10
}

fn default_mid_stuck_minutes() -> u64 {
    20
}

/// Escalation and handoff policy. Hot-reloadable.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct EscalationConfig {
    /// Act on positive triggers by handing the task to a replacement worker.
    #[serde(default = "default_true")]
    pub auto_handoff: bool,
    /// Enable the stuck-escalation trigger.
    #[serde(default = "default_true")]
    pub stuck_escalation: bool,
    /// Enable the phase-ready trigger.
    #[serde(default = "default_true")]
    pub phase_ready: bool,
    /// Enable the quality-gate-failure trigger.
    #[serde(default = "default_true")]
    pub quality_gate: bool,
    /// Enable the task-complete-for-handoff trigger.
    #[serde(default = "default_true")]
    pub task_complete: bool,
    /// Per-tier minimum stuck minutes.
    #[serde(default)]
    pub stuck_minutes: StuckMinutesTable,
    /// Tier that implements once planning is done.
    #[serde(default = "default_implementation_tier")]
    pub implementation_tier: Tier,
    /// Quality-gate trigger only applies to workers on this tier.
    #[serde(default = "default_gate_from")]
    pub quality_gate_from: Tier,
    /// Tier suggested after a failing gate.
    #[serde(default = "default_gate_to")]
    pub quality_gate_to: Tier,
    /// Specialist that takes over a finished implementation.
    #[serde(default = "default_specialist")]
    pub handoff_specialist: Specialist,
    /// Workspace-relative files whose existence marks a finished plan and
    /// whose contents are captured into handoff context.
    #[serde(default = "default_artifact_paths")]
    pub artifact_paths: Vec<String>,
    /// Workspace-relative JSON file reporting build/test gate outcomes.
    #[serde(default = "default_gate_status_path")]
    pub gate_status_path: String,
    /// Maximum bytes captured per workspace file.
    #[serde(default = "default_max_artifact_bytes")]
    pub max_artifact_bytes: usize,
}

impl Default for EscalationConfig {
    fn default() -> Self {
        Self {
            auto_handoff: true,
            stuck_escalation: true,
            phase_ready: true,
            quality_gate: true,
            task_complete: true,
            stuck_minutes: StuckMinutesTable::default(),
            implementation_tier: default_implementation_tier(),
            quality_gate_from: default_gate_from(),
            quality_gate_to: default_gate_to(),
            handoff_specialist: default_specialist(),
            artifact_paths: default_artifact_paths(),
            gate_status_path: default_gate_status_path(),
            max_artifact_bytes: default_max_artifact_bytes(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_implementation_tier() -> Tier {
    Tier::Mid
}

fn default_gate_from() -> Tier {
    Tier::Low
}

fn default_gate_to() -> Tier {
    Tier::Mid
}

fn default_specialist() -> Specialist {
    Specialist::Review
}

fn default_artifact_paths() -> Vec<String> {
    vec![".planning/PLAN.md".into(), ".planning/STATE.md".into()]
}

fn default_gate_status_path() -> String {
    ".fleet/gates.json".into()
}

fn default_max_artifact_bytes() -> usize {
    16 * 1024
}

/// Per-million-token rates for one tier.
#[derive(Debug, Clone, Copy, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct TierRate {
    /// Currency per million input tokens.
    #[serde(default)]
    pub input_per_mtok: f64,
    /// Currency per million output tokens.
    #[serde(default)]
    pub output_per_mtok: f64,
}

/// Pricing table keyed by tier.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct PricingConfig {
    /// Rates for `low`.
    #[serde(default = "default_low_rate")]
    pub low: TierRate,
    /// Rates for `mid`.
    #[serde(default = "default_mid_rate")]
    pub mid: TierRate,
    /// Rates for `high`.
    #[serde(default = "default_high_rate")]
    pub high: TierRate,
}

impl Default for PricingConfig {
    fn default() -> Self {
        Self {
            low: default_low_rate(),
            mid: default_mid_rate(),
            high: default_high_rate(),
        }
    }
}

impl PricingConfig {
    /// Rates for a tier.
    #[must_use]
    pub fn rate(&self, tier: Tier) -> TierRate {
        match tier {
            Tier::Low => self.low,
            Tier::Mid => self.mid,
            Tier::High => self.high,
        }
    }
}

fn default_low_rate() -> TierRate {
    TierRate {
        input_per_mtok: 1.0,
        output_per_mtok: 5.0,
    }
}

fn default_mid_rate() -> TierRate {
    TierRate {
        input_per_mtok: 3.0,
        output_per_mtok: 15.0,
    }
}

fn default_high_rate() -> TierRate {
    TierRate {
        input_per_mtok: 15.0,
        output_per_mtok: 75.0,
    }
}

/// Spend limits and ledger settings. Limits are hot-reloadable.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct CostConfig {
    /// Per-worker limit; 0 disables.
    #[serde(default)]
    pub per_worker_limit: f64,
    /// Per-task limit; 0 disables.
    #[serde(default)]
    pub per_task_limit: f64,
    /// Per-UTC-day limit; 0 disables.
    #[serde(default)]
    pub per_day_limit: f64,
    /// Fraction of a limit at which a warning fires, in `[0, 1]`.
    #[serde(default = "default_alert_threshold")]
    pub alert_threshold: f64,
    /// Token pricing used by `record_usage`.
    #[serde(default)]
    pub pricing: PricingConfig,
    /// Append-only JSONL ledger file.
    #[serde(default = "default_ledger_path")]
    pub ledger_path: PathBuf,
    /// Entries older than this are dropped by compaction.
    #[serde(default = "default_ledger_retention_days")]
    pub ledger_retention_days: u32,
}

impl Default for CostConfig {
    fn default() -> Self {
        Self {
            per_worker_limit: 0.0,
            per_task_limit: 0.0,
            per_day_limit: 0.0,
            alert_threshold: default_alert_threshold(),
            pricing: PricingConfig::default(),
            ledger_path: default_ledger_path(),
            ledger_retention_days: default_ledger_retention_days(),
        }
    }
}

impl CostConfig {
    /// Limits view consumed by the cost guard.
    #[must_use]
    pub fn limits(&self) -> CostLimits {
        CostLimits {
            per_worker: self.per_worker_limit,
            per_task: self.per_task_limit,
            per_day: self.per_day_limit,
            alert_threshold: self.alert_threshold,
        }
    }
}

fn default_alert_threshold() -> f64 {
    0.8
}

fn default_ledger_path() -> PathBuf {
    PathBuf::from(".fleet/costs.jsonl")
}

fn default_ledger_retention_days() -> u32 {
    90
}

/// Process host settings.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct HostConfig {
    /// `tmux` binary.
    #[serde(default = "default_tmux_bin")]
    pub tmux_bin: String,
    /// Worker CLI launched inside each session.
    #[serde(default = "default_worker_command")]
    pub worker_command: String,
    /// Arguments placed before the tier flag and prompt.
    #[serde(default)]
    pub worker_args: Vec<String>,
    /// Flag used to pass the tier to the worker CLI; empty disables.
    #[serde(default = "default_tier_flag")]
    pub tier_flag: String,
    /// Lines of scrollback captured for the output snapshot.
    #[serde(default = "default_capture_lines")]
    pub capture_lines: u32,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            tmux_bin: default_tmux_bin(),
            worker_command: default_worker_command(),
            worker_args: Vec::new(),
            tier_flag: default_tier_flag(),
            capture_lines: default_capture_lines(),
        }
    }
}

fn default_tmux_bin() -> String {
    "tmux".into()
}

fn default_worker_command() -> String {
    "claude".into()
}

fn default_tier_flag() -> String {
    "--model".into()
}

fn default_capture_lines() -> u32 {
    50
}

/// Tracker CLI settings.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct TrackerConfig {
    /// Tracker binary.
    #[serde(default = "default_tracker_command")]
    pub command: String,
    /// Arguments; `{task}` is replaced by the task reference.
    #[serde(default = "default_tracker_args")]
    pub args: Vec<String>,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            command: default_tracker_command(),
            args: default_tracker_args(),
        }
    }
}

fn default_tracker_command() -> String {
    "bd".into()
}

fn default_tracker_args() -> Vec<String> {
    vec![
        "list".into(),
        "--parent".into(),
        "{task}".into(),
        "--json".into(),
    ]
}

fn default_tick_interval_seconds() -> u64 {
    30
}

fn default_retention_days() -> u32 {
    7
}

fn default_ipc_name() -> String {
    "agent-fleet".into()
}

fn default_db_path() -> PathBuf {
    PathBuf::from(".fleet/fleet.db")
}

fn default_audit_dir() -> PathBuf {
    PathBuf::from(".fleet/logs")
}

/// Global configuration parsed from `fleet.toml`.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct FleetConfig {
    /// Workspace directory used when a convoy does not name one.
    pub default_workspace_root: PathBuf,
    /// `SQLite` database file for workers and convoys.
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
    /// Directory for the JSONL audit log.
    #[serde(default = "default_audit_dir")]
    pub audit_dir: PathBuf,
    /// Control loop tick interval.
    #[serde(default = "default_tick_interval_seconds")]
    pub tick_interval_seconds: u64,
    /// Days a terminal worker is kept before archival.
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
    /// Named pipe / Unix socket identifier.
    #[serde(default = "default_ipc_name")]
    pub ipc_name: String,
    /// Health thresholds.
    #[serde(default)]
    pub health: HealthConfig,
    /// Auto-action flags.
    #[serde(default)]
    pub auto_actions: AutoActionConfig,
    /// Escalation policy.
    #[serde(default)]
    pub escalation: EscalationConfig,
    /// Cost limits and ledger.
    #[serde(default)]
    pub cost: CostConfig,
    /// Process host.
    #[serde(default)]
    pub host: HostConfig,
    /// Tracker CLI.
    #[serde(default)]
    pub tracker: TrackerConfig,
}

impl FleetConfig {
    /// Load and validate configuration from a TOML file path.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the file cannot be read or contains
    /// invalid TOML, or if validation fails.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|err| AppError::Config(format!("failed to read config: {err}")))?;
        Self::from_toml_str(&raw)
    }

    /// Parse and validate configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if parsing or validation fails.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Validated health thresholds.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` unless `stale < warning < stuck`.
    pub fn health_thresholds(&self) -> Result<HealthThresholds> {
        self.health.thresholds()
    }

    fn validate(&self) -> Result<()> {
        self.health.thresholds()?;

        if self.tick_interval_seconds == 0 {
            return Err(AppError::Config(
                "tick_interval_seconds must be greater than zero".into(),
            ));
        }

        let cost = &self.cost;
        if !(0.0..=1.0).contains(&cost.alert_threshold) {
            return Err(AppError::Config(format!(
                "cost.alert_threshold must be within [0, 1], got {}",
                cost.alert_threshold
            )));
        }
        for (name, limit) in [
            ("per_worker_limit", cost.per_worker_limit),
            ("per_task_limit", cost.per_task_limit),
            ("per_day_limit", cost.per_day_limit),
        ] {
            if !limit.is_finite() || limit < 0.0 {
                return Err(AppError::Config(format!(
                    "cost.{name} must be a non-negative number"
                )));
            }
        }

        let ladder = &self.escalation.stuck_minutes;
        if ladder.low == 0 || ladder.mid == 0 {
            return Err(AppError::Config(
                "escalation.stuck_minutes entries must be greater than zero".into(),
            ));
        }
        if ladder.low > ladder.mid {
            return Err(AppError::Config(
                "escalation.stuck_minutes.low must not exceed mid".into(),
            ));
        }

        if self.escalation.quality_gate_to <= self.escalation.quality_gate_from {
            return Err(AppError::Config(
                "escalation.quality_gate_to must be above quality_gate_from".into(),
            ));
        }

        if self.ipc_name.trim().is_empty() {
            return Err(AppError::Config("ipc_name must not be empty".into()));
        }

        Ok(())
    }
}

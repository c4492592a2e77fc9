//! Worker health evaluation.
//!
//! Health is a pure function of idle time against three ordered
//! thresholds. The [`monitor`] submodule applies the configured
//! auto-actions on top of the pure classification.

pub mod monitor;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{AppError, Result};

pub use monitor::{HealthMonitor, MonitorAction};

/// Health classification, ordered from healthy to stuck.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum HealthState {
    /// Recently active.
    Active,
    /// Idle past the stale threshold.
    Stale,
    /// Idle past the warning threshold.
    Warning,
    /// Idle past the stuck threshold, or not running at all.
    Stuck,
}

impl HealthState {
    /// Stable lowercase identifier.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Stale => "stale",
            Self::Warning => "warning",
            Self::Stuck => "stuck",
        }
    }
}

/// Idle thresholds in milliseconds, strictly ascending.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct HealthThresholds {
    stale_ms: u64,
    warning_ms: u64,
    stuck_ms: u64,
}

impl HealthThresholds {
    /// Build thresholds from milliseconds.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` unless `stale < warning < stuck`.
    pub fn new(stale_ms: u64, warning_ms: u64, stuck_ms: u64) -> Result<Self> {
        if !(stale_ms < warning_ms && warning_ms < stuck_ms) {
            return Err(AppError::Config(format!(
                "health thresholds must satisfy stale < warning < stuck \
                 (got {stale_ms}ms, {warning_ms}ms, {stuck_ms}ms)"
            )));
        }
        Ok(Self {
            stale_ms,
            warning_ms,
            stuck_ms,
        })
    }

    /// Build thresholds from whole minutes.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` unless `stale < warning < stuck`.
    pub fn from_minutes(stale: u64, warning: u64, stuck: u64) -> Result<Self> {
        const MINUTE_MS: u64 = 60_000;
        Self::new(
            stale.saturating_mul(MINUTE_MS),
            warning.saturating_mul(MINUTE_MS),
            stuck.saturating_mul(MINUTE_MS),
        )
    }

    /// Stale threshold.
    #[must_use]
    pub fn stale_ms(&self) -> u64 {
        self.stale_ms
    }

    /// Warning threshold.
    #[must_use]
    pub fn warning_ms(&self) -> u64 {
        self.warning_ms
    }

    /// Stuck threshold.
    #[must_use]
    pub fn stuck_ms(&self) -> u64 {
        self.stuck_ms
    }
}

impl Default for HealthThresholds {
    fn default() -> Self {
        Self {
            stale_ms: 5 * 60_000,
            warning_ms: 15 * 60_000,
            stuck_ms: 30 * 60_000,
        }
    }
}

/// Classify idle time against thresholds. Monotone in `time_since_activity_ms`.
#[must_use]
pub fn evaluate(time_since_activity_ms: u64, thresholds: &HealthThresholds) -> HealthState {
    if time_since_activity_ms >= thresholds.stuck_ms {
        HealthState::Stuck
    } else if time_since_activity_ms >= thresholds.warning_ms {
        HealthState::Warning
    } else if time_since_activity_ms >= thresholds.stale_ms {
        HealthState::Stale
    } else {
        HealthState::Active
    }
}

/// Milliseconds between `since` and `now`, clamped at zero.
#[must_use]
pub fn elapsed_ms(since: DateTime<Utc>, now: DateTime<Utc>) -> u64 {
    u64::try_from((now - since).num_milliseconds()).unwrap_or(0)
}

/// Snapshot of one worker's health.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct HealthRecord {
    /// Worker identifier.
    pub worker_id: String,
    /// Classified state.
    pub state: HealthState,
    /// Whether the host reports the session alive.
    pub running: bool,
    /// Last observed activity.
    pub last_activity_at: Option<DateTime<Utc>>,
    /// Idle time at evaluation, `None` when no activity has been observed.
    pub time_since_activity_ms: Option<u64>,
    /// Evaluation time.
    pub evaluated_at: DateTime<Utc>,
}

/// Full health assessment for one worker.
///
/// A session the host reports as not running is `Stuck` regardless of
/// timestamps. A running session with no observed activity is `Active`:
/// a freshly spawned worker gets the benefit of the doubt.
#[must_use]
pub fn assess(
    worker_id: &str,
    running: bool,
    last_activity_at: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    thresholds: &HealthThresholds,
) -> HealthRecord {
    let time_since_activity_ms = last_activity_at.map(|at| elapsed_ms(at, now));
    let state = if running {
        time_since_activity_ms.map_or(HealthState::Active, |idle| evaluate(idle, thresholds))
    } else {
        HealthState::Stuck
    };

    HealthRecord {
        worker_id: worker_id.to_owned(),
        state,
        running,
        last_activity_at,
        time_since_activity_ms,
        evaluated_at: now,
    }
}

//! Cost guard: spend metering, limits and alerts.
//!
//! Every spend is appended to a [`CostLedgerStore`] before the in-memory
//! totals are updated, so a full replay of the ledger always reproduces
//! the incremental totals. Limits are passed per call, which keeps them
//! hot-reloadable without touching recorded state.

pub mod compaction;
pub mod ledger;
pub mod pricing;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::models::tier::Tier;
use crate::{AppError, Result};

pub use ledger::{CostLedgerEntry, CostLedgerStore, InMemoryLedger, JsonlLedger};
pub use pricing::{FlatRatePricing, Pricing, TokenUsage};

/// Spend limits. A limit of `0` disables its category.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CostLimits {
    /// Per-worker limit.
    pub per_worker: f64,
    /// Per-task limit.
    pub per_task: f64,
    /// Per-UTC-day limit.
    pub per_day: f64,
    /// Fraction of a limit at which a warning fires.
    pub alert_threshold: f64,
}

impl Default for CostLimits {
    fn default() -> Self {
        Self {
            per_worker: 0.0,
            per_task: 0.0,
            per_day: 0.0,
            alert_threshold: 0.8,
        }
    }
}

/// What a cost alert is about.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AlertCategory {
    /// One worker's spend.
    Worker,
    /// One task's spend across its workers.
    Task,
    /// Today's spend across the fleet.
    Day,
}

/// Alert severity.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum AlertLevel {
    /// Total crossed `alert_threshold × limit`.
    Warning,
    /// Total reached the limit.
    LimitReached,
}

/// A threshold crossing reported by [`CostGuard::check_limits`].
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct CostAlert {
    /// Category checked.
    pub category: AlertCategory,
    /// Severity.
    pub level: AlertLevel,
    /// Worker id, task id, or ISO date.
    pub subject: String,
    /// Current total for the subject.
    pub total: f64,
    /// Configured limit.
    pub limit: f64,
}

/// One row of a spend ranking.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct SpendLine {
    /// Worker or task id.
    pub id: String,
    /// Accumulated spend.
    pub total: f64,
    /// Most recent spend.
    pub last_activity_at: DateTime<Utc>,
}

/// Snapshot of aggregate spend.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct CostSummary {
    /// Spend across every retained entry.
    pub total: f64,
    /// Spend recorded on the current UTC day.
    pub today: f64,
    /// Number of entries replayed or recorded.
    pub entries: usize,
    /// Top workers by spend.
    pub top_workers: Vec<SpendLine>,
    /// Top tasks by spend.
    pub top_tasks: Vec<SpendLine>,
}

#[derive(Debug, Clone)]
struct Bucket {
    total: f64,
    last_activity_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
struct Totals {
    workers: HashMap<String, Bucket>,
    tasks: HashMap<String, Bucket>,
    days: HashMap<NaiveDate, f64>,
    total: f64,
    entries: usize,
}

impl Totals {
    fn apply(&mut self, entry: &CostLedgerEntry) {
        fn bump(map: &mut HashMap<String, Bucket>, key: &str, entry: &CostLedgerEntry) {
            let bucket = map.entry(key.to_owned()).or_insert(Bucket {
                total: 0.0,
                last_activity_at: entry.timestamp,
            });
            bucket.total += entry.amount;
            bucket.last_activity_at = bucket.last_activity_at.max(entry.timestamp);
        }

        bump(&mut self.workers, &entry.worker_id, entry);
        if let Some(task) = &entry.task_id {
            bump(&mut self.tasks, task, entry);
        }
        *self.days.entry(entry.timestamp.date_naive()).or_insert(0.0) += entry.amount;
        self.total += entry.amount;
        self.entries += 1;
    }

    fn today(&self, now: DateTime<Utc>) -> f64 {
        self.days.get(&now.date_naive()).copied().unwrap_or(0.0)
    }
}

/// Meters spend per worker, per task and per UTC day.
pub struct CostGuard {
    ledger: Arc<dyn CostLedgerStore>,
    totals: Mutex<Totals>,
}

impl CostGuard {
    /// Create a guard and replay the existing ledger into its totals.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Ledger` if the ledger cannot be read.
    pub fn open(ledger: Arc<dyn CostLedgerStore>) -> Result<Self> {
        let guard = Self {
            ledger,
            totals: Mutex::new(Totals::default()),
        };
        guard.rebuild()?;
        Ok(guard)
    }

    fn totals(&self) -> MutexGuard<'_, Totals> {
        self.totals
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn snapshot(&self) -> Totals {
        self.totals().clone()
    }

    /// Record a spend.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Ledger` for negative or non-finite amounts, or if
    /// the ledger append fails (totals are left untouched in that case).
    pub fn record_cost(
        &self,
        worker_id: &str,
        amount: f64,
        task_id: Option<&str>,
    ) -> Result<CostLedgerEntry> {
        let entry = CostLedgerEntry {
            worker_id: worker_id.to_owned(),
            task_id: task_id.map(str::to_owned),
            amount,
            tier: None,
            input_tokens: None,
            output_tokens: None,
            timestamp: Utc::now(),
        };
        self.record_entry(entry)
    }

    /// Convert token usage with `pricing`, then record the spend.
    ///
    /// # Errors
    ///
    /// Same as [`CostGuard::record_cost`].
    pub fn record_usage(
        &self,
        worker_id: &str,
        tier: Tier,
        usage: &TokenUsage,
        pricing: &dyn Pricing,
        task_id: Option<&str>,
    ) -> Result<CostLedgerEntry> {
        let entry = CostLedgerEntry {
            worker_id: worker_id.to_owned(),
            task_id: task_id.map(str::to_owned),
            amount: pricing.cost(tier, usage),
            tier: Some(tier),
            input_tokens: Some(usage.input_tokens),
            output_tokens: Some(usage.output_tokens),
            timestamp: Utc::now(),
        };
        self.record_entry(entry)
    }

    fn record_entry(&self, entry: CostLedgerEntry) -> Result<CostLedgerEntry> {
        if !entry.amount.is_finite() || entry.amount < 0.0 {
            return Err(AppError::Ledger(format!(
                "cost amount must be a non-negative number, got {}",
                entry.amount
            )));
        }
        self.ledger.append(&entry)?;
        self.totals().apply(&entry);
        debug!(
            worker_id = %entry.worker_id,
            task_id = entry.task_id.as_deref().unwrap_or(""),
            amount = entry.amount,
            "cost recorded"
        );
        Ok(entry)
    }

    /// Compare current totals with `limits`.
    ///
    /// For every category with a non-zero limit, a total at or above the
    /// limit yields `limit_reached`; otherwise a total at or above
    /// `alert_threshold × limit` yields `warning`.
    #[must_use]
    pub fn check_limits(
        &self,
        worker_id: &str,
        task_id: Option<&str>,
        limits: &CostLimits,
    ) -> Vec<CostAlert> {
        let now = Utc::now();
        let totals = self.snapshot();
        let mut alerts = Vec::new();

        let worker_total = totals.workers.get(worker_id).map_or(0.0, |b| b.total);
        push_alert(&mut alerts, AlertCategory::Worker, worker_id, worker_total, limits.per_worker, limits);

        if let Some(task) = task_id {
            let task_total = totals.tasks.get(task).map_or(0.0, |b| b.total);
            push_alert(&mut alerts, AlertCategory::Task, task, task_total, limits.per_task, limits);
        }

        let day = now.date_naive().to_string();
        push_alert(&mut alerts, AlertCategory::Day, &day, totals.today(now), limits.per_day, limits);

        alerts
    }

    /// Whether new work for `task_id` must not be spawned: the task or the
    /// day has reached its limit.
    #[must_use]
    pub fn is_task_blocked(&self, task_id: &str, limits: &CostLimits) -> bool {
        let totals = self.snapshot();
        let task_total = totals.tasks.get(task_id).map_or(0.0, |b| b.total);
        reached(task_total, limits.per_task) || reached(totals.today(Utc::now()), limits.per_day)
    }

    /// Aggregate snapshot with the top `top_n` workers and tasks.
    #[must_use]
    pub fn summary(&self, top_n: usize) -> CostSummary {
        let totals = self.snapshot();
        CostSummary {
            total: totals.total,
            today: totals.today(Utc::now()),
            entries: totals.entries,
            top_workers: rank(&totals.workers, top_n),
            top_tasks: rank(&totals.tasks, top_n),
        }
    }

    /// Accumulated spend of one worker.
    #[must_use]
    pub fn worker_total(&self, worker_id: &str) -> f64 {
        self.totals().workers.get(worker_id).map_or(0.0, |b| b.total)
    }

    /// Accumulated spend of one task.
    #[must_use]
    pub fn task_total(&self, task_id: &str) -> f64 {
        self.totals().tasks.get(task_id).map_or(0.0, |b| b.total)
    }

    /// Truncate the ledger and clear every total. Operator action only.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Ledger` if the ledger cannot be truncated.
    pub fn reset(&self) -> Result<()> {
        self.ledger.truncate()?;
        *self.totals() = Totals::default();
        warn!("cost ledger reset by operator");
        Ok(())
    }

    /// Replace totals with a full replay of the ledger.
    ///
    /// Returns the number of entries replayed.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Ledger` if the ledger cannot be read.
    pub fn rebuild(&self) -> Result<usize> {
        let entries = self.ledger.read_all()?;
        let mut fresh = Totals::default();
        for entry in &entries {
            fresh.apply(entry);
        }
        let count = fresh.entries;
        *self.totals() = fresh;
        info!(entries = count, "cost totals rebuilt from ledger");
        Ok(count)
    }
}

fn reached(total: f64, limit: f64) -> bool {
    limit > 0.0 && total >= limit
}

fn push_alert(
    alerts: &mut Vec<CostAlert>,
    category: AlertCategory,
    subject: &str,
    total: f64,
    limit: f64,
    limits: &CostLimits,
) {
    if limit <= 0.0 {
        return;
    }
    let level = if total >= limit {
        AlertLevel::LimitReached
    } else if total >= limits.alert_threshold * limit {
        AlertLevel::Warning
    } else {
        return;
    };
    alerts.push(CostAlert {
        category,
        level,
        subject: subject.to_owned(),
        total,
        limit,
    });
}

fn rank(buckets: &HashMap<String, Bucket>, top_n: usize) -> Vec<SpendLine> {
    let mut lines: Vec<SpendLine> = buckets
        .iter()
        .map(|(id, bucket)| SpendLine {
            id: id.clone(),
            total: bucket.total,
            last_activity_at: bucket.last_activity_at,
        })
        .collect();
    lines.sort_by(|a, b| {
        b.total
            .total_cmp(&a.total)
            .then_with(|| b.last_activity_at.cmp(&a.last_activity_at))
            .then_with(|| a.id.cmp(&b.id))
    });
    lines.truncate(top_n);
    lines
}

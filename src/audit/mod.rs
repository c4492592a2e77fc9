//! Structured audit log of control-plane actions.
//!
//! Provides the [`AuditLogger`] trait and associated types. The primary
//! implementation, [`JsonlAuditWriter`], appends JSONL records to
//! daily-rotating files under the configured audit directory.

pub mod writer;

use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Event type classification for audit log entries.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventType {
    /// Convoy created.
    ConvoyCreated,
    /// Convoy started or restarted.
    ConvoyStarted,
    /// Convoy paused by the operator.
    ConvoyPaused,
    /// Convoy resumed by the operator.
    ConvoyResumed,
    /// Convoy stopped by the operator.
    ConvoyStopped,
    /// Convoy reached a terminal status.
    ConvoyFinished,
    /// Worker reported completion.
    WorkerCompleted,
    /// Nudge delivered to a warning worker.
    WorkerPoked,
    /// Stuck worker killed.
    WorkerKilled,
    /// Killed worker respawned.
    WorkerRestarted,
    /// Escalation trigger fired.
    TriggerFired,
    /// Task handed to a replacement worker.
    Handoff,
    /// Cost warning or limit reached.
    CostAlert,
    /// Cost ledger truncated by the operator.
    CostReset,
    /// Configuration reloaded.
    ConfigReloaded,
    /// Old ledger entries dropped.
    LedgerCompacted,
}

/// A structured record of a control-plane action.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    /// ISO 8601 timestamp with timezone.
    pub timestamp: DateTime<Utc>,
    /// Event classification.
    pub event_type: AuditEventType,
    /// Affected worker.
    pub worker_id: Option<String>,
    /// Affected convoy.
    pub convoy_id: Option<String>,
    /// Affected tracker task.
    pub task_id: Option<String>,
    /// Brief result description.
    pub summary: Option<String>,
    /// Event-specific payload.
    pub detail: Option<serde_json::Value>,
}

impl AuditEntry {
    /// Construct a minimal audit entry for the given event type.
    #[must_use]
    pub fn new(event_type: AuditEventType) -> Self {
        Self {
            timestamp: Utc::now(),
            event_type,
            worker_id: None,
            convoy_id: None,
            task_id: None,
            summary: None,
            detail: None,
        }
    }

    /// Set the worker identifier.
    #[must_use]
    pub fn with_worker(mut self, worker_id: impl Into<String>) -> Self {
        self.worker_id = Some(worker_id.into());
        self
    }

    /// Set the convoy identifier.
    #[must_use]
    pub fn with_convoy(mut self, convoy_id: impl Into<String>) -> Self {
        self.convoy_id = Some(convoy_id.into());
        self
    }

    /// Set the task identifier when one is known.
    #[must_use]
    pub fn with_task(mut self, task_id: Option<&str>) -> Self {
        self.task_id = task_id.map(str::to_owned);
        self
    }

    /// Set the summary.
    #[must_use]
    pub fn with_summary(mut self, summary: impl Into<String>) -> Self {
        self.summary = Some(summary.into());
        self
    }

    /// Attach a serializable payload. Serialization failures drop the payload.
    #[must_use]
    pub fn with_detail(mut self, detail: &impl Serialize) -> Self {
        self.detail = serde_json::to_value(detail).ok();
        self
    }
}

/// Writes structured audit entries to a persistent store.
///
/// Implementations must be [`Send`] and [`Sync`] to allow sharing across
/// async task boundaries via [`std::sync::Arc`].
pub trait AuditLogger: Send + Sync {
    /// Record a single audit entry.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying write operation fails.
    fn log_entry(&self, entry: AuditEntry) -> crate::Result<()>;
}

/// Audit logger that keeps entries in memory.
#[derive(Default)]
pub struct MemoryAuditLogger {
    entries: Mutex<Vec<AuditEntry>>,
}

impl MemoryAuditLogger {
    /// Every entry recorded so far.
    #[must_use]
    pub fn entries(&self) -> Vec<AuditEntry> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Entries of one type.
    #[must_use]
    pub fn of_type(&self, event_type: AuditEventType) -> Vec<AuditEntry> {
        self.entries()
            .into_iter()
            .filter(|e| e.event_type == event_type)
            .collect()
    }
}

impl AuditLogger for MemoryAuditLogger {
    fn log_entry(&self, entry: AuditEntry) -> crate::Result<()> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(entry);
        Ok(())
    }
}

pub use writer::JsonlAuditWriter;

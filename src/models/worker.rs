//! Worker model and lifecycle helpers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::tier::{Specialist, Tier};
use crate::{AppError, Result};

/// Lifecycle status for a worker session.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    /// Session requested from the host, no activity observed yet.
    Starting,
    /// Session alive and producing activity.
    Running,
    /// Session parked (killed for handoff or by an auto-action).
    Suspended,
    /// Worker reported its task complete.
    Completed,
    /// Worker failed (spawn error, crash, timeout, operator stop).
    Failed,
}

impl WorkerStatus {
    /// Whether the status is terminal.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Stable lowercase identifier used in storage.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Suspended => "suspended",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

/// A worker executing one task under one tier.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct Worker {
    /// Unique worker identifier; doubles as the host session name.
    pub id: String,
    /// Current execution tier.
    pub tier: Tier,
    /// Workspace directory the session runs in.
    pub workspace_root: String,
    /// Tracker reference of the task (issue id) the worker owns.
    pub task_ref: Option<String>,
    /// Convoy the worker was scheduled by, if any.
    pub convoy_id: Option<String>,
    /// Specialist role for post-implementation workers.
    pub role: Option<Specialist>,
    /// Current lifecycle status.
    pub status: WorkerStatus,
    /// Last observed activity; `None` until the first heartbeat.
    pub last_activity_at: Option<DateTime<Utc>>,
    /// Most recent output snapshot from the host.
    pub last_output: Option<String>,
    /// Spend accumulated by this worker.
    pub spend: f64,
    /// Number of handoffs in this worker's lineage.
    pub handoff_count: u32,
    /// Reason recorded when the worker failed or was suspended.
    pub failure_reason: Option<String>,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Last mutation timestamp.
    pub updated_at: DateTime<Utc>,
    /// Set when the worker reaches a terminal status.
    pub terminated_at: Option<DateTime<Utc>>,
}

impl Worker {
    /// Construct a new worker in `Starting` status.
    #[must_use]
    pub fn new(id: String, tier: Tier, workspace_root: String) -> Self {
        let now = Utc::now();
        Self {
            id,
            tier,
            workspace_root,
            task_ref: None,
            convoy_id: None,
            role: None,
            status: WorkerStatus::Starting,
            last_activity_at: None,
            last_output: None,
            spend: 0.0,
            handoff_count: 0,
            failure_reason: None,
            created_at: now,
            updated_at: now,
            terminated_at: None,
        }
    }

    /// Attach the tracker task this worker owns.
    #[must_use]
    pub fn with_task(mut self, task_ref: impl Into<String>) -> Self {
        self.task_ref = Some(task_ref.into());
        self
    }

    /// Attach the owning convoy.
    #[must_use]
    pub fn with_convoy(mut self, convoy_id: impl Into<String>) -> Self {
        self.convoy_id = Some(convoy_id.into());
        self
    }

    /// Mark the worker as a specialist.
    #[must_use]
    pub fn with_role(mut self, role: Specialist) -> Self {
        self.role = Some(role);
        self
    }

    /// Determine whether a lifecycle transition is permitted.
    #[must_use]
    pub fn can_transition_to(&self, next: WorkerStatus) -> bool {
        matches!(
            (self.status, next),
            (
                WorkerStatus::Starting,
                WorkerStatus::Running
                    | WorkerStatus::Suspended
                    | WorkerStatus::Completed
                    | WorkerStatus::Failed
            ) | (
                WorkerStatus::Running,
                WorkerStatus::Suspended | WorkerStatus::Completed | WorkerStatus::Failed
            ) | (
                WorkerStatus::Suspended,
                WorkerStatus::Starting
                    | WorkerStatus::Running
                    | WorkerStatus::Completed
                    | WorkerStatus::Failed
            )
        )
    }

    /// Apply a lifecycle transition, stamping timestamps and the reason.
    ///
    /// # Errors
    ///
    /// Returns `AppError::InvalidState` if the transition is not permitted.
    pub fn transition_to(&mut self, next: WorkerStatus, reason: Option<String>) -> Result<()> {
        if !self.can_transition_to(next) {
            return Err(AppError::InvalidState(format!(
                "worker {} cannot move from {} to {}",
                self.id,
                self.status.as_str(),
                next.as_str()
            )));
        }
        let now = Utc::now();
        self.status = next;
        self.updated_at = now;
        if reason.is_some() {
            self.failure_reason = reason;
        }
        if next.is_terminal() {
            self.terminated_at = Some(now);
        }
        Ok(())
    }

    /// Record newer activity. Older or equal timestamps are ignored.
    ///
    /// Returns `true` when the recorded activity advanced.
    pub fn observe_activity(&mut self, at: DateTime<Utc>) -> bool {
        if self.last_activity_at.is_some_and(|prev| prev >= at) {
            return false;
        }
        self.last_activity_at = Some(at);
        self.updated_at = Utc::now();
        true
    }
}

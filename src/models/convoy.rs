//! Convoy model: a batch of issues scheduled under one concurrency policy.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{AppError, Result};

/// Lifecycle status of a convoy.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ConvoyStatus {
    /// Created, not yet started.
    Pending,
    /// Scheduling passes are active.
    Running,
    /// No new spawns; running jobs continue.
    Paused,
    /// Every job terminal, at least one completed.
    Completed,
    /// Every job terminal with none completed, or stopped by the operator.
    Failed,
}

impl ConvoyStatus {
    /// Stable lowercase identifier used in storage.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

/// Lifecycle status of a single job within a convoy.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting for a free slot.
    Pending,
    /// A worker is assigned and alive.
    Running,
    /// The worker reported completion.
    Completed,
    /// Spawn error, timeout, crash or operator stop.
    Failed,
}

impl JobStatus {
    /// Whether the status is terminal.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Stable lowercase identifier used in storage.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

/// Concurrency policy for a convoy.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct ConvoyConfig {
    /// Maximum number of simultaneously running jobs (≥ 1).
    pub max_concurrent: u32,
    /// Wall-clock budget per worker before it is killed and failed.
    pub per_worker_timeout_ms: u64,
    /// Whether to build a synthesis prompt once every job is terminal.
    pub synthesize: bool,
}

impl Default for ConvoyConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 3,
            per_worker_timeout_ms: 60 * 60 * 1000,
            synthesize: false,
        }
    }
}

impl ConvoyConfig {
    /// Reject configurations the scheduler cannot honour.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` when `max_concurrent` is zero.
    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent < 1 {
            return Err(AppError::Config(
                "max_concurrent must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

/// One issue's slot in a convoy.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct AgentJob {
    /// Tracker issue identifier.
    pub issue_id: String,
    /// Worker currently (or last) assigned to the job.
    pub worker_id: Option<String>,
    /// Current job status.
    pub status: JobStatus,
    /// Set when the job entered `Running`.
    pub started_at: Option<DateTime<Utc>>,
    /// Set when the job became terminal.
    pub completed_at: Option<DateTime<Utc>>,
    /// Failure reason for `Failed` jobs.
    pub error: Option<String>,
    /// Output captured from the worker at completion.
    pub output: Option<String>,
}

impl AgentJob {
    /// Construct a pending job for an issue.
    #[must_use]
    pub fn new(issue_id: String) -> Self {
        Self {
            issue_id,
            worker_id: None,
            status: JobStatus::Pending,
            started_at: None,
            completed_at: None,
            error: None,
            output: None,
        }
    }
}

/// A batch of issues scheduled together.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct Convoy {
    /// Unique convoy identifier.
    pub id: String,
    /// Human-readable name.
    pub name: String,
    /// Issues in original order.
    pub issue_ids: Vec<String>,
    /// Concurrency policy.
    pub config: ConvoyConfig,
    /// Current lifecycle status.
    pub status: ConvoyStatus,
    /// One job per issue, same order as `issue_ids`.
    pub jobs: Vec<AgentJob>,
    /// Synthesis prompt, set once every job is terminal and `synthesize` is on.
    pub synthesis_prompt: Option<String>,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Last mutation timestamp.
    pub updated_at: DateTime<Utc>,
}

impl Convoy {
    /// Construct a pending convoy with one pending job per issue.
    #[must_use]
    pub fn new(name: String, issue_ids: Vec<String>, config: ConvoyConfig) -> Self {
        let now = Utc::now();
        let jobs = issue_ids.iter().cloned().map(AgentJob::new).collect();
        Self {
            id: Uuid::new_v4().to_string(),
            name,
            issue_ids,
            config,
            status: ConvoyStatus::Pending,
            jobs,
            synthesis_prompt: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Number of jobs currently `Running`.
    #[must_use]
    pub fn running_count(&self) -> usize {
        self.jobs
            .iter()
            .filter(|job| job.status == JobStatus::Running)
            .count()
    }

    /// Number of jobs currently `Pending`.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.jobs
            .iter()
            .filter(|job| job.status == JobStatus::Pending)
            .count()
    }

    /// Whether every job is `Completed` or `Failed`.
    #[must_use]
    pub fn all_terminal(&self) -> bool {
        self.jobs.iter().all(|job| job.status.is_terminal())
    }

    /// Whether the convoy itself is in a terminal status.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self.status, ConvoyStatus::Completed | ConvoyStatus::Failed)
    }

    /// Look up the job for an issue.
    pub fn job_mut(&mut self, issue_id: &str) -> Option<&mut AgentJob> {
        self.jobs.iter_mut().find(|job| job.issue_id == issue_id)
    }

    /// Look up the running job assigned to a worker.
    pub fn job_for_worker_mut(&mut self, worker_id: &str) -> Option<&mut AgentJob> {
        self.jobs
            .iter_mut()
            .find(|job| job.worker_id.as_deref() == Some(worker_id))
    }
}

//! Operator commands delivered to the control loop.
//!
//! Every command carries a `oneshot` reply so callers (the IPC server,
//! tests) await the control loop's answer. [`ControlHandle`] wraps the
//! sending side with one async method per command.

use serde::Deserialize;
use tokio::sync::{mpsc, oneshot};

use crate::cost::compaction::CompactionOutcome;
use crate::cost::{CostAlert, CostSummary, TokenUsage};
use crate::health::HealthRecord;
use crate::models::convoy::{Convoy, ConvoyConfig};
use crate::models::worker::Worker;
use crate::{AppError, Result};

/// Reply channel for a command.
pub type Reply<T> = oneshot::Sender<Result<T>>;

/// Spend to record: a direct amount or token counts priced by tier.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(rename_all = "snake_case", untagged)]
pub enum CostInput {
    /// Currency amount.
    Amount {
        /// Amount in currency units.
        amount: f64,
    },
    /// Token counts priced at the worker's tier.
    Tokens(TokenUsage),
}

/// Lifecycle action on an existing convoy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConvoyAction {
    /// Start or restart.
    Start,
    /// Stop spawning.
    Pause,
    /// Resume spawning.
    Resume,
    /// Kill everything and fail.
    Stop,
}

/// Command processed between ticks by the control loop.
#[derive(Debug)]
pub enum ControlCommand {
    /// Create a convoy, optionally starting it right away.
    CreateConvoy {
        /// Human-readable name.
        name: String,
        /// Issues in order.
        issue_ids: Vec<String>,
        /// Concurrency policy.
        config: ConvoyConfig,
        /// Start immediately.
        start: bool,
        /// Reply.
        reply: Reply<Convoy>,
    },
    /// Apply a lifecycle action.
    Convoy {
        /// Convoy id.
        id: String,
        /// Action.
        action: ConvoyAction,
        /// Reply.
        reply: Reply<Convoy>,
    },
    /// Convoy manifest.
    ConvoyStatus {
        /// Convoy id.
        id: String,
        /// Reply.
        reply: Reply<Convoy>,
    },
    /// Every convoy.
    ListConvoys {
        /// Reply.
        reply: Reply<Vec<Convoy>>,
    },
    /// Every worker record.
    ListWorkers {
        /// Reply.
        reply: Reply<Vec<Worker>>,
    },
    /// A worker reports its task done.
    CompleteWorker {
        /// Worker id.
        worker_id: String,
        /// Result summary.
        output: Option<String>,
        /// Reply.
        reply: Reply<Worker>,
    },
    /// Health snapshot of live workers.
    Health {
        /// Reply.
        reply: Reply<Vec<HealthRecord>>,
    },
    /// Record spend for a worker.
    RecordCost {
        /// Worker id.
        worker_id: String,
        /// Spend.
        input: CostInput,
        /// Task override; defaults to the worker's task.
        task_id: Option<String>,
        /// Reply with the alerts raised.
        reply: Reply<Vec<CostAlert>>,
    },
    /// Aggregate spend.
    CostSummary {
        /// Number of top workers and tasks.
        top_n: usize,
        /// Reply.
        reply: Reply<CostSummary>,
    },
    /// Truncate the ledger.
    ResetCost {
        /// Reply.
        reply: Reply<()>,
    },
    /// Re-read the configuration file.
    Reload {
        /// Reply.
        reply: Reply<()>,
    },
    /// Drop ledger entries older than the retention window.
    CompactLedger {
        /// Reply.
        reply: Reply<CompactionOutcome>,
    },
}

/// Cloneable sender for [`ControlCommand`]s.
#[derive(Clone)]
pub struct ControlHandle {
    tx: mpsc::Sender<ControlCommand>,
}

impl ControlHandle {
    /// Wrap a command sender.
    #[must_use]
    pub fn new(tx: mpsc::Sender<ControlCommand>) -> Self {
        Self { tx }
    }

    async fn request<T>(&self, build: impl FnOnce(Reply<T>) -> ControlCommand) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(build(reply))
            .await
            .map_err(|_| AppError::Ipc("control loop is not running".into()))?;
        rx.await
            .map_err(|_| AppError::Ipc("control loop dropped the request".into()))?
    }

    /// Create a convoy.
    ///
    /// # Errors
    ///
    /// Returns the control loop's error, or `AppError::Ipc` if it is gone.
    pub async fn create_convoy(
        &self,
        name: String,
        issue_ids: Vec<String>,
        config: ConvoyConfig,
        start: bool,
    ) -> Result<Convoy> {
        self.request(|reply| ControlCommand::CreateConvoy {
            name,
            issue_ids,
            config,
            start,
            reply,
        })
        .await
    }

    /// Apply a lifecycle action to a convoy.
    ///
    /// # Errors
    ///
    /// Returns the control loop's error, or `AppError::Ipc` if it is gone.
    pub async fn convoy(&self, id: String, action: ConvoyAction) -> Result<Convoy> {
        self.request(|reply| ControlCommand::Convoy { id, action, reply })
            .await
    }

    /// Fetch a convoy manifest.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` for an unknown convoy.
    pub async fn convoy_status(&self, id: String) -> Result<Convoy> {
        self.request(|reply| ControlCommand::ConvoyStatus { id, reply })
            .await
    }

    /// List convoys.
    ///
    /// # Errors
    ///
    /// Returns the control loop's error, or `AppError::Ipc` if it is gone.
    pub async fn list_convoys(&self) -> Result<Vec<Convoy>> {
        self.request(|reply| ControlCommand::ListConvoys { reply })
            .await
    }

    /// List workers.
    ///
    /// # Errors
    ///
    /// Returns the control loop's error, or `AppError::Ipc` if it is gone.
    pub async fn list_workers(&self) -> Result<Vec<Worker>> {
        self.request(|reply| ControlCommand::ListWorkers { reply })
            .await
    }

    /// Report a worker's task complete.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` for an unknown worker.
    pub async fn complete_worker(&self, worker_id: String, output: Option<String>) -> Result<Worker> {
        self.request(|reply| ControlCommand::CompleteWorker {
            worker_id,
            output,
            reply,
        })
        .await
    }

    /// Health snapshot.
    ///
    /// # Errors
    ///
    /// Returns the control loop's error, or `AppError::Ipc` if it is gone.
    pub async fn health(&self) -> Result<Vec<HealthRecord>> {
        self.request(|reply| ControlCommand::Health { reply }).await
    }

    /// Record spend.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Ledger` for an invalid amount or a failed append.
    pub async fn record_cost(
        &self,
        worker_id: String,
        input: CostInput,
        task_id: Option<String>,
    ) -> Result<Vec<CostAlert>> {
        self.request(|reply| ControlCommand::RecordCost {
            worker_id,
            input,
            task_id,
            reply,
        })
        .await
    }

    /// Aggregate spend.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Ipc` if the control loop is gone.
    pub async fn cost_summary(&self, top_n: usize) -> Result<CostSummary> {
        self.request(|reply| ControlCommand::CostSummary { top_n, reply })
            .await
    }

    /// Truncate the ledger.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Ledger` if truncation fails.
    pub async fn reset_cost(&self) -> Result<()> {
        self.request(|reply| ControlCommand::ResetCost { reply }).await
    }

    /// Reload configuration.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the file is invalid.
    pub async fn reload(&self) -> Result<()> {
        self.request(|reply| ControlCommand::Reload { reply }).await
    }

    /// Compact the ledger now.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Ledger` if compaction fails.
    pub async fn compact_ledger(&self) -> Result<CompactionOutcome> {
        self.request(|reply| ControlCommand::CompactLedger { reply })
            .await
    }
}

//! The control loop: single owner and writer of fleet state.
//!
//! Each tick runs, in order:
//!
//! 1. pick up a reloaded configuration snapshot;
//! 2. probe every live worker, fold heartbeats and apply auto-actions;
//! 3. evaluate escalation triggers and perform handoffs;
//! 4. poll every active convoy (timeouts, exits, backfill).
//!
//! Operator commands and maintenance signals are applied between ticks,
//! so no two mutations ever interleave.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, warn, Instrument};

use crate::audit::{AuditEntry, AuditEventType, AuditLogger};
use crate::config::FleetConfig;
use crate::convoy::ConvoyScheduler;
use crate::cost::compaction::{self, CompactionOutcome, DEFAULT_LOCK_TIMEOUT};
use crate::cost::{AlertLevel, CostAlert, CostGuard, FlatRatePricing};
use crate::escalation::{
    first_actionable, render_transfer_document, CaptureRequest, EscalationEngine, HandoffTarget,
    SignalDetector, TriggerDetection, TriggerType, WorkerObservation,
};
use crate::health::{assess, HealthMonitor, HealthRecord, HealthThresholds, MonitorAction};
use crate::host::ProcessHost;
use crate::models::convoy::{Convoy, ConvoyConfig};
use crate::models::worker::{Worker, WorkerStatus};
use crate::persistence::{ConvoyStore, WorkerStore};
use crate::settings::SettingsService;
use crate::tracker::Tracker;
use crate::{AppError, Result};

use super::commands::{ControlCommand, ConvoyAction, CostInput};

/// Collaborators wired into a [`ControlLoop`].
pub struct Collaborators {
    /// Worker records.
    pub workers: Arc<dyn WorkerStore>,
    /// Convoy manifests.
    pub convoys: Arc<dyn ConvoyStore>,
    /// Session host.
    pub host: Arc<dyn ProcessHost>,
    /// Sub-task source.
    pub tracker: Arc<dyn Tracker>,
    /// Keyword heuristics.
    pub signals: Arc<dyn SignalDetector>,
    /// Spend meter.
    pub cost: Arc<CostGuard>,
    /// Audit sink.
    pub audit: Arc<dyn AuditLogger>,
}

/// A handoff performed during a tick.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct HandoffRecord {
    /// Worker that handed off.
    pub from_worker: String,
    /// Replacement worker.
    pub to_worker: String,
    /// Trigger acted on.
    pub trigger: TriggerType,
    /// Replacement target.
    pub target: HandoffTarget,
    /// Whether the replacement session started.
    pub spawned: bool,
}

/// What one tick did.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TickReport {
    /// Health of every probed worker.
    pub health: Vec<HealthRecord>,
    /// Auto-actions taken.
    pub actions: Vec<MonitorAction>,
    /// Positive trigger detections.
    pub triggers: Vec<TriggerDetection>,
    /// Handoffs performed.
    pub handoffs: Vec<HandoffRecord>,
    /// Convoys that became terminal.
    pub finished_convoys: Vec<String>,
}

/// Owns the scheduler, health monitor, escalation engine and cost guard.
pub struct ControlLoop {
    settings: Arc<SettingsService>,
    config: Arc<FleetConfig>,
    thresholds: HealthThresholds,
    pricing: FlatRatePricing,
    scheduler: ConvoyScheduler,
    monitor: HealthMonitor,
    engine: EscalationEngine,
    workers: Arc<dyn WorkerStore>,
    host: Arc<dyn ProcessHost>,
    cost: Arc<CostGuard>,
    audit: Arc<dyn AuditLogger>,
    // Prior handoff summaries per task, oldest first.
    lineage: HashMap<String, Vec<String>>,
}

impl ControlLoop {
    /// Wire a control loop from the current settings.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the health thresholds are invalid.
    pub fn new(settings: Arc<SettingsService>, parts: Collaborators) -> Result<Self> {
        let config = settings.current();
        let thresholds = config.health_thresholds()?;
        let scheduler = ConvoyScheduler::new(
            parts.convoys,
            Arc::clone(&parts.workers),
            Arc::clone(&parts.host),
            config.default_workspace_root.to_string_lossy().into_owned(),
        )
        .with_cost_guard(Arc::clone(&parts.cost), config.cost.limits());

        Ok(Self {
            pricing: FlatRatePricing::new(config.cost.pricing.clone()),
            thresholds,
            scheduler,
            monitor: HealthMonitor::new(Arc::clone(&parts.host)),
            engine: EscalationEngine::new(parts.tracker, parts.signals),
            workers: parts.workers,
            host: parts.host,
            cost: parts.cost,
            audit: parts.audit,
            lineage: HashMap::new(),
            settings,
            config,
        })
    }

    /// Convoy scheduler owned by this loop.
    #[must_use]
    pub fn scheduler(&self) -> &ConvoyScheduler {
        &self.scheduler
    }

    /// Run until `cancel` fires.
    ///
    /// `maintenance` receives the daily compaction signal.
    pub async fn run(
        mut self,
        mut commands: mpsc::Receiver<ControlCommand>,
        mut maintenance: mpsc::Receiver<()>,
        cancel: CancellationToken,
    ) {
        let period = Duration::from_secs(self.config.tick_interval_seconds.max(1));
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(tick_seconds = period.as_secs(), "control loop started");

        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    info!("control loop shutting down");
                    break;
                }
                _ = interval.tick() => {
                    if let Err(err) = self.tick().await {
                        error!(%err, "control loop tick failed");
                    }
                }
                Some(command) = commands.recv() => self.handle(command).await,
                Some(()) = maintenance.recv() => {
                    if let Err(err) = self.compact_ledger().await {
                        error!(%err, "scheduled ledger compaction failed");
                    }
                }
            }
        }
    }

    /// Run one full tick.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if a store fails. Host and tracker failures
    /// are recorded on the affected worker or job instead.
    pub async fn tick(&mut self) -> Result<TickReport> {
        let span = info_span!("tick");
        async {
            self.apply_settings();
            let mut report = TickReport::default();

            let now = Utc::now();
            for mut worker in self.workers.list_live().await? {
                let probe = self.monitor.probe(&mut worker, now, &self.thresholds).await;
                let actions = self
                    .monitor
                    .apply_auto_actions(&mut worker, &probe.record, &self.config.auto_actions)
                    .await;
                self.workers.save(&worker).await?;
                for action in &actions {
                    self.audit_action(action, &worker);
                }
                // A killed or restarted session already got its recovery this
                // tick; the probe no longer describes it.
                let recovered = actions.iter().any(|action| {
                    matches!(action, MonitorAction::Killed { .. } | MonitorAction::Restarted { .. })
                });
                report.actions.extend(actions);

                if !recovered && matches!(worker.status, WorkerStatus::Starting | WorkerStatus::Running) {
                    self.escalate(&worker, &probe.record, probe.recent_output.as_deref(), &mut report)
                        .await?;
                }
                report.health.push(probe.record);
            }

            for convoy in self.scheduler.poll_all().await? {
                if convoy.is_terminal() {
                    self.audit(
                        AuditEntry::new(AuditEventType::ConvoyFinished)
                            .with_convoy(&convoy.id)
                            .with_summary(convoy.status.as_str()),
                    );
                    report.finished_convoys.push(convoy.id);
                }
            }

            Ok::<_, AppError>(report)
        }
        .instrument(span)
        .await
    }

    fn apply_settings(&mut self) {
        let current = self.settings.current();
        if Arc::ptr_eq(&current, &self.config) {
            return;
        }
        match current.health_thresholds() {
            Ok(thresholds) => self.thresholds = thresholds,
            Err(err) => warn!(%err, "reloaded health thresholds invalid; keeping previous"),
        }
        self.scheduler.set_cost_limits(current.cost.limits());
        self.pricing = FlatRatePricing::new(current.cost.pricing.clone());
        self.config = current;
        info!("configuration applied");
        self.audit(AuditEntry::new(AuditEventType::ConfigReloaded));
    }

    async fn escalate(
        &mut self,
        worker: &Worker,
        record: &HealthRecord,
        recent_output: Option<&str>,
        report: &mut TickReport,
    ) -> Result<()> {
        let observation = WorkerObservation {
            worker,
            health: record.state,
            idle_ms: record.time_since_activity_ms.unwrap_or(0),
            recent_output: recent_output.or(worker.last_output.as_deref()),
        };
        let config = self.config.escalation.clone();
        let detections = self.engine.evaluate(&observation, &config).await;
        let Some((detection, target)) = first_actionable(&detections) else {
            return Ok(());
        };
        let detection = detection.clone();

        info!(
            worker_id = %worker.id,
            trigger = detection.trigger.as_str(),
            target = %target,
            reason = %detection.reason,
            "trigger fired"
        );
        self.audit(
            AuditEntry::new(AuditEventType::TriggerFired)
                .with_worker(&worker.id)
                .with_task(worker.task_ref.as_deref())
                .with_summary(detection.trigger.as_str())
                .with_detail(&detection),
        );
        self.engine.record_fired(worker, detection.trigger);
        report.triggers.push(detection.clone());

        if !config.auto_handoff {
            return Ok(());
        }
        if let Some(task) = worker.task_ref.as_deref() {
            if self.cost.is_task_blocked(task, &self.config.cost.limits()) {
                warn!(worker_id = %worker.id, task, "cost limit reached; handoff withheld");
                return Ok(());
            }
        }
        let record = self.handoff(worker, &detection, target).await?;
        report.handoffs.push(record);
        Ok(())
    }

    /// Move a worker's task to a replacement worker.
    async fn handoff(
        &mut self,
        worker: &Worker,
        detection: &TriggerDetection,
        target: HandoffTarget,
    ) -> Result<HandoffRecord> {
        let span = info_span!("handoff", worker_id = %worker.id, target = %target);
        async {
            let config = &self.config.escalation;
            let summaries = worker
                .task_ref
                .as_ref()
                .and_then(|task| self.lineage.get(task))
                .cloned()
                .unwrap_or_default();
            let context = self
                .engine
                .capture_context(
                    worker,
                    CaptureRequest {
                        detection,
                        target,
                        summaries,
                        artifact_paths: &config.artifact_paths,
                        max_artifact_bytes: config.max_artifact_bytes,
                    },
                )
                .await;
            let document = render_transfer_document(&context);

            let root = lineage_root(&worker.id);
            let (base_id, tier, role) = match target {
                HandoffTarget::Tier(tier) => {
                    (format!("{root}-h{}", context.handoff_count), tier, worker.role)
                }
                HandoffTarget::Specialist(role) => {
                    (format!("{root}-{}", role.as_str()), role.default_tier(), Some(role))
                }
            };
            let new_id = self.unused_worker_id(base_id).await?;

            // Park the old worker first so its session never overlaps the replacement.
            if self.host.is_running(&worker.id).await {
                if let Err(err) = self.host.kill(&worker.id).await {
                    warn!(%err, "failed to kill handed-off worker");
                }
            }
            let mut old = worker.clone();
            let (old_status, old_reason) = match target {
                HandoffTarget::Tier(_) => (
                    WorkerStatus::Suspended,
                    Some(format!("handed off to {new_id} ({target})")),
                ),
                HandoffTarget::Specialist(_) => (WorkerStatus::Completed, None),
            };
            old.transition_to(old_status, old_reason)?;
            self.workers.save(&old).await?;
            self.engine.forget(&old.id);
            self.monitor.forget(&old.id);

            let mut replacement = Worker::new(new_id.clone(), tier, worker.workspace_root.clone());
            replacement.task_ref.clone_from(&worker.task_ref);
            replacement.convoy_id.clone_from(&worker.convoy_id);
            replacement.role = role;
            replacement.handoff_count = context.handoff_count;
            self.workers.save(&replacement).await?;

            let spawned = match self
                .host
                .spawn(&new_id, &replacement.workspace_root, tier, &document)
                .await
            {
                Ok(()) => true,
                Err(err) => {
                    warn!(%err, replacement = %new_id, "replacement spawn failed");
                    replacement.transition_to(WorkerStatus::Failed, Some(err.to_string()))?;
                    self.workers.save(&replacement).await?;
                    false
                }
            };

            if self.scheduler.reassign_job(&worker.id, &new_id).await?.is_some() && !spawned {
                if let Some((convoy_id, issue_id)) = self.scheduler.find_job(&new_id).await? {
                    self.scheduler
                        .fail_job(&convoy_id, &issue_id, "handoff replacement failed to start")
                        .await?;
                }
            }

            if let Some(task) = &worker.task_ref {
                self.lineage.entry(task.clone()).or_default().push(format!(
                    "Handoff {} from {} ({}) to {new_id} ({target}): {}",
                    context.handoff_count,
                    worker.id,
                    worker.tier.as_str(),
                    detection.reason
                ));
            }

            info!(replacement = %new_id, spawned, "handoff complete");
            self.audit(
                AuditEntry::new(AuditEventType::Handoff)
                    .with_worker(&worker.id)
                    .with_task(worker.task_ref.as_deref())
                    .with_summary(format!("{} -> {new_id}", worker.id))
                    .with_detail(&context),
            );

            Ok::<_, AppError>(HandoffRecord {
                from_worker: worker.id.clone(),
                to_worker: new_id,
                trigger: detection.trigger,
                target,
                spawned,
            })
        }
        .instrument(span)
        .await
    }

    async fn unused_worker_id(&self, base: String) -> Result<String> {
        if self.workers.get(&base).await?.is_none() {
            return Ok(base);
        }
        let mut attempt = 2_u32;
        loop {
            let candidate = format!("{base}-{attempt}");
            if self.workers.get(&candidate).await?.is_none() {
                return Ok(candidate);
            }
            attempt += 1;
        }
    }

    /// Apply one operator command and send its reply.
    pub async fn handle(&mut self, command: ControlCommand) {
        match command {
            ControlCommand::CreateConvoy {
                name,
                issue_ids,
                config,
                start,
                reply,
            } => {
                let _ = reply.send(self.create_convoy(&name, issue_ids, config, start).await);
            }
            ControlCommand::Convoy { id, action, reply } => {
                let _ = reply.send(self.convoy_action(&id, action).await);
            }
            ControlCommand::ConvoyStatus { id, reply } => {
                let _ = reply.send(self.scheduler.get(&id).await);
            }
            ControlCommand::ListConvoys { reply } => {
                let _ = reply.send(self.scheduler.list().await);
            }
            ControlCommand::ListWorkers { reply } => {
                let _ = reply.send(self.workers.list().await);
            }
            ControlCommand::CompleteWorker {
                worker_id,
                output,
                reply,
            } => {
                let _ = reply.send(self.complete_worker(&worker_id, output).await);
            }
            ControlCommand::Health { reply } => {
                let _ = reply.send(self.health_snapshot().await);
            }
            ControlCommand::RecordCost {
                worker_id,
                input,
                task_id,
                reply,
            } => {
                let _ = reply.send(self.record_cost(&worker_id, input, task_id).await);
            }
            ControlCommand::CostSummary { top_n, reply } => {
                let _ = reply.send(Ok(self.cost.summary(top_n)));
            }
            ControlCommand::ResetCost { reply } => {
                let result = self.cost.reset();
                if result.is_ok() {
                    self.audit(AuditEntry::new(AuditEventType::CostReset));
                }
                let _ = reply.send(result);
            }
            ControlCommand::Reload { reply } => {
                let result = self.settings.reload().map(|_| self.apply_settings());
                let _ = reply.send(result);
            }
            ControlCommand::CompactLedger { reply } => {
                let _ = reply.send(self.compact_ledger().await);
            }
        }
    }

    /// Create a convoy and optionally start it.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` for an invalid issue list or config.
    pub async fn create_convoy(
        &mut self,
        name: &str,
        issue_ids: Vec<String>,
        config: ConvoyConfig,
        start: bool,
    ) -> Result<Convoy> {
        let convoy = self.scheduler.create(name, issue_ids, config).await?;
        self.audit(
            AuditEntry::new(AuditEventType::ConvoyCreated)
                .with_convoy(&convoy.id)
                .with_summary(name),
        );
        if start {
            return self.convoy_action(&convoy.id, ConvoyAction::Start).await;
        }
        Ok(convoy)
    }

    /// Start, pause, resume or stop a convoy.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` or `AppError::InvalidState` from the
    /// scheduler.
    pub async fn convoy_action(&mut self, id: &str, action: ConvoyAction) -> Result<Convoy> {
        let (convoy, event) = match action {
            ConvoyAction::Start => (self.scheduler.start(id).await?, AuditEventType::ConvoyStarted),
            ConvoyAction::Pause => (self.scheduler.pause(id).await?, AuditEventType::ConvoyPaused),
            ConvoyAction::Resume => (self.scheduler.resume(id).await?, AuditEventType::ConvoyResumed),
            ConvoyAction::Stop => (self.scheduler.stop(id).await?, AuditEventType::ConvoyStopped),
        };
        self.audit(
            AuditEntry::new(event)
                .with_convoy(id)
                .with_summary(convoy.status.as_str()),
        );
        Ok(convoy)
    }

    /// Record a worker's completion report.
    ///
    /// A convoy job held by the worker completes with `output` (or the
    /// worker's latest output snapshot) and its slot is backfilled.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` for an unknown worker and
    /// `AppError::InvalidState` if the worker already failed.
    pub async fn complete_worker(&mut self, worker_id: &str, output: Option<String>) -> Result<Worker> {
        let mut worker = self
            .workers
            .get(worker_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("worker {worker_id}")))?;
        if worker.status == WorkerStatus::Failed {
            return Err(AppError::InvalidState(format!("worker {worker_id} already failed")));
        }
        if output.is_some() {
            worker.last_output = output;
            self.workers.save(&worker).await?;
        }

        if let Some((convoy_id, issue_id)) = self.scheduler.find_job(worker_id).await? {
            self.scheduler
                .complete_job(&convoy_id, &issue_id, worker.last_output.clone())
                .await?;
        } else if worker.status != WorkerStatus::Completed {
            if self.host.is_running(worker_id).await {
                if let Err(err) = self.host.kill(worker_id).await {
                    warn!(worker_id, %err, "failed to kill completed worker");
                }
            }
            worker.transition_to(WorkerStatus::Completed, None)?;
            self.workers.save(&worker).await?;
        }

        self.engine.forget(worker_id);
        self.monitor.forget(worker_id);
        info!(worker_id, "worker completed");
        self.audit(
            AuditEntry::new(AuditEventType::WorkerCompleted)
                .with_worker(worker_id)
                .with_task(worker.task_ref.as_deref()),
        );

        self.workers
            .get(worker_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("worker {worker_id}")))
    }

    /// Read-only health of every live worker from stored activity.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the worker store fails.
    pub async fn health_snapshot(&self) -> Result<Vec<HealthRecord>> {
        let now = Utc::now();
        let mut records = Vec::new();
        for worker in self.workers.list_live().await? {
            let running = self.host.is_running(&worker.id).await;
            records.push(assess(&worker.id, running, worker.last_activity_at, now, &self.thresholds));
        }
        Ok(records)
    }

    /// Record spend and return the alerts it raises.
    ///
    /// The task defaults to the worker's task.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Ledger` for an invalid amount or failed append.
    pub async fn record_cost(
        &mut self,
        worker_id: &str,
        input: CostInput,
        task_id: Option<String>,
    ) -> Result<Vec<CostAlert>> {
        let mut worker = self.workers.get(worker_id).await?;
        let task = task_id.or_else(|| worker.as_ref().and_then(|w| w.task_ref.clone()));

        let entry = match input {
            CostInput::Amount { amount } => self.cost.record_cost(worker_id, amount, task.as_deref())?,
            CostInput::Tokens(usage) => {
                let tier = worker.as_ref().map_or(crate::models::tier::Tier::Low, |w| w.tier);
                self.cost
                    .record_usage(worker_id, tier, &usage, &self.pricing, task.as_deref())?
            }
        };

        if let Some(worker) = worker.as_mut() {
            worker.spend += entry.amount;
            worker.updated_at = Utc::now();
            self.workers.save(worker).await?;
        }

        let alerts = self
            .cost
            .check_limits(worker_id, task.as_deref(), &self.config.cost.limits());
        for alert in &alerts {
            match alert.level {
                AlertLevel::LimitReached => warn!(
                    subject = %alert.subject,
                    total = alert.total,
                    limit = alert.limit,
                    "cost limit reached"
                ),
                AlertLevel::Warning => info!(
                    subject = %alert.subject,
                    total = alert.total,
                    limit = alert.limit,
                    "cost warning"
                ),
            }
            self.audit(
                AuditEntry::new(AuditEventType::CostAlert)
                    .with_worker(worker_id)
                    .with_task(task.as_deref())
                    .with_detail(alert),
            );
        }
        Ok(alerts)
    }

    /// Compact the configured ledger file, then replay it into the totals.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Ledger` if compaction or replay fails.
    pub async fn compact_ledger(&mut self) -> Result<CompactionOutcome> {
        let path = self.config.cost.ledger_path.clone();
        let cutoff = compaction::retention_cutoff(self.config.cost.ledger_retention_days);
        let outcome = tokio::task::spawn_blocking(move || {
            compaction::compact_ledger(&path, cutoff, DEFAULT_LOCK_TIMEOUT)
        })
        .await
        .map_err(|err| AppError::Ledger(format!("compaction task failed: {err}")))??;

        if outcome.dropped > 0 {
            self.cost.rebuild()?;
        }
        self.audit(AuditEntry::new(AuditEventType::LedgerCompacted).with_detail(&outcome));
        Ok(outcome)
    }

    fn audit_action(&self, action: &MonitorAction, worker: &Worker) {
        let event = match action {
            MonitorAction::Poked { .. } => AuditEventType::WorkerPoked,
            MonitorAction::Killed { .. } => AuditEventType::WorkerKilled,
            MonitorAction::Restarted { .. } => AuditEventType::WorkerRestarted,
            MonitorAction::Failed { .. } => return,
        };
        self.audit(
            AuditEntry::new(event)
                .with_worker(&worker.id)
                .with_task(worker.task_ref.as_deref()),
        );
    }

    fn audit(&self, entry: AuditEntry) {
        if let Err(err) = self.audit.log_entry(entry) {
            warn!(%err, "failed to write audit entry");
        }
    }
}

/// Worker id with any `-h<n>` handoff suffix removed.
fn lineage_root(worker_id: &str) -> &str {
    if let Some(pos) = worker_id.rfind("-h") {
        let suffix = &worker_id[pos + 2..];
        if !suffix.is_empty() && suffix.bytes().all(|b| b.is_ascii_digit()) {
            return &worker_id[..pos];
        }
    }
    worker_id
}

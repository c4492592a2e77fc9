//! Convoy scheduler.
//!
//! Runs up to `max_concurrent` workers per convoy and backfills freed slots
//! in original issue order. Every operation loads the convoy from its
//! store, mutates it, and saves it back; the store is the source of truth.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{info, info_span, warn, Instrument};

use crate::cost::{CostGuard, CostLimits};
use crate::host::ProcessHost;
use crate::models::convoy::{AgentJob, Convoy, ConvoyConfig, ConvoyStatus, JobStatus};
use crate::models::tier::Tier;
use crate::models::worker::{Worker, WorkerStatus};
use crate::persistence::{ConvoyStore, WorkerStore};
use crate::{AppError, Result};

use super::synthesis::{build_synthesis_prompt, issue_prompt};

const STOPPED_BY_OPERATOR: &str = "stopped by operator";
const EXITED_WITHOUT_COMPLETION: &str = "worker exited without reporting completion";

struct CostGate {
    guard: Arc<CostGuard>,
    limits: CostLimits,
}

/// Schedules convoy jobs onto workers.
pub struct ConvoyScheduler {
    convoys: Arc<dyn ConvoyStore>,
    workers: Arc<dyn WorkerStore>,
    host: Arc<dyn ProcessHost>,
    workspace_root: String,
    tier: Tier,
    cost: Option<CostGate>,
}

impl ConvoyScheduler {
    /// Create a scheduler whose workers run in `workspace_root` on the
    /// `low` tier.
    #[must_use]
    pub fn new(
        convoys: Arc<dyn ConvoyStore>,
        workers: Arc<dyn WorkerStore>,
        host: Arc<dyn ProcessHost>,
        workspace_root: impl Into<String>,
    ) -> Self {
        Self {
            convoys,
            workers,
            host,
            workspace_root: workspace_root.into(),
            tier: Tier::Low,
            cost: None,
        }
    }

    /// Start convoy workers on a different tier.
    #[must_use]
    pub fn with_tier(mut self, tier: Tier) -> Self {
        self.tier = tier;
        self
    }

    /// Skip spawning jobs whose task or day has reached its cost limit.
    #[must_use]
    pub fn with_cost_guard(mut self, guard: Arc<CostGuard>, limits: CostLimits) -> Self {
        self.cost = Some(CostGate { guard, limits });
        self
    }

    /// Replace the cost limits after a configuration reload.
    pub fn set_cost_limits(&mut self, limits: CostLimits) {
        if let Some(gate) = &mut self.cost {
            gate.limits = limits;
        }
    }

    /// Create a pending convoy with one pending job per issue.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` for an empty or duplicated issue list or
    /// an invalid config, `AppError::Db` if persisting fails.
    pub async fn create(
        &self,
        name: &str,
        issue_ids: Vec<String>,
        config: ConvoyConfig,
    ) -> Result<Convoy> {
        if issue_ids.is_empty() {
            return Err(AppError::Config("convoy needs at least one issue".into()));
        }
        let mut seen = HashSet::new();
        if let Some(dup) = issue_ids.iter().find(|id| !seen.insert(id.as_str())) {
            return Err(AppError::Config(format!("duplicate issue id: {dup}")));
        }
        config.validate()?;

        let convoy = Convoy::new(name.to_owned(), issue_ids, config);
        self.convoys.save(&convoy).await?;
        info!(
            convoy_id = %convoy.id,
            name,
            issues = convoy.jobs.len(),
            max_concurrent = convoy.config.max_concurrent,
            "convoy created"
        );
        Ok(convoy)
    }

    /// Look up a convoy.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` if no convoy has this id.
    pub async fn get(&self, id: &str) -> Result<Convoy> {
        self.convoys
            .get(id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("convoy {id}")))
    }

    /// Every convoy, oldest first.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the store query fails.
    pub async fn list(&self) -> Result<Vec<Convoy>> {
        self.convoys.list().await
    }

    /// Start (or restart) a convoy and run a scheduling pass.
    ///
    /// Restarting resets failed jobs to pending so the operator can retry.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` for an unknown convoy.
    pub async fn start(&self, id: &str) -> Result<Convoy> {
        let mut convoy = self.get(id).await?;
        let span = info_span!("convoy_start", convoy_id = id);
        async {
            let mut retried = 0_usize;
            for job in &mut convoy.jobs {
                if job.status == JobStatus::Failed {
                    *job = AgentJob::new(job.issue_id.clone());
                    retried += 1;
                }
            }
            if retried > 0 {
                info!(retried, "failed jobs reset for retry");
            }
            convoy.synthesis_prompt = None;
            convoy.status = ConvoyStatus::Running;
            let scheduled = self.schedule_pass(&mut convoy).await;
            finalize(&mut convoy);
            self.save(&mut convoy).await?;
            scheduled?;
            info!(running = convoy.running_count(), pending = convoy.pending_count(), "convoy started");
            Ok::<_, AppError>(convoy)
        }
        .instrument(span)
        .await
    }

    /// Stop spawning new jobs. Running jobs continue.
    ///
    /// # Errors
    ///
    /// Returns `AppError::InvalidState` unless the convoy is running.
    pub async fn pause(&self, id: &str) -> Result<Convoy> {
        let mut convoy = self.get(id).await?;
        if convoy.status != ConvoyStatus::Running {
            return Err(AppError::InvalidState(format!(
                "convoy {id} is {}, not running",
                convoy.status.as_str()
            )));
        }
        convoy.status = ConvoyStatus::Paused;
        self.save(&mut convoy).await?;
        info!(convoy_id = id, "convoy paused");
        Ok(convoy)
    }

    /// Clear the pause and fill free slots.
    ///
    /// # Errors
    ///
    /// Returns `AppError::InvalidState` unless the convoy is paused.
    pub async fn resume(&self, id: &str) -> Result<Convoy> {
        let mut convoy = self.get(id).await?;
        if convoy.status != ConvoyStatus::Paused {
            return Err(AppError::InvalidState(format!(
                "convoy {id} is {}, not paused",
                convoy.status.as_str()
            )));
        }
        convoy.status = ConvoyStatus::Running;
        let scheduled = self.schedule_pass(&mut convoy).await;
        finalize(&mut convoy);
        self.save(&mut convoy).await?;
        scheduled?;
        info!(convoy_id = id, running = convoy.running_count(), "convoy resumed");
        Ok(convoy)
    }

    /// Kill every running job's worker and fail the convoy.
    ///
    /// Kill failures are logged, not propagated.
    ///
    /// # Errors
    ///
    /// Returns `AppError::InvalidState` for an already terminal convoy.
    pub async fn stop(&self, id: &str) -> Result<Convoy> {
        let mut convoy = self.get(id).await?;
        if convoy.is_terminal() {
            return Err(AppError::InvalidState(format!(
                "convoy {id} is already {}",
                convoy.status.as_str()
            )));
        }

        let now = Utc::now();
        for job in &mut convoy.jobs {
            if job.status.is_terminal() {
                continue;
            }
            if job.status == JobStatus::Running {
                if let Some(worker_id) = job.worker_id.clone() {
                    self.terminate_worker(&worker_id, WorkerStatus::Failed, STOPPED_BY_OPERATOR)
                        .await;
                }
            }
            fail(job, STOPPED_BY_OPERATOR, now);
        }
        convoy.status = ConvoyStatus::Failed;
        if convoy.config.synthesize {
            convoy.synthesis_prompt = Some(build_synthesis_prompt(&convoy));
        }
        self.save(&mut convoy).await?;
        warn!(convoy_id = id, "convoy stopped by operator");
        Ok(convoy)
    }

    /// Check running jobs for timeouts and exits, then backfill.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` for an unknown convoy or `AppError::Db`
    /// if persistence fails.
    pub async fn poll(&self, id: &str) -> Result<Convoy> {
        let mut convoy = self.get(id).await?;
        if !matches!(convoy.status, ConvoyStatus::Running | ConvoyStatus::Paused) {
            return Ok(convoy);
        }

        let span = info_span!("convoy_poll", convoy_id = id);
        async {
            let timeout_ms = convoy.config.per_worker_timeout_ms;
            let now = Utc::now();
            let mut changed = false;

            for job in &mut convoy.jobs {
                if job.status != JobStatus::Running {
                    continue;
                }
                let Some(worker_id) = job.worker_id.clone() else {
                    fail(job, "running job has no worker", now);
                    changed = true;
                    continue;
                };

                if timed_out(job.started_at, timeout_ms, now) {
                    let reason = format!("timed out after {timeout_ms} ms");
                    self.terminate_worker(&worker_id, WorkerStatus::Failed, &reason).await;
                    warn!(issue_id = %job.issue_id, %worker_id, "job timed out");
                    fail(job, &reason, now);
                    changed = true;
                    continue;
                }

                if self.host.is_running(&worker_id).await {
                    continue;
                }

                let worker = self.workers.get(&worker_id).await?;
                match worker {
                    Some(w) if w.status == WorkerStatus::Completed => {
                        info!(issue_id = %job.issue_id, %worker_id, "job completed");
                        complete(job, w.last_output, now);
                    }
                    other => {
                        if let Some(mut w) = other.filter(|w| !w.status.is_terminal()) {
                            if w.transition_to(WorkerStatus::Failed, Some(EXITED_WITHOUT_COMPLETION.into())).is_ok() {
                                self.workers.save(&w).await?;
                            }
                        }
                        warn!(issue_id = %job.issue_id, %worker_id, "worker exited without completion");
                        fail(job, EXITED_WITHOUT_COMPLETION, now);
                    }
                }
                changed = true;
            }

            let scheduled = if changed && convoy.status == ConvoyStatus::Running {
                self.schedule_pass(&mut convoy).await
            } else {
                Ok(())
            };
            finalize(&mut convoy);
            self.save(&mut convoy).await?;
            scheduled?;
            Ok::<_, AppError>(convoy)
        }
        .instrument(span)
        .await
    }

    /// Poll every running or paused convoy.
    ///
    /// # Errors
    ///
    /// Returns the first store failure.
    pub async fn poll_all(&self) -> Result<Vec<Convoy>> {
        let mut polled = Vec::new();
        for convoy in self.convoys.list_active().await? {
            polled.push(self.poll(&convoy.id).await?);
        }
        Ok(polled)
    }

    /// Mark a job completed with its output, then backfill.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` for an unknown convoy or issue and
    /// `AppError::InvalidState` if the job is already terminal.
    pub async fn complete_job(&self, id: &str, issue_id: &str, output: Option<String>) -> Result<Convoy> {
        self.finish_job(id, issue_id, Ok(output)).await
    }

    /// Mark a job failed with an error, then backfill.
    ///
    /// # Errors
    ///
    /// Same as [`ConvoyScheduler::complete_job`].
    pub async fn fail_job(&self, id: &str, issue_id: &str, error: &str) -> Result<Convoy> {
        self.finish_job(id, issue_id, Err(error.to_owned())).await
    }

    async fn finish_job(
        &self,
        id: &str,
        issue_id: &str,
        outcome: std::result::Result<Option<String>, String>,
    ) -> Result<Convoy> {
        let mut convoy = self.get(id).await?;
        let now = Utc::now();
        let job = convoy
            .job_mut(issue_id)
            .ok_or_else(|| AppError::NotFound(format!("issue {issue_id} in convoy {id}")))?;
        if job.status.is_terminal() {
            return Err(AppError::InvalidState(format!(
                "job {issue_id} is already {}",
                job.status.as_str()
            )));
        }

        let worker_id = job.worker_id.clone();
        let (worker_status, reason) = match outcome {
            Ok(output) => {
                complete(job, output, now);
                (WorkerStatus::Completed, "job completed".to_owned())
            }
            Err(error) => {
                fail(job, &error, now);
                (WorkerStatus::Failed, error)
            }
        };
        if let Some(worker_id) = worker_id {
            self.terminate_worker(&worker_id, worker_status, &reason).await;
        }
        info!(convoy_id = id, issue_id, status = worker_status.as_str(), "job finished");

        let scheduled = if convoy.status == ConvoyStatus::Running {
            self.schedule_pass(&mut convoy).await
        } else {
            Ok(())
        };
        finalize(&mut convoy);
        self.save(&mut convoy).await?;
        scheduled?;
        Ok(convoy)
    }

    /// Point the running job held by `worker_id` at `new_worker_id`.
    ///
    /// Returns the convoy id when a job was reassigned.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the store fails.
    pub async fn reassign_job(&self, worker_id: &str, new_worker_id: &str) -> Result<Option<String>> {
        for mut convoy in self.convoys.list_active().await? {
            let Some(job) = convoy
                .job_for_worker_mut(worker_id)
                .filter(|job| job.status == JobStatus::Running)
            else {
                continue;
            };
            job.worker_id = Some(new_worker_id.to_owned());
            let issue_id = job.issue_id.clone();
            self.save(&mut convoy).await?;
            info!(convoy_id = %convoy.id, issue_id, from = worker_id, to = new_worker_id, "job reassigned");
            return Ok(Some(convoy.id));
        }
        Ok(None)
    }

    /// Locate the running job held by a worker as `(convoy_id, issue_id)`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the store fails.
    pub async fn find_job(&self, worker_id: &str) -> Result<Option<(String, String)>> {
        for convoy in self.convoys.list_active().await? {
            if let Some(job) = convoy.jobs.iter().find(|job| {
                job.status == JobStatus::Running && job.worker_id.as_deref() == Some(worker_id)
            }) {
                return Ok(Some((convoy.id.clone(), job.issue_id.clone())));
            }
        }
        Ok(None)
    }

    /// Spawn workers for pending jobs, FIFO, until the convoy is full.
    ///
    /// On error the jobs started earlier in the pass are already marked
    /// `running`; callers save the convoy before propagating.
    async fn schedule_pass(&self, convoy: &mut Convoy) -> Result<()> {
        let limit = usize::try_from(convoy.config.max_concurrent).unwrap_or(usize::MAX);
        let mut running = convoy.running_count();
        let now = Utc::now();

        for index in 0..convoy.jobs.len() {
            if running >= limit {
                break;
            }
            if convoy.jobs[index].status != JobStatus::Pending {
                continue;
            }
            let issue_id = convoy.jobs[index].issue_id.clone();
            if self.task_blocked(&issue_id) {
                warn!(convoy_id = %convoy.id, issue_id, "cost limit reached; job left pending");
                continue;
            }

            let worker_id = self.next_worker_id(&convoy.id, &issue_id).await?;
            let mut worker = Worker::new(worker_id.clone(), self.tier, self.workspace_root.clone())
                .with_task(issue_id.clone())
                .with_convoy(convoy.id.clone());
            self.workers.save(&worker).await?;

            let prompt = issue_prompt(&convoy.name, &issue_id, &worker_id);
            let job = &mut convoy.jobs[index];
            job.worker_id = Some(worker_id.clone());

            match self
                .host
                .spawn(&worker_id, &self.workspace_root, self.tier, &prompt)
                .await
            {
                Ok(()) => {
                    job.status = JobStatus::Running;
                    job.started_at = Some(now);
                    running += 1;
                    info!(convoy_id = %convoy.id, issue_id, worker_id, "job started");
                }
                Err(err) => {
                    let reason = err.to_string();
                    warn!(convoy_id = %convoy.id, issue_id, worker_id, %err, "spawn failed");
                    fail(job, &reason, now);
                    worker.transition_to(WorkerStatus::Failed, Some(reason))?;
                    self.workers.save(&worker).await?;
                }
            }
        }
        Ok(())
    }

    fn task_blocked(&self, issue_id: &str) -> bool {
        self.cost
            .as_ref()
            .is_some_and(|gate| gate.guard.is_task_blocked(issue_id, &gate.limits))
    }

    /// Session-safe worker id, unique across retries of the same issue.
    async fn next_worker_id(&self, convoy_id: &str, issue_id: &str) -> Result<String> {
        let short: String = convoy_id.chars().take(8).collect();
        let base = format!("{short}-{}", sanitize(issue_id));
        if self.workers.get(&base).await?.is_none() {
            return Ok(base);
        }
        let mut attempt = 2_u32;
        loop {
            let candidate = format!("{base}-r{attempt}");
            if self.workers.get(&candidate).await?.is_none() {
                return Ok(candidate);
            }
            attempt += 1;
        }
    }

    /// Kill a worker's session (errors logged) and record its final status.
    async fn terminate_worker(&self, worker_id: &str, status: WorkerStatus, reason: &str) {
        if self.host.is_running(worker_id).await {
            if let Err(err) = self.host.kill(worker_id).await {
                warn!(worker_id, %err, "failed to kill worker");
            }
        }
        match self.workers.get(worker_id).await {
            Ok(Some(mut worker)) if !worker.status.is_terminal() => {
                let reason = (status == WorkerStatus::Failed).then(|| reason.to_owned());
                if let Err(err) = worker.transition_to(status, reason) {
                    warn!(worker_id, %err, "failed to record worker status");
                    return;
                }
                if let Err(err) = self.workers.save(&worker).await {
                    warn!(worker_id, %err, "failed to save worker");
                }
            }
            Ok(_) => {}
            Err(err) => warn!(worker_id, %err, "failed to load worker"),
        }
    }

    async fn save(&self, convoy: &mut Convoy) -> Result<()> {
        convoy.updated_at = Utc::now();
        self.convoys.save(convoy).await
    }
}

/// Settle the convoy status once every job is terminal.
fn finalize(convoy: &mut Convoy) {
    if !convoy.all_terminal() || convoy.is_terminal() {
        return;
    }
    let any_completed = convoy.jobs.iter().any(|j| j.status == JobStatus::Completed);
    convoy.status = if any_completed {
        ConvoyStatus::Completed
    } else {
        ConvoyStatus::Failed
    };
    if convoy.config.synthesize {
        convoy.synthesis_prompt = Some(build_synthesis_prompt(convoy));
    }
    info!(convoy_id = %convoy.id, status = convoy.status.as_str(), "convoy finished");
}

fn sanitize(issue_id: &str) -> String {
    issue_id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

fn timed_out(started_at: Option<DateTime<Utc>>, timeout_ms: u64, now: DateTime<Utc>) -> bool {
    let Some(started) = started_at else {
        return false;
    };
    let elapsed = u64::try_from((now - started).num_milliseconds()).unwrap_or(0);
    elapsed >= timeout_ms
}

fn complete(job: &mut AgentJob, output: Option<String>, now: DateTime<Utc>) {
    job.status = JobStatus::Completed;
    job.completed_at = Some(now);
    job.output = output;
    job.error = None;
}

fn fail(job: &mut AgentJob, error: &str, now: DateTime<Utc>) {
    job.status = JobStatus::Failed;
    job.completed_at = Some(now);
    job.error = Some(error.to_owned());
}

//! Health probing and auto-actions.
//!
//! The monitor probes each live worker through the [`ProcessHost`],
//! folds heartbeats into the worker record, classifies health, and applies
//! the configured auto-actions:
//!
//! * `poke_on_warning` delivers the nudge message once per warning episode.
//!   The episode ends when the worker drops back below `warning`.
//! * `kill_on_stuck` kills a stuck session and parks the worker as
//!   `suspended`.
//! * `restart_on_kill` respawns the same session right after an auto-kill.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, info_span, warn, Instrument};

use crate::config::AutoActionConfig;
use crate::host::ProcessHost;
use crate::models::worker::{Worker, WorkerStatus};

use super::{assess, HealthRecord, HealthState, HealthThresholds};

/// Result of probing one worker.
#[derive(Debug, Clone)]
pub struct WorkerProbe {
    /// Health classification at probe time.
    pub record: HealthRecord,
    /// Tail of recent output, when the host returned a heartbeat.
    pub recent_output: Option<String>,
}

/// Auto-action taken by the monitor.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MonitorAction {
    /// Nudge message delivered.
    Poked {
        /// Target worker.
        worker_id: String,
    },
    /// Session killed because it was stuck.
    Killed {
        /// Target worker.
        worker_id: String,
    },
    /// Session respawned after a kill.
    Restarted {
        /// Target worker.
        worker_id: String,
    },
    /// An auto-action failed; the worker is left as-is.
    Failed {
        /// Target worker.
        worker_id: String,
        /// Which action failed.
        action: String,
        /// Host error.
        error: String,
    },
}

/// Probes worker sessions and applies auto-actions.
pub struct HealthMonitor {
    host: Arc<dyn ProcessHost>,
    poked: HashSet<String>,
}

impl HealthMonitor {
    /// Create a monitor over a process host.
    #[must_use]
    pub fn new(host: Arc<dyn ProcessHost>) -> Self {
        Self {
            host,
            poked: HashSet::new(),
        }
    }

    /// Probe a worker and fold the heartbeat into its record.
    ///
    /// A first observed activity moves a `starting` worker to `running`.
    /// The caller persists the mutated worker.
    pub async fn probe(
        &self,
        worker: &mut Worker,
        now: DateTime<Utc>,
        thresholds: &HealthThresholds,
    ) -> WorkerProbe {
        let running = self.host.is_running(&worker.id).await;
        let heartbeat = if running {
            self.host.heartbeat(&worker.id).await
        } else {
            None
        };

        let mut recent_output = None;
        if let Some(beat) = heartbeat {
            worker.observe_activity(beat.timestamp);
            worker.last_output = Some(beat.recent_output.clone());
            recent_output = Some(beat.recent_output);
            if worker.status == WorkerStatus::Starting {
                if let Err(err) = worker.transition_to(WorkerStatus::Running, None) {
                    warn!(worker_id = %worker.id, %err, "failed to mark worker running");
                }
            }
        }

        let record = assess(&worker.id, running, worker.last_activity_at, now, thresholds);
        WorkerProbe {
            record,
            recent_output,
        }
    }

    /// Apply auto-actions for a probed worker.
    ///
    /// Returns every action taken so the caller can audit them. Host
    /// failures are reported as [`MonitorAction::Failed`], never propagated.
    pub async fn apply_auto_actions(
        &mut self,
        worker: &mut Worker,
        record: &HealthRecord,
        config: &AutoActionConfig,
    ) -> Vec<MonitorAction> {
        let span = info_span!("auto_actions", worker_id = %worker.id, state = record.state.as_str());
        async move {
            let mut actions = Vec::new();

            if record.state < HealthState::Warning {
                self.poked.remove(&worker.id);
            }

            if record.state == HealthState::Warning
                && config.poke_on_warning
                && record.running
                && !self.poked.contains(&worker.id)
            {
                match self.host.send_input(&worker.id, &config.nudge_message).await {
                    Ok(()) => {
                        info!("poked warning worker");
                        self.poked.insert(worker.id.clone());
                        actions.push(MonitorAction::Poked {
                            worker_id: worker.id.clone(),
                        });
                    }
                    Err(err) => {
                        warn!(%err, "poke failed");
                        actions.push(MonitorAction::Failed {
                            worker_id: worker.id.clone(),
                            action: "poke".into(),
                            error: err.to_string(),
                        });
                    }
                }
            }

            if record.state == HealthState::Stuck && config.kill_on_stuck {
                if let Err(err) = self.host.kill(&worker.id).await {
                    // A session that already exited is still parked below.
                    warn!(%err, "kill failed");
                }
                if let Err(err) =
                    worker.transition_to(WorkerStatus::Suspended, Some("killed: stuck".into()))
                {
                    warn!(%err, "failed to suspend killed worker");
                    return actions;
                }
                self.poked.remove(&worker.id);
                info!("killed stuck worker");
                actions.push(MonitorAction::Killed {
                    worker_id: worker.id.clone(),
                });

                if config.restart_on_kill {
                    actions.push(self.restart(worker).await);
                }
            }

            actions
        }
        .instrument(span)
        .await
    }

    async fn restart(&self, worker: &mut Worker) -> MonitorAction {
        let prompt = restart_prompt(worker);
        match self
            .host
            .spawn(&worker.id, &worker.workspace_root, worker.tier, &prompt)
            .await
        {
            Ok(()) => {
                if let Err(err) = worker.transition_to(WorkerStatus::Starting, None) {
                    warn!(%err, "failed to mark restarted worker starting");
                }
                // Fresh session: restart the idle clock.
                worker.last_activity_at = Some(Utc::now());
                info!("restarted worker");
                MonitorAction::Restarted {
                    worker_id: worker.id.clone(),
                }
            }
            Err(err) => {
                warn!(%err, "restart failed");
                MonitorAction::Failed {
                    worker_id: worker.id.clone(),
                    action: "restart".into(),
                    error: err.to_string(),
                }
            }
        }
    }

    /// Forget per-worker monitor state, e.g. after a handoff.
    pub fn forget(&mut self, worker_id: &str) {
        self.poked.remove(worker_id);
    }
}

fn restart_prompt(worker: &Worker) -> String {
    match &worker.task_ref {
        Some(task) => format!(
            "Resume work on task {task}. Your previous session stopped responding and was \
             restarted; inspect the workspace state before continuing."
        ),
        None => "Your previous session stopped responding and was restarted; inspect the \
                 workspace state and continue the current task."
            .into(),
    }
}

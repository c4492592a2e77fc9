//! Escalation and handoff engine.
//!
//! Four independent evaluators inspect a worker's external signals each
//! tick and report a [`TriggerDetection`]. The engine itself is read-only
//! with respect to workers: it never spawns or kills. The control loop
//! acts on a positive detection by capturing a [`handoff::HandoffContext`]
//! and spawning the replacement.
//!
//! Every evaluator is fail-open. A signal source that errors (tracker down,
//! unreadable gate report) yields "not triggered" and a warning, never an
//! escalation.
//!
//! Once a trigger fires for a worker, the worker's last-activity timestamp
//! at that moment becomes the trigger's baseline. The same trigger is not
//! evaluated again for that worker until newer activity is observed.

pub mod detectors;
pub mod handoff;
pub mod signals;

use std::collections::HashMap;
use std::fmt::{Display, Formatter};
use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info_span, warn, Instrument};

use crate::config::EscalationConfig;
use crate::health::HealthState;
use crate::models::tier::{Specialist, Tier};
use crate::models::worker::Worker;
use crate::tracker::Tracker;

pub use handoff::{render_transfer_document, CaptureRequest, HandoffContext};
pub use signals::{KeywordSignalDetector, SignalDetector};

/// Escalation trigger kinds, in evaluation order.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TriggerType {
    /// Worker stuck past its tier's gate.
    StuckEscalation,
    /// Build or test gate failing on the gated tier.
    QualityGateFailure,
    /// Implementation finished; hand to a specialist.
    TaskCompleteForHandoff,
    /// Planning finished; hand to the implementation tier.
    PhaseReady,
}

impl TriggerType {
    /// Evaluation order. The control loop acts on the first positive one.
    pub const ALL: [Self; 4] = [
        Self::StuckEscalation,
        Self::QualityGateFailure,
        Self::TaskCompleteForHandoff,
        Self::PhaseReady,
    ];

    /// Stable lowercase identifier.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::StuckEscalation => "stuck_escalation",
            Self::QualityGateFailure => "quality_gate_failure",
            Self::TaskCompleteForHandoff => "task_complete_for_handoff",
            Self::PhaseReady => "phase_ready",
        }
    }

    fn enabled(self, config: &EscalationConfig) -> bool {
        match self {
            Self::StuckEscalation => config.stuck_escalation,
            Self::QualityGateFailure => config.quality_gate,
            Self::TaskCompleteForHandoff => config.task_complete,
            Self::PhaseReady => config.phase_ready,
        }
    }
}

impl Display for TriggerType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How much an evaluator trusts its own verdict.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum Confidence {
    /// Weak or missing evidence.
    Low,
    /// Partial evidence.
    Medium,
    /// Strong evidence.
    High,
}

/// Where a handoff should go.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum HandoffTarget {
    /// A worker on another tier.
    Tier(Tier),
    /// A specialist worker.
    Specialist(Specialist),
}

impl HandoffTarget {
    /// Tier the replacement worker runs at.
    #[must_use]
    pub fn tier(self) -> Tier {
        match self {
            Self::Tier(tier) => tier,
            Self::Specialist(role) => role.default_tier(),
        }
    }
}

impl Display for HandoffTarget {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Tier(tier) => write!(f, "tier {tier}"),
            Self::Specialist(role) => write!(f, "{role} specialist"),
        }
    }
}

/// Output of one evaluator.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct TriggerDetection {
    /// Which evaluator produced this.
    pub trigger: TriggerType,
    /// Whether a handoff is warranted.
    pub triggered: bool,
    /// Human-readable explanation.
    pub reason: String,
    /// Evaluator confidence.
    pub confidence: Confidence,
    /// Suggested handoff target.
    pub suggested: Option<HandoffTarget>,
}

impl TriggerDetection {
    fn fired(trigger: TriggerType, reason: String, confidence: Confidence, target: HandoffTarget) -> Self {
        Self {
            trigger,
            triggered: true,
            reason,
            confidence,
            suggested: Some(target),
        }
    }

    fn quiet(trigger: TriggerType, reason: impl Into<String>, confidence: Confidence) -> Self {
        Self {
            trigger,
            triggered: false,
            reason: reason.into(),
            confidence,
            suggested: None,
        }
    }
}

/// External signals observed for one worker this tick.
#[derive(Debug, Clone, Copy)]
pub struct WorkerObservation<'a> {
    /// Worker under evaluation.
    pub worker: &'a Worker,
    /// Health classification this tick.
    pub health: HealthState,
    /// Idle time: since last activity, or since creation if none seen.
    pub idle_ms: u64,
    /// Tail of recent output, if the host returned one.
    pub recent_output: Option<&'a str>,
}

impl WorkerObservation<'_> {
    fn workspace(&self) -> &Path {
        Path::new(&self.worker.workspace_root)
    }
}

/// Runs the evaluators and tracks re-fire baselines.
pub struct EscalationEngine {
    tracker: Arc<dyn Tracker>,
    signals: Arc<dyn SignalDetector>,
    baselines: HashMap<(String, TriggerType), Option<DateTime<Utc>>>,
}

impl EscalationEngine {
    /// Create an engine over a tracker and a signal detector.
    #[must_use]
    pub fn new(tracker: Arc<dyn Tracker>, signals: Arc<dyn SignalDetector>) -> Self {
        Self {
            tracker,
            signals,
            baselines: HashMap::new(),
        }
    }

    /// Tracker used for signals and handoff capture.
    #[must_use]
    pub fn tracker(&self) -> &Arc<dyn Tracker> {
        &self.tracker
    }

    /// Whether `trigger` is waiting for fresh activity from this worker.
    #[must_use]
    pub fn is_suppressed(&self, worker: &Worker, trigger: TriggerType) -> bool {
        self.baselines
            .get(&(worker.id.clone(), trigger))
            .is_some_and(|baseline| worker.last_activity_at <= *baseline)
    }

    /// Run every enabled, non-suppressed evaluator in [`TriggerType::ALL`]
    /// order.
    pub async fn evaluate(
        &self,
        observation: &WorkerObservation<'_>,
        config: &EscalationConfig,
    ) -> Vec<TriggerDetection> {
        let worker = observation.worker;
        let span = info_span!("escalation_evaluate", worker_id = %worker.id, tier = worker.tier.as_str());
        async move {
            let mut detections = Vec::new();
            for trigger in TriggerType::ALL {
                if !trigger.enabled(config) {
                    continue;
                }
                if self.is_suppressed(worker, trigger) {
                    debug!(trigger = trigger.as_str(), "awaiting fresh activity");
                    continue;
                }
                detections.push(self.run(trigger, observation, config).await);
            }
            detections
        }
        .instrument(span)
        .await
    }

    async fn run(
        &self,
        trigger: TriggerType,
        observation: &WorkerObservation<'_>,
        config: &EscalationConfig,
    ) -> TriggerDetection {
        let result = match trigger {
            TriggerType::StuckEscalation => Ok(detectors::stuck_escalation(observation, config)),
            TriggerType::QualityGateFailure => detectors::quality_gate(observation, config).await,
            TriggerType::TaskCompleteForHandoff => {
                detectors::task_complete(observation, config, self.tracker.as_ref(), self.signals.as_ref())
                    .await
            }
            TriggerType::PhaseReady => {
                detectors::phase_ready(observation, config, self.tracker.as_ref(), self.signals.as_ref())
                    .await
            }
        };
        result.unwrap_or_else(|err| {
            warn!(trigger = trigger.as_str(), %err, "signal source failed; treating as not triggered");
            TriggerDetection::quiet(trigger, format!("signal unavailable: {err}"), Confidence::Low)
        })
    }

    /// Capture handoff context for a worker through this engine's tracker.
    pub async fn capture_context(
        &self,
        worker: &Worker,
        request: handoff::CaptureRequest<'_>,
    ) -> HandoffContext {
        handoff::capture_context(worker, request, self.tracker.as_ref()).await
    }

    /// Record that `trigger` fired for a worker at its current activity.
    pub fn record_fired(&mut self, worker: &Worker, trigger: TriggerType) {
        self.baselines
            .insert((worker.id.clone(), trigger), worker.last_activity_at);
    }

    /// Drop every baseline held for a worker.
    pub fn forget(&mut self, worker_id: &str) {
        self.baselines.retain(|(id, _), _| id != worker_id);
    }
}

/// First positive detection carrying a target, in evaluation order.
#[must_use]
pub fn first_actionable(detections: &[TriggerDetection]) -> Option<(&TriggerDetection, HandoffTarget)> {
    detections
        .iter()
        .find_map(|d| d.suggested.filter(|_| d.triggered).map(|target| (d, target)))
}

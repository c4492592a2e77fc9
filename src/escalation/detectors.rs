//! The four trigger evaluators.
//!
//! Evaluators only read. Errors bubble up to the engine, which downgrades
//! them to "not triggered".

use serde::Deserialize;

use crate::config::EscalationConfig;
use crate::health::HealthState;
use crate::tracker::{SubTaskStatus, Tracker};
use crate::{AppError, Result};

use super::signals::SignalDetector;
use super::{Confidence, HandoffTarget, TriggerDetection, TriggerType, WorkerObservation};

const MINUTE_MS: u64 = 60_000;

/// Stuck escalation: a stuck worker past its tier's gate moves one rung up.
#[must_use]
pub fn stuck_escalation(
    observation: &WorkerObservation<'_>,
    config: &EscalationConfig,
) -> TriggerDetection {
    const KIND: TriggerType = TriggerType::StuckEscalation;
    let tier = observation.worker.tier;

    if observation.health != HealthState::Stuck {
        return TriggerDetection::quiet(
            KIND,
            format!("worker is {}", observation.health.as_str()),
            Confidence::Low,
        );
    }

    let (Some(gate_minutes), Some(next)) = (config.stuck_minutes.for_tier(tier), tier.next()) else {
        return TriggerDetection::quiet(KIND, "manual attention required", Confidence::High);
    };

    let stuck_minutes = observation.idle_ms / MINUTE_MS;
    if observation.idle_ms < gate_minutes.saturating_mul(MINUTE_MS) {
        return TriggerDetection::quiet(
            KIND,
            format!("stuck for {stuck_minutes}m, below the {gate_minutes}m gate for tier {tier}"),
            Confidence::Medium,
        );
    }

    TriggerDetection::fired(
        KIND,
        format!("stuck for {stuck_minutes}m on tier {tier} (gate {gate_minutes}m)"),
        Confidence::High,
        HandoffTarget::Tier(next),
    )
}

/// Phase-ready: planning looks finished, hand to the implementation tier.
///
/// Signals: a planning sub-task is closed; a planning artifact exists in
/// the workspace; recent output shows a plan-mode exit.
///
/// # Errors
///
/// Propagates tracker and filesystem failures.
pub async fn phase_ready(
    observation: &WorkerObservation<'_>,
    config: &EscalationConfig,
    tracker: &dyn Tracker,
    signals: &dyn SignalDetector,
) -> Result<TriggerDetection> {
    const KIND: TriggerType = TriggerType::PhaseReady;
    let worker = observation.worker;

    if worker.role.is_some() {
        return Ok(TriggerDetection::quiet(KIND, "specialist worker", Confidence::Low));
    }
    if worker.tier == config.implementation_tier {
        return Ok(TriggerDetection::quiet(
            KIND,
            format!("already on implementation tier {}", config.implementation_tier),
            Confidence::Low,
        ));
    }

    let mut present = Vec::new();

    if let Some(task_ref) = &worker.task_ref {
        let tasks = tracker.list_sub_tasks(task_ref).await?;
        if tasks
            .iter()
            .any(|t| t.status == SubTaskStatus::Closed && signals.is_planning_task(&t.title))
        {
            present.push("planning sub-task closed");
        }
    }

    let workspace = observation.workspace();
    for path in &config.artifact_paths {
        if tokio::fs::try_exists(workspace.join(path)).await? {
            present.push("planning artifact present");
            break;
        }
    }

    if observation
        .recent_output
        .is_some_and(|output| signals.has_plan_exit(output))
    {
        present.push("plan-mode exit in output");
    }

    let reason = if present.is_empty() {
        "no phase-ready signals".to_owned()
    } else {
        present.join(", ")
    };
    let target = HandoffTarget::Tier(config.implementation_tier);

    Ok(match present.len() {
        0 => TriggerDetection::quiet(KIND, reason, Confidence::Low),
        1 => TriggerDetection::quiet(KIND, reason, Confidence::Medium),
        2 => TriggerDetection::fired(KIND, reason, Confidence::Medium, target),
        _ => TriggerDetection::fired(KIND, reason, Confidence::High, target),
    })
}

/// Outcome of one gate in the workspace gate report.
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum GateOutcome {
    /// Gate passed.
    #[serde(alias = "passed", alias = "ok")]
    Pass,
    /// Gate failed.
    #[serde(alias = "failed", alias = "error")]
    Fail,
}

/// Build/test outcomes written by the worker's tooling.
#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
pub struct GateReport {
    /// Build outcome.
    #[serde(default)]
    pub build: Option<GateOutcome>,
    /// Test outcome.
    #[serde(default)]
    pub test: Option<GateOutcome>,
}

impl GateReport {
    /// Names of failing gates.
    #[must_use]
    pub fn failures(&self) -> Vec<&'static str> {
        let mut failed = Vec::new();
        if self.build == Some(GateOutcome::Fail) {
            failed.push("build");
        }
        if self.test == Some(GateOutcome::Fail) {
            failed.push("test");
        }
        failed
    }
}

/// Quality-gate failure: a failing build or test on the gated tier.
///
/// # Errors
///
/// Returns an error if the gate report exists but cannot be read or parsed.
pub async fn quality_gate(
    observation: &WorkerObservation<'_>,
    config: &EscalationConfig,
) -> Result<TriggerDetection> {
    const KIND: TriggerType = TriggerType::QualityGateFailure;
    let tier = observation.worker.tier;

    if tier != config.quality_gate_from {
        return Ok(TriggerDetection::quiet(
            KIND,
            format!("tier {tier} is not gated"),
            Confidence::Low,
        ));
    }

    let path = observation.workspace().join(&config.gate_status_path);
    let raw = match tokio::fs::read(&path).await {
        Ok(raw) => raw,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return Ok(TriggerDetection::quiet(KIND, "no gate report", Confidence::Low));
        }
        Err(err) => return Err(err.into()),
    };
    let report: GateReport = serde_json::from_slice(&raw)
        .map_err(|err| AppError::Io(format!("invalid gate report {}: {err}", path.display())))?;

    let failures = report.failures();
    if failures.is_empty() {
        return Ok(TriggerDetection::quiet(KIND, "gates passing", Confidence::High));
    }

    Ok(TriggerDetection::fired(
        KIND,
        format!("{} failing on tier {tier}", failures.join(" and ")),
        Confidence::High,
        HandoffTarget::Tier(config.quality_gate_to),
    ))
}

/// Task-complete-for-handoff: an implementation sub-task is closed and
/// nothing remains open.
///
/// # Errors
///
/// Propagates tracker failures.
pub async fn task_complete(
    observation: &WorkerObservation<'_>,
    config: &EscalationConfig,
    tracker: &dyn Tracker,
    signals: &dyn SignalDetector,
) -> Result<TriggerDetection> {
    const KIND: TriggerType = TriggerType::TaskCompleteForHandoff;
    let worker = observation.worker;

    if worker.role.is_some() {
        return Ok(TriggerDetection::quiet(KIND, "specialist worker", Confidence::Low));
    }
    let Some(task_ref) = &worker.task_ref else {
        return Ok(TriggerDetection::quiet(KIND, "no tracked task", Confidence::Low));
    };

    let tasks = tracker.list_sub_tasks(task_ref).await?;
    if tasks.is_empty() {
        return Ok(TriggerDetection::quiet(KIND, "no sub-tasks", Confidence::Low));
    }

    let implementation_closed = tasks
        .iter()
        .any(|t| t.status == SubTaskStatus::Closed && signals.is_implementation_task(&t.title));
    let open = tasks
        .iter()
        .filter(|t| t.status != SubTaskStatus::Closed)
        .count();

    Ok(match (implementation_closed, open) {
        (true, 0) => TriggerDetection::fired(
            KIND,
            "implementation closed and no sub-tasks remain".into(),
            Confidence::High,
            HandoffTarget::Specialist(config.handoff_specialist),
        ),
        (true, open) => TriggerDetection::quiet(
            KIND,
            format!("implementation closed, {open} sub-task(s) still open"),
            Confidence::Medium,
        ),
        (false, _) => TriggerDetection::quiet(KIND, "implementation not closed", Confidence::Low),
    })
}

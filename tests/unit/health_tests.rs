//! Unit tests for health classification and the health monitor.

use std::sync::Arc;

use chrono::{Duration, Utc};

use agent_fleet::config::AutoActionConfig;
use agent_fleet::health::{assess, evaluate, HealthMonitor, HealthState, HealthThresholds, MonitorAction};
use agent_fleet::host::{MockHost, ProcessHost};
use agent_fleet::models::tier::Tier;
use agent_fleet::models::worker::{Worker, WorkerStatus};
use agent_fleet::orchestrator::TickReport;
use agent_fleet::AppError;

const MINUTE: u64 = 60_000;

fn thresholds() -> HealthThresholds {
    HealthThresholds::from_minutes(5, 15, 30).expect("valid thresholds")
}

#[test]
fn evaluate_maps_idle_time_onto_states() {
    let t = thresholds();
    assert_eq!(evaluate(0, &t), HealthState::Active);
    assert_eq!(evaluate(5 * MINUTE - 1, &t), HealthState::Active);
    assert_eq!(evaluate(5 * MINUTE, &t), HealthState::Stale);
    assert_eq!(evaluate(15 * MINUTE, &t), HealthState::Warning);
    assert_eq!(evaluate(30 * MINUTE, &t), HealthState::Stuck);
    assert_eq!(evaluate(u64::MAX, &t), HealthState::Stuck);
}

#[test]
fn evaluate_is_monotone() {
    let t = thresholds();
    let mut previous = HealthState::Active;
    for minute in 0..60 {
        let state = evaluate(minute * MINUTE, &t);
        assert!(state >= previous, "state went backwards at {minute}m");
        previous = state;
    }
}

#[test]
fn thresholds_must_be_strictly_ascending() {
    assert!(matches!(HealthThresholds::new(10, 10, 20), Err(AppError::Config(_))));
    assert!(matches!(HealthThresholds::new(30, 20, 10), Err(AppError::Config(_))));
    assert!(HealthThresholds::new(1, 2, 3).is_ok());
}

#[test]
fn dead_session_is_stuck_regardless_of_activity() {
    let now = Utc::now();
    let record = assess("w", false, Some(now), now, &thresholds());
    assert_eq!(record.state, HealthState::Stuck);
    assert!(!record.running);
}

#[test]
fn running_session_without_activity_is_active() {
    let now = Utc::now();
    let record = assess("w", true, None, now, &thresholds());
    assert_eq!(record.state, HealthState::Active);
    assert_eq!(record.time_since_activity_ms, None);
}

#[test]
fn future_activity_clamps_to_zero_idle() {
    let now = Utc::now();
    let record = assess("w", true, Some(now + Duration::minutes(5)), now, &thresholds());
    assert_eq!(record.time_since_activity_ms, Some(0));
    assert_eq!(record.state, HealthState::Active);
}

async fn spawned_worker(host: &MockHost, id: &str) -> Worker {
    host.spawn(id, "/tmp/ws", Tier::Low, "go").await.expect("spawn");
    Worker::new(id.into(), Tier::Low, "/tmp/ws".into()).with_task("iss-1")
}

#[tokio::test]
async fn probe_folds_heartbeat_and_marks_running() {
    let host = Arc::new(MockHost::new());
    let mut worker = spawned_worker(&host, "w-1").await;
    let beat = Utc::now() - Duration::minutes(20);
    host.set_heartbeat("w-1", beat, "compiling...");

    let monitor = HealthMonitor::new(host.clone());
    let probe = monitor.probe(&mut worker, Utc::now(), &thresholds()).await;

    assert_eq!(worker.status, WorkerStatus::Running);
    assert_eq!(worker.last_activity_at, Some(beat));
    assert_eq!(worker.last_output.as_deref(), Some("compiling..."));
    assert_eq!(probe.record.state, HealthState::Warning);
    assert_eq!(probe.recent_output.as_deref(), Some("compiling..."));
}

#[tokio::test]
async fn poke_fires_once_per_warning_episode() {
    let host = Arc::new(MockHost::new());
    let mut worker = spawned_worker(&host, "w-1").await;
    let mut monitor = HealthMonitor::new(host.clone());
    let config = AutoActionConfig {
        poke_on_warning: true,
        ..AutoActionConfig::default()
    };

    let now = Utc::now();
    let warning = assess("w-1", true, Some(now - Duration::minutes(20)), now, &thresholds());
    let first = monitor.apply_auto_actions(&mut worker, &warning, &config).await;
    let second = monitor.apply_auto_actions(&mut worker, &warning, &config).await;
    assert_eq!(first, vec![MonitorAction::Poked { worker_id: "w-1".into() }]);
    assert!(second.is_empty());

    // Dropping back to active ends the episode.
    let active = assess("w-1", true, Some(now), now, &thresholds());
    assert!(monitor.apply_auto_actions(&mut worker, &active, &config).await.is_empty());
    let third = monitor.apply_auto_actions(&mut worker, &warning, &config).await;
    assert_eq!(third.len(), 1);
    assert_eq!(host.inputs_for("w-1").len(), 2);
}

#[tokio::test]
async fn no_actions_when_flags_are_off() {
    let host = Arc::new(MockHost::new());
    let mut worker = spawned_worker(&host, "w-1").await;
    let mut monitor = HealthMonitor::new(host.clone());

    let now = Utc::now();
    let stuck = assess("w-1", true, Some(now - Duration::hours(2)), now, &thresholds());
    let actions = monitor
        .apply_auto_actions(&mut worker, &stuck, &AutoActionConfig::default())
        .await;

    assert!(actions.is_empty());
    assert!(host.kills().is_empty());
    assert_eq!(worker.status, WorkerStatus::Starting);
}

#[tokio::test]
async fn kill_on_stuck_suspends_and_restart_respawns() {
    let host = Arc::new(MockHost::new());
    let mut worker = spawned_worker(&host, "w-1").await;
    worker.transition_to(WorkerStatus::Running, None).expect("running");
    let mut monitor = HealthMonitor::new(host.clone());
    let config = AutoActionConfig {
        kill_on_stuck: true,
        restart_on_kill: true,
        ..AutoActionConfig::default()
    };

    let now = Utc::now();
    let stuck = assess("w-1", true, Some(now - Duration::hours(1)), now, &thresholds());
    let actions = monitor.apply_auto_actions(&mut worker, &stuck, &config).await;

    assert_eq!(
        actions,
        vec![
            MonitorAction::Killed { worker_id: "w-1".into() },
            MonitorAction::Restarted { worker_id: "w-1".into() },
        ]
    );
    assert_eq!(host.kills(), vec!["w-1".to_owned()]);
    assert_eq!(host.spawns().len(), 2);
    assert!(host.spawns()[1].prompt.contains("iss-1"));
    assert_eq!(worker.status, WorkerStatus::Starting);
    assert!(worker.last_activity_at.is_some_and(|at| at > now - Duration::minutes(1)));
}

#[tokio::test]
async fn failed_restart_leaves_worker_suspended() {
    let host = Arc::new(MockHost::new());
    let mut worker = spawned_worker(&host, "w-1").await;
    host.fail_all_spawns(true);
    let mut monitor = HealthMonitor::new(host.clone());
    let config = AutoActionConfig {
        kill_on_stuck: true,
        restart_on_kill: true,
        ..AutoActionConfig::default()
    };

    let now = Utc::now();
    let stuck = assess("w-1", false, None, now, &thresholds());
    let actions = monitor.apply_auto_actions(&mut worker, &stuck, &config).await;

    assert!(matches!(actions.last(), Some(MonitorAction::Failed { action, .. }) if action == "restart"));
    assert_eq!(worker.status, WorkerStatus::Suspended);
    assert_eq!(worker.failure_reason.as_deref(), Some("killed: stuck"));
}

#[test]
fn monitor_actions_serialize_with_kind_tag() {
    let actions = vec![
        MonitorAction::Poked { worker_id: "w-1".into() },
        MonitorAction::Killed { worker_id: "w-1".into() },
        MonitorAction::Restarted { worker_id: "w-1".into() },
        MonitorAction::Failed {
            worker_id: "w-1".into(),
            action: "restart".into(),
            error: "host: spawn refused".into(),
        },
    ];
    let json = serde_json::to_value(&actions).expect("serialize");
    assert_eq!(json[0], serde_json::json!({"kind": "poked", "worker_id": "w-1"}));
    assert_eq!(json[1]["kind"], "killed");
    assert_eq!(json[2]["kind"], "restarted");
    assert_eq!(
        json[3],
        serde_json::json!({
            "kind": "failed",
            "worker_id": "w-1",
            "action": "restart",
            "error": "host: spawn refused",
        })
    );
}

#[test]
fn tick_report_serializes_actions_and_health() {
    let now = Utc::now();
    let report = TickReport {
        health: vec![assess("w-1", false, None, now, &thresholds())],
        actions: vec![MonitorAction::Killed { worker_id: "w-1".into() }],
        ..TickReport::default()
    };
    let json = serde_json::to_value(&report).expect("serialize");
    assert_eq!(json["health"][0]["state"], "stuck");
    assert_eq!(json["actions"][0]["kind"], "killed");
    assert_eq!(json["handoffs"], serde_json::json!([]));
}

//! Convoy lifecycle driven through the control loop.

use agent_fleet::audit::AuditEventType;
use agent_fleet::models::convoy::{ConvoyStatus, JobStatus};
use agent_fleet::models::worker::WorkerStatus;
use agent_fleet::orchestrator::ConvoyAction;
use agent_fleet::persistence::WorkerStore;
use agent_fleet::AppError;

use super::test_helpers::{worker_id, Harness};

#[tokio::test]
async fn completion_reports_backfill_in_issue_order() {
    let mut h = Harness::new();
    let convoy = h.start_convoy(&["a", "b", "c", "d", "e"], 2).await;

    assert_eq!(convoy.status, ConvoyStatus::Running);
    assert_eq!(convoy.running_count(), 2);
    assert_eq!(
        h.host.running(),
        vec![worker_id(&convoy, "a"), worker_id(&convoy, "b")]
    );

    let done = h
        .control
        .complete_worker(&worker_id(&convoy, "a"), Some("fixed a".into()))
        .await
        .expect("complete a");
    assert_eq!(done.status, WorkerStatus::Completed);

    let convoy = h.control.scheduler().get(&convoy.id).await.expect("convoy");
    assert_eq!(convoy.jobs[0].status, JobStatus::Completed);
    assert_eq!(convoy.jobs[0].output.as_deref(), Some("fixed a"));
    assert_eq!(convoy.jobs[2].status, JobStatus::Running);
    assert_eq!(convoy.jobs[3].status, JobStatus::Pending);
    assert_eq!(convoy.running_count(), 2);

    let spawned: Vec<String> = h.host.spawns().into_iter().map(|s| s.worker_id).collect();
    assert_eq!(
        spawned,
        vec![
            worker_id(&convoy, "a"),
            worker_id(&convoy, "b"),
            worker_id(&convoy, "c"),
        ]
    );

    let created = h.audit.of_type(AuditEventType::ConvoyCreated);
    assert_eq!(created.len(), 1);
    assert_eq!(created[0].convoy_id.as_deref(), Some(convoy.id.as_str()));
    assert_eq!(h.audit.of_type(AuditEventType::ConvoyStarted).len(), 1);
    assert_eq!(h.audit.of_type(AuditEventType::WorkerCompleted).len(), 1);
}

#[tokio::test]
async fn silent_exit_fails_job_and_tick_reports_finished_convoy() {
    let mut h = Harness::new();
    let convoy = h.start_convoy(&["a", "b"], 2).await;
    let a = worker_id(&convoy, "a");
    let b = worker_id(&convoy, "b");

    h.control
        .complete_worker(&a, Some("done".into()))
        .await
        .expect("complete a");
    h.host.set_running(&b, false);

    let report = h.control.tick().await.expect("tick");
    assert_eq!(report.finished_convoys, vec![convoy.id.clone()]);
    assert!(report.handoffs.is_empty());

    let convoy = h.control.scheduler().get(&convoy.id).await.expect("convoy");
    assert_eq!(convoy.status, ConvoyStatus::Completed);
    assert_eq!(convoy.jobs[1].status, JobStatus::Failed);
    assert!(convoy.jobs[1]
        .error
        .as_deref()
        .is_some_and(|e| e.contains("without reporting completion")));

    let worker = h.workers.get(&b).await.expect("get").expect("worker b");
    assert_eq!(worker.status, WorkerStatus::Failed);

    let finished = h.audit.of_type(AuditEventType::ConvoyFinished);
    assert_eq!(finished.len(), 1);
    assert_eq!(finished[0].summary.as_deref(), Some("completed"));
}

#[tokio::test]
async fn tick_backfills_after_a_failed_worker() {
    let mut h = Harness::new();
    let convoy = h.start_convoy(&["a", "b", "c"], 1).await;
    h.host.set_running(&worker_id(&convoy, "a"), false);

    let report = h.control.tick().await.expect("tick");
    assert!(report.finished_convoys.is_empty());

    let convoy = h.control.scheduler().get(&convoy.id).await.expect("convoy");
    assert_eq!(convoy.jobs[0].status, JobStatus::Failed);
    assert_eq!(convoy.jobs[1].status, JobStatus::Running);
    assert_eq!(convoy.jobs[2].status, JobStatus::Pending);
    assert_eq!(h.host.running(), vec![worker_id(&convoy, "b")]);
}

#[tokio::test]
async fn paused_convoy_holds_pending_jobs_until_resumed() {
    let mut h = Harness::new();
    let convoy = h.start_convoy(&["a", "b"], 1).await;

    let paused = h
        .control
        .convoy_action(&convoy.id, ConvoyAction::Pause)
        .await
        .expect("pause");
    assert_eq!(paused.status, ConvoyStatus::Paused);

    h.control
        .complete_worker(&worker_id(&convoy, "a"), None)
        .await
        .expect("complete a");
    let held = h.control.scheduler().get(&convoy.id).await.expect("convoy");
    assert_eq!(held.jobs[1].status, JobStatus::Pending);

    let resumed = h
        .control
        .convoy_action(&convoy.id, ConvoyAction::Resume)
        .await
        .expect("resume");
    assert_eq!(resumed.status, ConvoyStatus::Running);
    assert_eq!(resumed.jobs[1].status, JobStatus::Running);
    assert_eq!(h.audit.of_type(AuditEventType::ConvoyPaused).len(), 1);
    assert_eq!(h.audit.of_type(AuditEventType::ConvoyResumed).len(), 1);
}

#[tokio::test]
async fn stop_kills_running_workers() {
    let mut h = Harness::new();
    let convoy = h.start_convoy(&["a", "b", "c"], 2).await;

    let stopped = h
        .control
        .convoy_action(&convoy.id, ConvoyAction::Stop)
        .await
        .expect("stop");
    assert!(stopped.is_terminal());
    assert!(h.host.running().is_empty());
    assert_eq!(h.host.kills().len(), 2);

    let again = h.control.convoy_action(&convoy.id, ConvoyAction::Stop).await;
    assert!(matches!(again, Err(AppError::InvalidState(_))));
    assert_eq!(h.audit.of_type(AuditEventType::ConvoyStopped).len(), 1);
}

#[tokio::test]
async fn completing_unknown_or_failed_worker_is_rejected() {
    let mut h = Harness::new();
    let missing = h.control.complete_worker("nobody", None).await;
    assert!(matches!(missing, Err(AppError::NotFound(_))));

    let convoy = h.start_convoy(&["a"], 1).await;
    let a = worker_id(&convoy, "a");
    h.host.set_running(&a, false);
    h.control.tick().await.expect("tick");

    let failed = h.control.complete_worker(&a, None).await;
    assert!(matches!(failed, Err(AppError::InvalidState(_))));
}

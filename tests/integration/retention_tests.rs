//! Integration tests for the worker retention service.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{Duration, Utc};
use tokio_util::sync::CancellationToken;

use agent_fleet::models::tier::Tier;
use agent_fleet::models::worker::{Worker, WorkerStatus};
use agent_fleet::persistence::retention::{archive_expired, spawn_retention_task};
use agent_fleet::persistence::{InMemoryWorkerStore, WorkerStore};

fn stopped(id: &str, status: WorkerStatus, age_days: i64) -> Worker {
    let mut worker = Worker::new(id.into(), Tier::Low, "/ws".into());
    worker.transition_to(status, None).expect("transition");
    worker.updated_at = Utc::now() - Duration::days(age_days);
    worker
}

#[tokio::test]
async fn archives_workers_stopped_past_retention() {
    let store = InMemoryWorkerStore::new();
    for worker in [
        stopped("old-done", WorkerStatus::Completed, 31),
        stopped("old-failed", WorkerStatus::Failed, 45),
        stopped("old-parked", WorkerStatus::Suspended, 60),
        stopped("fresh", WorkerStatus::Completed, 2),
    ] {
        store.save(&worker).await.expect("save");
    }
    let mut live = Worker::new("live".into(), Tier::Low, "/ws".into());
    live.updated_at = Utc::now() - Duration::days(90);
    store.save(&live).await.expect("save");

    let archived = archive_expired(&store, 30).await.expect("archive");
    assert_eq!(archived, 3);

    let remaining: Vec<String> = store.list().await.expect("list").into_iter().map(|w| w.id).collect();
    assert!(remaining.contains(&"fresh".to_owned()));
    assert!(remaining.contains(&"live".to_owned()));
    assert_eq!(remaining.len(), 2);
    assert_eq!(store.archived().len(), 3);
}

#[tokio::test]
async fn nothing_to_archive_returns_zero() {
    let store = InMemoryWorkerStore::new();
    store
        .save(&stopped("fresh", WorkerStatus::Completed, 1))
        .await
        .expect("save");
    assert_eq!(archive_expired(&store, 30).await.expect("archive"), 0);
}

#[tokio::test]
async fn background_task_runs_once_and_stops_on_cancel() {
    let store = Arc::new(InMemoryWorkerStore::new());
    store
        .save(&stopped("old", WorkerStatus::Failed, 10))
        .await
        .expect("save");

    let cancel = CancellationToken::new();
    let handle = spawn_retention_task(store.clone(), 7, cancel.clone());

    let deadline = tokio::time::Instant::now() + StdDuration::from_secs(5);
    while store.archived().is_empty() {
        assert!(tokio::time::Instant::now() < deadline, "first purge never ran");
        tokio::time::sleep(StdDuration::from_millis(20)).await;
    }

    cancel.cancel();
    tokio::time::timeout(StdDuration::from_secs(5), handle)
        .await
        .expect("task stopped")
        .expect("task joined");
}

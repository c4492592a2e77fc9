//! `SQLite` repository tests for workers and convoys.

use std::sync::Arc;

use chrono::{Duration, Utc};

use agent_fleet::models::convoy::{Convoy, ConvoyConfig, ConvoyStatus, JobStatus};
use agent_fleet::models::tier::{Specialist, Tier};
use agent_fleet::models::worker::{Worker, WorkerStatus};
use agent_fleet::persistence::db;
use agent_fleet::persistence::{ConvoyRepo, ConvoyStore, WorkerRepo, WorkerStore};

async fn repos() -> (WorkerRepo, ConvoyRepo) {
    let pool = Arc::new(db::connect_memory().await.expect("db"));
    (WorkerRepo::new(Arc::clone(&pool)), ConvoyRepo::new(pool))
}

#[tokio::test]
async fn worker_round_trips_every_field() {
    let (workers, _) = repos().await;
    let mut worker = Worker::new("w-1".into(), Tier::Mid, "/tmp/ws".into())
        .with_task("iss-3")
        .with_convoy("c-1")
        .with_role(Specialist::Test);
    worker.observe_activity(Utc::now() - Duration::minutes(3));
    worker.last_output = Some("running tests".into());
    worker.spend = 2.5;
    worker.handoff_count = 2;
    worker
        .transition_to(WorkerStatus::Suspended, Some("handed off".into()))
        .expect("transition");

    workers.save(&worker).await.expect("save");
    let loaded = workers.get("w-1").await.expect("get").expect("present");
    assert_eq!(loaded, worker);
    assert!(workers.get("missing").await.expect("get").is_none());
}

#[tokio::test]
async fn save_updates_in_place_and_list_live_filters() {
    let (workers, _) = repos().await;
    let mut a = Worker::new("a".into(), Tier::Low, "/ws".into());
    let b = Worker::new("b".into(), Tier::Low, "/ws".into());
    workers.save(&a).await.expect("save a");
    workers.save(&b).await.expect("save b");

    a.transition_to(WorkerStatus::Completed, None).expect("complete");
    workers.save(&a).await.expect("update a");

    let all: Vec<String> = workers.list().await.expect("list").into_iter().map(|w| w.id).collect();
    assert_eq!(all, vec!["a", "b"]);
    let live: Vec<String> = workers
        .list_live()
        .await
        .expect("live")
        .into_iter()
        .map(|w| w.id)
        .collect();
    assert_eq!(live, vec!["b"]);
}

#[tokio::test]
async fn archival_moves_only_old_stopped_workers() {
    let (workers, _) = repos().await;
    let mut old = Worker::new("old".into(), Tier::Low, "/ws".into());
    old.transition_to(WorkerStatus::Failed, Some("boom".into())).expect("fail");
    old.updated_at = Utc::now() - Duration::days(40);
    let mut recent = Worker::new("recent".into(), Tier::Low, "/ws".into());
    recent.transition_to(WorkerStatus::Completed, None).expect("complete");
    let mut stale_live = Worker::new("live".into(), Tier::Low, "/ws".into());
    stale_live.updated_at = Utc::now() - Duration::days(40);

    for w in [&old, &recent, &stale_live] {
        workers.save(w).await.expect("save");
    }

    let archived = workers
        .archive_stopped_before(Utc::now() - Duration::days(30))
        .await
        .expect("archive");
    assert_eq!(archived, 1);
    assert!(workers.get("old").await.expect("get").is_none());
    assert!(workers.get("recent").await.expect("get").is_some());
    assert!(workers.get("live").await.expect("get").is_some());
}

#[tokio::test]
async fn convoy_round_trips_with_jobs_in_order() {
    let (_, convoys) = repos().await;
    let mut convoy = Convoy::new(
        "sprint".into(),
        vec!["c".into(), "a".into(), "b".into()],
        ConvoyConfig {
            max_concurrent: 2,
            per_worker_timeout_ms: 90_000,
            synthesize: true,
        },
    );
    convoys.save(&convoy).await.expect("save");

    convoy.status = ConvoyStatus::Running;
    convoy.jobs[0].status = JobStatus::Running;
    convoy.jobs[0].worker_id = Some("w-c".into());
    convoy.jobs[0].started_at = Some(Utc::now());
    convoy.jobs[1].status = JobStatus::Failed;
    convoy.jobs[1].error = Some("spawn refused".into());
    convoy.jobs[1].completed_at = Some(Utc::now());
    convoys.save(&convoy).await.expect("update");

    let loaded = convoys.get(&convoy.id).await.expect("get").expect("present");
    assert_eq!(loaded, convoy);
    let issues: Vec<&str> = loaded.jobs.iter().map(|j| j.issue_id.as_str()).collect();
    assert_eq!(issues, vec!["c", "a", "b"]);
}

#[tokio::test]
async fn list_active_skips_pending_and_terminal_convoys() {
    let (_, convoys) = repos().await;
    let pending = Convoy::new("p".into(), vec!["x".into()], ConvoyConfig::default());
    let mut running = Convoy::new("r".into(), vec!["x".into()], ConvoyConfig::default());
    running.status = ConvoyStatus::Running;
    let mut paused = Convoy::new("z".into(), vec!["x".into()], ConvoyConfig::default());
    paused.status = ConvoyStatus::Paused;
    let mut done = Convoy::new("d".into(), vec!["x".into()], ConvoyConfig::default());
    done.status = ConvoyStatus::Completed;

    for c in [&pending, &running, &paused, &done] {
        convoys.save(c).await.expect("save");
    }

    assert_eq!(convoys.list().await.expect("list").len(), 4);
    let mut active: Vec<String> = convoys
        .list_active()
        .await
        .expect("active")
        .into_iter()
        .map(|c| c.name)
        .collect();
    active.sort();
    assert_eq!(active, vec!["r", "z"]);
}

#[tokio::test]
async fn file_database_persists_across_connections() {
    let temp = tempfile::tempdir().expect("tempdir");
    let path = temp.path().join("nested").join("fleet.db");

    {
        let pool = Arc::new(db::connect(&path).await.expect("connect"));
        let workers = WorkerRepo::new(Arc::clone(&pool));
        workers
            .save(&Worker::new("w".into(), Tier::High, "/ws".into()))
            .await
            .expect("save");
        pool.close().await;
    }

    let pool = Arc::new(db::connect(&path).await.expect("reconnect"));
    let workers = WorkerRepo::new(pool);
    let loaded = workers.get("w").await.expect("get").expect("present");
    assert_eq!(loaded.tier, Tier::High);
}

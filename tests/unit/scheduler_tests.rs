//! Unit tests for the convoy scheduler against in-memory stores.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};

use agent_fleet::convoy::ConvoyScheduler;
use agent_fleet::cost::{CostGuard, CostLimits, InMemoryLedger};
use agent_fleet::host::MockHost;
use agent_fleet::models::convoy::{Convoy, ConvoyConfig, ConvoyStatus, JobStatus};
use agent_fleet::models::tier::Tier;
use agent_fleet::models::worker::{Worker, WorkerStatus};
use agent_fleet::persistence::memory::{InMemoryConvoyStore, InMemoryWorkerStore};
use agent_fleet::persistence::{ConvoyStore, WorkerStore};
use agent_fleet::{AppError, BoxFuture, Result};

struct Fixture {
    host: Arc<MockHost>,
    workers: Arc<InMemoryWorkerStore>,
    scheduler: ConvoyScheduler,
}

fn fixture() -> Fixture {
    let host = Arc::new(MockHost::new());
    let workers = Arc::new(InMemoryWorkerStore::new());
    let scheduler = ConvoyScheduler::new(
        Arc::new(InMemoryConvoyStore::new()),
        workers.clone(),
        host.clone(),
        "/tmp/fleet",
    );
    Fixture {
        host,
        workers,
        scheduler,
    }
}

fn issues(ids: &[&str]) -> Vec<String> {
    ids.iter().map(|s| (*s).to_owned()).collect()
}

fn config(max_concurrent: u32) -> ConvoyConfig {
    ConvoyConfig {
        max_concurrent,
        ..ConvoyConfig::default()
    }
}

fn statuses(convoy: &Convoy) -> Vec<JobStatus> {
    convoy.jobs.iter().map(|j| j.status).collect()
}

fn worker_id(convoy: &Convoy, issue: &str) -> String {
    format!("{}-{issue}", &convoy.id[..8])
}

#[tokio::test]
async fn create_validates_issue_list_and_policy() {
    let f = fixture();
    let empty = f.scheduler.create("c", Vec::new(), config(1)).await;
    assert!(matches!(empty, Err(AppError::Config(_))));

    let dup = f.scheduler.create("c", issues(&["a", "a"]), config(1)).await;
    assert!(matches!(dup, Err(AppError::Config(msg)) if msg.contains("duplicate")));

    let zero = f.scheduler.create("c", issues(&["a"]), config(0)).await;
    assert!(matches!(zero, Err(AppError::Config(_))));

    let ok = f.scheduler.create("c", issues(&["a"]), config(1)).await.expect("create");
    assert_eq!(ok.status, ConvoyStatus::Pending);
    assert!(f.host.spawns().is_empty());
}

#[tokio::test]
async fn start_fills_slots_in_issue_order() {
    let f = fixture();
    let convoy = f
        .scheduler
        .create("sprint", issues(&["a", "b", "c", "d", "e"]), config(2))
        .await
        .expect("create");

    let started = f.scheduler.start(&convoy.id).await.expect("start");
    assert_eq!(started.status, ConvoyStatus::Running);
    assert_eq!(
        statuses(&started),
        vec![
            JobStatus::Running,
            JobStatus::Running,
            JobStatus::Pending,
            JobStatus::Pending,
            JobStatus::Pending,
        ]
    );

    let spawns = f.host.spawns();
    assert_eq!(spawns.len(), 2);
    assert_eq!(spawns[0].worker_id, worker_id(&convoy, "a"));
    assert!(spawns[0].prompt.contains("issue a"));
    assert_eq!(spawns[0].tier, Tier::Low);

    let worker = f
        .workers
        .get(&worker_id(&convoy, "a"))
        .await
        .expect("get")
        .expect("worker saved");
    assert_eq!(worker.task_ref.as_deref(), Some("a"));
    assert_eq!(worker.convoy_id.as_deref(), Some(convoy.id.as_str()));
}

#[tokio::test]
async fn completion_backfills_fifo() {
    let f = fixture();
    let convoy = f
        .scheduler
        .create("sprint", issues(&["a", "b", "c"]), config(2))
        .await
        .expect("create");
    f.scheduler.start(&convoy.id).await.expect("start");

    let after = f
        .scheduler
        .complete_job(&convoy.id, "b", Some("done b".into()))
        .await
        .expect("complete b");
    assert_eq!(
        statuses(&after),
        vec![JobStatus::Running, JobStatus::Completed, JobStatus::Running]
    );
    assert_eq!(after.jobs[1].output.as_deref(), Some("done b"));
    assert_eq!(f.host.kills(), vec![worker_id(&convoy, "b")]);

    let worker = f
        .workers
        .get(&worker_id(&convoy, "b"))
        .await
        .expect("get")
        .expect("worker");
    assert_eq!(worker.status, WorkerStatus::Completed);

    let again = f.scheduler.complete_job(&convoy.id, "b", None).await;
    assert!(matches!(again, Err(AppError::InvalidState(_))));
    let missing = f.scheduler.complete_job(&convoy.id, "zz", None).await;
    assert!(matches!(missing, Err(AppError::NotFound(_))));
}

#[tokio::test]
async fn poll_reads_completion_and_exits_from_the_host() {
    let f = fixture();
    let convoy = f
        .scheduler
        .create("sprint", issues(&["a", "b", "c"]), config(2))
        .await
        .expect("create");
    f.scheduler.start(&convoy.id).await.expect("start");

    // Worker a reported completion, then its session ended.
    let a = worker_id(&convoy, "a");
    let mut worker = f.workers.get(&a).await.expect("get").expect("worker a");
    worker.last_output = Some("fixed a".into());
    worker
        .transition_to(WorkerStatus::Completed, None)
        .expect("complete");
    f.workers.save(&worker).await.expect("save");
    f.host.set_running(&a, false);

    // Worker b died silently.
    let b = worker_id(&convoy, "b");
    f.host.set_running(&b, false);

    let polled = f.scheduler.poll(&convoy.id).await.expect("poll");
    assert_eq!(polled.jobs[0].status, JobStatus::Completed);
    assert_eq!(polled.jobs[0].output.as_deref(), Some("fixed a"));
    assert_eq!(polled.jobs[1].status, JobStatus::Failed);
    assert_eq!(polled.jobs[2].status, JobStatus::Running);

    let dead = f.workers.get(&b).await.expect("get").expect("worker b");
    assert_eq!(dead.status, WorkerStatus::Failed);
}

#[tokio::test]
async fn paused_convoy_does_not_backfill_until_resumed() {
    let f = fixture();
    let convoy = f
        .scheduler
        .create("sprint", issues(&["a", "b"]), config(1))
        .await
        .expect("create");
    f.scheduler.start(&convoy.id).await.expect("start");
    f.scheduler.pause(&convoy.id).await.expect("pause");

    let after = f
        .scheduler
        .complete_job(&convoy.id, "a", None)
        .await
        .expect("complete a");
    assert_eq!(after.status, ConvoyStatus::Paused);
    assert_eq!(after.jobs[1].status, JobStatus::Pending);
    assert_eq!(f.host.spawns().len(), 1);

    let resumed = f.scheduler.resume(&convoy.id).await.expect("resume");
    assert_eq!(resumed.jobs[1].status, JobStatus::Running);

    let err = f.scheduler.resume(&convoy.id).await;
    assert!(matches!(err, Err(AppError::InvalidState(_))));
}

#[tokio::test]
async fn stop_kills_running_and_fails_the_convoy() {
    let f = fixture();
    let convoy = f
        .scheduler
        .create(
            "sprint",
            issues(&["a", "b", "c"]),
            ConvoyConfig {
                max_concurrent: 2,
                synthesize: true,
                ..ConvoyConfig::default()
            },
        )
        .await
        .expect("create");
    f.scheduler.start(&convoy.id).await.expect("start");

    let stopped = f.scheduler.stop(&convoy.id).await.expect("stop");
    assert_eq!(stopped.status, ConvoyStatus::Failed);
    assert!(stopped.jobs.iter().all(|j| j.status == JobStatus::Failed));
    assert_eq!(stopped.jobs[2].error.as_deref(), Some("stopped by operator"));
    assert_eq!(f.host.kills().len(), 2);
    assert!(f.host.running().is_empty());
    assert!(stopped
        .synthesis_prompt
        .as_deref()
        .is_some_and(|p| p.contains("0 of 3 issues completed")));

    let again = f.scheduler.stop(&convoy.id).await;
    assert!(matches!(again, Err(AppError::InvalidState(_))));
}

#[tokio::test]
async fn spawn_failure_fails_the_job_and_moves_on() {
    let f = fixture();
    let convoy = f
        .scheduler
        .create("sprint", issues(&["a", "b", "c"]), config(1))
        .await
        .expect("create");
    f.host.fail_spawn_for(&worker_id(&convoy, "a"));

    let started = f.scheduler.start(&convoy.id).await.expect("start");
    assert_eq!(
        statuses(&started),
        vec![JobStatus::Failed, JobStatus::Running, JobStatus::Pending]
    );
    let failed = f
        .workers
        .get(&worker_id(&convoy, "a"))
        .await
        .expect("get")
        .expect("worker a");
    assert_eq!(failed.status, WorkerStatus::Failed);
}

#[tokio::test]
async fn finished_convoy_synthesizes_in_issue_order() {
    let f = fixture();
    let convoy = f
        .scheduler
        .create(
            "sprint",
            issues(&["a", "b"]),
            ConvoyConfig {
                max_concurrent: 2,
                synthesize: true,
                ..ConvoyConfig::default()
            },
        )
        .await
        .expect("create");
    f.scheduler.start(&convoy.id).await.expect("start");
    f.scheduler
        .fail_job(&convoy.id, "b", "tests red")
        .await
        .expect("fail b");
    let done = f
        .scheduler
        .complete_job(&convoy.id, "a", Some("patched parser".into()))
        .await
        .expect("complete a");

    assert_eq!(done.status, ConvoyStatus::Completed);
    let prompt = done.synthesis_prompt.expect("synthesis prompt");
    let a = prompt.find("## Issue a (completed)").expect("issue a section");
    let b = prompt.find("## Issue b (failed)").expect("issue b section");
    assert!(a < b);
    assert!(prompt.contains("patched parser"));
    assert!(prompt.contains("Error: tests red"));
}

#[tokio::test]
async fn convoy_with_only_failures_is_failed() {
    let f = fixture();
    let convoy = f
        .scheduler
        .create("sprint", issues(&["a"]), config(1))
        .await
        .expect("create");
    f.scheduler.start(&convoy.id).await.expect("start");
    let done = f
        .scheduler
        .fail_job(&convoy.id, "a", "gave up")
        .await
        .expect("fail");
    assert_eq!(done.status, ConvoyStatus::Failed);
    assert!(done.synthesis_prompt.is_none());
}

#[tokio::test]
async fn restart_retries_failed_jobs_with_fresh_worker_ids() {
    let f = fixture();
    let convoy = f
        .scheduler
        .create("sprint", issues(&["a"]), config(1))
        .await
        .expect("create");
    f.scheduler.start(&convoy.id).await.expect("start");
    f.scheduler
        .fail_job(&convoy.id, "a", "flaky")
        .await
        .expect("fail");

    let restarted = f.scheduler.start(&convoy.id).await.expect("restart");
    assert_eq!(restarted.status, ConvoyStatus::Running);
    assert_eq!(restarted.jobs[0].status, JobStatus::Running);
    assert_eq!(
        restarted.jobs[0].worker_id.as_deref(),
        Some(format!("{}-r2", worker_id(&convoy, "a")).as_str())
    );
}

#[tokio::test]
async fn timed_out_job_is_killed_and_failed() {
    let f = fixture();
    let convoy = f
        .scheduler
        .create(
            "sprint",
            issues(&["a"]),
            ConvoyConfig {
                max_concurrent: 1,
                per_worker_timeout_ms: 1,
                synthesize: false,
            },
        )
        .await
        .expect("create");
    f.scheduler.start(&convoy.id).await.expect("start");
    tokio::time::sleep(std::time::Duration::from_millis(10)).await;

    let polled = f.scheduler.poll(&convoy.id).await.expect("poll");
    assert_eq!(polled.jobs[0].status, JobStatus::Failed);
    assert!(polled.jobs[0]
        .error
        .as_deref()
        .is_some_and(|e| e.starts_with("timed out")));
    assert_eq!(f.host.kills(), vec![worker_id(&convoy, "a")]);
}

#[tokio::test]
async fn cost_limit_leaves_blocked_jobs_pending() {
    let host = Arc::new(MockHost::new());
    let guard = Arc::new(CostGuard::open(Arc::new(InMemoryLedger::new())).expect("guard"));
    guard.record_cost("earlier", 5.0, Some("a")).expect("record");
    let scheduler = ConvoyScheduler::new(
        Arc::new(InMemoryConvoyStore::new()),
        Arc::new(InMemoryWorkerStore::new()),
        host.clone(),
        "/tmp/fleet",
    )
    .with_cost_guard(
        guard,
        CostLimits {
            per_task: 5.0,
            ..CostLimits::default()
        },
    );

    let convoy = scheduler
        .create("sprint", issues(&["a", "b"]), config(2))
        .await
        .expect("create");
    let started = scheduler.start(&convoy.id).await.expect("start");

    assert_eq!(statuses(&started), vec![JobStatus::Pending, JobStatus::Running]);
    assert_eq!(host.spawns().len(), 1);
}

#[tokio::test]
async fn reassign_points_running_job_at_new_worker() {
    let f = fixture();
    let convoy = f
        .scheduler
        .create("sprint", issues(&["a"]), config(1))
        .await
        .expect("create");
    f.scheduler.start(&convoy.id).await.expect("start");
    let original = worker_id(&convoy, "a");

    assert_eq!(
        f.scheduler.find_job(&original).await.expect("find"),
        Some((convoy.id.clone(), "a".to_owned()))
    );
    let moved = f
        .scheduler
        .reassign_job(&original, "replacement")
        .await
        .expect("reassign");
    assert_eq!(moved.as_deref(), Some(convoy.id.as_str()));
    assert!(f.scheduler.find_job(&original).await.expect("find").is_none());
    assert!(f.scheduler.find_job("replacement").await.expect("find").is_some());
    assert_eq!(
        f.scheduler.reassign_job("nobody", "x").await.expect("reassign"),
        None
    );
}

/// Worker store that starts failing writes after a fixed number of saves.
struct FlakyWorkerStore {
    inner: InMemoryWorkerStore,
    saves_left: AtomicUsize,
}

impl FlakyWorkerStore {
    fn failing_after(saves: usize) -> Self {
        Self {
            inner: InMemoryWorkerStore::new(),
            saves_left: AtomicUsize::new(saves),
        }
    }

    fn heal(&self) {
        self.saves_left.store(usize::MAX, Ordering::SeqCst);
    }
}

impl WorkerStore for FlakyWorkerStore {
    fn save<'a>(&'a self, worker: &'a Worker) -> BoxFuture<'a, Result<()>> {
        let allowed = self
            .saves_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if allowed {
            self.inner.save(worker)
        } else {
            Box::pin(async { Err(AppError::Db("disk full".into())) })
        }
    }

    fn get<'a>(&'a self, id: &'a str) -> BoxFuture<'a, Result<Option<Worker>>> {
        self.inner.get(id)
    }

    fn list(&self) -> BoxFuture<'_, Result<Vec<Worker>>> {
        self.inner.list()
    }

    fn list_live(&self) -> BoxFuture<'_, Result<Vec<Worker>>> {
        self.inner.list_live()
    }

    fn archive_stopped_before(&self, cutoff: DateTime<Utc>) -> BoxFuture<'_, Result<u64>> {
        self.inner.archive_stopped_before(cutoff)
    }
}

#[tokio::test]
async fn store_failure_mid_pass_still_persists_started_jobs() {
    let host = Arc::new(MockHost::new());
    let convoys = Arc::new(InMemoryConvoyStore::new());
    let workers = Arc::new(FlakyWorkerStore::failing_after(1));
    let scheduler = ConvoyScheduler::new(convoys.clone(), workers.clone(), host.clone(), "/tmp/fleet");
    let convoy = scheduler
        .create("sprint", issues(&["a", "b", "c"]), config(3))
        .await
        .expect("create");

    let started = scheduler.start(&convoy.id).await;
    assert!(matches!(started, Err(AppError::Db(_))));
    assert_eq!(host.spawns().len(), 1);

    let stored = convoys.get(&convoy.id).await.expect("get").expect("convoy");
    assert_eq!(
        statuses(&stored),
        vec![JobStatus::Running, JobStatus::Pending, JobStatus::Pending]
    );
    assert_eq!(stored.jobs[0].worker_id.as_deref(), Some(worker_id(&convoy, "a").as_str()));

    workers.heal();
    scheduler
        .complete_job(&convoy.id, "a", Some("done".into()))
        .await
        .expect("complete a");
    let spawned: Vec<String> = host.spawns().into_iter().map(|s| s.worker_id).collect();
    assert_eq!(
        spawned,
        vec![
            worker_id(&convoy, "a"),
            worker_id(&convoy, "b"),
            worker_id(&convoy, "c"),
        ]
    );
}

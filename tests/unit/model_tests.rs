//! Unit tests for tiers, worker lifecycle and convoy bookkeeping.

use chrono::{Duration, Utc};

use agent_fleet::models::convoy::{Convoy, ConvoyConfig, JobStatus};
use agent_fleet::models::tier::{Specialist, Tier};
use agent_fleet::models::worker::{Worker, WorkerStatus};
use agent_fleet::AppError;

fn worker() -> Worker {
    Worker::new("w-1".into(), Tier::Low, "/tmp/ws".into()).with_task("iss-1")
}

#[test]
fn tier_ladder_climbs_to_high_and_stops() {
    assert_eq!(Tier::Low.next(), Some(Tier::Mid));
    assert_eq!(Tier::Mid.next(), Some(Tier::High));
    assert_eq!(Tier::High.next(), None);
    assert!(Tier::Low < Tier::Mid && Tier::Mid < Tier::High);
}

#[test]
fn tier_and_specialist_parse_their_identifiers() {
    for tier in Tier::ALL {
        assert_eq!(tier.as_str().parse::<Tier>().expect("parse"), tier);
    }
    assert_eq!("review".parse::<Specialist>().expect("parse"), Specialist::Review);
    assert!(matches!("ultra".parse::<Tier>(), Err(AppError::Config(_))));
    assert!(matches!("deploy".parse::<Specialist>(), Err(AppError::Config(_))));
}

#[test]
fn specialists_have_default_tiers_and_instructions() {
    assert_eq!(Specialist::Review.default_tier(), Tier::Mid);
    assert_eq!(Specialist::Test.default_tier(), Tier::Low);
    assert!(Specialist::Merge.instruction().contains("merge specialist"));
}

#[test]
fn new_worker_starts_in_starting() {
    let w = worker();
    assert_eq!(w.status, WorkerStatus::Starting);
    assert_eq!(w.task_ref.as_deref(), Some("iss-1"));
    assert!(w.last_activity_at.is_none());
    assert_eq!(w.handoff_count, 0);
}

#[test]
fn worker_lifecycle_allows_documented_transitions() {
    let mut w = worker();
    w.transition_to(WorkerStatus::Running, None).expect("start -> running");
    w.transition_to(WorkerStatus::Suspended, Some("killed: stuck".into()))
        .expect("running -> suspended");
    assert_eq!(w.failure_reason.as_deref(), Some("killed: stuck"));
    w.transition_to(WorkerStatus::Starting, None).expect("suspended -> starting");
    w.transition_to(WorkerStatus::Completed, None).expect("starting -> completed");
    assert!(w.terminated_at.is_some());
}

#[test]
fn terminal_workers_cannot_move() {
    let mut w = worker();
    w.transition_to(WorkerStatus::Failed, Some("spawn refused".into()))
        .expect("starting -> failed");
    for next in [
        WorkerStatus::Starting,
        WorkerStatus::Running,
        WorkerStatus::Suspended,
        WorkerStatus::Completed,
    ] {
        assert!(!w.can_transition_to(next));
    }
    let err = w.transition_to(WorkerStatus::Running, None).unwrap_err();
    assert!(matches!(err, AppError::InvalidState(_)));
}

#[test]
fn running_cannot_go_back_to_starting() {
    let mut w = worker();
    w.transition_to(WorkerStatus::Running, None).expect("running");
    assert!(!w.can_transition_to(WorkerStatus::Starting));
}

#[test]
fn activity_only_moves_forward() {
    let mut w = worker();
    let now = Utc::now();
    assert!(w.observe_activity(now));
    assert!(!w.observe_activity(now - Duration::seconds(10)));
    assert!(!w.observe_activity(now));
    assert_eq!(w.last_activity_at, Some(now));
    assert!(w.observe_activity(now + Duration::seconds(1)));
}

#[test]
fn convoy_has_one_pending_job_per_issue_in_order() {
    let issues: Vec<String> = ["a", "b", "c"].iter().map(|s| (*s).to_owned()).collect();
    let convoy = Convoy::new("sprint".into(), issues.clone(), ConvoyConfig::default());

    let job_ids: Vec<&str> = convoy.jobs.iter().map(|j| j.issue_id.as_str()).collect();
    assert_eq!(job_ids, vec!["a", "b", "c"]);
    assert_eq!(convoy.pending_count(), 3);
    assert_eq!(convoy.running_count(), 0);
    assert!(!convoy.all_terminal());
    assert!(!convoy.is_terminal());
}

#[test]
fn convoy_config_requires_positive_concurrency() {
    let config = ConvoyConfig {
        max_concurrent: 0,
        ..ConvoyConfig::default()
    };
    assert!(matches!(config.validate(), Err(AppError::Config(_))));
    assert!(ConvoyConfig::default().validate().is_ok());
}

#[test]
fn job_lookup_by_worker() {
    let mut convoy = Convoy::new("c".into(), vec!["a".into(), "b".into()], ConvoyConfig::default());
    if let Some(job) = convoy.job_mut("b") {
        job.worker_id = Some("w-b".into());
        job.status = JobStatus::Running;
    }
    let job = convoy.job_for_worker_mut("w-b").expect("job for worker");
    assert_eq!(job.issue_id, "b");
    assert!(convoy.job_for_worker_mut("w-z").is_none());
}

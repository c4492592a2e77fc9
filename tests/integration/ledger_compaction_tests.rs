//! Cost ledger compaction against real files.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{Duration as StdDuration, Instant};

use chrono::{Duration, Utc};
use fs4::FileExt;

use agent_fleet::audit::AuditEventType;
use agent_fleet::cost::compaction::{compact_ledger, lock_path, retention_cutoff};
use agent_fleet::cost::ledger::read_entries;
use agent_fleet::cost::{CostGuard, CostLedgerEntry, CostLedgerStore, JsonlLedger};

use super::test_helpers::Harness;

fn entry(worker: &str, amount: f64, age_days: i64) -> CostLedgerEntry {
    CostLedgerEntry {
        worker_id: worker.into(),
        task_id: Some("iss-1".into()),
        amount,
        tier: None,
        input_tokens: None,
        output_tokens: None,
        timestamp: Utc::now() - Duration::days(age_days),
    }
}

fn hold_lock(ledger: &Path, exclusive: bool) -> File {
    let holder = OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(lock_path(ledger))
        .expect("lock file");
    if exclusive {
        FileExt::lock_exclusive(&holder).expect("hold lock");
    } else {
        FileExt::lock_shared(&holder).expect("hold lock");
    }
    holder
}

/// Log sink shared with a scoped subscriber.
#[derive(Clone, Default)]
struct CapturedLogs(Arc<Mutex<Vec<u8>>>);

impl CapturedLogs {
    fn text(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().expect("logs")).into_owned()
    }
}

impl Write for CapturedLogs {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().expect("logs").extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

fn with_captured_logs<T>(f: impl FnOnce() -> T) -> (T, String) {
    let logs = CapturedLogs::default();
    let sink = logs.clone();
    let subscriber = tracing_subscriber::fmt()
        .with_writer(move || sink.clone())
        .with_ansi(false)
        .finish();
    let out = tracing::subscriber::with_default(subscriber, f);
    (out, logs.text())
}

fn seed(path: &Path, entries: &[CostLedgerEntry]) {
    let ledger = JsonlLedger::open(path.to_owned()).expect("ledger");
    for e in entries {
        ledger.append(e).expect("append");
    }
}

#[test]
fn drops_entries_older_than_cutoff() {
    let temp = tempfile::tempdir().expect("tempdir");
    let path = temp.path().join("ledger.jsonl");
    seed(
        &path,
        &[entry("a", 1.0, 100), entry("b", 2.0, 10), entry("c", 3.0, 0)],
    );

    let outcome =
        compact_ledger(&path, retention_cutoff(30), StdDuration::from_secs(1)).expect("compact");
    assert_eq!(outcome.kept, 2);
    assert_eq!(outcome.dropped, 1);
    assert!(!outcome.forced);

    let workers: Vec<String> = read_entries(&path)
        .expect("read")
        .into_iter()
        .map(|e| e.worker_id)
        .collect();
    assert_eq!(workers, vec!["b", "c"]);
}

#[test]
fn compact_ledger_leaves_file_untouched_when_nothing_expires() {
    let temp = tempfile::tempdir().expect("tempdir");
    let path = temp.path().join("ledger.jsonl");
    seed(&path, &[entry("a", 1.0, 1)]);
    let before = fs::read_to_string(&path).expect("read");

    let outcome =
        compact_ledger(&path, retention_cutoff(30), StdDuration::from_secs(1)).expect("compact");
    assert_eq!(outcome.dropped, 0);
    assert_eq!(fs::read_to_string(&path).expect("read"), before);
}

#[test]
fn held_lock_forces_continuation_after_timeout() {
    let temp = tempfile::tempdir().expect("tempdir");
    let path = temp.path().join("ledger.jsonl");
    seed(&path, &[entry("a", 1.0, 100), entry("b", 1.0, 0)]);

    let holder = hold_lock(&path, true);

    let outcome =
        compact_ledger(&path, retention_cutoff(30), StdDuration::from_millis(150)).expect("compact");
    assert!(outcome.forced);
    assert_eq!(outcome.dropped, 1);

    FileExt::unlock(&holder).expect("release");
}

#[test]
fn append_waits_out_a_held_compaction_lock_then_proceeds() {
    let temp = tempfile::tempdir().expect("tempdir");
    let path = temp.path().join("ledger.jsonl");
    let ledger = JsonlLedger::open(path.clone())
        .expect("ledger")
        .with_lock_timeout(StdDuration::from_millis(200));
    let holder = hold_lock(&path, true);

    let started = Instant::now();
    let (appended, logs) = with_captured_logs(|| ledger.append(&entry("w", 1.0, 0)));
    appended.expect("append");

    assert!(started.elapsed() >= StdDuration::from_millis(200));
    assert!(logs.contains("ledger lock wait timed out"), "logs: {logs}");
    assert_eq!(read_entries(&path).expect("read").len(), 1);

    FileExt::unlock(&holder).expect("release");
}

#[test]
fn appends_share_the_lock_with_each_other() {
    let temp = tempfile::tempdir().expect("tempdir");
    let path = temp.path().join("ledger.jsonl");
    let ledger = JsonlLedger::open(path.clone())
        .expect("ledger")
        .with_lock_timeout(StdDuration::from_secs(5));
    let holder = hold_lock(&path, false);

    let started = Instant::now();
    let (appended, logs) = with_captured_logs(|| ledger.append(&entry("w", 1.0, 0)));
    appended.expect("append");

    assert!(started.elapsed() < StdDuration::from_secs(5));
    assert!(!logs.contains("timed out"), "logs: {logs}");
    assert_eq!(read_entries(&path).expect("read").len(), 1);

    FileExt::unlock(&holder).expect("release");
}

#[test]
fn lock_file_sits_next_to_the_ledger() {
    assert_eq!(
        lock_path(Path::new("/var/fleet/cost-ledger.jsonl")),
        Path::new("/var/fleet/cost-ledger.jsonl.lock")
    );
}

#[test]
fn guard_rebuild_after_compaction_forgets_dropped_spend() {
    let temp = tempfile::tempdir().expect("tempdir");
    let path = temp.path().join("ledger.jsonl");
    seed(&path, &[entry("a", 4.0, 100), entry("a", 1.5, 0)]);

    let guard = CostGuard::open(Arc::new(JsonlLedger::open(path.clone()).expect("ledger")))
        .expect("guard");
    assert!((guard.worker_total("a") - 5.5).abs() < 1e-9);

    compact_ledger(&path, retention_cutoff(30), StdDuration::from_secs(1)).expect("compact");
    assert_eq!(guard.rebuild().expect("rebuild"), 1);
    assert!((guard.worker_total("a") - 1.5).abs() < 1e-9);
}

#[tokio::test]
async fn control_loop_compaction_uses_configured_ledger() {
    let mut h = Harness::with_config("ledger_retention_days = 7\n");
    let path = h.settings.current().cost.ledger_path.clone();
    seed(&path, &[entry("w", 2.0, 30)]);
    h.cost.rebuild().expect("rebuild");
    assert!((h.cost.worker_total("w") - 2.0).abs() < 1e-9);

    let outcome = h.control.compact_ledger().await.expect("compact");
    assert_eq!(outcome.dropped, 1);
    assert!(h.cost.worker_total("w").abs() < 1e-9);
    assert_eq!(h.audit.of_type(AuditEventType::LedgerCompacted).len(), 1);
}

//! Cost ledger compaction.
//!
//! Compaction drops entries older than the retention window and rewrites
//! the ledger atomically through a temp file in the same directory.
//! Compaction holds an exclusive advisory lock on a sibling `<ledger>.lock`
//! file; appends hold it shared, so an append from another process (the
//! daemon while `agent-fleet-ctl compact-offline` runs) never lands between
//! the read and the rename. Every wait on that lock is bounded: after the
//! timeout the caller proceeds anyway and logs a warning.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use fs4::FileExt;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, warn};

use super::ledger::read_entries;
use crate::{AppError, Result};

/// Default bound on waiting for the ledger lock.
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(5);

const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(50);

const COMPACTION_INTERVAL: Duration = Duration::from_secs(24 * 3600);

/// What a compaction run did.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub struct CompactionOutcome {
    /// Entries kept.
    pub kept: usize,
    /// Entries dropped as older than the cutoff.
    pub dropped: usize,
    /// Whether the lock wait timed out and compaction went ahead anyway.
    pub forced: bool,
}

/// How a [`LedgerLock`] is held.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LockMode {
    /// Appends; many may hold it at once.
    Shared,
    /// Compaction and reset.
    Exclusive,
}

/// Held advisory lock; released on drop.
pub(crate) struct LedgerLock {
    file: File,
    held: bool,
}

impl LedgerLock {
    /// Poll for the lock until `timeout`, then give up waiting.
    pub(crate) fn acquire(path: &Path, mode: LockMode, timeout: Duration) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(path)
            .map_err(|err| {
                AppError::Ledger(format!("failed to open lock file {}: {err}", path.display()))
            })?;

        let started = Instant::now();
        loop {
            let locked = match mode {
                LockMode::Shared => FileExt::try_lock_shared(&file),
                LockMode::Exclusive => FileExt::try_lock_exclusive(&file),
            };
            if locked.is_ok() {
                return Ok(Self { file, held: true });
            }
            if started.elapsed() >= timeout {
                warn!(
                    lock = %path.display(),
                    ?mode,
                    waited_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
                    "ledger lock wait timed out; forcing continuation"
                );
                return Ok(Self { file, held: false });
            }
            std::thread::sleep(LOCK_POLL_INTERVAL);
        }
    }

    /// Whether the wait ended with the lock held.
    #[must_use]
    pub(crate) fn held(&self) -> bool {
        self.held
    }
}

impl Drop for LedgerLock {
    fn drop(&mut self) {
        if self.held {
            if let Err(err) = FileExt::unlock(&self.file) {
                warn!(%err, "failed to release ledger lock");
            }
        }
    }
}

/// Sibling lock file for a ledger path.
#[must_use]
pub fn lock_path(ledger: &Path) -> PathBuf {
    let mut name = ledger.file_name().unwrap_or_default().to_os_string();
    name.push(".lock");
    ledger.with_file_name(name)
}

/// Drop ledger entries older than `cutoff`.
///
/// # Errors
///
/// Returns `AppError::Ledger` if the ledger cannot be read or rewritten.
pub fn compact_ledger(
    ledger: &Path,
    cutoff: DateTime<Utc>,
    lock_timeout: Duration,
) -> Result<CompactionOutcome> {
    let span = info_span!("compact_ledger", ledger = %ledger.display());
    let _guard = span.enter();

    let lock = LedgerLock::acquire(&lock_path(ledger), LockMode::Exclusive, lock_timeout)?;

    let entries = read_entries(ledger)?;
    let total = entries.len();
    let kept: Vec<_> = entries
        .into_iter()
        .filter(|entry| entry.timestamp >= cutoff)
        .collect();
    let outcome = CompactionOutcome {
        kept: kept.len(),
        dropped: total - kept.len(),
        forced: !lock.held(),
    };

    if outcome.dropped == 0 {
        info!(kept = outcome.kept, "ledger already compact");
        return Ok(outcome);
    }

    let dir = ledger
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let mut tmp = tempfile::NamedTempFile::new_in(dir)
        .map_err(|err| AppError::Ledger(format!("failed to create temp ledger: {err}")))?;
    for entry in &kept {
        let line = serde_json::to_string(entry)?;
        writeln!(tmp, "{line}")
            .map_err(|err| AppError::Ledger(format!("failed to write temp ledger: {err}")))?;
    }
    tmp.as_file()
        .sync_all()
        .map_err(|err| AppError::Ledger(format!("failed to sync temp ledger: {err}")))?;
    tmp.persist(ledger)
        .map_err(|err| AppError::Ledger(format!("failed to replace ledger: {err}")))?;

    info!(
        kept = outcome.kept,
        dropped = outcome.dropped,
        forced = outcome.forced,
        "ledger compacted"
    );
    Ok(outcome)
}

/// Compaction cutoff for a retention window ending now.
#[must_use]
pub fn retention_cutoff(retention_days: u32) -> DateTime<Utc> {
    Utc::now() - chrono::Duration::days(i64::from(retention_days))
}

/// Spawn the daily maintenance trigger.
///
/// The task only signals; the receiver (the control loop) runs the
/// compaction so it never races the append path in this process.
#[must_use]
pub fn spawn_compaction_trigger(
    trigger: mpsc::Sender<()>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(COMPACTION_INTERVAL);
        // The first tick completes immediately; skip it so startup stays quiet.
        interval.tick().await;
        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    info!("ledger compaction trigger shutting down");
                    break;
                }
                _ = interval.tick() => {
                    if trigger.send(()).await.is_err() {
                        error!("control loop gone; stopping compaction trigger");
                        break;
                    }
                }
            }
        }
    })
}

//! Cost ledger storage.
//!
//! The ledger is append-only. [`JsonlLedger`] writes one JSON object per
//! line and skips malformed lines on replay; [`InMemoryLedger`] backs tests.
//! Appends and truncation take the compaction lock (shared and exclusive
//! respectively) with a short bounded wait.

use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use super::compaction::{lock_path, LedgerLock, LockMode};
use crate::models::tier::Tier;
use crate::{AppError, Result};

/// One recorded spend.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CostLedgerEntry {
    /// Worker that incurred the spend.
    pub worker_id: String,
    /// Task the spend is attributed to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    /// Amount in currency units.
    pub amount: f64,
    /// Tier, when recorded from token usage.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tier: Option<Tier>,
    /// Input tokens, when recorded from token usage.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_tokens: Option<u64>,
    /// Output tokens, when recorded from token usage.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_tokens: Option<u64>,
    /// When the spend was recorded.
    pub timestamp: DateTime<Utc>,
}

/// Append-only store for ledger entries.
pub trait CostLedgerStore: Send + Sync {
    /// Append one entry durably.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Ledger` if the write fails.
    fn append(&self, entry: &CostLedgerEntry) -> Result<()>;

    /// Every entry in append order.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Ledger` if the store cannot be read.
    fn read_all(&self) -> Result<Vec<CostLedgerEntry>>;

    /// Remove every entry.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Ledger` if the store cannot be cleared.
    fn truncate(&self) -> Result<()>;
}

/// Default bound on an append waiting out a compaction.
pub const APPEND_LOCK_TIMEOUT: Duration = Duration::from_secs(1);

/// JSONL ledger file.
pub struct JsonlLedger {
    path: PathBuf,
    lock_file: PathBuf,
    lock_timeout: Duration,
    // Serializes appends within this process.
    write_lock: Mutex<()>,
}

impl JsonlLedger {
    /// Open a ledger at `path`, creating parent directories.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Ledger` if the parent directory cannot be created.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|err| {
                AppError::Ledger(format!(
                    "failed to create ledger directory {}: {err}",
                    parent.display()
                ))
            })?;
        }
        Ok(Self {
            lock_file: lock_path(&path),
            path,
            lock_timeout: APPEND_LOCK_TIMEOUT,
            write_lock: Mutex::new(()),
        })
    }

    /// Bound the wait on a compaction holding the ledger lock.
    #[must_use]
    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    /// Ledger file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Parse a JSONL ledger file, skipping malformed lines.
///
/// A missing file is an empty ledger.
///
/// # Errors
///
/// Returns `AppError::Ledger` if the file exists but cannot be read.
pub fn read_entries(path: &Path) -> Result<Vec<CostLedgerEntry>> {
    let file = match fs::File::open(path) {
        Ok(file) => file,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => {
            return Err(AppError::Ledger(format!(
                "failed to open ledger {}: {err}",
                path.display()
            )))
        }
    };

    let mut entries = Vec::new();
    for (index, line) in BufReader::new(file).lines().enumerate() {
        let line = line.map_err(|err| AppError::Ledger(format!("failed to read ledger: {err}")))?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<CostLedgerEntry>(&line) {
            Ok(entry) => entries.push(entry),
            Err(err) => warn!(line = index + 1, %err, "skipping malformed ledger line"),
        }
    }
    Ok(entries)
}

impl CostLedgerStore for JsonlLedger {
    fn append(&self, entry: &CostLedgerEntry) -> Result<()> {
        let _guard = self
            .write_lock
            .lock()
            .map_err(|_| AppError::Ledger("ledger mutex poisoned".into()))?;

        let mut line = serde_json::to_string(entry)?;
        line.push('\n');

        let _lock = LedgerLock::acquire(&self.lock_file, LockMode::Shared, self.lock_timeout)?;

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|err| {
                AppError::Ledger(format!("failed to open ledger {}: {err}", self.path.display()))
            })?;
        file.write_all(line.as_bytes())
            .and_then(|()| file.flush())
            .map_err(|err| AppError::Ledger(format!("failed to append to ledger: {err}")))
    }

    fn read_all(&self) -> Result<Vec<CostLedgerEntry>> {
        read_entries(&self.path)
    }

    fn truncate(&self) -> Result<()> {
        let _guard = self
            .write_lock
            .lock()
            .map_err(|_| AppError::Ledger("ledger mutex poisoned".into()))?;
        let _lock = LedgerLock::acquire(&self.lock_file, LockMode::Exclusive, self.lock_timeout)?;
        fs::File::create(&self.path).map(drop).map_err(|err| {
            AppError::Ledger(format!("failed to truncate ledger {}: {err}", self.path.display()))
        })
    }
}

/// Ledger held in memory.
#[derive(Debug, Default)]
pub struct InMemoryLedger {
    entries: Mutex<Vec<CostLedgerEntry>>,
}

impl InMemoryLedger {
    /// Create an empty ledger.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl CostLedgerStore for InMemoryLedger {
    fn append(&self, entry: &CostLedgerEntry) -> Result<()> {
        self.entries
            .lock()
            .map_err(|_| AppError::Ledger("ledger mutex poisoned".into()))?
            .push(entry.clone());
        Ok(())
    }

    fn read_all(&self) -> Result<Vec<CostLedgerEntry>> {
        Ok(self
            .entries
            .lock()
            .map_err(|_| AppError::Ledger("ledger mutex poisoned".into()))?
            .clone())
    }

    fn truncate(&self) -> Result<()> {
        self.entries
            .lock()
            .map_err(|_| AppError::Ledger("ledger mutex poisoned".into()))?
            .clear();
        Ok(())
    }
}

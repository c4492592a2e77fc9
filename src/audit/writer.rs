//! Daily JSONL audit files.

use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::sync::Mutex;

use chrono::{NaiveDate, Utc};
use tracing::{debug, warn};

use super::{AuditEntry, AuditLogger};
use crate::{AppError, Result};

/// The file currently receiving entries.
struct DayFile {
    date: NaiveDate,
    out: BufWriter<File>,
}

/// Audit sink writing `<dir>/fleet-YYYY-MM-DD.jsonl`, one entry per line.
///
/// The UTC date is checked on every write; the first write of a new day
/// switches to that day's file. Each entry is flushed before `log_entry`
/// returns.
pub struct JsonlAuditWriter {
    dir: PathBuf,
    current: Mutex<Option<DayFile>>,
}

impl JsonlAuditWriter {
    /// Writer rooted at `dir`, created with its parents when missing.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Io` if the directory cannot be created.
    pub fn new(dir: PathBuf) -> Result<Self> {
        fs::create_dir_all(&dir).map_err(|err| {
            AppError::Io(format!("failed to create audit dir {}: {err}", dir.display()))
        })?;
        Ok(Self {
            dir,
            current: Mutex::new(None),
        })
    }

    /// File that holds entries written on `date`.
    #[must_use]
    pub fn path_for_date(&self, date: NaiveDate) -> PathBuf {
        self.dir.join(format!("fleet-{date}.jsonl"))
    }

    fn open_day(&self, date: NaiveDate) -> Result<DayFile> {
        let path = self.path_for_date(date);
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|err| AppError::Io(format!("failed to open {}: {err}", path.display())))?;
        debug!(path = %path.display(), "audit file opened");
        Ok(DayFile {
            date,
            out: BufWriter::new(file),
        })
    }
}

impl AuditLogger for JsonlAuditWriter {
    fn log_entry(&self, entry: AuditEntry) -> Result<()> {
        let line = serde_json::to_string(&entry)?;
        let today = Utc::now().date_naive();

        let mut current = self
            .current
            .lock()
            .map_err(|_| AppError::Io("audit writer lock poisoned".into()))?;
        let day = match current.take() {
            Some(day) if day.date == today => day,
            _ => self.open_day(today)?,
        };
        let day = current.insert(day);

        writeln!(day.out, "{line}")
            .and_then(|()| day.out.flush())
            .map_err(|err| {
                warn!(%err, "audit write failed");
                AppError::Io(format!("audit write failed: {err}"))
            })
    }
}

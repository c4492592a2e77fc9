//! Transcript health scan.
//!
//! Worker sessions leave JSONL transcripts behind. A transcript can show
//! that a session is wedged even when its process is alive: a loop of
//! `Warmup` tool errors, runaway message counts, one command retried over
//! and over, or a file that keeps growing. [`scan_transcripts`] walks a
//! directory and reports each of these.

use std::collections::HashMap;
use std::fs;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use serde::Serialize;
use serde_json::Value;
use tracing::{info, warn};

use crate::{AppError, Result};

/// More warmup errors than this is a critical loop.
pub const WARMUP_ERROR_LIMIT: u64 = 10;
/// More messages than this is excessive.
pub const MESSAGE_LIMIT: u64 = 500;
/// A single command repeated more often than this is a retry loop.
pub const REPEATED_COMMAND_LIMIT: u64 = 50;
/// Files larger than this many KiB are flagged.
pub const SIZE_LIMIT_KB: f64 = 2000.0;

const TOP_COMMANDS: usize = 5;
const COMMAND_PREVIEW_CHARS: usize = 50;

/// Issue severity.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    /// Worth a look.
    Warning,
    /// The session is wedged.
    Critical,
}

/// One finding in a transcript.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct TranscriptIssue {
    /// Severity.
    pub severity: Severity,
    /// Description.
    pub message: String,
}

/// Scan result for one transcript file.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct TranscriptReport {
    /// File path.
    pub path: PathBuf,
    /// File size in KiB.
    pub size_kb: f64,
    /// Line count.
    pub message_count: u64,
    /// Tool results reporting a `Warmup` error.
    pub warmup_errors: u64,
    /// Whether any message is marked as a sidechain.
    pub is_sidechain: bool,
    /// Most frequent tool commands, highest first.
    pub top_commands: Vec<(String, u64)>,
    /// Findings.
    pub issues: Vec<TranscriptIssue>,
}

impl TranscriptReport {
    /// Whether any finding is critical.
    #[must_use]
    pub fn is_critical(&self) -> bool {
        self.issues.iter().any(|i| i.severity == Severity::Critical)
    }

    fn flag(&mut self, severity: Severity, message: String) {
        self.issues.push(TranscriptIssue { severity, message });
    }
}

fn content_items(message: &Value) -> impl Iterator<Item = &Value> {
    message
        .pointer("/message/content")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter(|item| item.is_object())
}

fn is_warmup_error(item: &Value) -> bool {
    item.get("content").and_then(Value::as_str) == Some("Warmup")
        && item.get("is_error").and_then(Value::as_bool) == Some(true)
}

/// Tool command for a `tool_use` item: its `input.command`, else its name.
fn tool_command(item: &Value) -> Option<String> {
    if item.get("type").and_then(Value::as_str) != Some("tool_use") {
        return None;
    }
    let input = item.get("input").filter(|v| v.is_object())?;
    let command = input
        .get("command")
        .and_then(Value::as_str)
        .or_else(|| item.get("name").and_then(Value::as_str))
        .unwrap_or("unknown");
    Some(command.to_owned())
}

/// Analyse one transcript. Read failures are reported as a finding.
#[must_use]
pub fn analyze_transcript(path: &Path) -> TranscriptReport {
    #[allow(clippy::cast_precision_loss)] // file sizes stay far below 2^52
    let size_kb = fs::metadata(path).map_or(0.0, |m| m.len() as f64 / 1024.0);
    let mut report = TranscriptReport {
        path: path.to_path_buf(),
        size_kb,
        message_count: 0,
        warmup_errors: 0,
        is_sidechain: false,
        top_commands: Vec::new(),
        issues: Vec::new(),
    };

    let file = match fs::File::open(path) {
        Ok(file) => file,
        Err(err) => {
            report.flag(Severity::Warning, format!("error reading file: {err}"));
            return report;
        }
    };

    let mut commands: HashMap<String, u64> = HashMap::new();
    for line in BufReader::new(file).lines() {
        let line = match line {
            Ok(line) => line,
            Err(err) => {
                report.flag(Severity::Warning, format!("error reading file: {err}"));
                return report;
            }
        };
        report.message_count += 1;
        let Ok(message) = serde_json::from_str::<Value>(&line) else {
            continue;
        };

        if message.get("isSidechain").and_then(Value::as_bool) == Some(true) {
            report.is_sidechain = true;
        }
        match message.get("type").and_then(Value::as_str) {
            Some("user") => {
                let warmups = content_items(&message).filter(|i| is_warmup_error(i)).count();
                report.warmup_errors += u64::try_from(warmups).unwrap_or(u64::MAX);
            }
            Some("assistant") => {
                for command in content_items(&message).filter_map(tool_command) {
                    *commands.entry(command).or_default() += 1;
                }
            }
            _ => {}
        }
    }

    let mut ranked: Vec<(String, u64)> = commands.into_iter().collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    ranked.truncate(TOP_COMMANDS);
    report.top_commands = ranked;

    if report.warmup_errors > WARMUP_ERROR_LIMIT {
        let message = format!("warmup loop detected ({} warmup errors)", report.warmup_errors);
        report.flag(Severity::Critical, message);
    }
    if report.message_count > MESSAGE_LIMIT {
        let message = format!("excessive messages ({})", report.message_count);
        report.flag(Severity::Warning, message);
    }
    let repeated: Vec<String> = report
        .top_commands
        .iter()
        .filter(|(_, count)| *count > REPEATED_COMMAND_LIMIT)
        .map(|(command, count)| {
            let preview: String = command.chars().take(COMMAND_PREVIEW_CHARS).collect();
            format!("command repeated {count}x: {preview}")
        })
        .collect();
    for message in repeated {
        report.flag(Severity::Warning, message);
    }
    if report.size_kb > SIZE_LIMIT_KB {
        let message = format!("large session file ({:.0}KB)", report.size_kb);
        report.flag(Severity::Warning, message);
    }

    report
}

/// Analyse every `*.jsonl` file below `dir`, in path order.
///
/// # Errors
///
/// Returns `AppError::NotFound` if `dir` does not exist and
/// `AppError::Config` if it cannot be turned into a glob pattern.
pub fn scan_transcripts(dir: &Path) -> Result<Vec<TranscriptReport>> {
    if !dir.is_dir() {
        return Err(AppError::NotFound(format!("directory {}", dir.display())));
    }
    let pattern = dir.join("**").join("*.jsonl");
    let pattern = pattern
        .to_str()
        .ok_or_else(|| AppError::Config(format!("non-UTF-8 path: {}", dir.display())))?;
    let paths = glob::glob(pattern)
        .map_err(|err| AppError::Config(format!("invalid scan pattern: {err}")))?;

    let mut files: Vec<PathBuf> = paths
        .filter_map(|entry| match entry {
            Ok(path) => Some(path),
            Err(err) => {
                warn!(%err, "skipping unreadable transcript path");
                None
            }
        })
        .collect();
    files.sort();

    let reports: Vec<TranscriptReport> = files.iter().map(|p| analyze_transcript(p)).collect();
    info!(
        dir = %dir.display(),
        scanned = reports.len(),
        problematic = reports.iter().filter(|r| !r.issues.is_empty()).count(),
        "transcript scan complete"
    );
    Ok(reports)
}

/// Delete transcripts with a critical finding. Returns the removed paths.
///
/// # Errors
///
/// Returns `AppError::Io` on the first file that cannot be removed.
pub fn remove_critical(reports: &[TranscriptReport]) -> Result<Vec<PathBuf>> {
    let mut removed = Vec::new();
    for report in reports.iter().filter(|r| r.is_critical()) {
        fs::remove_file(&report.path)?;
        warn!(path = %report.path.display(), "removed wedged transcript");
        removed.push(report.path.clone());
    }
    Ok(removed)
}

//! Tracker backed by an external CLI that prints JSON.

use std::process::Stdio;
use std::time::Duration;

use serde::Deserialize;
use tokio::process::Command;
use tracing::debug;

use crate::config::TrackerConfig;
use crate::{AppError, BoxFuture, Result};

use super::{SubTask, Tracker};

const TRACKER_TIMEOUT: Duration = Duration::from_secs(15);

/// Accepts either a bare array or an object wrapping `issues`.
#[derive(Deserialize)]
#[serde(untagged)]
enum Listing {
    Bare(Vec<SubTask>),
    Wrapped { issues: Vec<SubTask> },
}

/// Shells out to the configured tracker CLI.
///
/// `{task}` in the configured arguments is replaced by the task reference.
#[derive(Debug, Clone)]
pub struct CommandTracker {
    config: TrackerConfig,
}

impl CommandTracker {
    /// Create a tracker from configuration.
    #[must_use]
    pub fn new(config: TrackerConfig) -> Self {
        Self { config }
    }

    /// Arguments for a task reference.
    #[must_use]
    pub fn args_for(&self, task_ref: &str) -> Vec<String> {
        self.config
            .args
            .iter()
            .map(|arg| arg.replace("{task}", task_ref))
            .collect()
    }
}

/// Parse tracker JSON output.
///
/// # Errors
///
/// Returns `AppError::Tracker` if the output is not a sub-task listing.
pub fn parse_listing(raw: &[u8]) -> Result<Vec<SubTask>> {
    let listing: Listing = serde_json::from_slice(raw)
        .map_err(|err| AppError::Tracker(format!("unparseable tracker output: {err}")))?;
    Ok(match listing {
        Listing::Bare(tasks) | Listing::Wrapped { issues: tasks } => tasks,
    })
}

impl Tracker for CommandTracker {
    fn list_sub_tasks<'a>(&'a self, task_ref: &'a str) -> BoxFuture<'a, Result<Vec<SubTask>>> {
        Box::pin(async move {
            let mut cmd = Command::new(&self.config.command);
            cmd.args(self.args_for(task_ref))
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .kill_on_drop(true);

            let output = tokio::time::timeout(TRACKER_TIMEOUT, cmd.output())
                .await
                .map_err(|_| AppError::Tracker(format!("{} timed out", self.config.command)))?
                .map_err(|err| {
                    AppError::Tracker(format!("failed to run {}: {err}", self.config.command))
                })?;

            if !output.status.success() {
                let stderr = String::from_utf8_lossy(&output.stderr);
                return Err(AppError::Tracker(format!(
                    "{} failed: {}",
                    self.config.command,
                    stderr.trim()
                )));
            }

            let tasks = parse_listing(&output.stdout)?;
            debug!(task_ref, count = tasks.len(), "tracker listing");
            Ok(tasks)
        })
    }
}

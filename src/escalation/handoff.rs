//! Handoff context capture and transfer document rendering.
//!
//! Capture is best-effort: a missing file, a workspace that is not a git
//! repository, or an unreachable tracker leaves the corresponding section
//! empty and records a note instead of failing the handoff.

use std::fmt::Write as _;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::models::tier::{Specialist, Tier};
use crate::models::worker::Worker;
use crate::tracker::{SubTask, SubTaskStatus, Tracker};

use super::{HandoffTarget, TriggerDetection, TriggerType};

const GIT_TIMEOUT: Duration = Duration::from_secs(10);

/// Snapshot of one workspace file.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct FileSnapshot {
    /// Workspace-relative path.
    pub path: String,
    /// Content, cut at the configured byte budget.
    pub content: String,
    /// Whether the content was cut.
    pub truncated: bool,
}

/// Version control state of the workspace.
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct VcsState {
    /// Current branch.
    pub branch: Option<String>,
    /// `git status --porcelain` lines.
    pub status: Vec<String>,
    /// Last commit as `<short-hash> <subject>`.
    pub last_commit: Option<String>,
}

/// Tracked sub-tasks split by progress, each sorted by id.
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct TaskPartition {
    /// Closed sub-tasks.
    pub completed: Vec<SubTask>,
    /// In-progress sub-tasks.
    pub active: Vec<SubTask>,
    /// Not-yet-started sub-tasks.
    pub remaining: Vec<SubTask>,
}

impl TaskPartition {
    /// Partition sub-tasks by status.
    #[must_use]
    pub fn from_tasks(mut tasks: Vec<SubTask>) -> Self {
        tasks.sort_by(|a, b| a.id.cmp(&b.id));
        let mut partition = Self::default();
        for task in tasks {
            match task.status {
                SubTaskStatus::Closed => partition.completed.push(task),
                SubTaskStatus::InProgress => partition.active.push(task),
                SubTaskStatus::Open => partition.remaining.push(task),
            }
        }
        partition
    }
}

/// Everything a replacement worker needs to resume a task.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct HandoffContext {
    /// Worker handing off.
    pub worker_id: String,
    /// Task being handed off.
    pub task_ref: Option<String>,
    /// Tier of the worker handing off.
    pub source_tier: Tier,
    /// Specialist role of the worker handing off.
    pub source_role: Option<Specialist>,
    /// Where the task goes.
    pub target: HandoffTarget,
    /// Trigger that caused the handoff.
    pub trigger: TriggerType,
    /// Trigger explanation.
    pub reason: String,
    /// Workspace files in configured order.
    pub files: Vec<FileSnapshot>,
    /// VCS state.
    pub vcs: VcsState,
    /// Tracker partition.
    pub tasks: TaskPartition,
    /// Earlier summaries in this task's lineage, oldest first.
    pub summaries: Vec<String>,
    /// Capture problems, recorded instead of failing the handoff.
    pub notes: Vec<String>,
    /// Handoffs so far in the lineage, including this one.
    pub handoff_count: u32,
    /// Spend so far on the handing-off worker.
    pub spend: f64,
    /// Capture time.
    pub captured_at: DateTime<Utc>,
}

/// Read workspace files in order, each cut at `max_bytes` on a char boundary.
/// Missing files are skipped.
pub async fn capture_files(workspace: &Path, paths: &[String], max_bytes: usize) -> Vec<FileSnapshot> {
    let mut files = Vec::new();
    for rel in paths {
        let full = workspace.join(rel);
        match tokio::fs::read(&full).await {
            Ok(bytes) => {
                let text = String::from_utf8_lossy(&bytes);
                let (content, truncated) = truncate_utf8(&text, max_bytes);
                files.push(FileSnapshot {
                    path: rel.clone(),
                    content: content.to_owned(),
                    truncated,
                });
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => warn!(path = %full.display(), %err, "failed to read handoff artifact"),
        }
    }
    files
}

fn truncate_utf8(text: &str, max_bytes: usize) -> (&str, bool) {
    if text.len() <= max_bytes {
        return (text, false);
    }
    let mut end = max_bytes;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    (&text[..end], true)
}

async fn run_git(workspace: &Path, args: &[&str]) -> Option<String> {
    let mut cmd = Command::new("git");
    cmd.args(args)
        .current_dir(workspace)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    let output = tokio::time::timeout(GIT_TIMEOUT, cmd.output()).await.ok()?.ok()?;
    if !output.status.success() {
        debug!(args = args.join(" "), "git command failed");
        return None;
    }
    Some(String::from_utf8_lossy(&output.stdout).trim_end().to_owned())
}

/// Capture branch, porcelain status and last commit. Fields stay empty
/// outside a git repository.
pub async fn capture_vcs(workspace: &Path) -> VcsState {
    let branch = run_git(workspace, &["rev-parse", "--abbrev-ref", "HEAD"])
        .await
        .filter(|b| !b.is_empty());
    let status = run_git(workspace, &["status", "--porcelain"])
        .await
        .map(|out| out.lines().map(str::to_owned).collect())
        .unwrap_or_default();
    let last_commit = run_git(workspace, &["log", "-1", "--format=%h %s"])
        .await
        .filter(|c| !c.is_empty());
    VcsState {
        branch,
        status,
        last_commit,
    }
}

/// Inputs for [`capture_context`] beyond the worker itself.
#[derive(Debug, Clone)]
pub struct CaptureRequest<'a> {
    /// Positive detection being acted on.
    pub detection: &'a TriggerDetection,
    /// Resolved target.
    pub target: HandoffTarget,
    /// Earlier lineage summaries.
    pub summaries: Vec<String>,
    /// Files to snapshot.
    pub artifact_paths: &'a [String],
    /// Per-file byte budget.
    pub max_artifact_bytes: usize,
}

/// Gather the full handoff context for a worker.
pub async fn capture_context(
    worker: &Worker,
    request: CaptureRequest<'_>,
    tracker: &dyn Tracker,
) -> HandoffContext {
    let workspace = Path::new(&worker.workspace_root);
    let mut notes = Vec::new();

    let files = capture_files(workspace, request.artifact_paths, request.max_artifact_bytes).await;
    let vcs = capture_vcs(workspace).await;
    if vcs.branch.is_none() {
        notes.push("workspace VCS state unavailable".to_owned());
    }

    let tasks = match &worker.task_ref {
        Some(task_ref) => match tracker.list_sub_tasks(task_ref).await {
            Ok(tasks) => TaskPartition::from_tasks(tasks),
            Err(err) => {
                warn!(worker_id = %worker.id, %err, "tracker unavailable during handoff capture");
                notes.push(format!("tracker unavailable: {err}"));
                TaskPartition::default()
            }
        },
        None => TaskPartition::default(),
    };

    HandoffContext {
        worker_id: worker.id.clone(),
        task_ref: worker.task_ref.clone(),
        source_tier: worker.tier,
        source_role: worker.role,
        target: request.target,
        trigger: request.detection.trigger,
        reason: request.detection.reason.clone(),
        files,
        vcs,
        tasks,
        summaries: request.summaries,
        notes,
        handoff_count: worker.handoff_count + 1,
        spend: worker.spend,
        captured_at: Utc::now(),
    }
}

fn write_tasks(doc: &mut String, heading: &str, tasks: &[SubTask]) {
    let _ = writeln!(doc, "### {heading}");
    if tasks.is_empty() {
        let _ = writeln!(doc, "- (none)");
    }
    for task in tasks {
        let _ = writeln!(doc, "- [{}] {}", task.id, task.title);
    }
    doc.push('\n');
}

/// Render the transfer document given to the replacement worker.
///
/// Output depends only on `context`; sections always appear in the same
/// order: handoff, version control, tasks, prior summaries, workspace files.
#[must_use]
pub fn render_transfer_document(context: &HandoffContext) -> String {
    let mut doc = String::new();

    // A specialist escalated by tier keeps its instruction.
    let role = match context.target {
        HandoffTarget::Specialist(role) => Some(role),
        HandoffTarget::Tier(_) => context.source_role,
    };
    if let Some(role) = role {
        let _ = writeln!(doc, "{}\n", role.instruction());
    }

    let _ = writeln!(doc, "# Handoff");
    let _ = writeln!(doc);
    if let Some(task) = &context.task_ref {
        let _ = writeln!(doc, "- Task: {task}");
    }
    let _ = writeln!(doc, "- From: {} (tier {})", context.worker_id, context.source_tier);
    let _ = writeln!(doc, "- To: {}", context.target);
    let _ = writeln!(doc, "- Trigger: {}", context.trigger);
    let _ = writeln!(doc, "- Reason: {}", context.reason);
    let _ = writeln!(doc, "- Handoff count: {}", context.handoff_count);
    let _ = writeln!(doc, "- Spend so far: {:.2}", context.spend);
    let _ = writeln!(doc, "- Captured at: {}", context.captured_at.to_rfc3339());
    for note in &context.notes {
        let _ = writeln!(doc, "- Note: {note}");
    }
    doc.push('\n');

    let _ = writeln!(doc, "## Version control");
    let _ = writeln!(doc);
    let vcs = &context.vcs;
    let _ = writeln!(doc, "- Branch: {}", vcs.branch.as_deref().unwrap_or("(unknown)"));
    let _ = writeln!(doc, "- Last commit: {}", vcs.last_commit.as_deref().unwrap_or("(none)"));
    if vcs.status.is_empty() {
        let _ = writeln!(doc, "- Working tree clean");
    } else {
        let _ = writeln!(doc, "- Uncommitted changes:");
        let _ = writeln!(doc, "```");
        for line in &vcs.status {
            let _ = writeln!(doc, "{line}");
        }
        let _ = writeln!(doc, "```");
    }
    doc.push('\n');

    let _ = writeln!(doc, "## Tasks");
    let _ = writeln!(doc);
    write_tasks(&mut doc, "Completed", &context.tasks.completed);
    write_tasks(&mut doc, "Active", &context.tasks.active);
    write_tasks(&mut doc, "Remaining", &context.tasks.remaining);

    let _ = writeln!(doc, "## Prior summaries");
    let _ = writeln!(doc);
    if context.summaries.is_empty() {
        let _ = writeln!(doc, "(none)");
    }
    for (index, summary) in context.summaries.iter().enumerate() {
        let _ = writeln!(doc, "{}. {summary}", index + 1);
    }
    doc.push('\n');

    let _ = writeln!(doc, "## Workspace files");
    let _ = writeln!(doc);
    if context.files.is_empty() {
        let _ = writeln!(doc, "(none)");
    }
    for file in &context.files {
        let marker = if file.truncated { " (truncated)" } else { "" };
        let _ = writeln!(doc, "### {}{marker}", file.path);
        let _ = writeln!(doc, "```");
        let _ = writeln!(doc, "{}", file.content.trim_end());
        let _ = writeln!(doc, "```");
        doc.push('\n');
    }

    doc
}

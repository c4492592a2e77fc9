//! Issue tracker abstraction.
//!
//! Escalation reads sub-task state for a worker's task through the
//! [`Tracker`] trait. [`CommandTracker`] shells out to a tracker CLI;
//! [`InMemoryTracker`] backs tests.

pub mod command;
pub mod memory;

use serde::{Deserialize, Serialize};

use crate::{BoxFuture, Result};

pub use command::CommandTracker;
pub use memory::InMemoryTracker;

/// Sub-task status as reported by the tracker.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SubTaskStatus {
    /// Not started.
    #[serde(alias = "todo", alias = "pending")]
    Open,
    /// Being worked on.
    #[serde(alias = "in-progress", alias = "active")]
    InProgress,
    /// Finished.
    #[serde(alias = "done", alias = "completed", alias = "resolved")]
    Closed,
}

/// One sub-task of a worker's task.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SubTask {
    /// Tracker identifier.
    pub id: String,
    /// Title used for phase classification.
    pub title: String,
    /// Current status.
    pub status: SubTaskStatus,
}

/// Read-only view of a task's sub-tasks.
pub trait Tracker: Send + Sync {
    /// Every sub-task of `task_ref`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Tracker` if the tracker is unreachable or its
    /// response cannot be parsed.
    fn list_sub_tasks<'a>(&'a self, task_ref: &'a str) -> BoxFuture<'a, Result<Vec<SubTask>>>;

    /// Sub-tasks of `task_ref` that are not closed.
    ///
    /// # Errors
    ///
    /// Propagates [`Tracker::list_sub_tasks`] failures.
    fn list_open_sub_tasks<'a>(
        &'a self,
        task_ref: &'a str,
    ) -> BoxFuture<'a, Result<Vec<SubTask>>> {
        Box::pin(async move {
            let tasks = self.list_sub_tasks(task_ref).await?;
            Ok(tasks
                .into_iter()
                .filter(|task| task.status != SubTaskStatus::Closed)
                .collect())
        })
    }
}

//! In-memory tracker for tests.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::{AppError, BoxFuture, Result};

use super::{SubTask, SubTaskStatus, Tracker};

#[derive(Debug, Default)]
struct State {
    tasks: HashMap<String, Vec<SubTask>>,
    unavailable: bool,
}

/// Tracker double holding sub-tasks per task reference.
#[derive(Debug, Default)]
pub struct InMemoryTracker {
    state: Mutex<State>,
}

impl InMemoryTracker {
    /// Create an empty tracker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut State) -> T) -> T {
        let mut guard = self
            .state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        f(&mut guard)
    }

    /// Replace the sub-tasks of a task.
    pub fn set_sub_tasks(&self, task_ref: &str, tasks: Vec<SubTask>) {
        self.with_state(|s| {
            s.tasks.insert(task_ref.to_owned(), tasks);
        });
    }

    /// Update one sub-task's status.
    pub fn set_status(&self, task_ref: &str, sub_task_id: &str, status: SubTaskStatus) {
        self.with_state(|s| {
            if let Some(task) = s
                .tasks
                .get_mut(task_ref)
                .and_then(|tasks| tasks.iter_mut().find(|t| t.id == sub_task_id))
            {
                task.status = status;
            }
        });
    }

    /// Make every call fail as if the tracker were down.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.with_state(|s| s.unavailable = unavailable);
    }
}

impl Tracker for InMemoryTracker {
    fn list_sub_tasks<'a>(&'a self, task_ref: &'a str) -> BoxFuture<'a, Result<Vec<SubTask>>> {
        Box::pin(async move {
            self.with_state(|s| {
                if s.unavailable {
                    return Err(AppError::Tracker("tracker unavailable".into()));
                }
                Ok(s.tasks.get(task_ref).cloned().unwrap_or_default())
            })
        })
    }
}

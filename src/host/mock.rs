//! In-memory process host for tests and dry runs.
//!
//! Sessions are plain records; tests drive liveness and heartbeats through
//! the setter methods and inspect what the control plane asked for.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use chrono::{DateTime, Utc};

use crate::models::tier::Tier;
use crate::{AppError, BoxFuture, Result};

use super::{Heartbeat, ProcessHost};

/// A recorded spawn request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpawnRecord {
    /// Session name.
    pub worker_id: String,
    /// Workspace directory.
    pub workspace_root: String,
    /// Requested tier.
    pub tier: Tier,
    /// Initial prompt.
    pub prompt: String,
}

#[derive(Debug, Default)]
struct MockState {
    running: HashSet<String>,
    heartbeats: HashMap<String, Heartbeat>,
    spawns: Vec<SpawnRecord>,
    kills: Vec<String>,
    inputs: Vec<(String, String)>,
    fail_spawn: HashSet<String>,
    fail_all_spawns: bool,
}

/// Process host double with scriptable sessions.
#[derive(Debug, Default)]
pub struct MockHost {
    state: Mutex<MockState>,
}

impl MockHost {
    /// Create an empty host.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut MockState) -> T) -> T {
        let mut guard = self
            .state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        f(&mut guard)
    }

    /// Mark a session alive or dead.
    pub fn set_running(&self, worker_id: &str, running: bool) {
        self.with_state(|s| {
            if running {
                s.running.insert(worker_id.to_owned());
            } else {
                s.running.remove(worker_id);
            }
        });
    }

    /// Set the heartbeat returned for a session.
    pub fn set_heartbeat(&self, worker_id: &str, timestamp: DateTime<Utc>, recent_output: &str) {
        self.with_state(|s| {
            s.heartbeats.insert(
                worker_id.to_owned(),
                Heartbeat {
                    timestamp,
                    recent_output: recent_output.to_owned(),
                },
            );
        });
    }

    /// Make spawns of a specific session fail.
    pub fn fail_spawn_for(&self, worker_id: &str) {
        self.with_state(|s| {
            s.fail_spawn.insert(worker_id.to_owned());
        });
    }

    /// Make every spawn fail.
    pub fn fail_all_spawns(&self, fail: bool) {
        self.with_state(|s| s.fail_all_spawns = fail);
    }

    /// Every spawn request in order.
    #[must_use]
    pub fn spawns(&self) -> Vec<SpawnRecord> {
        self.with_state(|s| s.spawns.clone())
    }

    /// Every killed session in order.
    #[must_use]
    pub fn kills(&self) -> Vec<String> {
        self.with_state(|s| s.kills.clone())
    }

    /// Every input delivered to a session.
    #[must_use]
    pub fn inputs_for(&self, worker_id: &str) -> Vec<String> {
        self.with_state(|s| {
            s.inputs
                .iter()
                .filter(|(id, _)| id == worker_id)
                .map(|(_, text)| text.clone())
                .collect()
        })
    }

    /// Currently alive sessions, sorted.
    #[must_use]
    pub fn running(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.with_state(|s| s.running.iter().cloned().collect());
        ids.sort();
        ids
    }
}

impl ProcessHost for MockHost {
    fn spawn<'a>(
        &'a self,
        worker_id: &'a str,
        workspace_root: &'a str,
        tier: Tier,
        initial_prompt: &'a str,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            self.with_state(|s| {
                s.spawns.push(SpawnRecord {
                    worker_id: worker_id.to_owned(),
                    workspace_root: workspace_root.to_owned(),
                    tier,
                    prompt: initial_prompt.to_owned(),
                });
                if s.fail_all_spawns || s.fail_spawn.contains(worker_id) {
                    return Err(AppError::Host(format!("spawn refused for {worker_id}")));
                }
                s.running.insert(worker_id.to_owned());
                s.heartbeats.remove(worker_id);
                Ok(())
            })
        })
    }

    fn is_running<'a>(&'a self, worker_id: &'a str) -> BoxFuture<'a, bool> {
        Box::pin(async move { self.with_state(|s| s.running.contains(worker_id)) })
    }

    fn heartbeat<'a>(&'a self, worker_id: &'a str) -> BoxFuture<'a, Option<Heartbeat>> {
        Box::pin(async move { self.with_state(|s| s.heartbeats.get(worker_id).cloned()) })
    }

    fn kill<'a>(&'a self, worker_id: &'a str) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            self.with_state(|s| {
                s.kills.push(worker_id.to_owned());
                if s.running.remove(worker_id) {
                    Ok(())
                } else {
                    Err(AppError::Host(format!("no session {worker_id}")))
                }
            })
        })
    }

    fn send_input<'a>(&'a self, worker_id: &'a str, text: &'a str) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            self.with_state(|s| {
                if !s.running.contains(worker_id) {
                    return Err(AppError::Host(format!("no session {worker_id}")));
                }
                s.inputs.push((worker_id.to_owned(), text.to_owned()));
                Ok(())
            })
        })
    }
}

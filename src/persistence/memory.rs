//! In-memory stores for tests and ephemeral runs.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};

use crate::models::convoy::{Convoy, ConvoyStatus};
use crate::models::worker::{Worker, WorkerStatus};
use crate::{BoxFuture, Result};

use super::{ConvoyStore, WorkerStore};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

fn sorted_by_creation<T>(
    items: impl Iterator<Item = T>,
    key: impl Fn(&T) -> (DateTime<Utc>, String),
) -> Vec<T> {
    let mut out: Vec<T> = items.collect();
    out.sort_by_key(key);
    out
}

/// Worker store held in memory.
#[derive(Debug, Default)]
pub struct InMemoryWorkerStore {
    workers: Mutex<BTreeMap<String, Worker>>,
    archived: Mutex<Vec<Worker>>,
}

impl InMemoryWorkerStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Workers moved out by archival.
    #[must_use]
    pub fn archived(&self) -> Vec<Worker> {
        lock(&self.archived).clone()
    }
}

impl WorkerStore for InMemoryWorkerStore {
    fn save<'a>(&'a self, worker: &'a Worker) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            lock(&self.workers).insert(worker.id.clone(), worker.clone());
            Ok(())
        })
    }

    fn get<'a>(&'a self, id: &'a str) -> BoxFuture<'a, Result<Option<Worker>>> {
        Box::pin(async move { Ok(lock(&self.workers).get(id).cloned()) })
    }

    fn list(&self) -> BoxFuture<'_, Result<Vec<Worker>>> {
        Box::pin(async move {
            let workers = lock(&self.workers);
            Ok(sorted_by_creation(workers.values().cloned(), |w| {
                (w.created_at, w.id.clone())
            }))
        })
    }

    fn list_live(&self) -> BoxFuture<'_, Result<Vec<Worker>>> {
        Box::pin(async move {
            let workers = lock(&self.workers);
            let live = workers
                .values()
                .filter(|w| matches!(w.status, WorkerStatus::Starting | WorkerStatus::Running))
                .cloned();
            Ok(sorted_by_creation(live, |w| (w.created_at, w.id.clone())))
        })
    }

    fn archive_stopped_before(&self, cutoff: DateTime<Utc>) -> BoxFuture<'_, Result<u64>> {
        Box::pin(async move {
            let mut workers = lock(&self.workers);
            let stale: Vec<String> = workers
                .values()
                .filter(|w| {
                    matches!(
                        w.status,
                        WorkerStatus::Completed | WorkerStatus::Failed | WorkerStatus::Suspended
                    ) && w.updated_at < cutoff
                })
                .map(|w| w.id.clone())
                .collect();
            let mut archived = lock(&self.archived);
            for id in &stale {
                if let Some(worker) = workers.remove(id) {
                    archived.push(worker);
                }
            }
            Ok(u64::try_from(stale.len()).unwrap_or(u64::MAX))
        })
    }
}

/// Convoy store held in memory.
#[derive(Debug, Default)]
pub struct InMemoryConvoyStore {
    convoys: Mutex<BTreeMap<String, Convoy>>,
}

impl InMemoryConvoyStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl ConvoyStore for InMemoryConvoyStore {
    fn save<'a>(&'a self, convoy: &'a Convoy) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            lock(&self.convoys).insert(convoy.id.clone(), convoy.clone());
            Ok(())
        })
    }

    fn get<'a>(&'a self, id: &'a str) -> BoxFuture<'a, Result<Option<Convoy>>> {
        Box::pin(async move { Ok(lock(&self.convoys).get(id).cloned()) })
    }

    fn list(&self) -> BoxFuture<'_, Result<Vec<Convoy>>> {
        Box::pin(async move {
            let convoys = lock(&self.convoys);
            Ok(sorted_by_creation(convoys.values().cloned(), |c| {
                (c.created_at, c.id.clone())
            }))
        })
    }

    fn list_active(&self) -> BoxFuture<'_, Result<Vec<Convoy>>> {
        Box::pin(async move {
            let convoys = lock(&self.convoys);
            let active = convoys
                .values()
                .filter(|c| matches!(c.status, ConvoyStatus::Running | ConvoyStatus::Paused))
                .cloned();
            Ok(sorted_by_creation(active, |c| (c.created_at, c.id.clone())))
        })
    }
}

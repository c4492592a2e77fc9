//! Persistence layer.
//!
//! [`WorkerStore`] and [`ConvoyStore`] are the seams the scheduler and the
//! control loop write through. `SQLite` repositories back production;
//! [`memory`] holds in-process doubles.

pub mod convoy_repo;
pub mod db;
pub mod memory;
pub mod retention;
pub mod schema;
pub mod worker_repo;

use chrono::{DateTime, Utc};

use crate::models::convoy::Convoy;
use crate::models::worker::Worker;
use crate::{BoxFuture, Result};

pub use convoy_repo::ConvoyRepo;
pub use memory::{InMemoryConvoyStore, InMemoryWorkerStore};
pub use worker_repo::WorkerRepo;

/// Worker records.
pub trait WorkerStore: Send + Sync {
    /// Insert or replace a worker.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the write fails.
    fn save<'a>(&'a self, worker: &'a Worker) -> BoxFuture<'a, Result<()>>;

    /// Look up a worker by id.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    fn get<'a>(&'a self, id: &'a str) -> BoxFuture<'a, Result<Option<Worker>>>;

    /// Every unarchived worker, oldest first.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    fn list(&self) -> BoxFuture<'_, Result<Vec<Worker>>>;

    /// Workers in `starting` or `running`, oldest first.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    fn list_live(&self) -> BoxFuture<'_, Result<Vec<Worker>>>;

    /// Archive workers that stopped (terminal or suspended) before `cutoff`.
    /// Returns the number archived.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the write fails.
    fn archive_stopped_before(&self, cutoff: DateTime<Utc>) -> BoxFuture<'_, Result<u64>>;
}

/// Convoy manifests with their jobs.
pub trait ConvoyStore: Send + Sync {
    /// Insert or replace a convoy and all of its jobs.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the write fails.
    fn save<'a>(&'a self, convoy: &'a Convoy) -> BoxFuture<'a, Result<()>>;

    /// Look up a convoy by id.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    fn get<'a>(&'a self, id: &'a str) -> BoxFuture<'a, Result<Option<Convoy>>>;

    /// Every convoy, oldest first.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    fn list(&self) -> BoxFuture<'_, Result<Vec<Convoy>>>;

    /// Convoys in `running` or `paused`, oldest first.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    fn list_active(&self) -> BoxFuture<'_, Result<Vec<Convoy>>>;
}

/// Parse a stored RFC 3339 timestamp.
pub(crate) fn parse_ts(field: &str, raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| crate::AppError::Db(format!("invalid {field}: {e}")))
}

/// Parse an optional stored RFC 3339 timestamp.
pub(crate) fn parse_opt_ts(field: &str, raw: Option<&str>) -> Result<Option<DateTime<Utc>>> {
    raw.map(|value| parse_ts(field, value)).transpose()
}

//! Worker repository for `SQLite` persistence.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::models::tier::{Specialist, Tier};
use crate::models::worker::{Worker, WorkerStatus};
use crate::{AppError, BoxFuture, Result};

use super::db::Database;
use super::{parse_opt_ts, parse_ts, WorkerStore};

/// Repository wrapper around `SQLite` for worker records.
#[derive(Clone)]
pub struct WorkerRepo {
    db: Arc<Database>,
}

/// Internal row struct for `SQLite` deserialization.
#[derive(sqlx::FromRow)]
struct WorkerRow {
    id: String,
    tier: String,
    workspace_root: String,
    task_ref: Option<String>,
    convoy_id: Option<String>,
    role: Option<String>,
    status: String,
    last_activity_at: Option<String>,
    last_output: Option<String>,
    spend: f64,
    handoff_count: i64,
    failure_reason: Option<String>,
    created_at: String,
    updated_at: String,
    terminated_at: Option<String>,
}

impl WorkerRow {
    /// Convert a database row into the domain model.
    fn into_worker(self) -> Result<Worker> {
        let tier: Tier = self
            .tier
            .parse()
            .map_err(|_| AppError::Db(format!("invalid worker tier: {}", self.tier)))?;
        let role = self
            .role
            .as_deref()
            .map(str::parse::<Specialist>)
            .transpose()
            .map_err(|e| AppError::Db(format!("invalid worker role: {e}")))?;
        let handoff_count = u32::try_from(self.handoff_count)
            .map_err(|e| AppError::Db(format!("invalid handoff_count: {e}")))?;

        Ok(Worker {
            id: self.id,
            tier,
            workspace_root: self.workspace_root,
            task_ref: self.task_ref,
            convoy_id: self.convoy_id,
            role,
            status: parse_worker_status(&self.status)?,
            last_activity_at: parse_opt_ts("last_activity_at", self.last_activity_at.as_deref())?,
            last_output: self.last_output,
            spend: self.spend,
            handoff_count,
            failure_reason: self.failure_reason,
            created_at: parse_ts("created_at", &self.created_at)?,
            updated_at: parse_ts("updated_at", &self.updated_at)?,
            terminated_at: parse_opt_ts("terminated_at", self.terminated_at.as_deref())?,
        })
    }
}

fn parse_worker_status(s: &str) -> Result<WorkerStatus> {
    match s {
        "starting" => Ok(WorkerStatus::Starting),
        "running" => Ok(WorkerStatus::Running),
        "suspended" => Ok(WorkerStatus::Suspended),
        "completed" => Ok(WorkerStatus::Completed),
        "failed" => Ok(WorkerStatus::Failed),
        other => Err(AppError::Db(format!("invalid worker status: {other}"))),
    }
}

impl WorkerRepo {
    /// Create a new repository instance.
    #[must_use]
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    async fn upsert(&self, worker: &Worker) -> Result<()> {
        sqlx::query(
            "INSERT INTO worker (id, tier, workspace_root, task_ref, convoy_id, role, status,
             last_activity_at, last_output, spend, handoff_count, failure_reason, created_at,
             updated_at, terminated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)
             ON CONFLICT(id) DO UPDATE SET
                tier = excluded.tier,
                workspace_root = excluded.workspace_root,
                task_ref = excluded.task_ref,
                convoy_id = excluded.convoy_id,
                role = excluded.role,
                status = excluded.status,
                last_activity_at = excluded.last_activity_at,
                last_output = excluded.last_output,
                spend = excluded.spend,
                handoff_count = excluded.handoff_count,
                failure_reason = excluded.failure_reason,
                updated_at = excluded.updated_at,
                terminated_at = excluded.terminated_at",
        )
        .bind(&worker.id)
        .bind(worker.tier.as_str())
        .bind(&worker.workspace_root)
        .bind(&worker.task_ref)
        .bind(&worker.convoy_id)
        .bind(worker.role.map(Specialist::as_str))
        .bind(worker.status.as_str())
        .bind(worker.last_activity_at.map(|t| t.to_rfc3339()))
        .bind(&worker.last_output)
        .bind(worker.spend)
        .bind(i64::from(worker.handoff_count))
        .bind(&worker.failure_reason)
        .bind(worker.created_at.to_rfc3339())
        .bind(worker.updated_at.to_rfc3339())
        .bind(worker.terminated_at.map(|t| t.to_rfc3339()))
        .execute(self.db.as_ref())
        .await?;
        Ok(())
    }

    async fn fetch(&self, sql: &str) -> Result<Vec<Worker>> {
        let rows: Vec<WorkerRow> = sqlx::query_as(sql).fetch_all(self.db.as_ref()).await?;
        rows.into_iter().map(WorkerRow::into_worker).collect()
    }

    async fn archive(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let cutoff = cutoff.to_rfc3339();
        let archived_at = Utc::now().to_rfc3339();
        let stopped = "status IN ('completed','failed','suspended') AND updated_at < ?1";

        let mut tx = self.db.begin().await?;
        sqlx::query(&format!(
            "INSERT OR REPLACE INTO worker_archive
             SELECT id, tier, workspace_root, task_ref, convoy_id, role, status,
                    last_activity_at, last_output, spend, handoff_count, failure_reason,
                    created_at, updated_at, terminated_at, ?2
             FROM worker WHERE {stopped}"
        ))
        .bind(&cutoff)
        .bind(&archived_at)
        .execute(&mut *tx)
        .await?;
        let deleted = sqlx::query(&format!("DELETE FROM worker WHERE {stopped}"))
            .bind(&cutoff)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        tx.commit().await?;
        Ok(deleted)
    }
}

impl WorkerStore for WorkerRepo {
    fn save<'a>(&'a self, worker: &'a Worker) -> BoxFuture<'a, Result<()>> {
        Box::pin(self.upsert(worker))
    }

    fn get<'a>(&'a self, id: &'a str) -> BoxFuture<'a, Result<Option<Worker>>> {
        Box::pin(async move {
            let row: Option<WorkerRow> = sqlx::query_as("SELECT * FROM worker WHERE id = ?1")
                .bind(id)
                .fetch_optional(self.db.as_ref())
                .await?;
            row.map(WorkerRow::into_worker).transpose()
        })
    }

    fn list(&self) -> BoxFuture<'_, Result<Vec<Worker>>> {
        Box::pin(self.fetch("SELECT * FROM worker ORDER BY created_at, id"))
    }

    fn list_live(&self) -> BoxFuture<'_, Result<Vec<Worker>>> {
        Box::pin(self.fetch(
            "SELECT * FROM worker WHERE status IN ('starting','running') ORDER BY created_at, id",
        ))
    }

    fn archive_stopped_before(&self, cutoff: DateTime<Utc>) -> BoxFuture<'_, Result<u64>> {
        Box::pin(self.archive(cutoff))
    }
}

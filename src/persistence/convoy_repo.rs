//! Convoy repository for `SQLite` persistence.
//!
//! A convoy is stored as one `convoy` row plus one `agent_job` row per
//! issue; `position` preserves the original issue order.

use std::sync::Arc;

use crate::models::convoy::{AgentJob, Convoy, ConvoyConfig, ConvoyStatus, JobStatus};
use crate::{AppError, BoxFuture, Result};

use super::db::Database;
use super::{parse_opt_ts, parse_ts, ConvoyStore};

/// Repository wrapper around `SQLite` for convoy manifests.
#[derive(Clone)]
pub struct ConvoyRepo {
    db: Arc<Database>,
}

/// Internal row struct for `SQLite` deserialization.
#[derive(sqlx::FromRow)]
struct ConvoyRow {
    id: String,
    name: String,
    issue_ids: String,
    max_concurrent: i64,
    per_worker_timeout_ms: i64,
    synthesize: bool,
    status: String,
    synthesis_prompt: Option<String>,
    created_at: String,
    updated_at: String,
}

/// Internal row struct for `SQLite` deserialization.
#[derive(sqlx::FromRow)]
struct JobRow {
    issue_id: String,
    worker_id: Option<String>,
    status: String,
    started_at: Option<String>,
    completed_at: Option<String>,
    error: Option<String>,
    output: Option<String>,
}

impl JobRow {
    fn into_job(self) -> Result<AgentJob> {
        Ok(AgentJob {
            issue_id: self.issue_id,
            worker_id: self.worker_id,
            status: parse_job_status(&self.status)?,
            started_at: parse_opt_ts("started_at", self.started_at.as_deref())?,
            completed_at: parse_opt_ts("completed_at", self.completed_at.as_deref())?,
            error: self.error,
            output: self.output,
        })
    }
}

impl ConvoyRow {
    fn into_convoy(self, jobs: Vec<AgentJob>) -> Result<Convoy> {
        let issue_ids: Vec<String> = serde_json::from_str(&self.issue_ids)
            .map_err(|e| AppError::Db(format!("invalid issue_ids: {e}")))?;
        let max_concurrent = u32::try_from(self.max_concurrent)
            .map_err(|e| AppError::Db(format!("invalid max_concurrent: {e}")))?;
        let per_worker_timeout_ms = u64::try_from(self.per_worker_timeout_ms)
            .map_err(|e| AppError::Db(format!("invalid per_worker_timeout_ms: {e}")))?;

        Ok(Convoy {
            id: self.id,
            name: self.name,
            issue_ids,
            config: ConvoyConfig {
                max_concurrent,
                per_worker_timeout_ms,
                synthesize: self.synthesize,
            },
            status: parse_convoy_status(&self.status)?,
            jobs,
            synthesis_prompt: self.synthesis_prompt,
            created_at: parse_ts("created_at", &self.created_at)?,
            updated_at: parse_ts("updated_at", &self.updated_at)?,
        })
    }
}

fn parse_convoy_status(s: &str) -> Result<ConvoyStatus> {
    match s {
        "pending" => Ok(ConvoyStatus::Pending),
        "running" => Ok(ConvoyStatus::Running),
        "paused" => Ok(ConvoyStatus::Paused),
        "completed" => Ok(ConvoyStatus::Completed),
        "failed" => Ok(ConvoyStatus::Failed),
        other => Err(AppError::Db(format!("invalid convoy status: {other}"))),
    }
}

fn parse_job_status(s: &str) -> Result<JobStatus> {
    match s {
        "pending" => Ok(JobStatus::Pending),
        "running" => Ok(JobStatus::Running),
        "completed" => Ok(JobStatus::Completed),
        "failed" => Ok(JobStatus::Failed),
        other => Err(AppError::Db(format!("invalid job status: {other}"))),
    }
}

impl ConvoyRepo {
    /// Create a new repository instance.
    #[must_use]
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    async fn upsert(&self, convoy: &Convoy) -> Result<()> {
        let issue_ids = serde_json::to_string(&convoy.issue_ids)
            .map_err(|e| AppError::Db(format!("serialize issue_ids: {e}")))?;
        let timeout = i64::try_from(convoy.config.per_worker_timeout_ms)
            .map_err(|e| AppError::Db(format!("per_worker_timeout_ms out of range: {e}")))?;

        let mut tx = self.db.begin().await?;

        sqlx::query(
            "INSERT INTO convoy (id, name, issue_ids, max_concurrent, per_worker_timeout_ms,
             synthesize, status, synthesis_prompt, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
             ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                status = excluded.status,
                synthesis_prompt = excluded.synthesis_prompt,
                updated_at = excluded.updated_at",
        )
        .bind(&convoy.id)
        .bind(&convoy.name)
        .bind(&issue_ids)
        .bind(i64::from(convoy.config.max_concurrent))
        .bind(timeout)
        .bind(convoy.config.synthesize)
        .bind(convoy.status.as_str())
        .bind(&convoy.synthesis_prompt)
        .bind(convoy.created_at.to_rfc3339())
        .bind(convoy.updated_at.to_rfc3339())
        .execute(&mut *tx)
        .await?;

        for (position, job) in (0_i64..).zip(&convoy.jobs) {
            sqlx::query(
                "INSERT INTO agent_job (convoy_id, position, issue_id, worker_id, status,
                 started_at, completed_at, error, output)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                 ON CONFLICT(convoy_id, issue_id) DO UPDATE SET
                    worker_id = excluded.worker_id,
                    status = excluded.status,
                    started_at = excluded.started_at,
                    completed_at = excluded.completed_at,
                    error = excluded.error,
                    output = excluded.output",
            )
            .bind(&convoy.id)
            .bind(position)
            .bind(&job.issue_id)
            .bind(&job.worker_id)
            .bind(job.status.as_str())
            .bind(job.started_at.map(|t| t.to_rfc3339()))
            .bind(job.completed_at.map(|t| t.to_rfc3339()))
            .bind(&job.error)
            .bind(&job.output)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn load(&self, row: ConvoyRow) -> Result<Convoy> {
        let jobs: Vec<JobRow> = sqlx::query_as(
            "SELECT issue_id, worker_id, status, started_at, completed_at, error, output
             FROM agent_job WHERE convoy_id = ?1 ORDER BY position",
        )
        .bind(&row.id)
        .fetch_all(self.db.as_ref())
        .await?;
        let jobs = jobs
            .into_iter()
            .map(JobRow::into_job)
            .collect::<Result<Vec<_>>>()?;
        row.into_convoy(jobs)
    }

    async fn fetch(&self, sql: &str) -> Result<Vec<Convoy>> {
        let rows: Vec<ConvoyRow> = sqlx::query_as(sql).fetch_all(self.db.as_ref()).await?;
        let mut convoys = Vec::with_capacity(rows.len());
        for row in rows {
            convoys.push(self.load(row).await?);
        }
        Ok(convoys)
    }
}

impl ConvoyStore for ConvoyRepo {
    fn save<'a>(&'a self, convoy: &'a Convoy) -> BoxFuture<'a, Result<()>> {
        Box::pin(self.upsert(convoy))
    }

    fn get<'a>(&'a self, id: &'a str) -> BoxFuture<'a, Result<Option<Convoy>>> {
        Box::pin(async move {
            let row: Option<ConvoyRow> = sqlx::query_as("SELECT * FROM convoy WHERE id = ?1")
                .bind(id)
                .fetch_optional(self.db.as_ref())
                .await?;
            match row {
                Some(row) => Ok(Some(self.load(row).await?)),
                None => Ok(None),
            }
        })
    }

    fn list(&self) -> BoxFuture<'_, Result<Vec<Convoy>>> {
        Box::pin(self.fetch("SELECT * FROM convoy ORDER BY created_at, id"))
    }

    fn list_active(&self) -> BoxFuture<'_, Result<Vec<Convoy>>> {
        Box::pin(self.fetch(
            "SELECT * FROM convoy WHERE status IN ('running','paused') ORDER BY created_at, id",
        ))
    }
}

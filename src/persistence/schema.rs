//! `SQLite` schema bootstrap logic.
//!
//! All table definitions use `CREATE TABLE IF NOT EXISTS`, so bootstrap
//! is safe to re-run on every startup.

use sqlx::SqlitePool;

use crate::Result;

/// Apply all table definitions to the connected `SQLite` database.
///
/// # Errors
///
/// Returns `AppError::Db` if any DDL statement fails.
pub async fn bootstrap_schema(pool: &SqlitePool) -> Result<()> {
    let ddl = r"
CREATE TABLE IF NOT EXISTS worker (
    id               TEXT PRIMARY KEY NOT NULL,
    tier             TEXT NOT NULL CHECK(tier IN ('low','mid','high')),
    workspace_root   TEXT NOT NULL,
    task_ref         TEXT,
    convoy_id        TEXT,
    role             TEXT CHECK(role IS NULL OR role IN ('review','test','merge')),
    status           TEXT NOT NULL CHECK(status IN ('starting','running','suspended','completed','failed')),
    last_activity_at TEXT,
    last_output      TEXT,
    spend            REAL NOT NULL DEFAULT 0,
    handoff_count    INTEGER NOT NULL DEFAULT 0,
    failure_reason   TEXT,
    created_at       TEXT NOT NULL,
    updated_at       TEXT NOT NULL,
    terminated_at    TEXT
);

CREATE TABLE IF NOT EXISTS worker_archive (
    id               TEXT PRIMARY KEY NOT NULL,
    tier             TEXT NOT NULL,
    workspace_root   TEXT NOT NULL,
    task_ref         TEXT,
    convoy_id        TEXT,
    role             TEXT,
    status           TEXT NOT NULL,
    last_activity_at TEXT,
    last_output      TEXT,
    spend            REAL NOT NULL DEFAULT 0,
    handoff_count    INTEGER NOT NULL DEFAULT 0,
    failure_reason   TEXT,
    created_at       TEXT NOT NULL,
    updated_at       TEXT NOT NULL,
    terminated_at    TEXT,
    archived_at      TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS convoy (
    id                    TEXT PRIMARY KEY NOT NULL,
    name                  TEXT NOT NULL,
    issue_ids             TEXT NOT NULL,
    max_concurrent        INTEGER NOT NULL CHECK(max_concurrent >= 1),
    per_worker_timeout_ms INTEGER NOT NULL,
    synthesize            INTEGER NOT NULL DEFAULT 0,
    status                TEXT NOT NULL CHECK(status IN ('pending','running','paused','completed','failed')),
    synthesis_prompt      TEXT,
    created_at            TEXT NOT NULL,
    updated_at            TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS agent_job (
    convoy_id     TEXT NOT NULL,
    position      INTEGER NOT NULL,
    issue_id      TEXT NOT NULL,
    worker_id     TEXT,
    status        TEXT NOT NULL CHECK(status IN ('pending','running','completed','failed')),
    started_at    TEXT,
    completed_at  TEXT,
    error         TEXT,
    output        TEXT,
    PRIMARY KEY (convoy_id, issue_id)
);

CREATE INDEX IF NOT EXISTS idx_worker_status ON worker(status);
CREATE INDEX IF NOT EXISTS idx_worker_convoy ON worker(convoy_id);
CREATE INDEX IF NOT EXISTS idx_job_worker ON agent_job(worker_id);
";

    sqlx::raw_sql(ddl).execute(pool).await?;
    Ok(())
}

//! Retention service for stopped workers.
//!
//! Runs as a background task that archives workers which have been
//! completed, failed or suspended for longer than `retention_days`.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use super::WorkerStore;
use crate::Result;

const PURGE_INTERVAL: Duration = Duration::from_secs(3600);

/// Spawn the retention background task.
///
/// The task runs hourly until `cancel` fires.
#[must_use]
pub fn spawn_retention_task(
    workers: Arc<dyn WorkerStore>,
    retention_days: u32,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(PURGE_INTERVAL);
        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    info!("retention task shutting down");
                    break;
                }
                _ = interval.tick() => {
                    if let Err(err) = archive_expired(workers.as_ref(), retention_days).await {
                        error!(?err, "worker archival failed");
                    }
                }
            }
        }
    })
}

/// Archive every worker stopped for longer than `retention_days`.
///
/// # Errors
///
/// Returns `AppError::Db` if the store rejects the archival.
pub async fn archive_expired(workers: &dyn WorkerStore, retention_days: u32) -> Result<u64> {
    let cutoff = Utc::now() - chrono::Duration::days(i64::from(retention_days));
    let archived = workers.archive_stopped_before(cutoff).await?;
    if archived > 0 {
        info!(retention_days, archived, "stopped workers archived");
    }
    Ok(archived)
}

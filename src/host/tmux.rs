//! tmux-backed process host.
//!
//! Each worker runs in a detached tmux session named after the worker id.
//! Liveness comes from `has-session`, activity from the window activity
//! timestamp, and the output snapshot from `capture-pane`.

use std::process::Stdio;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::process::Command;
use tracing::{debug, info, info_span, Instrument};

use crate::config::HostConfig;
use crate::models::tier::Tier;
use crate::{AppError, BoxFuture, Result};

use super::{Heartbeat, ProcessHost};

/// Upper bound on a single tmux invocation.
const COMMAND_TIMEOUT: Duration = Duration::from_secs(10);

/// Output of one tmux invocation.
struct TmuxOutput {
    success: bool,
    stdout: String,
    stderr: String,
}

/// Process host that runs workers in tmux sessions.
#[derive(Debug, Clone)]
pub struct TmuxHost {
    config: HostConfig,
}

impl TmuxHost {
    /// Create a host from configuration.
    #[must_use]
    pub fn new(config: HostConfig) -> Self {
        Self { config }
    }

    /// Build the worker command line for a tier and prompt.
    #[must_use]
    pub fn worker_command_line(&self, tier: Tier, initial_prompt: &str) -> Vec<String> {
        let mut argv = vec![self.config.worker_command.clone()];
        argv.extend(self.config.worker_args.iter().cloned());
        if !self.config.tier_flag.is_empty() {
            argv.push(self.config.tier_flag.clone());
            argv.push(tier.as_str().to_owned());
        }
        if !initial_prompt.is_empty() {
            argv.push(initial_prompt.to_owned());
        }
        argv
    }

    async fn tmux(&self, args: &[&str]) -> Result<TmuxOutput> {
        let mut cmd = Command::new(&self.config.tmux_bin);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let output = tokio::time::timeout(COMMAND_TIMEOUT, cmd.output())
            .await
            .map_err(|_| AppError::Host(format!("tmux {} timed out", args.join(" "))))?
            .map_err(|err| AppError::Host(format!("failed to run tmux: {err}")))?;

        Ok(TmuxOutput {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_owned(),
        })
    }

    async fn tmux_checked(&self, args: &[&str]) -> Result<String> {
        let out = self.tmux(args).await?;
        if out.success {
            Ok(out.stdout)
        } else {
            Err(AppError::Host(format!(
                "tmux {} failed: {}",
                args.first().copied().unwrap_or_default(),
                out.stderr
            )))
        }
    }
}

/// Exact-match session target, so `w1` never resolves to `w10`.
fn target(worker_id: &str) -> String {
    format!("={worker_id}")
}

/// Parse tmux's `#{window_activity}` (epoch seconds).
fn parse_activity(raw: &str) -> Option<DateTime<Utc>> {
    let secs = raw.trim().parse::<i64>().ok()?;
    DateTime::from_timestamp(secs, 0)
}

impl ProcessHost for TmuxHost {
    fn spawn<'a>(
        &'a self,
        worker_id: &'a str,
        workspace_root: &'a str,
        tier: Tier,
        initial_prompt: &'a str,
    ) -> BoxFuture<'a, Result<()>> {
        let span = info_span!("tmux_spawn", worker_id, workspace = workspace_root, tier = tier.as_str());
        Box::pin(
            async move {
                let argv = self.worker_command_line(tier, initial_prompt);
                let mut args = vec!["new-session", "-d", "-s", worker_id, "-c", workspace_root];
                args.extend(argv.iter().map(String::as_str));
                self.tmux_checked(&args).await?;
                info!("worker session created");
                Ok(())
            }
            .instrument(span),
        )
    }

    fn is_running<'a>(&'a self, worker_id: &'a str) -> BoxFuture<'a, bool> {
        Box::pin(async move {
            let target = target(worker_id);
            match self.tmux(&["has-session", "-t", &target]).await {
                Ok(out) => out.success,
                Err(err) => {
                    debug!(worker_id, %err, "has-session failed");
                    false
                }
            }
        })
    }

    fn heartbeat<'a>(&'a self, worker_id: &'a str) -> BoxFuture<'a, Option<Heartbeat>> {
        Box::pin(async move {
            let target = target(worker_id);
            let activity = self
                .tmux_checked(&["display-message", "-p", "-t", &target, "#{window_activity}"])
                .await
                .ok()
                .and_then(|raw| parse_activity(&raw))?;

            let start = format!("-{}", self.config.capture_lines);
            let recent_output = self
                .tmux_checked(&["capture-pane", "-p", "-t", &target, "-S", &start])
                .await
                .unwrap_or_default();

            Some(Heartbeat {
                timestamp: activity,
                recent_output,
            })
        })
    }

    fn kill<'a>(&'a self, worker_id: &'a str) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let target = target(worker_id);
            self.tmux_checked(&["kill-session", "-t", &target]).await?;
            info!(worker_id, "worker session killed");
            Ok(())
        })
    }

    fn send_input<'a>(&'a self, worker_id: &'a str, text: &'a str) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let target = target(worker_id);
            self.tmux_checked(&["send-keys", "-t", &target, "-l", text])
                .await?;
            self.tmux_checked(&["send-keys", "-t", &target, "Enter"])
                .await?;
            debug!(worker_id, "input delivered");
            Ok(())
        })
    }
}

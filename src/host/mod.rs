//! Process host abstraction.
//!
//! The [`ProcessHost`] trait decouples the control plane from the
//! mechanism that actually runs worker sessions. The control plane only
//! ever creates, probes, feeds and kills named sessions; it never awaits
//! a worker's output.

pub mod mock;
pub mod tmux;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::tier::Tier;
use crate::{BoxFuture, Result};

pub use mock::MockHost;
pub use tmux::TmuxHost;

/// Most recent liveness signal observed for a worker session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Heartbeat {
    /// Time of the last observed activity in the session.
    pub timestamp: DateTime<Utc>,
    /// Tail of the session's recent output.
    pub recent_output: String,
}

/// Creates, probes and kills named worker sessions.
pub trait ProcessHost: Send + Sync {
    /// Start a named session running a worker at `tier` in `workspace_root`,
    /// with `initial_prompt` as its first instruction.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Host` if the session cannot be created.
    fn spawn<'a>(
        &'a self,
        worker_id: &'a str,
        workspace_root: &'a str,
        tier: Tier,
        initial_prompt: &'a str,
    ) -> BoxFuture<'a, Result<()>>;

    /// Whether the named session is alive.
    fn is_running<'a>(&'a self, worker_id: &'a str) -> BoxFuture<'a, bool>;

    /// Latest heartbeat for the session, or `None` if nothing was observed.
    fn heartbeat<'a>(&'a self, worker_id: &'a str) -> BoxFuture<'a, Option<Heartbeat>>;

    /// Kill the named session.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Host` if the host refuses or the call fails.
    fn kill<'a>(&'a self, worker_id: &'a str) -> BoxFuture<'a, Result<()>>;

    /// Deliver text input to the session as if typed.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Host` if the session is gone or delivery fails.
    fn send_input<'a>(&'a self, worker_id: &'a str, text: &'a str) -> BoxFuture<'a, Result<()>>;
}

#![forbid(unsafe_code)]

//! Control plane for fleets of autonomous worker sessions.
//!
//! Schedules convoys of issues onto workers under a concurrency bound,
//! evaluates worker health, escalates stalled or outgrown workers to a
//! more capable tier through context-preserving handoffs, and meters
//! spend against configured limits.

use std::future::Future;
use std::pin::Pin;

pub mod audit;
pub mod config;
pub mod config_watcher;
pub mod convoy;
pub mod cost;
pub mod errors;
pub mod escalation;
pub mod health;
pub mod host;
pub mod ipc;
pub mod models;
pub mod orchestrator;
pub mod persistence;
pub mod settings;
pub mod tracker;
pub mod transcript;

pub use config::FleetConfig;
pub use errors::{AppError, Result};

/// Boxed `Send` future returned by the async trait seams
/// ([`host::ProcessHost`], [`tracker::Tracker`], the persistence stores).
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

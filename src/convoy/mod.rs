//! Convoy scheduling: bounded-concurrency execution of issue batches.

pub mod scheduler;
pub mod synthesis;

pub use scheduler::ConvoyScheduler;
pub use synthesis::{build_synthesis_prompt, issue_prompt};

//! Fleet orchestration.
//!
//! The [`control_loop`] owns all mutable fleet state; [`commands`] is the
//! channel protocol operators use to reach it.

pub mod commands;
pub mod control_loop;

pub use commands::{ControlCommand, ControlHandle, ConvoyAction, CostInput};
pub use control_loop::{Collaborators, ControlLoop, HandoffRecord, TickReport};

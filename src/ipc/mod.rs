//! Local IPC layer for `agent-fleet-ctl` interaction.
//!
//! Provides a named pipe (Windows) or Unix domain socket (Linux/macOS)
//! server that accepts JSON-line commands from the companion CLI.

pub mod server;

pub use server::{handle_line, spawn_ipc_server, FleetRequest, IpcRequest, IpcResponse};

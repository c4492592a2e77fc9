#![forbid(unsafe_code)]

//! `agent-fleet-ctl`: local CLI companion for `agent-fleet`.
//!
//! Most subcommands connect to the daemon's IPC socket and send one JSON
//! command. `scan` and `compact-offline` work directly on local files and
//! need no running daemon.

use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use interprocess::local_socket::{traits::Stream as _, GenericNamespaced, Stream, ToNsName};

use agent_fleet::cost::compaction::{compact_ledger, retention_cutoff, DEFAULT_LOCK_TIMEOUT};
use agent_fleet::ipc::IpcRequest;
use agent_fleet::transcript::{remove_critical, scan_transcripts, Severity};
use agent_fleet::FleetConfig;

#[derive(Debug, Parser)]
#[command(
    name = "agent-fleet-ctl",
    about = "Local CLI for the agent-fleet control plane",
    version,
    long_about = None
)]
struct Cli {
    /// IPC socket name (must match the daemon's `ipc_name` config).
    #[arg(long, default_value = "agent-fleet")]
    ipc_name: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Manage convoys.
    #[command(subcommand)]
    Convoy(ConvoyCommand),

    /// List worker records.
    Workers,

    /// Report a worker's task complete.
    Complete {
        /// Worker id.
        worker_id: String,
        /// Result summary.
        #[arg(long)]
        output: Option<String>,
    },

    /// Show health for every live worker.
    Health,

    /// Spend tracking.
    #[command(subcommand)]
    Cost(CostCommand),

    /// Ask the daemon to re-read its configuration file.
    Reload,

    /// Ask the daemon to compact the cost ledger now.
    Compact,

    /// Compact the cost ledger without a running daemon.
    CompactOffline {
        /// Configuration file naming the ledger and retention window.
        #[arg(long, default_value = "fleet.toml")]
        config: PathBuf,
    },

    /// Scan session transcripts for wedged workers.
    Scan {
        /// Directory holding `*.jsonl` transcripts.
        dir: PathBuf,
        /// Delete transcripts with critical findings.
        #[arg(long)]
        fix: bool,
    },
}

#[derive(Debug, Subcommand)]
enum ConvoyCommand {
    /// Create a convoy over the given issues.
    Create {
        /// Convoy name.
        name: String,
        /// Issue ids in dispatch order.
        #[arg(required = true)]
        issues: Vec<String>,
        /// Maximum concurrently running workers.
        #[arg(long, short = 'k')]
        max_concurrent: Option<u32>,
        /// Per-worker timeout in milliseconds.
        #[arg(long)]
        timeout_ms: Option<u64>,
        /// Build a synthesis prompt when the convoy finishes.
        #[arg(long)]
        synthesize: bool,
        /// Start the convoy right away.
        #[arg(long)]
        start: bool,
    },
    /// Start (or restart) a convoy.
    Start {
        /// Convoy id.
        id: String,
    },
    /// Stop spawning new workers.
    Pause {
        /// Convoy id.
        id: String,
    },
    /// Resume a paused convoy.
    Resume {
        /// Convoy id.
        id: String,
    },
    /// Kill the convoy's workers and fail it.
    Stop {
        /// Convoy id.
        id: String,
    },
    /// Show a convoy manifest.
    Status {
        /// Convoy id.
        id: String,
    },
    /// List convoys.
    List,
}

#[derive(Debug, Subcommand)]
enum CostCommand {
    /// Record spend for a worker.
    Record {
        /// Worker id.
        worker_id: String,
        /// Amount in currency units.
        #[arg(long, conflicts_with_all = ["input_tokens", "output_tokens"])]
        amount: Option<f64>,
        /// Prompt tokens, priced at the worker's tier.
        #[arg(long)]
        input_tokens: Option<u64>,
        /// Completion tokens, priced at the worker's tier.
        #[arg(long)]
        output_tokens: Option<u64>,
        /// Charge a task other than the worker's own.
        #[arg(long)]
        task: Option<String>,
    },
    /// Show aggregate spend.
    Summary {
        /// Number of top workers and tasks.
        #[arg(long, default_value_t = 10)]
        top: usize,
    },
    /// Truncate the ledger.
    Reset,
}

fn main() {
    let args = Cli::parse();

    let request = match args.command {
        Command::Convoy(command) => convoy_request(command),
        Command::Workers => IpcRequest::new("worker-list"),
        Command::Complete { worker_id, output } => IpcRequest {
            worker_id: Some(worker_id),
            output,
            ..IpcRequest::new("worker-complete")
        },
        Command::Health => IpcRequest::new("health"),
        Command::Cost(command) => cost_request(command),
        Command::Reload => IpcRequest::new("reload"),
        Command::Compact => IpcRequest::new("compact"),
        Command::CompactOffline { config } => {
            exit_on_error(compact_offline(&config));
            return;
        }
        Command::Scan { dir, fix } => {
            exit_on_error(scan(&dir, fix));
            return;
        }
    };

    match send_ipc_command(&args.ipc_name, &request) {
        Ok(response) => print_response(&response),
        Err(err) => {
            eprintln!("Failed to connect to agent-fleet: {err}");
            eprintln!("Is agent-fleet running with ipc_name '{}'?", args.ipc_name);
            std::process::exit(1);
        }
    }
}

fn convoy_request(command: ConvoyCommand) -> IpcRequest {
    let by_id = |verb: &str, id: String| IpcRequest {
        id: Some(id),
        ..IpcRequest::new(verb)
    };
    match command {
        ConvoyCommand::Create {
            name,
            issues,
            max_concurrent,
            timeout_ms,
            synthesize,
            start,
        } => IpcRequest {
            name: Some(name),
            issues: Some(issues),
            max_concurrent,
            per_worker_timeout_ms: timeout_ms,
            synthesize: Some(synthesize),
            start: Some(start),
            ..IpcRequest::new("convoy-create")
        },
        ConvoyCommand::Start { id } => by_id("convoy-start", id),
        ConvoyCommand::Pause { id } => by_id("convoy-pause", id),
        ConvoyCommand::Resume { id } => by_id("convoy-resume", id),
        ConvoyCommand::Stop { id } => by_id("convoy-stop", id),
        ConvoyCommand::Status { id } => by_id("convoy-status", id),
        ConvoyCommand::List => IpcRequest::new("convoy-list"),
    }
}

fn cost_request(command: CostCommand) -> IpcRequest {
    match command {
        CostCommand::Record {
            worker_id,
            amount,
            input_tokens,
            output_tokens,
            task,
        } => IpcRequest {
            worker_id: Some(worker_id),
            amount,
            input_tokens,
            output_tokens,
            task_id: task,
            ..IpcRequest::new("cost-record")
        },
        CostCommand::Summary { top } => IpcRequest {
            top_n: Some(top),
            ..IpcRequest::new("cost-summary")
        },
        CostCommand::Reset => IpcRequest::new("cost-reset"),
    }
}

fn print_response(response: &serde_json::Value) {
    let Some(obj) = response.as_object() else {
        println!("{response}");
        return;
    };
    let ok = obj
        .get("ok")
        .and_then(serde_json::Value::as_bool)
        .unwrap_or(false);
    if ok {
        match obj.get("data") {
            Some(data) if !data.is_null() => {
                println!("{}", serde_json::to_string_pretty(data).unwrap_or_default());
            }
            _ => println!("OK"),
        }
    } else {
        let err_msg = obj
            .get("error")
            .and_then(|v| v.as_str())
            .unwrap_or("unknown error");
        eprintln!("Error: {err_msg}");
        std::process::exit(1);
    }
}

fn exit_on_error(result: agent_fleet::Result<()>) {
    if let Err(err) = result {
        eprintln!("Error: {err}");
        std::process::exit(1);
    }
}

fn compact_offline(config: &std::path::Path) -> agent_fleet::Result<()> {
    let config = FleetConfig::load_from_path(config)?;
    let outcome = compact_ledger(
        &config.cost.ledger_path,
        retention_cutoff(config.cost.ledger_retention_days),
        DEFAULT_LOCK_TIMEOUT,
    )?;
    println!(
        "kept {} entries, dropped {}{}",
        outcome.kept,
        outcome.dropped,
        if outcome.forced { " (lock wait timed out)" } else { "" }
    );
    Ok(())
}

fn scan(dir: &std::path::Path, fix: bool) -> agent_fleet::Result<()> {
    let reports = scan_transcripts(dir)?;
    let problematic: Vec<_> = reports.iter().filter(|r| !r.issues.is_empty()).collect();

    println!("scanned {} transcripts", reports.len());
    for report in &problematic {
        println!(
            "\n{} ({:.1}KB, {} messages{})",
            report.path.display(),
            report.size_kb,
            report.message_count,
            if report.is_sidechain { ", sidechain" } else { "" }
        );
        for issue in &report.issues {
            let tag = match issue.severity {
                Severity::Critical => "CRITICAL",
                Severity::Warning => "WARNING",
            };
            println!("  [{tag}] {}", issue.message);
        }
    }
    if problematic.is_empty() {
        println!("no issues found");
    }

    if fix {
        let removed = remove_critical(&reports)?;
        println!("\nremoved {} transcript(s) with critical issues", removed.len());
    }
    Ok(())
}

/// Connect to the IPC socket, send a JSON command, and read the response.
fn send_ipc_command(
    ipc_name: &str,
    request: &IpcRequest,
) -> std::result::Result<serde_json::Value, Box<dyn std::error::Error>> {
    let name = ipc_name.to_ns_name::<GenericNamespaced>()?;
    let mut stream = Stream::connect(name)?;

    let mut request_line = serde_json::to_string(request)?;
    request_line.push('\n');
    stream.write_all(request_line.as_bytes())?;
    stream.flush()?;

    let mut reader = BufReader::new(&stream);
    let mut response_line = String::new();
    reader.read_line(&mut response_line)?;

    let response: serde_json::Value = serde_json::from_str(response_line.trim())?;
    Ok(response)
}

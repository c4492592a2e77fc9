//! Local IPC server for `agent-fleet-ctl` commands.
//!
//! Listens on a named pipe (Windows) or Unix domain socket (Linux/macOS)
//! using the `interprocess` crate. Accepts line-delimited JSON commands
//! and forwards them to the control loop through a [`ControlHandle`].
//!
//! ## Protocol
//!
//! Request (one JSON object per line):
//! ```json
//! {"command": "convoy-create", "name": "sprint", "issues": ["a-1", "a-2"], "max_concurrent": 2, "start": true}
//! {"command": "convoy-pause", "id": "<convoy id>"}
//! {"command": "worker-complete", "worker_id": "1a2b3c4d-a-1", "output": "fixed"}
//! {"command": "cost-record", "worker_id": "1a2b3c4d-a-1", "amount": 0.42}
//! {"command": "cost-summary", "top_n": 5}
//! ```
//!
//! Response (one JSON object per line):
//! ```json
//! {"ok": true, "data": { ... } }
//! {"ok": false, "error": "not found: convoy x"}
//! ```

use interprocess::local_socket::{tokio::prelude::*, GenericNamespaced, ListenerOptions};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{info, info_span, warn, Instrument};

use crate::cost::TokenUsage;
use crate::models::convoy::ConvoyConfig;
use crate::orchestrator::{ControlHandle, ConvoyAction, CostInput};
use crate::{AppError, Result};

const DEFAULT_TOP_N: usize = 10;

/// Inbound IPC request from `agent-fleet-ctl`.
#[derive(Debug, Default, Deserialize, Serialize)]
pub struct IpcRequest {
    /// Command verb.
    pub command: String,
    /// Convoy id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Convoy name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Convoy issues in order.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub issues: Option<Vec<String>>,
    /// Convoy concurrency bound.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_concurrent: Option<u32>,
    /// Per-worker timeout.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub per_worker_timeout_ms: Option<u64>,
    /// Build a synthesis prompt at the end.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub synthesize: Option<bool>,
    /// Start the convoy right after creating it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start: Option<bool>,
    /// Worker id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_id: Option<String>,
    /// Completion output.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    /// Spend amount.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub amount: Option<f64>,
    /// Prompt tokens, priced by tier when no amount is given.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_tokens: Option<u64>,
    /// Completion tokens.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_tokens: Option<u64>,
    /// Task id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    /// Summary size.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_n: Option<usize>,
}

impl IpcRequest {
    /// Request with only a command verb.
    #[must_use]
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            ..Self::default()
        }
    }
}

/// A validated IPC command.
#[derive(Debug, Clone, PartialEq)]
pub enum FleetRequest {
    /// `convoy-create`
    ConvoyCreate {
        /// Name.
        name: String,
        /// Issues.
        issues: Vec<String>,
        /// Policy.
        config: ConvoyConfig,
        /// Start immediately.
        start: bool,
    },
    /// `convoy-start|pause|resume|stop`
    Convoy {
        /// Convoy id.
        id: String,
        /// Action.
        action: ConvoyAction,
    },
    /// `convoy-status`
    ConvoyStatus {
        /// Convoy id.
        id: String,
    },
    /// `convoy-list`
    ConvoyList,
    /// `worker-list`
    WorkerList,
    /// `worker-complete`
    WorkerComplete {
        /// Worker id.
        worker_id: String,
        /// Output summary.
        output: Option<String>,
    },
    /// `health`
    Health,
    /// `cost-record`
    CostRecord {
        /// Worker id.
        worker_id: String,
        /// Spend.
        input: CostInput,
        /// Task override.
        task_id: Option<String>,
    },
    /// `cost-summary`
    CostSummary {
        /// Top-N size.
        top_n: usize,
    },
    /// `cost-reset`
    CostReset,
    /// `reload`
    Reload,
    /// `compact`
    Compact,
}

fn required(field: Option<String>, name: &str) -> Result<String> {
    field
        .filter(|v| !v.trim().is_empty())
        .ok_or_else(|| AppError::Ipc(format!("missing required '{name}' field")))
}

impl TryFrom<IpcRequest> for FleetRequest {
    type Error = AppError;

    fn try_from(mut request: IpcRequest) -> Result<Self> {
        let convoy = |request: IpcRequest, action| -> Result<Self> {
            Ok(Self::Convoy {
                id: required(request.id, "id")?,
                action,
            })
        };

        let command = std::mem::take(&mut request.command);
        match command.as_str() {
            "convoy-create" => {
                let defaults = ConvoyConfig::default();
                Ok(Self::ConvoyCreate {
                    name: required(request.name, "name")?,
                    issues: request
                        .issues
                        .ok_or_else(|| AppError::Ipc("missing required 'issues' field".into()))?,
                    config: ConvoyConfig {
                        max_concurrent: request.max_concurrent.unwrap_or(defaults.max_concurrent),
                        per_worker_timeout_ms: request
                            .per_worker_timeout_ms
                            .unwrap_or(defaults.per_worker_timeout_ms),
                        synthesize: request.synthesize.unwrap_or(defaults.synthesize),
                    },
                    start: request.start.unwrap_or(false),
                })
            }
            "convoy-start" => convoy(request, ConvoyAction::Start),
            "convoy-pause" => convoy(request, ConvoyAction::Pause),
            "convoy-resume" => convoy(request, ConvoyAction::Resume),
            "convoy-stop" => convoy(request, ConvoyAction::Stop),
            "convoy-status" => Ok(Self::ConvoyStatus {
                id: required(request.id, "id")?,
            }),
            "convoy-list" => Ok(Self::ConvoyList),
            "worker-list" => Ok(Self::WorkerList),
            "worker-complete" => Ok(Self::WorkerComplete {
                worker_id: required(request.worker_id, "worker_id")?,
                output: request.output,
            }),
            "health" => Ok(Self::Health),
            "cost-record" => {
                let input = match (request.amount, request.input_tokens, request.output_tokens) {
                    (Some(amount), _, _) => CostInput::Amount { amount },
                    (None, None, None) => {
                        return Err(AppError::Ipc(
                            "cost-record needs 'amount' or token counts".into(),
                        ))
                    }
                    (None, input, output) => CostInput::Tokens(TokenUsage {
                        input_tokens: input.unwrap_or(0),
                        output_tokens: output.unwrap_or(0),
                    }),
                };
                Ok(Self::CostRecord {
                    worker_id: required(request.worker_id, "worker_id")?,
                    input,
                    task_id: request.task_id,
                })
            }
            "cost-summary" => Ok(Self::CostSummary {
                top_n: request.top_n.unwrap_or(DEFAULT_TOP_N),
            }),
            "cost-reset" => Ok(Self::CostReset),
            "reload" => Ok(Self::Reload),
            "compact" => Ok(Self::Compact),
            other => Err(AppError::Ipc(format!("unknown command: {other}"))),
        }
    }
}

/// Outbound IPC response to `agent-fleet-ctl`.
#[derive(Debug, Serialize, Deserialize)]
pub struct IpcResponse {
    /// Whether the command succeeded.
    pub ok: bool,
    /// Payload on success.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    /// Error message on failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl IpcResponse {
    fn success(data: serde_json::Value) -> Self {
        Self {
            ok: true,
            data: Some(data),
            error: None,
        }
    }

    fn error(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            data: None,
            error: Some(message.into()),
        }
    }
}

/// Spawn the IPC server task.
///
/// # Errors
///
/// Returns `AppError::Ipc` if the listener cannot be created.
pub fn spawn_ipc_server(
    name: &str,
    control: ControlHandle,
    ct: CancellationToken,
) -> Result<tokio::task::JoinHandle<()>> {
    let name = name.to_owned();
    let listener_name = name
        .clone()
        .to_ns_name::<GenericNamespaced>()
        .map_err(|err| AppError::Ipc(format!("invalid ipc socket name '{name}': {err}")))?;

    let listener = ListenerOptions::new()
        .name(listener_name)
        .create_tokio()
        .map_err(|err| AppError::Ipc(format!("failed to create ipc listener: {err}")))?;

    info!(ipc_name = %name, "IPC server listening");

    let handle = tokio::spawn(async move {
        let span = info_span!("ipc_server", name = %name);
        async move {
            loop {
                tokio::select! {
                    () = ct.cancelled() => {
                        info!("IPC server shutting down");
                        break;
                    }
                    accept_result = listener.accept() => {
                        match accept_result {
                            Ok(stream) => {
                                tokio::spawn(handle_connection(stream, control.clone()));
                            }
                            Err(err) => {
                                warn!(%err, "IPC accept failed");
                            }
                        }
                    }
                }
            }
        }
        .instrument(span)
        .await;
    });

    Ok(handle)
}

/// Handle a single IPC client connection.
async fn handle_connection(stream: interprocess::local_socket::tokio::Stream, control: ControlHandle) {
    let span = info_span!("ipc_conn");
    async move {
        let (reader, mut writer) = stream.split();
        let mut buf_reader = BufReader::new(reader);
        let mut line = String::new();

        loop {
            line.clear();
            match buf_reader.read_line(&mut line).await {
                Ok(0) => break, // EOF
                Ok(_) => {
                    let trimmed = line.trim();
                    if trimmed.is_empty() {
                        continue;
                    }

                    let response = handle_line(trimmed, &control).await;
                    let mut response_line = serde_json::to_string(&response).unwrap_or_else(|_| {
                        r#"{"ok":false,"error":"serialization failed"}"#.to_owned()
                    });
                    response_line.push('\n');

                    if let Err(err) = writer.write_all(response_line.as_bytes()).await {
                        warn!(%err, "failed to write ipc response");
                        break;
                    }
                }
                Err(err) => {
                    warn!(%err, "ipc read error");
                    break;
                }
            }
        }

        info!("IPC connection closed");
    }
    .instrument(span)
    .await;
}

/// Parse, route and answer one request line.
pub async fn handle_line(line: &str, control: &ControlHandle) -> IpcResponse {
    let request = match serde_json::from_str::<IpcRequest>(line) {
        Ok(request) => request,
        Err(err) => return IpcResponse::error(format!("invalid json: {err}")),
    };
    let span = info_span!("ipc_command", command = %request.command);
    async move {
        let routed = FleetRequest::try_from(request);
        let result = match routed {
            Ok(request) => dispatch(request, control).await,
            Err(err) => Err(err),
        };
        match result {
            Ok(data) => IpcResponse::success(data),
            Err(err) => {
                warn!(%err, "ipc command failed");
                IpcResponse::error(err.to_string())
            }
        }
    }
    .instrument(span)
    .await
}

fn to_json(value: &impl Serialize) -> Result<serde_json::Value> {
    Ok(serde_json::to_value(value)?)
}

async fn dispatch(request: FleetRequest, control: &ControlHandle) -> Result<serde_json::Value> {
    match request {
        FleetRequest::ConvoyCreate {
            name,
            issues,
            config,
            start,
        } => to_json(&control.create_convoy(name, issues, config, start).await?),
        FleetRequest::Convoy { id, action } => to_json(&control.convoy(id, action).await?),
        FleetRequest::ConvoyStatus { id } => to_json(&control.convoy_status(id).await?),
        FleetRequest::ConvoyList => to_json(&control.list_convoys().await?),
        FleetRequest::WorkerList => to_json(&control.list_workers().await?),
        FleetRequest::WorkerComplete { worker_id, output } => {
            to_json(&control.complete_worker(worker_id, output).await?)
        }
        FleetRequest::Health => to_json(&control.health().await?),
        FleetRequest::CostRecord {
            worker_id,
            input,
            task_id,
        } => to_json(&control.record_cost(worker_id, input, task_id).await?),
        FleetRequest::CostSummary { top_n } => to_json(&control.cost_summary(top_n).await?),
        FleetRequest::CostReset => {
            control.reset_cost().await?;
            Ok(serde_json::json!({ "reset": true }))
        }
        FleetRequest::Reload => {
            control.reload().await?;
            Ok(serde_json::json!({ "reloaded": true }))
        }
        FleetRequest::Compact => to_json(&control.compact_ledger().await?),
    }
}

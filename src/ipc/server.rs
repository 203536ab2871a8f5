//! Local IPC server for `agent-shepherd-ctl` commands.
//!
//! Listens on a named pipe (Windows) or Unix domain socket (Linux/macOS)
//! using the `interprocess` crate. Accepts line-delimited JSON commands
//! and routes them to the scheduler, the task queue or the supervisor.
//!
//! ## Protocol
//!
//! Request (one JSON object per line):
//! ```json
//! {"command": "list", "auth_token": "..."}
//! {"command": "send", "session": "worker-1", "text": "status?"}
//! {"command": "check", "session": "worker-1", "interval_seconds": 900, "text": "{session}: report progress"}
//! {"command": "remind", "session": "worker-1", "delay_seconds": 60, "text": "wrap up"}
//! {"command": "enqueue", "task": {"queue_key": "web", "title": "fix login"}}
//! {"command": "submit", "task_id": "...", "session": "worker-1", "output": {"summary": "done"}}
//! ```
//!
//! Response (one JSON object per line):
//! ```json
//! {"ok": true, "data": { ... } }
//! {"ok": false, "error": "not found: ..."}
//! ```

use std::sync::Arc;

use chrono::{DateTime, Utc};
use interprocess::local_socket::{tokio::prelude::*, GenericNamespaced, ListenerOptions};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{info, info_span, warn, Instrument};

use crate::backend::send_line;
use crate::models::schedule::{offset_from, MAX_SCHEDULE_SECONDS};
use crate::models::task::NewTask;
use crate::{AppError, Result};

use super::IpcState;

/// Inbound request from `agent-shepherd-ctl`.
#[derive(Debug, Default, Deserialize)]
pub struct IpcRequest {
    /// Command verb.
    pub command: String,
    /// Target session (`send`, `check`, `remind`, `submit`, `kill`).
    pub session: Option<String>,
    /// Message text or template.
    pub text: Option<String>,
    /// Schedule entry id (`cancel`).
    pub id: Option<String>,
    /// Recurring interval (`check`).
    pub interval_seconds: Option<u64>,
    /// Absolute delivery time (`remind`).
    pub at: Option<DateTime<Utc>>,
    /// Relative delivery time (`remind`).
    pub delay_seconds: Option<u64>,
    /// Task definition (`enqueue`).
    pub task: Option<NewTask>,
    /// Task id (`submit`, `reopen`).
    pub task_id: Option<String>,
    /// Deliverable (`submit`).
    pub output: Option<Value>,
    /// Shared-secret authentication token.
    pub auth_token: Option<String>,
}

/// Outbound response to `agent-shepherd-ctl`.
#[derive(Debug, Serialize, PartialEq)]
pub struct IpcResponse {
    /// Whether the command succeeded.
    pub ok: bool,
    /// Payload on success.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    /// Error message on failure.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl IpcResponse {
    fn success(data: Value) -> Self {
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

    fn from_result<T: Serialize>(result: Result<T>) -> Self {
        match result.and_then(|data| Ok(serde_json::to_value(data)?)) {
            Ok(data) => Self::success(data),
            Err(err) => Self::error(err.to_string()),
        }
    }
}

/// Spawn the IPC server task.
///
/// # Errors
///
/// Returns `AppError::Ipc` if the listener cannot be created.
pub fn spawn_ipc_server(
    state: Arc<IpcState>,
    ct: CancellationToken,
) -> Result<tokio::task::JoinHandle<()>> {
    let name = state.ipc_name.clone();

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
                                let state = Arc::clone(&state);
                                tokio::spawn(handle_connection(stream, state));
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

async fn handle_connection(stream: interprocess::local_socket::tokio::Stream, state: Arc<IpcState>) {
    let span = info_span!("ipc_conn");
    async move {
        let (reader, mut writer) = stream.split();
        let mut buf_reader = BufReader::new(reader);
        let mut line = String::new();

        loop {
            line.clear();
            match buf_reader.read_line(&mut line).await {
                Ok(0) => break,
                Ok(_) => {
                    let trimmed = line.trim();
                    if trimmed.is_empty() {
                        continue;
                    }

                    let response = dispatch_line(trimmed, &state).await;
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

/// Parse one request line and execute it.
pub async fn dispatch_line(line: &str, state: &IpcState) -> IpcResponse {
    match serde_json::from_str::<IpcRequest>(line) {
        Ok(request) => dispatch_command(&request, state).await,
        Err(err) => IpcResponse::error(format!("invalid json: {err}")),
    }
}

/// Route a parsed request to its handler.
pub async fn dispatch_command(request: &IpcRequest, state: &IpcState) -> IpcResponse {
    let span = info_span!("ipc_command", command = %request.command);
    async {
        if let Some(expected) = &state.auth_token {
            if request.auth_token.as_ref() != Some(expected) {
                warn!("IPC request rejected: invalid auth token");
                return IpcResponse::error("unauthorized");
            }
        }

        match request.command.as_str() {
            "list" => handle_list(state).await,
            "tasks" => IpcResponse::from_result(Ok(state.assign.list_tasks().await)),
            "schedules" => IpcResponse::from_result(Ok(state.scheduler.list().await)),
            "send" => IpcResponse::from_result(handle_send(request, state).await),
            "check" => IpcResponse::from_result(handle_check(request, state).await),
            "remind" => IpcResponse::from_result(handle_remind(request, state).await),
            "cancel" => IpcResponse::from_result(handle_cancel(request, state).await),
            "enqueue" => IpcResponse::from_result(handle_enqueue(request, state).await),
            "submit" => IpcResponse::from_result(handle_submit(request, state).await),
            "reopen" => IpcResponse::from_result(handle_reopen(request, state).await),
            "kill" => IpcResponse::from_result(handle_kill(request, state).await),
            other => IpcResponse::error(format!("unknown command: {other}")),
        }
    }
    .instrument(span)
    .await
}

fn required<'a, T>(field: Option<&'a T>, name: &str) -> Result<&'a T> {
    field.ok_or_else(|| AppError::InvalidInput(format!("missing required '{name}' field")))
}

/// Sessions with their supervision and workload details.
async fn handle_list(state: &IpcState) -> IpcResponse {
    let sessions = match state.backend.list().await {
        Ok(sessions) => sessions,
        Err(err) => return IpcResponse::error(format!("failed to list sessions: {err}")),
    };
    let supervised = state.supervisor.agents().await;
    let tracker = state.supervisor.tracker();

    let mut items = Vec::with_capacity(sessions.len());
    for session in sessions {
        let profile = supervised.iter().find(|p| p.name == session.name);
        let workload = state.assign.workload(&session.name).await;
        let current_task = state.assign.current_task(&session.name).await.map(|t| t.id);
        items.push(json!({
            "name": session.name,
            "backend": session.backend_kind,
            "state": session.state,
            "pid": session.pid,
            "failure": session.failure,
            "exit_code": session.exit_code,
            "role": profile.map(|p| p.role.clone()),
            "project": profile.map(|p| p.project.clone()),
            "idle_seconds": tracker.last_activity(&session.name).map(|_| tracker.idle_time(&session.name).as_secs()),
            "current_task": current_task,
            "workload": workload,
        }));
    }
    IpcResponse::success(json!({ "sessions": items }))
}

async fn handle_send(request: &IpcRequest, state: &IpcState) -> Result<Value> {
    let session = required(request.session.as_ref(), "session")?;
    let text = required(request.text.as_ref(), "text")?;
    send_line(state.backend.as_ref(), session, text).await?;
    info!(session = %session, "message sent via IPC");
    Ok(json!({ "session": session, "delivered": true }))
}

async fn handle_check(request: &IpcRequest, state: &IpcState) -> Result<Value> {
    let session = required(request.session.as_ref(), "session")?;
    let interval = *required(request.interval_seconds.as_ref(), "interval_seconds")?;
    let text = required(request.text.as_ref(), "text")?;
    let check = state.scheduler.add_check(session, interval, text).await?;
    Ok(serde_json::to_value(check)?)
}

async fn handle_remind(request: &IpcRequest, state: &IpcState) -> Result<Value> {
    let session = required(request.session.as_ref(), "session")?;
    let text = required(request.text.as_ref(), "text")?;
    let run_at = match (request.at, request.delay_seconds) {
        (Some(at), None) => at,
        (None, Some(delay)) => offset_from(Utc::now(), delay).ok_or_else(|| {
            AppError::InvalidInput(format!(
                "delay {delay}s exceeds the maximum of {MAX_SCHEDULE_SECONDS}s"
            ))
        })?,
        _ => {
            return Err(AppError::InvalidInput(
                "exactly one of 'at' or 'delay_seconds' is required".into(),
            ))
        }
    };
    let message = state.scheduler.add_message(session, run_at, text).await?;
    Ok(serde_json::to_value(message)?)
}

async fn handle_cancel(request: &IpcRequest, state: &IpcState) -> Result<Value> {
    let id = required(request.id.as_ref(), "id")?;
    let cancelled = state.scheduler.cancel(id).await?;
    Ok(json!({ "id": id, "cancelled": cancelled }))
}

async fn handle_enqueue(request: &IpcRequest, state: &IpcState) -> Result<Value> {
    let task = required(request.task.as_ref(), "task")?;
    let task = state.assign.enqueue(task.clone()).await?;
    Ok(serde_json::to_value(task)?)
}

async fn handle_submit(request: &IpcRequest, state: &IpcState) -> Result<Value> {
    let task_id = required(request.task_id.as_ref(), "task_id")?;
    let session = required(request.session.as_ref(), "session")?;
    let output = required(request.output.as_ref(), "output")?;
    let outcome = state.supervisor.submit_output(task_id, session, output).await?;
    Ok(serde_json::to_value(outcome)?)
}

async fn handle_reopen(request: &IpcRequest, state: &IpcState) -> Result<Value> {
    let task_id = required(request.task_id.as_ref(), "task_id")?;
    let task = state.assign.reopen(task_id).await?;
    Ok(serde_json::to_value(task)?)
}

async fn handle_kill(request: &IpcRequest, state: &IpcState) -> Result<Value> {
    let session = required(request.session.as_ref(), "session")?;
    let exit = state.supervisor.kill(session).await?;
    Ok(json!({ "session": session, "exit": exit }))
}

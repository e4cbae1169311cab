// ABOUTME: HTTP handlers for running commands in a sandbox and following their output
// ABOUTME: Synchronous and background execs plus an SSE stream fed from the replay log

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use sandchest_core::IdKind;
use sandchest_sandbox::{ExecRequest, SandboxManager};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, warn};

use crate::auth::Tenant;
use crate::error::ApiResult;
use crate::response::{ExecResponse, ExecResult};
use crate::sandbox_handlers::require_id;
use crate::sse::{chunk_output, create_error_event, create_sse_event, create_sse_response, GuardedSseStream};
use crate::state::AppState;

/// How often the stream re-reads the replay log.
const STREAM_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Polls a finished exec may go without its completion event before the row is used instead.
const FINISHED_GRACE_POLLS: u32 = 8;

/// A command given as one shell string or as an argv list.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum Command {
    Shell(String),
    Argv(Vec<String>),
}

impl Command {
    pub fn into_argv(self) -> Vec<String> {
        match self {
            Command::Shell(line) => vec!["sh".to_string(), "-c".to_string(), line],
            Command::Argv(argv) => argv,
        }
    }
}

fn default_wait() -> bool {
    true
}

#[derive(Debug, Deserialize)]
pub struct ExecBody {
    pub cmd: Command,
    #[serde(default)]
    pub cwd: Option<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
    #[serde(default = "default_wait")]
    pub wait: bool,
}

pub async fn exec(
    State(state): State<AppState>,
    tenant: Tenant,
    Path(sandbox_id): Path<String>,
    Json(body): Json<ExecBody>,
) -> ApiResult<Response> {
    require_id(IdKind::Sandbox, &sandbox_id)?;
    let wait = body.wait;
    let outcome = state
        .manager
        .exec(
            &tenant.org_id,
            &sandbox_id,
            ExecRequest {
                cmd: body.cmd.into_argv(),
                cwd: body.cwd,
                env: body.env,
                timeout_secs: body.timeout_seconds,
                wait,
            },
        )
        .await?;

    if wait {
        return Ok(Json(ExecResult::from(outcome)).into_response());
    }
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({ "exec_id": outcome.exec.id, "status": outcome.exec.status })),
    )
        .into_response())
}

pub async fn list_execs(
    State(state): State<AppState>,
    tenant: Tenant,
    Path(sandbox_id): Path<String>,
) -> ApiResult<Json<Value>> {
    require_id(IdKind::Sandbox, &sandbox_id)?;
    let execs = state.manager.list_execs(&tenant.org_id, &sandbox_id).await?;
    let execs: Vec<ExecResponse> = execs.iter().map(ExecResponse::from).collect();
    Ok(Json(json!({ "execs": execs })))
}

pub async fn get_exec(
    State(state): State<AppState>,
    tenant: Tenant,
    Path((sandbox_id, exec_id)): Path<(String, String)>,
) -> ApiResult<Json<ExecResponse>> {
    require_id(IdKind::Sandbox, &sandbox_id)?;
    require_id(IdKind::Exec, &exec_id)?;
    let exec = state
        .manager
        .get_exec(&tenant.org_id, &sandbox_id, &exec_id)
        .await?;
    Ok(Json(ExecResponse::from(&exec)))
}

/// Stream an exec's output as `{seq, t, data}` events ending with one `exit` event.
pub async fn stream_exec(
    State(state): State<AppState>,
    tenant: Tenant,
    Path((sandbox_id, exec_id)): Path<(String, String)>,
) -> ApiResult<impl IntoResponse> {
    require_id(IdKind::Sandbox, &sandbox_id)?;
    require_id(IdKind::Exec, &exec_id)?;
    state
        .manager
        .get_exec(&tenant.org_id, &sandbox_id, &exec_id)
        .await?;

    let guard = state.drain.track_connection();
    let stream = output_events(state.manager.clone(), tenant.org_id, sandbox_id, exec_id);
    Ok(create_sse_response(GuardedSseStream::new(stream, guard)))
}

fn exit_event(seq: u64, code: Option<i64>, duration_ms: Option<i64>, status: Value) -> Value {
    json!({ "seq": seq, "t": "exit", "code": code, "duration_ms": duration_ms, "status": status })
}

fn output_events(
    manager: SandboxManager,
    org_id: String,
    sandbox_id: String,
    exec_id: String,
) -> impl futures::Stream<Item = Result<axum::response::sse::Event, std::convert::Infallible>> {
    async_stream::stream! {
        let mut after = 0u64;
        let mut seq = 0u64;
        let mut finished_polls = 0u32;

        loop {
            let events = match manager.replay(&org_id, &sandbox_id, after).await {
                Ok(events) => events,
                Err(e) => {
                    warn!(sandbox_id = %sandbox_id, exec_id = %exec_id, error = %e, "Exec stream lost its replay source");
                    yield Ok(create_error_event("exec output is unavailable"));
                    return;
                }
            };

            for event in events {
                after = after.max(event.seq);
                if event.data.get("exec_id").and_then(Value::as_str) != Some(exec_id.as_str()) {
                    continue;
                }
                match event.kind.as_str() {
                    "exec.output" => {
                        let stream = event.data.get("stream").and_then(Value::as_str).unwrap_or("stdout");
                        let data = event.data.get("data").and_then(Value::as_str).unwrap_or_default();
                        for piece in chunk_output(data) {
                            seq += 1;
                            if let Ok(sse) = create_sse_event(&json!({ "seq": seq, "t": stream, "data": piece })) {
                                yield Ok(sse);
                            }
                        }
                    }
                    "exec.completed" => {
                        seq += 1;
                        let exit = exit_event(
                            seq,
                            event.data.get("exit_code").and_then(Value::as_i64),
                            event.data.get("duration_ms").and_then(Value::as_i64),
                            event.data.get("status").cloned().unwrap_or(Value::Null),
                        );
                        if let Ok(sse) = create_sse_event(&exit) {
                            yield Ok(sse);
                        }
                        debug!(exec_id = %exec_id, events = seq, "Exec stream complete");
                        return;
                    }
                    _ => {}
                }
            }

            match manager.get_exec(&org_id, &sandbox_id, &exec_id).await {
                Ok(exec) if exec.status.is_finished() => {
                    finished_polls += 1;
                    if finished_polls > FINISHED_GRACE_POLLS {
                        seq += 1;
                        let exit = exit_event(
                            seq,
                            exec.exit_code.map(i64::from),
                            exec.duration_ms,
                            json!(exec.status),
                        );
                        if let Ok(sse) = create_sse_event(&exit) {
                            yield Ok(sse);
                        }
                        return;
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(exec_id = %exec_id, error = %e, "Exec stream lost its exec");
                    yield Ok(create_error_event("exec is unavailable"));
                    return;
                }
            }

            tokio::time::sleep(STREAM_POLL_INTERVAL).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_forms() {
        let body: ExecBody = serde_json::from_str(r#"{"cmd":"echo hi | wc -c"}"#).unwrap();
        assert!(body.wait);
        assert_eq!(
            body.cmd.into_argv(),
            vec!["sh", "-c", "echo hi | wc -c"]
        );

        let body: ExecBody =
            serde_json::from_str(r#"{"cmd":["ls","-la"],"wait":false,"timeout_seconds":5}"#).unwrap();
        assert!(!body.wait);
        assert_eq!(body.timeout_seconds, Some(5));
        assert_eq!(body.cmd.into_argv(), vec!["ls", "-la"]);
    }
}

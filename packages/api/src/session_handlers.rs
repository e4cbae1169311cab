// ABOUTME: HTTP handlers for persistent shell sessions inside a sandbox
// ABOUTME: Open a shell, run commands or feed raw input to it, and destroy it

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use sandchest_core::IdKind;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;

use crate::auth::Tenant;
use crate::error::ApiResult;
use crate::response::{ExecResult, SessionResponse};
use crate::sandbox_handlers::require_id;
use crate::state::AppState;

#[derive(Debug, Default, Deserialize)]
pub struct CreateSessionBody {
    #[serde(default)]
    pub shell: Option<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
}

pub async fn create_session(
    State(state): State<AppState>,
    tenant: Tenant,
    Path(sandbox_id): Path<String>,
    body: Option<Json<CreateSessionBody>>,
) -> ApiResult<impl IntoResponse> {
    require_id(IdKind::Sandbox, &sandbox_id)?;
    let body = body.map(|Json(b)| b).unwrap_or_default();
    let session = state
        .manager
        .create_session(&tenant.org_id, &sandbox_id, body.shell, body.env)
        .await?;
    Ok((StatusCode::CREATED, Json(SessionResponse::from(&session))))
}

pub async fn list_sessions(
    State(state): State<AppState>,
    tenant: Tenant,
    Path(sandbox_id): Path<String>,
) -> ApiResult<Json<Value>> {
    require_id(IdKind::Sandbox, &sandbox_id)?;
    let sessions = state
        .manager
        .list_sessions(&tenant.org_id, &sandbox_id)
        .await?;
    let sessions: Vec<SessionResponse> = sessions.iter().map(SessionResponse::from).collect();
    Ok(Json(json!({ "sessions": sessions })))
}

#[derive(Debug, Deserialize)]
pub struct SessionExecBody {
    pub cmd: String,
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
}

pub async fn session_exec(
    State(state): State<AppState>,
    tenant: Tenant,
    Path((sandbox_id, session_id)): Path<(String, String)>,
    Json(body): Json<SessionExecBody>,
) -> ApiResult<Json<ExecResult>> {
    require_id(IdKind::Sandbox, &sandbox_id)?;
    require_id(IdKind::Session, &session_id)?;
    let outcome = state
        .manager
        .session_exec(
            &tenant.org_id,
            &sandbox_id,
            &session_id,
            &body.cmd,
            body.timeout_seconds,
        )
        .await?;
    Ok(Json(ExecResult::from(outcome)))
}

#[derive(Debug, Deserialize)]
pub struct SessionInputBody {
    pub data: String,
}

pub async fn session_input(
    State(state): State<AppState>,
    tenant: Tenant,
    Path((sandbox_id, session_id)): Path<(String, String)>,
    Json(body): Json<SessionInputBody>,
) -> ApiResult<Json<Value>> {
    require_id(IdKind::Sandbox, &sandbox_id)?;
    require_id(IdKind::Session, &session_id)?;
    state
        .manager
        .session_input(&tenant.org_id, &sandbox_id, &session_id, &body.data)
        .await?;
    Ok(Json(json!({ "ok": true })))
}

pub async fn destroy_session(
    State(state): State<AppState>,
    tenant: Tenant,
    Path((sandbox_id, session_id)): Path<(String, String)>,
) -> ApiResult<Json<SessionResponse>> {
    require_id(IdKind::Sandbox, &sandbox_id)?;
    require_id(IdKind::Session, &session_id)?;
    let session = state
        .manager
        .destroy_session(&tenant.org_id, &sandbox_id, &session_id)
        .await?;
    Ok(Json(SessionResponse::from(&session)))
}

// ABOUTME: HTTP handlers for registering and listing sandbox artifacts
// ABOUTME: Registered paths are collected into object storage when the sandbox stops

use axum::{
    extract::{Path, State},
    Json,
};
use sandchest_core::IdKind;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::auth::Tenant;
use crate::error::ApiResult;
use crate::response::ArtifactResponse;
use crate::sandbox_handlers::require_id;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct RegisterArtifactsBody {
    pub paths: Vec<String>,
    #[serde(default)]
    pub exec_id: Option<String>,
}

pub async fn register_artifacts(
    State(state): State<AppState>,
    tenant: Tenant,
    Path(sandbox_id): Path<String>,
    Json(body): Json<RegisterArtifactsBody>,
) -> ApiResult<Json<Value>> {
    require_id(IdKind::Sandbox, &sandbox_id)?;
    if let Some(exec_id) = &body.exec_id {
        require_id(IdKind::Exec, exec_id)?;
    }
    let (registered, total) = state
        .manager
        .register_artifacts(&tenant.org_id, &sandbox_id, body.paths, body.exec_id)
        .await?;
    Ok(Json(json!({ "registered": registered, "total": total })))
}

pub async fn list_artifacts(
    State(state): State<AppState>,
    tenant: Tenant,
    Path(sandbox_id): Path<String>,
) -> ApiResult<Json<Value>> {
    require_id(IdKind::Sandbox, &sandbox_id)?;
    let artifacts: Vec<ArtifactResponse> = state
        .manager
        .list_artifacts(&tenant.org_id, &sandbox_id)
        .await?
        .into_iter()
        .map(ArtifactResponse::from)
        .collect();
    Ok(Json(json!({ "artifacts": artifacts })))
}

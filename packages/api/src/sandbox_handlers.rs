// ABOUTME: HTTP handlers for sandbox lifecycle and fork operations
// ABOUTME: Create, list, inspect, stop, delete and fork sandboxes scoped to the calling tenant

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use sandchest_core::{parse_id, IdKind};
use sandchest_sandbox::{CreateSandboxRequest, ForkRequest};
use sandchest_storage::{SandboxFilter, SandboxStatus};
use serde::Deserialize;
use std::collections::HashMap;
use tracing::info;

use crate::auth::Tenant;
use crate::error::{ApiResult, AppError};
use crate::response::{ForkTreeResponse, SandboxList, SandboxResponse};
use crate::state::AppState;

const DEFAULT_LIST_LIMIT: u32 = 50;
const MAX_LIST_LIMIT: u32 = 100;

/// Reject path IDs that are not well-formed IDs of `kind`.
pub(crate) fn require_id(kind: IdKind, id: &str) -> ApiResult<()> {
    parse_id(kind, id)
        .map(|_| ())
        .map_err(|e| AppError::bad_request(format!("invalid ID '{}': {}", id, e)))
}

#[derive(Debug, Deserialize)]
pub struct CreateSandboxBody {
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub profile: Option<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub ttl_seconds: Option<i64>,
    #[serde(default)]
    pub queue_timeout_seconds: Option<i64>,
}

pub async fn create_sandbox(
    State(state): State<AppState>,
    tenant: Tenant,
    Json(body): Json<CreateSandboxBody>,
) -> ApiResult<impl IntoResponse> {
    let sandbox = state
        .manager
        .create(CreateSandboxRequest {
            org_id: tenant.org_id,
            image: body.image,
            profile: body.profile,
            env: body.env,
            ttl_seconds: body.ttl_seconds,
            queue_timeout_seconds: body.queue_timeout_seconds,
        })
        .await?;
    Ok((StatusCode::CREATED, Json(SandboxResponse::from(&sandbox))))
}

#[derive(Debug, Default, Deserialize)]
pub struct ListSandboxesQuery {
    pub status: Option<String>,
    pub image: Option<String>,
    pub forked_from: Option<String>,
    pub cursor: Option<String>,
    pub limit: Option<u32>,
}

pub async fn list_sandboxes(
    State(state): State<AppState>,
    tenant: Tenant,
    Query(query): Query<ListSandboxesQuery>,
) -> ApiResult<Json<SandboxList>> {
    let status = query
        .status
        .as_deref()
        .map(SandboxStatus::from_str)
        .transpose()
        .map_err(|e| AppError::bad_request(e.to_string()))?;
    let limit = query
        .limit
        .unwrap_or(DEFAULT_LIST_LIMIT)
        .clamp(1, MAX_LIST_LIMIT);

    let filter = SandboxFilter {
        status,
        image: query.image,
        forked_from: query.forked_from,
        cursor: query.cursor,
        limit: Some(limit),
    };
    let sandboxes = state.manager.list(&tenant.org_id, &filter).await?;
    let next_cursor = if sandboxes.len() == limit as usize {
        sandboxes.last().map(|s| s.id.clone())
    } else {
        None
    };

    Ok(Json(SandboxList {
        sandboxes: sandboxes.iter().map(SandboxResponse::from).collect(),
        next_cursor,
    }))
}

pub async fn get_sandbox(
    State(state): State<AppState>,
    tenant: Tenant,
    Path(sandbox_id): Path<String>,
) -> ApiResult<Json<SandboxResponse>> {
    require_id(IdKind::Sandbox, &sandbox_id)?;
    let sandbox = state.manager.get(&tenant.org_id, &sandbox_id).await?;
    Ok(Json(SandboxResponse::from(&sandbox)))
}

#[derive(Debug, Deserialize)]
pub struct UpdateSandboxBody {
    pub replay_public: Option<bool>,
}

pub async fn update_sandbox(
    State(state): State<AppState>,
    tenant: Tenant,
    Path(sandbox_id): Path<String>,
    Json(body): Json<UpdateSandboxBody>,
) -> ApiResult<Json<SandboxResponse>> {
    require_id(IdKind::Sandbox, &sandbox_id)?;
    let sandbox = match body.replay_public {
        Some(public) => {
            state
                .manager
                .set_replay_public(&tenant.org_id, &sandbox_id, public)
                .await?
        }
        None => state.manager.get(&tenant.org_id, &sandbox_id).await?,
    };
    Ok(Json(SandboxResponse::from(&sandbox)))
}

pub async fn stop_sandbox(
    State(state): State<AppState>,
    tenant: Tenant,
    Path(sandbox_id): Path<String>,
) -> ApiResult<Json<SandboxResponse>> {
    require_id(IdKind::Sandbox, &sandbox_id)?;
    info!(sandbox_id = %sandbox_id, org_id = %tenant.org_id, "Stop requested");
    let sandbox = state.manager.stop(&tenant.org_id, &sandbox_id).await?;
    Ok(Json(SandboxResponse::from(&sandbox)))
}

pub async fn delete_sandbox(
    State(state): State<AppState>,
    tenant: Tenant,
    Path(sandbox_id): Path<String>,
) -> ApiResult<Json<SandboxResponse>> {
    require_id(IdKind::Sandbox, &sandbox_id)?;
    info!(sandbox_id = %sandbox_id, org_id = %tenant.org_id, audit = true, "Delete requested");
    let sandbox = state.manager.delete(&tenant.org_id, &sandbox_id).await?;
    Ok(Json(SandboxResponse::from(&sandbox)))
}

#[derive(Debug, Default, Deserialize)]
pub struct ForkBody {
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub ttl_seconds: Option<i64>,
}

pub async fn fork_sandbox(
    State(state): State<AppState>,
    tenant: Tenant,
    Path(sandbox_id): Path<String>,
    body: Option<Json<ForkBody>>,
) -> ApiResult<impl IntoResponse> {
    require_id(IdKind::Sandbox, &sandbox_id)?;
    let body = body.map(|Json(b)| b).unwrap_or_default();
    let child = state
        .manager
        .fork(
            &tenant.org_id,
            &sandbox_id,
            ForkRequest {
                env: body.env,
                ttl_seconds: body.ttl_seconds,
            },
        )
        .await?;
    Ok((StatusCode::CREATED, Json(SandboxResponse::from(&child))))
}

pub async fn fork_tree(
    State(state): State<AppState>,
    tenant: Tenant,
    Path(sandbox_id): Path<String>,
) -> ApiResult<Json<ForkTreeResponse>> {
    require_id(IdKind::Sandbox, &sandbox_id)?;
    let tree = state.manager.fork_tree(&tenant.org_id, &sandbox_id).await?;
    Ok(Json(ForkTreeResponse::from(tree)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use sandchest_core::generate_id;

    #[test]
    fn test_require_id_checks_kind_and_format() {
        assert!(require_id(IdKind::Sandbox, &generate_id(IdKind::Sandbox)).is_ok());
        assert!(require_id(IdKind::Sandbox, &generate_id(IdKind::Exec)).is_err());
        assert!(require_id(IdKind::Sandbox, "sb_short").is_err());
    }
}

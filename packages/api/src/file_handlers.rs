// ABOUTME: HTTP handlers for reading, writing, listing and deleting files in a sandbox
// ABOUTME: File bodies travel as raw bytes; the target path is a query parameter

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::header,
    response::{IntoResponse, Response},
    Json,
};
use sandchest_core::IdKind;
use serde::Deserialize;
use serde_json::json;

use crate::auth::Tenant;
use crate::error::{ApiResult, AppError};
use crate::sandbox_handlers::require_id;
use crate::state::AppState;

/// Largest accepted upload.
pub const MAX_FILE_BYTES: usize = 64 * 1024 * 1024;

#[derive(Debug, Default, Deserialize)]
pub struct FileQuery {
    pub path: Option<String>,
    #[serde(default)]
    pub list: bool,
}

impl FileQuery {
    fn path(&self) -> ApiResult<&str> {
        self.path
            .as_deref()
            .filter(|p| !p.is_empty())
            .ok_or_else(|| AppError::bad_request("query parameter 'path' is required"))
    }
}

pub async fn put_file(
    State(state): State<AppState>,
    tenant: Tenant,
    Path(sandbox_id): Path<String>,
    Query(query): Query<FileQuery>,
    body: Bytes,
) -> ApiResult<Json<serde_json::Value>> {
    require_id(IdKind::Sandbox, &sandbox_id)?;
    let path = query.path()?;
    let size = body.len();
    state
        .manager
        .put_file(&tenant.org_id, &sandbox_id, path, body.to_vec())
        .await?;
    Ok(Json(json!({ "path": path, "size_bytes": size })))
}

/// Download a file, or list a directory when `list=true`.
pub async fn get_file(
    State(state): State<AppState>,
    tenant: Tenant,
    Path(sandbox_id): Path<String>,
    Query(query): Query<FileQuery>,
) -> ApiResult<Response> {
    require_id(IdKind::Sandbox, &sandbox_id)?;
    let path = query.path()?;

    if query.list {
        let files = state
            .manager
            .list_files(&tenant.org_id, &sandbox_id, path)
            .await?;
        return Ok(Json(json!({ "files": files })).into_response());
    }

    let content = state
        .manager
        .get_file(&tenant.org_id, &sandbox_id, path)
        .await?;
    Ok((
        [(header::CONTENT_TYPE, "application/octet-stream")],
        content,
    )
        .into_response())
}

pub async fn delete_file(
    State(state): State<AppState>,
    tenant: Tenant,
    Path(sandbox_id): Path<String>,
    Query(query): Query<FileQuery>,
) -> ApiResult<Json<serde_json::Value>> {
    require_id(IdKind::Sandbox, &sandbox_id)?;
    let path = query.path()?;
    state
        .manager
        .delete_file(&tenant.org_id, &sandbox_id, path)
        .await?;
    Ok(Json(json!({ "ok": true })))
}

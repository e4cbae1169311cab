// ABOUTME: HTTP handlers serving a sandbox's replay event log
// ABOUTME: Owners read their own replays; anyone may read one its owner made public

use axum::{
    extract::{Path, Query, State},
    Json,
};
use sandchest_core::IdKind;
use serde::Deserialize;

use crate::auth::Tenant;
use crate::error::ApiResult;
use crate::response::ReplayResponse;
use crate::sandbox_handlers::require_id;
use crate::state::AppState;

#[derive(Debug, Default, Deserialize)]
pub struct ReplayQuery {
    /// Only events with a sequence number above this.
    #[serde(default)]
    pub after: u64,
}

pub async fn get_replay(
    State(state): State<AppState>,
    tenant: Tenant,
    Path(sandbox_id): Path<String>,
    Query(query): Query<ReplayQuery>,
) -> ApiResult<Json<ReplayResponse>> {
    require_id(IdKind::Sandbox, &sandbox_id)?;
    let events = state
        .manager
        .replay(&tenant.org_id, &sandbox_id, query.after)
        .await?;
    Ok(Json(ReplayResponse { sandbox_id, events }))
}

pub async fn get_public_replay(
    State(state): State<AppState>,
    Path(sandbox_id): Path<String>,
    Query(query): Query<ReplayQuery>,
) -> ApiResult<Json<ReplayResponse>> {
    require_id(IdKind::Sandbox, &sandbox_id)?;
    let (sandbox, events) = state
        .manager
        .public_replay(&sandbox_id, query.after)
        .await?;
    Ok(Json(ReplayResponse {
        sandbox_id: sandbox.id,
        events,
    }))
}

// ABOUTME: Internal endpoints called by node agents
// ABOUTME: Heartbeats keep a node eligible for placement and its sandboxes alive

use axum::{
    extract::{Path, State},
    http::HeaderMap,
    Json,
};
use sandchest_core::format_timestamp;
use sandchest_sandbox::NodeHeartbeat;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::auth::verify_internal_token;
use crate::error::{ApiResult, AppError};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct HeartbeatBody {
    #[serde(default)]
    pub address: Option<String>,
    pub slots_total: u32,
    #[serde(default)]
    pub active_sandbox_ids: Vec<String>,
}

pub async fn heartbeat(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(node_id): Path<String>,
    Json(body): Json<HeartbeatBody>,
) -> ApiResult<Json<Value>> {
    verify_internal_token(state.internal_token.as_deref(), &headers)?;
    if node_id.trim().is_empty() {
        return Err(AppError::bad_request("node_id must not be empty"));
    }

    let node = state
        .manager
        .node_heartbeat(NodeHeartbeat {
            node_id,
            address: body.address,
            slots_total: body.slots_total,
            active_sandbox_ids: body.active_sandbox_ids,
        })
        .await?;
    Ok(Json(json!({
        "node_id": node.id,
        "slots_total": node.slots_total,
        "last_heartbeat_at": format_timestamp(&node.last_heartbeat_at),
    })))
}

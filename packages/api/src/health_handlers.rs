// ABOUTME: Liveness and readiness probes
// ABOUTME: Served outside authentication and still answered while the server drains

use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use serde_json::json;

use crate::middleware::DrainController;

pub async fn healthz() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

/// Reports not ready once draining so load balancers stop routing here.
pub async fn readyz(State(drain): State<DrainController>) -> impl IntoResponse {
    if drain.is_draining() {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "status": "draining" })),
        );
    }
    (StatusCode::OK, Json(json!({ "status": "ready" })))
}

/// Readiness plus build version and in-flight request count.
pub async fn health(State(drain): State<DrainController>) -> impl IntoResponse {
    let draining = drain.is_draining();
    let status = if draining {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };
    (
        status,
        Json(json!({
            "status": if draining { "draining" } else { "ready" },
            "service": "sandchest",
            "version": env!("CARGO_PKG_VERSION"),
            "active_connections": drain.active_connections(),
        })),
    )
}

// ABOUTME: HTTP API layer for Sandchest providing REST endpoints and routing
// ABOUTME: Tenant routes sit behind key authentication and rate limiting; the drain gate wraps everything

use axum::{
    extract::DefaultBodyLimit,
    middleware::from_fn_with_state,
    routing::{delete, get, post},
    Router,
};
use tower_http::trace::TraceLayer;

pub mod artifact_handlers;
pub mod auth;
pub mod error;
pub mod exec_handlers;
pub mod file_handlers;
pub mod health_handlers;
pub mod middleware;
pub mod node_handlers;
pub mod quota;
pub mod replay_handlers;
pub mod response;
pub mod sandbox_handlers;
pub mod session_handlers;
pub mod sse;
pub mod state;

pub use auth::{ApiKeys, Tenant};
pub use error::{ApiResult, AppError};
pub use middleware::{DrainController, RateLimiter};
pub use quota::{QuotaProvider, RateCategory, RateLimits, StaticQuotas};
pub use state::AppState;

/// Routes that act on behalf of an authenticated tenant.
fn tenant_router(state: &AppState) -> Router<AppState> {
    Router::new()
        .route(
            "/v1/sandboxes",
            get(sandbox_handlers::list_sandboxes).post(sandbox_handlers::create_sandbox),
        )
        .route(
            "/v1/sandboxes/{id}",
            get(sandbox_handlers::get_sandbox)
                .patch(sandbox_handlers::update_sandbox)
                .delete(sandbox_handlers::delete_sandbox),
        )
        .route("/v1/sandboxes/{id}/stop", post(sandbox_handlers::stop_sandbox))
        .route("/v1/sandboxes/{id}/fork", post(sandbox_handlers::fork_sandbox))
        .route("/v1/sandboxes/{id}/forks", get(sandbox_handlers::fork_tree))
        // Commands
        .route(
            "/v1/sandboxes/{id}/exec",
            get(exec_handlers::list_execs).post(exec_handlers::exec),
        )
        .route("/v1/sandboxes/{id}/exec/{exec_id}", get(exec_handlers::get_exec))
        .route(
            "/v1/sandboxes/{id}/exec/{exec_id}/stream",
            get(exec_handlers::stream_exec),
        )
        // Sessions
        .route(
            "/v1/sandboxes/{id}/sessions",
            get(session_handlers::list_sessions).post(session_handlers::create_session),
        )
        .route(
            "/v1/sandboxes/{id}/sessions/{session_id}",
            delete(session_handlers::destroy_session),
        )
        .route(
            "/v1/sandboxes/{id}/sessions/{session_id}/exec",
            post(session_handlers::session_exec),
        )
        .route(
            "/v1/sandboxes/{id}/sessions/{session_id}/input",
            post(session_handlers::session_input),
        )
        // Files and artifacts
        .route(
            "/v1/sandboxes/{id}/files",
            get(file_handlers::get_file)
                .put(file_handlers::put_file)
                .delete(file_handlers::delete_file)
                .layer(DefaultBodyLimit::max(file_handlers::MAX_FILE_BYTES)),
        )
        .route(
            "/v1/sandboxes/{id}/artifacts",
            get(artifact_handlers::list_artifacts).post(artifact_handlers::register_artifacts),
        )
        .route("/v1/sandboxes/{id}/replay", get(replay_handlers::get_replay))
        // Route layers run bottom-up: authenticate, then rate limit.
        .route_layer(from_fn_with_state(state.clone(), middleware::rate_limit))
        .route_layer(from_fn_with_state(state.clone(), auth::authenticate))
}

/// Probes, public replays and node callbacks.
fn open_router() -> Router<AppState> {
    Router::new()
        .route("/healthz", get(health_handlers::healthz))
        .route("/readyz", get(health_handlers::readyz))
        .route("/health", get(health_handlers::health))
        .route(
            "/v1/public/replay/{id}",
            get(replay_handlers::get_public_replay),
        )
        .route(
            "/internal/nodes/{node_id}/heartbeat",
            post(node_handlers::heartbeat),
        )
}

/// Build the complete application router.
pub fn create_router(state: AppState) -> Router {
    tenant_router(&state)
        .merge(open_router())
        .layer(middleware::create_panic_handler())
        .layer(TraceLayer::new_for_http())
        .layer(from_fn_with_state(
            state.drain.clone(),
            middleware::drain_gate,
        ))
        .with_state(state)
}

// ABOUTME: Per-tenant, per-category request limiting over the shared coordination store
// ABOUTME: Fails open when the store cannot answer so infrastructure trouble never blocks traffic

use axum::{
    extract::{Request, State},
    http::{HeaderValue, Method},
    middleware::Next,
    response::{IntoResponse, Response},
};
use sandchest_coordination::{CoordinationStore, RateLimitDecision};
use sandchest_core::constants::RATE_LIMIT_WINDOW_SECS;
use sandchest_core::Clock;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::auth::Tenant;
use crate::error::AppError;
use crate::quota::{QuotaProvider, RateCategory};
use crate::state::AppState;

/// Upper bound on one counter round trip before failing open.
const CHECK_TIMEOUT: Duration = Duration::from_secs(2);

/// Categorize a tenant request by method and path.
pub fn categorize(method: &Method, path: &str) -> RateCategory {
    let segments: Vec<&str> = path.trim_matches('/').split('/').collect();
    if *method == Method::POST {
        match segments.as_slice() {
            ["v1", "sandboxes"] | ["v1", "sandboxes", _, "fork"] => {
                return RateCategory::SandboxCreate
            }
            ["v1", "sandboxes", _, "exec"]
            | ["v1", "sandboxes", _, "sessions", _, "exec"]
            | ["v1", "sandboxes", _, "sessions", _, "input"] => return RateCategory::Exec,
            _ => {}
        }
    }
    RateCategory::Read
}

/// Fixed-window request counter keyed by tenant and category.
#[derive(Clone)]
pub struct RateLimiter {
    store: Arc<dyn CoordinationStore>,
    quotas: Arc<dyn QuotaProvider>,
    clock: Arc<dyn Clock>,
    window_secs: u64,
}

impl RateLimiter {
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        quotas: Arc<dyn QuotaProvider>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            quotas,
            clock,
            window_secs: RATE_LIMIT_WINDOW_SECS,
        }
    }

    pub fn now_ms(&self) -> i64 {
        self.clock.now_ms()
    }

    /// Count one request and decide. Store errors and timeouts allow the request.
    pub async fn check(&self, org_id: &str, category: RateCategory) -> RateLimitDecision {
        let limit = self.quotas.limits(org_id).for_category(category);
        let counted = tokio::time::timeout(
            CHECK_TIMEOUT,
            self.store
                .check_rate_limit(org_id, category.as_str(), limit, self.window_secs),
        )
        .await;

        match counted {
            Ok(Ok(decision)) => decision,
            Ok(Err(e)) => {
                warn!(
                    org_id = %org_id,
                    category = %category.as_str(),
                    error = %e,
                    "Rate limit check failed, allowing request"
                );
                RateLimitDecision::fail_open(limit, self.clock.now_ms(), self.window_secs)
            }
            Err(_) => {
                warn!(
                    org_id = %org_id,
                    category = %category.as_str(),
                    "Rate limit check timed out, allowing request"
                );
                RateLimitDecision::fail_open(limit, self.clock.now_ms(), self.window_secs)
            }
        }
    }
}

fn insert_headers(response: &mut Response, decision: &RateLimitDecision) {
    let headers = response.headers_mut();
    headers.insert("x-ratelimit-limit", HeaderValue::from(decision.limit));
    headers.insert("x-ratelimit-remaining", HeaderValue::from(decision.remaining));
    headers.insert(
        "x-ratelimit-reset",
        HeaderValue::from(decision.reset_at_ms.div_euclid(1000)),
    );
}

/// Runs after authentication; requests without a tenant pass through.
pub async fn rate_limit(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let Some(tenant) = request.extensions().get::<Tenant>().cloned() else {
        return next.run(request).await;
    };
    let category = categorize(request.method(), request.uri().path());
    let decision = state.limiter.check(&tenant.org_id, category).await;

    if !decision.allowed {
        let retry_after = decision.retry_after_secs(state.limiter.now_ms());
        info!(
            org_id = %tenant.org_id,
            category = %category.as_str(),
            limit = decision.limit,
            retry_after,
            "Rate limit exceeded"
        );
        return AppError::RateLimited {
            limit: decision.limit,
            reset_at: decision.reset_at_ms.div_euclid(1000),
            retry_after,
        }
        .into_response();
    }

    debug!(
        org_id = %tenant.org_id,
        category = %category.as_str(),
        remaining = decision.remaining,
        "Rate limit check passed"
    );
    let mut response = next.run(request).await;
    insert_headers(&mut response, &decision);
    response
}

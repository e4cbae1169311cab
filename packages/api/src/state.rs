// ABOUTME: Shared state handed to every API handler and middleware
// ABOUTME: Bundles the sandbox manager with authentication, rate limiting and drain control

use axum::extract::FromRef;
use sandchest_sandbox::SandboxManager;
use std::sync::Arc;

use crate::auth::ApiKeys;
use crate::middleware::{DrainController, RateLimiter};

#[derive(Clone)]
pub struct AppState {
    pub manager: SandboxManager,
    pub api_keys: Arc<ApiKeys>,
    /// Shared secret for node agent callbacks; `None` disables them.
    pub internal_token: Option<String>,
    pub limiter: RateLimiter,
    pub drain: DrainController,
}

impl AppState {
    pub fn new(
        manager: SandboxManager,
        api_keys: ApiKeys,
        internal_token: Option<String>,
        limiter: RateLimiter,
        drain: DrainController,
    ) -> Self {
        Self {
            manager,
            api_keys: Arc::new(api_keys),
            internal_token,
            limiter,
            drain,
        }
    }
}

impl FromRef<AppState> for DrainController {
    fn from_ref(state: &AppState) -> Self {
        state.drain.clone()
    }
}

// ABOUTME: Bearer API key authentication resolving each request to a tenant
// ABOUTME: Keys are held as SHA-256 digests; node callbacks use a separate shared internal token

use axum::{
    extract::{FromRequestParts, Request, State},
    http::{header, request::Parts, HeaderMap},
    middleware::Next,
    response::Response,
};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use tracing::{debug, warn};

use crate::error::AppError;
use crate::state::AppState;

/// Header carrying the node-to-control-plane shared secret.
pub const INTERNAL_TOKEN_HEADER: &str = "x-internal-token";

/// The organization a request acts on behalf of.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tenant {
    pub org_id: String,
}

fn hash_token(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}

/// API key registry mapping key digests to organizations.
#[derive(Debug, Clone, Default)]
pub struct ApiKeys {
    by_digest: HashMap<String, String>,
}

impl ApiKeys {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: &str, org_id: impl Into<String>) {
        self.by_digest.insert(hash_token(key), org_id.into());
    }

    /// Parse `key:org,key:org`. Entries without both parts are rejected.
    pub fn parse(spec: &str) -> Result<Self, String> {
        let mut keys = Self::new();
        for entry in spec.split(',').map(str::trim).filter(|e| !e.is_empty()) {
            match entry.split_once(':') {
                Some((key, org)) if !key.trim().is_empty() && !org.trim().is_empty() => {
                    keys.insert(key.trim(), org.trim());
                }
                _ => return Err(format!("malformed API key entry '{}'", redact(entry))),
            }
        }
        Ok(keys)
    }

    pub fn len(&self) -> usize {
        self.by_digest.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_digest.is_empty()
    }

    pub fn resolve(&self, key: &str) -> Option<Tenant> {
        self.by_digest.get(&hash_token(key)).map(|org_id| Tenant {
            org_id: org_id.clone(),
        })
    }
}

fn redact(entry: &str) -> String {
    entry.chars().take(4).chain("...".chars()).collect()
}

fn bearer(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|token| !token.is_empty())
}

/// Resolve the bearer key to a tenant and store it in request extensions.
pub async fn authenticate(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Result<Response, AppError> {
    let path = request.uri().path().to_string();
    let Some(token) = bearer(request.headers()) else {
        warn!(path = %path, audit = true, "Missing API key");
        return Err(AppError::Unauthorized);
    };
    let Some(tenant) = state.api_keys.resolve(token) else {
        warn!(path = %path, audit = true, "Invalid API key");
        return Err(AppError::Unauthorized);
    };

    debug!(path = %path, org_id = %tenant.org_id, "API key validated");
    request.extensions_mut().insert(tenant);
    Ok(next.run(request).await)
}

impl<S: Send + Sync> FromRequestParts<S> for Tenant {
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<Tenant>()
            .cloned()
            .ok_or(AppError::Unauthorized)
    }
}

/// Check the node-agent shared secret. No configured secret rejects every caller.
pub fn verify_internal_token(expected: Option<&str>, headers: &HeaderMap) -> Result<(), AppError> {
    let presented = headers
        .get(INTERNAL_TOKEN_HEADER)
        .and_then(|value| value.to_str().ok());
    match (expected, presented) {
        (Some(expected), Some(presented))
            if hash_token(expected) == hash_token(presented) =>
        {
            Ok(())
        }
        (None, _) => {
            warn!(audit = true, "Internal call rejected, no internal token configured");
            Err(AppError::Unauthorized)
        }
        _ => {
            warn!(audit = true, "Internal call rejected, bad internal token");
            Err(AppError::Unauthorized)
        }
    }
}

// ABOUTME: API error type and its JSON response mapping
// ABOUTME: Maps domain errors to status codes, machine-readable codes and retry guidance

use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use sandchest_sandbox::ManagerError;
use serde::Serialize;
use thiserror::Error;
use tracing::{error, info};
use uuid::Uuid;

/// Seconds a client should wait after a capacity rejection.
pub const CAPACITY_RETRY_AFTER_SECS: u64 = 5;

/// Main application error type that all handlers should return
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Unauthorized")]
    Unauthorized,

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Sandbox not running: {0}")]
    SandboxNotRunning(String),

    #[error("Rate limit exceeded")]
    RateLimited {
        limit: u32,
        /// Epoch seconds at which the window resets.
        reset_at: i64,
        retry_after: u64,
    },

    #[error("Capacity unavailable: {0}")]
    CapacityUnavailable(String),

    #[error("Service is draining")]
    ServiceUnavailable,

    #[error("Internal error: {0}")]
    Internal(String),
}

#[derive(Serialize)]
struct ErrorResponse {
    error: &'static str,
    message: String,
    request_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    retry_after: Option<u64>,
}

impl AppError {
    pub fn status_and_code(&self) -> (StatusCode, &'static str) {
        match self {
            AppError::BadRequest(_) => (StatusCode::BAD_REQUEST, "bad_request"),
            AppError::Validation(_) => (StatusCode::BAD_REQUEST, "validation_error"),
            AppError::Unauthorized => (StatusCode::UNAUTHORIZED, "unauthorized"),
            AppError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
            AppError::Conflict(_) => (StatusCode::CONFLICT, "conflict"),
            AppError::SandboxNotRunning(_) => (StatusCode::CONFLICT, "sandbox_not_running"),
            AppError::RateLimited { .. } => (StatusCode::TOO_MANY_REQUESTS, "rate_limited"),
            AppError::CapacityUnavailable(_) => {
                (StatusCode::SERVICE_UNAVAILABLE, "capacity_unavailable")
            }
            AppError::ServiceUnavailable => {
                (StatusCode::SERVICE_UNAVAILABLE, "service_unavailable")
            }
            AppError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error"),
        }
    }

    /// Message safe to show to the caller.
    fn user_message(&self) -> String {
        match self {
            AppError::BadRequest(msg)
            | AppError::Validation(msg)
            | AppError::Conflict(msg)
            | AppError::SandboxNotRunning(msg) => msg.clone(),
            AppError::Unauthorized => "A valid API key is required".to_string(),
            AppError::NotFound(what) => format!("{} not found", what),
            AppError::RateLimited { .. } => "Too many requests. Please try again later".to_string(),
            AppError::CapacityUnavailable(_) => {
                "No capacity is available right now. Please retry shortly".to_string()
            }
            AppError::ServiceUnavailable => {
                "Server is shutting down. Please retry on a new connection".to_string()
            }
            AppError::Internal(_) => "An internal server error occurred".to_string(),
        }
    }

    fn retry_after(&self) -> Option<u64> {
        match self {
            AppError::RateLimited { retry_after, .. } => Some(*retry_after),
            AppError::CapacityUnavailable(_) => Some(CAPACITY_RETRY_AFTER_SECS),
            _ => None,
        }
    }

    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::BadRequest(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }
}

impl From<ManagerError> for AppError {
    fn from(err: ManagerError) -> Self {
        match err {
            ManagerError::NotFound(what) => AppError::NotFound(what),
            ManagerError::Validation(msg) => AppError::Validation(msg),
            ManagerError::SandboxNotRunning(msg) => AppError::SandboxNotRunning(msg),
            ManagerError::Conflict(msg) => AppError::Conflict(msg),
            ManagerError::CapacityUnavailable(msg) => AppError::CapacityUnavailable(msg),
            other => AppError::Internal(other.to_string()),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let request_id = Uuid::new_v4().to_string();
        let (status, code) = self.status_and_code();

        match &self {
            AppError::Internal(detail) => {
                error!(request_id = %request_id, error = %detail, "Internal server error occurred");
            }
            AppError::Unauthorized => {
                info!(request_id = %request_id, audit = true, "Unauthorized request rejected");
            }
            _ => {
                info!(
                    request_id = %request_id,
                    error_code = %code,
                    error = %self,
                    "API error response"
                );
            }
        }

        let retry_after = self.retry_after();
        let body = ErrorResponse {
            error: code,
            message: self.user_message(),
            request_id,
            retry_after,
        };
        let mut response = (status, Json(body)).into_response();
        let headers = response.headers_mut();

        if let Some(secs) = retry_after {
            headers.insert(header::RETRY_AFTER, HeaderValue::from(secs));
        }
        if let AppError::RateLimited {
            limit, reset_at, ..
        } = &self
        {
            headers.insert("x-ratelimit-limit", HeaderValue::from(*limit));
            headers.insert("x-ratelimit-remaining", HeaderValue::from(0u32));
            headers.insert("x-ratelimit-reset", HeaderValue::from(*reset_at));
        }
        if matches!(self, AppError::ServiceUnavailable) {
            headers.insert(header::CONNECTION, HeaderValue::from_static("close"));
        }

        response
    }
}

/// Result type alias for API handlers
pub type ApiResult<T> = Result<T, AppError>;

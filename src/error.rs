use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use thiserror::Error;

/// Numeric error codes carried in every error body.
///
/// Codes are stable across releases; clients branch on `code`, never on
/// `message`.
pub mod codes {
    pub const SERVER_ERROR: u32 = 10_000_000;
    pub const INVALID_PARAMS: u32 = 10_000_001;
    pub const NOT_FOUND: u32 = 10_000_002;
    pub const UNAUTHORIZED_AUTH_NOT_EXIST: u32 = 10_000_003;
    pub const UNAUTHORIZED_TOKEN_ERROR: u32 = 10_000_004;
    pub const UNAUTHORIZED_TOKEN_TIMEOUT: u32 = 10_000_005;
    pub const UNAUTHORIZED_TOKEN_GENERATE: u32 = 10_000_006;
    pub const TOO_MANY_REQUESTS: u32 = 10_000_007;
    pub const UNAUTHORIZED_TOKEN_MISSING: u32 = 10_000_008;
    pub const REQUEST_TIMEOUT: u32 = 10_000_009;
}

/// Application-wide error types with appropriate HTTP status codes.
///
/// # Admission Errors
///
/// The guard middleware short-circuits the chain with one of:
///
/// - `RateLimitExceeded` - bucket for the resolved key had too few tokens
/// - `TokenMissing` / `TokenInvalidSignature` / `TokenExpired` - auth failures
/// - `RequestTimeout` - handler did not finish before its deadline
/// - `UnhandledFault` - a panic was caught by the recovery boundary
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Rate limit exceeded for key {0}")]
    RateLimitExceeded(String),

    #[error("Authentication token missing")]
    TokenMissing,

    #[error("Authentication token invalid: {0}")]
    TokenInvalidSignature(String),

    #[error("Authentication token expired")]
    TokenExpired,

    #[error("Unknown application credentials")]
    AuthNotExist,

    #[error("Failed to generate token: {0}")]
    TokenGenerate(String),

    #[error("Request exceeded deadline of {0:?}")]
    RequestTimeout(std::time::Duration),

    #[error("Unhandled fault: {0}")]
    UnhandledFault(String),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Invalid request: {0}")]
    BadRequest(String),

    #[error("Internal server error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),
}

/// Error response body for API endpoints.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub code: u32,
    pub message: String,
}

impl AppError {
    /// HTTP status, numeric code and client-facing message for this error.
    ///
    /// The message never contains internal details; those stay in logs.
    pub fn parts(&self) -> (StatusCode, u32, &str) {
        match self {
            AppError::RateLimitExceeded(_) => (
                StatusCode::TOO_MANY_REQUESTS,
                codes::TOO_MANY_REQUESTS,
                "Too many requests. Please retry later.",
            ),
            AppError::TokenMissing => (
                StatusCode::UNAUTHORIZED,
                codes::UNAUTHORIZED_TOKEN_MISSING,
                "Authentication token required",
            ),
            AppError::TokenInvalidSignature(_) => (
                StatusCode::UNAUTHORIZED,
                codes::UNAUTHORIZED_TOKEN_ERROR,
                "Authentication token is invalid",
            ),
            AppError::TokenExpired => (
                StatusCode::UNAUTHORIZED,
                codes::UNAUTHORIZED_TOKEN_TIMEOUT,
                "Authentication token has expired",
            ),
            AppError::AuthNotExist => (
                StatusCode::UNAUTHORIZED,
                codes::UNAUTHORIZED_AUTH_NOT_EXIST,
                "Unknown application credentials",
            ),
            AppError::TokenGenerate(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                codes::UNAUTHORIZED_TOKEN_GENERATE,
                "Failed to generate authentication token",
            ),
            AppError::RequestTimeout(_) => (
                StatusCode::GATEWAY_TIMEOUT,
                codes::REQUEST_TIMEOUT,
                "Request timed out. Please try again.",
            ),
            AppError::UnhandledFault(_) | AppError::Internal(_) | AppError::ConfigError(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                codes::SERVER_ERROR,
                "An internal error occurred. Please contact support if the issue persists.",
            ),
            AppError::SerializationError(_) => (
                StatusCode::BAD_REQUEST,
                codes::INVALID_PARAMS,
                "Malformed request body",
            ),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, codes::NOT_FOUND, msg.as_str()),
            AppError::BadRequest(msg) => {
                (StatusCode::BAD_REQUEST, codes::INVALID_PARAMS, msg.as_str())
            }
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code, message) = self.parts();

        // Full detail goes to the log; the body only carries the sanitized message
        if status.is_server_error() {
            tracing::error!(error = %self, code, "Request failed");
        } else {
            tracing::warn!(error = %self, code, "Request rejected");
        }

        let body = ErrorResponse {
            code,
            message: message.to_string(),
        };

        (status, axum::Json(body)).into_response()
    }
}

/// Convenience type alias for Results with AppError.
pub type AppResult<T> = Result<T, AppError>;

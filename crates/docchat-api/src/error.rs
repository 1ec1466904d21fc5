//! API error types and JSON error response formatting.
//!
//! ApiError provides a consistent JSON error response format across all
//! endpoints, mapping internal errors to appropriate HTTP status codes.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use tracing::error;

use docchat_backend::BackendError;
use docchat_core::error::DocchatError;
use docchat_core::session::AuthError;

/// JSON error response body.
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    /// Machine-readable error code (e.g., "bad_request", "not_found").
    pub error: String,
    /// Human-readable error message.
    pub message: String,
}

/// API error type that maps to HTTP status codes and JSON responses.
#[derive(Debug)]
pub enum ApiError {
    /// 400 Bad Request - missing or invalid parameters.
    BadRequest(String),
    /// 401 Unauthorized - missing, unknown or expired bearer token.
    Unauthorized(String),
    /// 401 Unauthorized - wrong e-mail or password.
    InvalidCredentials(String),
    /// 403 Forbidden - the account has not confirmed its e-mail.
    EmailNotConfirmed(String),
    /// 404 Not Found - resource does not exist or belongs to someone else.
    NotFound(String),
    /// 409 Conflict - e.g. the e-mail is already registered.
    Conflict(String),
    /// 429 Too Many Requests - rate limit exceeded.
    TooManyRequests(String),
    /// 500 Internal Server Error - unexpected server error.
    Internal(String),
    /// 502 Bad Gateway - the indexing backend could not be reached or
    /// answered with something unusable.
    BadGateway(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error_code, message) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "bad_request", msg),
            ApiError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, "unauthorized", msg),
            ApiError::InvalidCredentials(msg) => {
                (StatusCode::UNAUTHORIZED, "invalid_credentials", msg)
            }
            ApiError::EmailNotConfirmed(msg) => {
                (StatusCode::FORBIDDEN, "email_not_confirmed", msg)
            }
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, "not_found", msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, "conflict", msg),
            ApiError::TooManyRequests(msg) => {
                (StatusCode::TOO_MANY_REQUESTS, "too_many_requests", msg)
            }
            ApiError::Internal(msg) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "internal_error", msg)
            }
            ApiError::BadGateway(msg) => (StatusCode::BAD_GATEWAY, "bad_gateway", msg),
        };

        let body = ErrorBody {
            error: error_code.to_string(),
            message,
        };

        (status, Json(body)).into_response()
    }
}

impl From<DocchatError> for ApiError {
    fn from(err: DocchatError) -> Self {
        match err {
            DocchatError::Validation(msg) => ApiError::BadRequest(msg),
            DocchatError::NotFound(msg) => ApiError::NotFound(msg),
            DocchatError::Backend(msg) => ApiError::BadGateway(msg),
            DocchatError::Auth(e) => ApiError::from(e),
            other => {
                error!(error = %other, "Request failed");
                ApiError::Internal(other.to_string())
            }
        }
    }
}

impl From<AuthError> for ApiError {
    fn from(err: AuthError) -> Self {
        let msg = err.to_string();
        match err {
            AuthError::EmailNotConfirmed => ApiError::EmailNotConfirmed(msg),
            AuthError::InvalidCredentials => ApiError::InvalidCredentials(msg),
            AuthError::SessionNotFound => ApiError::Unauthorized(msg),
            AuthError::EmailAlreadyRegistered | AuthError::EmailAlreadyConfirmed => {
                ApiError::Conflict(msg)
            }
            AuthError::UserNotFound => ApiError::NotFound(msg),
            AuthError::InvalidConfirmationToken
            | AuthError::InvalidEmail
            | AuthError::WeakPassword { .. } => ApiError::BadRequest(msg),
            AuthError::Provider(_) => {
                error!(error = %msg, "Auth provider failure");
                ApiError::Internal(msg)
            }
        }
    }
}

impl From<BackendError> for ApiError {
    fn from(err: BackendError) -> Self {
        ApiError::BadGateway(err.to_string())
    }
}

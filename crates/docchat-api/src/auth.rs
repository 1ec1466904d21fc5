//! API authentication via bearer session tokens.
//!
//! Resolves `Authorization: Bearer <access_token>` through the auth
//! provider and hands the live `Session` to handlers as a request
//! extension.

use axum::extract::{Request, State};
use axum::http::header::AUTHORIZATION;
use axum::http::HeaderMap;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use tracing::debug;

use docchat_core::session::Session;

use crate::error::ApiError;
use crate::state::AppState;

/// Pull the token out of an `Authorization` header value.
pub fn bearer_token(value: &str) -> Option<&str> {
    value
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

/// Resolve the bearer session named by `headers`.
///
/// Fails with 401 if the header is missing, malformed, or names a session
/// the provider does not know (or that has expired).
pub async fn resolve_session(state: &AppState, headers: &HeaderMap) -> Result<Session, ApiError> {
    let value = headers
        .get(AUTHORIZATION)
        .ok_or_else(|| ApiError::Unauthorized("Missing Authorization header".to_string()))?;
    let value = value
        .to_str()
        .map_err(|_| ApiError::Unauthorized("Invalid Authorization header encoding".to_string()))?;
    let token = bearer_token(value)
        .ok_or_else(|| ApiError::Unauthorized("Invalid bearer token".to_string()))?;

    match state.auth.get_session(token).await? {
        Some(session) => Ok(session),
        None => {
            debug!("Rejected unknown or expired session");
            Err(ApiError::Unauthorized("Session not found or expired".to_string()))
        }
    }
}

/// Middleware that validates Bearer token authentication and hands the
/// `Session` to handlers as a request extension.
pub async fn require_auth(State(state): State<AppState>, mut req: Request, next: Next) -> Response {
    let resolved = resolve_session(&state, req.headers()).await;
    match resolved {
        Ok(session) => {
            req.extensions_mut().insert(session);
            next.run(req).await
        }
        Err(e) => e.into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bearer_token() {
        assert_eq!(bearer_token("Bearer abc123"), Some("abc123"));
        assert_eq!(bearer_token("Bearer "), None);
        assert_eq!(bearer_token("Basic abc123"), None);
        assert_eq!(bearer_token("abc123"), None);
    }
}

//! Router setup with all API routes and middleware.
//!
//! Configures the axum Router with CORS, tracing, compression,
//! and all endpoint handlers.

use axum::extract::DefaultBodyLimit;
use axum::http::{header, HeaderValue, Method};
use axum::routing::{get, post};
use axum::Router;
use tower_http::compression::CompressionLayer;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::warn;

use docchat_core::error::DocchatError;

use crate::handlers;
use crate::rate_limit::RateLimiter;
use crate::state::AppState;

/// Request bodies above this size are rejected.
const BODY_LIMIT: usize = 1024 * 1024;

fn cors_layer(origins: &[String]) -> CorsLayer {
    let origins: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| match origin.parse::<HeaderValue>() {
            Ok(value) => Some(value),
            Err(e) => {
                warn!(origin = %origin, error = %e, "Ignoring invalid CORS origin");
                None
            }
        })
        .collect();

    CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION, header::ACCEPT])
}

/// Create the axum Router with all routes and middleware.
pub fn create_router(state: AppState) -> Router {
    let cors = cors_layer(&state.config.server.allowed_origins);

    // Routes that do NOT require authentication.
    let public_routes = Router::new()
        .route("/health", get(handlers::health))
        .route("/api/chat", post(handlers::relay_chat))
        .route("/api/crawl_docs_proxy", post(handlers::relay_crawl_docs))
        .route(
            "/api/document_status/{id}",
            get(handlers::relay_document_status),
        )
        .route(
            "/api/document_status/{id}/progress",
            get(handlers::document_progress),
        )
        .route("/auth/signup", post(handlers::sign_up))
        .route("/auth/signin", post(handlers::sign_in))
        .route("/auth/confirm", post(handlers::confirm_email))
        .route("/auth/resend", post(handlers::resend_confirmation));

    let limiter = RateLimiter::new(state.config.server.rate_limit_per_sec);

    // Rate-limited protected routes.
    let rate_limited_routes = Router::new()
        .route("/auth/session", get(handlers::current_session))
        .route("/auth/signout", post(handlers::sign_out))
        .route(
            "/api/conversations",
            get(handlers::list_conversations).post(handlers::create_conversation),
        )
        .route("/api/conversations/{id}", get(handlers::get_conversation))
        .route(
            "/api/conversations/{id}/messages",
            get(handlers::list_messages),
        )
        .route("/api/conversations/{id}/ask", post(handlers::ask))
        .route(
            "/api/conversations/{id}/ask/stream",
            post(handlers::ask_stream),
        )
        .route("/api/ingest", post(handlers::ingest))
        .layer(axum::middleware::from_fn(
            crate::rate_limit::rate_limit_middleware,
        ))
        .layer(axum::Extension(limiter.clone()));

    // Authenticates inside the handler, after the body is validated.
    let message_routes = Router::new()
        .route("/api/messages", post(handlers::insert_message))
        .layer(axum::middleware::from_fn(
            crate::rate_limit::rate_limit_middleware,
        ))
        .layer(axum::Extension(limiter));

    // Long-lived SSE stream exempt from rate limiting.
    let stream_routes = Router::new().route(
        "/api/conversations/{id}/stream",
        get(handlers::conversation_stream),
    );

    // Combine all protected routes behind auth.
    let protected_routes =
        rate_limited_routes
            .merge(stream_routes)
            .route_layer(axum::middleware::from_fn_with_state(
                state.clone(),
                crate::auth::require_auth,
            ));

    public_routes
        .merge(message_routes)
        .merge(protected_routes)
        .layer(DefaultBodyLimit::max(BODY_LIMIT))
        .layer(CompressionLayer::new())
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Serve the API on 127.0.0.1 at the configured port until the server
/// stops.
pub async fn start_server(state: AppState) -> Result<(), DocchatError> {
    let addr = format!("127.0.0.1:{}", state.config.server.port);
    let router = create_router(state);

    tracing::info!("Starting API server on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, router).await?;

    Ok(())
}

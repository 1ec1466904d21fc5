//! Docchat API crate - axum HTTP server, route handlers, SSE streaming.
//!
//! Serves the relay routes to the indexing backend, crawl progress as
//! server-sent events, e-mail/password auth, and the conversation store
//! routes for signed-in users.

pub mod auth;
pub mod error;
pub mod handlers;
pub mod rate_limit;
pub mod routes;
pub mod state;

pub use error::ApiError;
pub use routes::{create_router, start_server};
pub use state::AppState;

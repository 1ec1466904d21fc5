//! Fixed-window rate limiter for the signed-in routes.
//!
//! Counts requests in the current wall-clock second and rejects with 429
//! once `server.rate_limit_per_sec` is reached.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use axum::extract::{Extension, Request};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use tracing::debug;

use crate::error::ApiError;

/// Shared, cloneable request counter.
#[derive(Clone, Debug)]
pub struct RateLimiter {
    max_per_sec: u64,
    /// Epoch second the counter belongs to.
    window: Arc<AtomicU64>,
    /// Requests admitted or refused in `window`.
    count: Arc<AtomicU64>,
}

impl RateLimiter {
    pub fn new(max_per_sec: u64) -> Self {
        Self {
            max_per_sec,
            window: Arc::new(AtomicU64::new(0)),
            count: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn try_acquire(&self) -> bool {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        self.try_acquire_at(now)
    }

    /// Admit a request arriving at epoch second `now`.
    fn try_acquire_at(&self, now: u64) -> bool {
        let window = self.window.load(Ordering::Acquire);
        if window != now
            && self
                .window
                .compare_exchange(window, now, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
        {
            // This request opened the window.
            self.count.store(1, Ordering::Release);
            return self.max_per_sec > 0;
        }
        self.count.fetch_add(1, Ordering::AcqRel) < self.max_per_sec
    }
}

/// Axum middleware that enforces the rate limit.
pub async fn rate_limit_middleware(
    Extension(limiter): Extension<RateLimiter>,
    req: Request,
    next: Next,
) -> Response {
    if limiter.try_acquire() {
        next.run(req).await
    } else {
        debug!(path = %req.uri().path(), "Rate limit exceeded");
        ApiError::TooManyRequests("Rate limit exceeded".to_string()).into_response()
    }
}

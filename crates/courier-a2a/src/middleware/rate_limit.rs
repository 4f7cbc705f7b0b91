//! Per-caller rate limiting

use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use tracing::warn;

use super::auth::CallerFingerprint;
use super::{PipelineState, client_ip};
use crate::error::ApiError;

/// A sliding-window rate limiter that tracks per-caller request counts.
///
/// Each caller gets their own window of timestamps. When a new request
/// arrives, expired timestamps are pruned and the count is checked against
/// the limit.
#[derive(Clone)]
pub struct RateLimiter {
    /// Per-caller sliding windows of request timestamps
    windows: Arc<DashMap<String, VecDeque<Instant>>>,
    max_requests: usize,
    window_duration: Duration,
}

impl RateLimiter {
    pub fn new(max_requests: usize, window_duration: Duration) -> Self {
        Self {
            windows: Arc::new(DashMap::new()),
            max_requests: max_requests.max(1),
            window_duration,
        }
    }

    /// Record a request from `caller` if it is within limits.
    ///
    /// Returns how long the caller has to wait when the limit is exceeded.
    pub fn check_and_record(&self, caller: &str) -> Result<(), Duration> {
        let now = Instant::now();

        let mut entry = self.windows.entry(caller.to_string()).or_default();
        let window = entry.value_mut();

        while window
            .front()
            .is_some_and(|&t| now.duration_since(t) >= self.window_duration)
        {
            window.pop_front();
        }

        if window.len() >= self.max_requests {
            let retry_after = window
                .front()
                .map(|&oldest| self.window_duration.saturating_sub(now.duration_since(oldest)))
                .unwrap_or(self.window_duration);
            warn!(
                "Rate limit exceeded for caller '{}': {} requests in {:?} (limit: {})",
                caller,
                window.len(),
                self.window_duration,
                self.max_requests,
            );
            return Err(retry_after);
        }

        window.push_back(now);
        Ok(())
    }

    /// Forget callers whose whole window has expired
    pub fn prune(&self) -> usize {
        let now = Instant::now();
        let before = self.windows.len();
        self.windows.retain(|_, window| {
            window
                .back()
                .is_some_and(|&t| now.duration_since(t) < self.window_duration)
        });
        before - self.windows.len()
    }

    pub fn tracked_callers(&self) -> usize {
        self.windows.len()
    }
}

/// Innermost filter. Callers are keyed by token fingerprint when
/// authenticated, otherwise by source IP.
pub async fn enforce(State(state): State<PipelineState>, req: Request, next: Next) -> Response {
    let key = match req.extensions().get::<CallerFingerprint>() {
        Some(fingerprint) => format!("token:{}", fingerprint.0),
        None => format!("ip:{}", client_ip(&req)),
    };

    // Keep the window map bounded by the same ceiling as the connection table
    if state.rate_limiter.tracked_callers() > state.limits.max_tracked_ips {
        state.rate_limiter.prune();
    }

    match state.rate_limiter.check_and_record(&key) {
        Ok(()) => next.run(req).await,
        Err(wait) => ApiError::RateLimited {
            retry_after_secs: wait.as_secs_f64().ceil().max(1.0) as u64,
        }
        .into_response(),
    }
}

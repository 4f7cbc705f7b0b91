//! Request pipeline
//!
//! Outermost first:
//! 1. resource protection (connections per IP, tracked IPs, payload, memory)
//! 2. request timeout
//! 3. tracing
//! 4. CSRF
//! 5. bearer authentication
//! 6. rate limiting
//!
//! Each filter is an `axum::middleware::from_fn_with_state` function over a
//! shared [`PipelineState`].

pub mod auth;
pub mod csrf;
pub mod rate_limit;
pub mod resources;
pub mod timeout;
pub mod trace;

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

use axum::Router;
use axum::extract::{ConnectInfo, DefaultBodyLimit, Request};
use axum::middleware::{from_fn, from_fn_with_state};
use tower_http::limit::RequestBodyLimitLayer;

use crate::config::ServerLimits;

pub use rate_limit::RateLimiter;
pub use resources::{
    ConnectionGuard, ConnectionTracker, FixedMemoryProbe, MemoryProbe, ProcMemoryProbe,
};

/// Shared state for every pipeline filter
#[derive(Clone)]
pub struct PipelineState {
    pub limits: Arc<ServerLimits>,
    pub connections: ConnectionTracker,
    pub memory: Arc<dyn MemoryProbe>,
    pub auth_token: Option<Arc<str>>,
    pub rate_limiter: RateLimiter,
}

impl PipelineState {
    pub fn new(limits: ServerLimits, auth_token: Option<String>) -> Self {
        let limits = limits.clamped();
        Self {
            connections: ConnectionTracker::new(
                limits.max_connections_per_ip,
                limits.max_tracked_ips,
            ),
            rate_limiter: RateLimiter::new(limits.rate_limit_max, limits.rate_limit_window()),
            limits: Arc::new(limits),
            memory: Arc::new(ProcMemoryProbe::default()),
            auth_token: auth_token.filter(|t| !t.is_empty()).map(Arc::from),
        }
    }

    pub fn with_memory_probe(mut self, probe: Arc<dyn MemoryProbe>) -> Self {
        self.memory = probe;
        self
    }
}

/// Wrap `router` in the full pipeline
pub fn apply(router: Router, state: PipelineState) -> Router {
    let max_payload = state.limits.max_payload_bytes;
    router
        .layer(DefaultBodyLimit::disable())
        .layer(RequestBodyLimitLayer::new(max_payload))
        .layer(from_fn_with_state(state.clone(), rate_limit::enforce))
        .layer(from_fn_with_state(state.clone(), auth::require_bearer))
        .layer(from_fn(csrf::protect))
        .layer(from_fn(trace::trace_request))
        .layer(from_fn_with_state(state.clone(), timeout::enforce))
        .layer(from_fn_with_state(state, resources::protect))
}

/// Source IP of the request. Requests without connection info (in-process
/// calls) are attributed to the unspecified address.
pub(crate) fn client_ip(req: &Request) -> IpAddr {
    req.extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip())
        .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED))
}

/// Compare two secrets without short-circuiting on the first mismatch
pub(crate) fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

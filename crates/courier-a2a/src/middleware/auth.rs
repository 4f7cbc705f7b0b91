//! Bearer token authentication

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use axum::extract::{Request, State};
use axum::http::header::AUTHORIZATION;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use tracing::debug;

use super::{PipelineState, constant_time_eq};
use crate::error::ApiError;

/// Routes reachable without a token
const PUBLIC_PATHS: [&str; 2] = ["/a2a/agent-card", "/health"];

/// Opaque per-token identity, inserted for authenticated requests
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallerFingerprint(pub u64);

impl CallerFingerprint {
    fn of(token: &str) -> Self {
        let mut hasher = DefaultHasher::new();
        token.hash(&mut hasher);
        Self(hasher.finish())
    }
}

fn bearer(req: &Request) -> Option<&str> {
    let value = req.headers().get(AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = value.split_once(' ')?;
    scheme
        .eq_ignore_ascii_case("bearer")
        .then(|| token.trim())
        .filter(|t| !t.is_empty())
}

pub async fn require_bearer(
    State(state): State<PipelineState>,
    mut req: Request,
    next: Next,
) -> Response {
    let Some(expected) = state.auth_token.as_deref() else {
        return next.run(req).await;
    };
    if PUBLIC_PATHS.contains(&req.uri().path()) {
        return next.run(req).await;
    }

    let fingerprint = match bearer(&req) {
        None => return ApiError::Unauthorized.into_response(),
        Some(token) if !constant_time_eq(token.as_bytes(), expected.as_bytes()) => {
            debug!("Rejected bearer token for {}", req.uri().path());
            return ApiError::Forbidden.into_response();
        }
        Some(token) => CallerFingerprint::of(token),
    };

    req.extensions_mut().insert(fingerprint);
    next.run(req).await
}

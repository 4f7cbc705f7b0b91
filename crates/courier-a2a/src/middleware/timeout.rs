//! Per-request deadline

use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use tracing::warn;

use super::PipelineState;
use crate::error::ApiError;

/// Run the rest of the pipeline on its own task. When the deadline passes
/// the caller gets a 408 and the handler keeps running to completion.
pub async fn enforce(State(state): State<PipelineState>, req: Request, next: Next) -> Response {
    let deadline = state.limits.request_timeout();
    let path = req.uri().path().to_string();
    let handler = tokio::spawn(next.run(req));

    match tokio::time::timeout(deadline, handler).await {
        Ok(Ok(response)) => response,
        Ok(Err(join_err)) => {
            ApiError::Internal(format!("request handler aborted: {}", join_err)).into_response()
        }
        Err(_) => {
            warn!("Request to {} exceeded {:?}", path, deadline);
            ApiError::RequestTimeout {
                timeout_ms: state.limits.request_timeout_ms,
            }
            .into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerLimits;
    use axum::Router;
    use axum::body::Body;
    use axum::http::StatusCode;
    use axum::middleware::from_fn_with_state;
    use axum::routing::get;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;
    use tower::ServiceExt;

    fn state(timeout_ms: u64) -> PipelineState {
        let mut state = PipelineState::new(ServerLimits::default(), None);
        // Below the configurable floor so the test stays fast
        state.limits = Arc::new(ServerLimits {
            request_timeout_ms: timeout_ms,
            ..ServerLimits::default()
        });
        state
    }

    #[tokio::test]
    async fn test_slow_handler_gets_408_and_finishes() {
        let finished = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&finished);
        let app = Router::new()
            .route(
                "/slow",
                get(move || {
                    let flag = Arc::clone(&flag);
                    async move {
                        tokio::time::sleep(Duration::from_millis(150)).await;
                        flag.store(true, Ordering::SeqCst);
                        "late"
                    }
                }),
            )
            .layer(from_fn_with_state(state(30), enforce));

        let req = axum::http::Request::get("/slow").body(Body::empty()).unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::REQUEST_TIMEOUT);
        assert!(!finished.load(Ordering::SeqCst));

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(finished.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_fast_handler_passes_through() {
        let app = Router::new()
            .route("/", get(|| async { "quick" }))
            .layer(from_fn_with_state(state(1000), enforce));
        let req = axum::http::Request::get("/").body(Body::empty()).unwrap();
        assert_eq!(app.oneshot(req).await.unwrap().status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_panicking_handler_is_500() {
        let app = Router::new()
            .route(
                "/",
                get(|| async {
                    if true {
                        panic!("handler blew up");
                    }
                    "unreachable"
                }),
            )
            .layer(from_fn_with_state(state(1000), enforce));
        let req = axum::http::Request::get("/").body(Body::empty()).unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}

//! Request ids and per-request spans

use std::time::Instant;

use axum::extract::Request;
use axum::http::{HeaderName, HeaderValue};
use axum::middleware::Next;
use axum::response::Response;
use tracing::{Instrument, debug, info_span, warn};
use uuid::Uuid;

pub static REQUEST_ID_HEADER: HeaderName = HeaderName::from_static("x-request-id");

pub async fn trace_request(mut req: Request, next: Next) -> Response {
    let request_id = req
        .headers()
        .get(&REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty() && v.len() <= 128)
        .map(String::from)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let header = HeaderValue::from_str(&request_id).ok();
    if let Some(value) = &header {
        req.headers_mut().insert(REQUEST_ID_HEADER.clone(), value.clone());
    }

    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let span = info_span!("request", id = %request_id, %method, %path);

    let started = Instant::now();
    let mut response = next.run(req).instrument(span.clone()).await;
    let elapsed = started.elapsed();

    let status = response.status();
    span.in_scope(|| {
        if status.is_server_error() {
            warn!("{} {} -> {} in {:?}", method, path, status.as_u16(), elapsed);
        } else {
            debug!("{} {} -> {} in {:?}", method, path, status.as_u16(), elapsed);
        }
    });

    if let Some(value) = header {
        response.headers_mut().insert(REQUEST_ID_HEADER.clone(), value);
    }
    response
}

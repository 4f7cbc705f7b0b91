//! Double-submit CSRF protection for browser callers

use axum::extract::Request;
use axum::http::header::{COOKIE, SET_COOKIE};
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use tracing::debug;
use uuid::Uuid;

use super::constant_time_eq;
use crate::error::ApiError;

pub const CSRF_COOKIE: &str = "csrf_token";
pub static CSRF_HEADER: HeaderName = HeaderName::from_static("x-csrf-token");

fn is_safe(method: &Method) -> bool {
    matches!(*method, Method::GET | Method::HEAD | Method::OPTIONS)
}

/// Value of the `csrf_token` cookie, if the request carries one
fn cookie_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get_all(COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(name, _)| *name == CSRF_COOKIE)
        .map(|(_, value)| value)
        .filter(|value| !value.is_empty())
}

pub async fn protect(req: Request, next: Next) -> Response {
    if is_safe(req.method()) {
        let issue = cookie_token(req.headers()).is_none();
        let mut response = next.run(req).await;
        if issue {
            let token = Uuid::new_v4().simple().to_string();
            let cookie = format!("{}={}; Path=/; SameSite=Strict", CSRF_COOKIE, token);
            if let (Ok(cookie), Ok(token)) =
                (HeaderValue::from_str(&cookie), HeaderValue::from_str(&token))
            {
                let headers = response.headers_mut();
                headers.append(SET_COOKIE, cookie);
                headers.insert(CSRF_HEADER.clone(), token);
            }
        }
        return response;
    }

    // Cookie-less machine clients are not exposed to CSRF
    if !req.headers().contains_key(COOKIE) {
        return next.run(req).await;
    }

    let echoed = req
        .headers()
        .get(&CSRF_HEADER)
        .and_then(|value| value.to_str().ok());
    let valid = match (cookie_token(req.headers()), echoed) {
        (Some(cookie), Some(header)) => constant_time_eq(cookie.as_bytes(), header.as_bytes()),
        _ => false,
    };
    if !valid {
        debug!("CSRF check failed for {} {}", req.method(), req.uri().path());
        return ApiError::CsrfInvalid.into_response();
    }
    next.run(req).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::Router;
    use axum::body::Body;
    use axum::http::StatusCode;
    use axum::middleware::from_fn;
    use axum::routing::get;
    use tower::ServiceExt;

    fn app() -> Router {
        Router::new()
            .route("/", get(|| async { "read" }).post(|| async { "write" }))
            .layer(from_fn(protect))
    }

    #[tokio::test]
    async fn test_safe_request_receives_token() {
        let req = axum::http::Request::get("/").body(Body::empty()).unwrap();
        let resp = app().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let token = resp.headers()[&CSRF_HEADER].to_str().unwrap().to_string();
        let cookie = resp.headers()[SET_COOKIE].to_str().unwrap();
        assert!(cookie.starts_with(&format!("csrf_token={};", token)));
        assert!(cookie.contains("SameSite=Strict"));
    }

    #[tokio::test]
    async fn test_existing_cookie_not_reissued() {
        let req = axum::http::Request::get("/")
            .header(COOKIE, "theme=dark; csrf_token=abc")
            .body(Body::empty())
            .unwrap();
        let resp = app().oneshot(req).await.unwrap();
        assert!(resp.headers().get(SET_COOKIE).is_none());
    }

    #[tokio::test]
    async fn test_cookie_bearing_post_needs_matching_header() {
        let post = |header: Option<&str>| {
            let mut builder = axum::http::Request::post("/").header(COOKIE, "csrf_token=abc123");
            if let Some(value) = header {
                builder = builder.header(&CSRF_HEADER, value);
            }
            builder.body(Body::empty()).unwrap()
        };

        let resp = app().oneshot(post(None)).await.unwrap();
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);
        let resp = app().oneshot(post(Some("other"))).await.unwrap();
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);
        let resp = app().oneshot(post(Some("abc123"))).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_machine_clients_unaffected() {
        let req = axum::http::Request::post("/").body(Body::empty()).unwrap();
        let resp = app().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }
}

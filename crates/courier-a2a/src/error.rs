//! Client and server error types
//!
//! Every variant carries a stable string code. On the server side the code
//! travels in the error envelope; on the client side it is exposed through
//! [`ClientError::code`].

use axum::Json;
use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use courier_store::{StoreError, TaskState};
use serde_json::{Value, json};
use thiserror::Error;
use tracing::error;

use crate::config::RetryConfig;
use crate::protocol::{Envelope, ErrorBody};

/// Errors returned by [`crate::client::A2aClient`]
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Agent '{agent_id}' is not registered")]
    AgentNotFound { agent_id: String },

    #[error("Agent '{agent_id}' has an unusable URL: {reason}")]
    InvalidAgentUrl { agent_id: String, reason: String },

    #[error("Registry lookup failed: {0}")]
    Registry(#[from] StoreError),

    #[error("Request timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("Request cancelled")]
    Cancelled,

    #[error("Network error: {0}")]
    Network(#[source] reqwest::Error),

    #[error("HTTP {status}: {message}")]
    Http {
        status: u16,
        code: Option<String>,
        message: String,
    },

    #[error("Expected application/json response, got {}", .content_type.as_deref().unwrap_or("no content type"))]
    InvalidContentType { content_type: Option<String> },

    #[error("Response body exceeds {limit} bytes")]
    ResponseTooLarge { limit: usize },

    #[error("Response failed schema validation: {}", .violations.join("; "))]
    InvalidResponseSchema { violations: Vec<String> },

    #[error("Failed to decode response: {0}")]
    Decode(String),

    #[error("Remote agent error {code}: {message}")]
    Remote { code: String, message: String },

    #[error("{code} for agent '{agent_id}' after {attempts} attempts: {source}")]
    OperationFailed {
        code: &'static str,
        agent_id: String,
        attempts: u32,
        #[source]
        source: Box<ClientError>,
    },
}

impl ClientError {
    /// Stable machine-readable code
    pub fn code(&self) -> &str {
        match self {
            Self::AgentNotFound { .. } => "AGENT_NOT_FOUND",
            Self::InvalidAgentUrl { .. } => "INVALID_AGENT_URL",
            Self::Registry(_) => "REGISTRY_ERROR",
            Self::Timeout { .. } => "TIMEOUT",
            Self::Cancelled => "CANCELLED",
            Self::Network(_) => "NETWORK_ERROR",
            Self::Http { .. } => "HTTP_ERROR",
            Self::InvalidContentType { .. } => "INVALID_CONTENT_TYPE",
            Self::ResponseTooLarge { .. } => "RESPONSE_TOO_LARGE",
            Self::InvalidResponseSchema { .. } => "INVALID_RESPONSE_SCHEMA",
            Self::Decode(_) => "DECODE_ERROR",
            Self::Remote { .. } => "REMOTE_ERROR",
            Self::OperationFailed { code, .. } => code,
        }
    }

    /// Whether another attempt could succeed
    pub fn is_retryable(&self, retry: &RetryConfig) -> bool {
        match self {
            Self::Timeout { .. } => true,
            Self::Network(e) => !e.is_builder() && !e.is_redirect(),
            Self::Http { status, .. } => retry.is_retryable_status(*status),
            _ => false,
        }
    }

    /// HTTP status of the underlying failure, if any
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Http { status, .. } => Some(*status),
            Self::OperationFailed { source, .. } => source.status(),
            _ => None,
        }
    }
}

/// Server-side error, rendered as an error envelope with a matching status
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{message}")]
    Validation {
        message: String,
        details: Vec<String>,
    },

    #[error("Task not found: {0}")]
    TaskNotFound(String),

    #[error("Route not found: {0}")]
    RouteNotFound(String),

    #[error("Cannot move task from {from} to {to}")]
    InvalidTransition { from: TaskState, to: TaskState },

    #[error("Task {id} is {state} and cannot be modified")]
    TaskTerminal { id: String, state: TaskState },

    #[error("Task {id} is {state}; no result available yet")]
    TaskNotFinished { id: String, state: TaskState },

    #[error("Missing bearer token")]
    Unauthorized,

    #[error("Invalid bearer token")]
    Forbidden,

    #[error("Missing or mismatched CSRF token")]
    CsrfInvalid,

    #[error("Rate limit exceeded; retry in {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("Too many concurrent connections from this address")]
    TooManyConnections,

    #[error("Server is tracking too many clients")]
    ServerBusy,

    #[error("Server is under memory pressure")]
    MemoryPressure,

    #[error("Payload exceeds {limit} bytes")]
    PayloadTooLarge { limit: usize },

    #[error("Invalid Content-Length header")]
    InvalidContentLength,

    #[error("Request did not complete within {timeout_ms}ms")]
    RequestTimeout { timeout_ms: u64 },

    #[error("Internal server error")]
    Internal(String),
}

impl ApiError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
            details: Vec::new(),
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation { .. } => "VALIDATION_ERROR",
            Self::TaskNotFound(_) => "TASK_NOT_FOUND",
            Self::RouteNotFound(_) => "NOT_FOUND",
            Self::InvalidTransition { .. } | Self::TaskTerminal { .. } => {
                "INVALID_STATE_TRANSITION"
            }
            Self::TaskNotFinished { .. } => "TASK_NOT_FINISHED",
            Self::Unauthorized => "UNAUTHORIZED",
            Self::Forbidden => "FORBIDDEN",
            Self::CsrfInvalid => "CSRF_TOKEN_INVALID",
            Self::RateLimited { .. } => "RATE_LIMITED",
            Self::TooManyConnections => "TOO_MANY_CONNECTIONS",
            Self::ServerBusy => "SERVER_BUSY",
            Self::MemoryPressure => "MEMORY_PRESSURE",
            Self::PayloadTooLarge { .. } => "PAYLOAD_TOO_LARGE",
            Self::InvalidContentLength => "INVALID_CONTENT_LENGTH",
            Self::RequestTimeout { .. } => "REQUEST_TIMEOUT",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::Validation { .. } | Self::InvalidContentLength => StatusCode::BAD_REQUEST,
            Self::TaskNotFound(_) | Self::RouteNotFound(_) => StatusCode::NOT_FOUND,
            Self::InvalidTransition { .. }
            | Self::TaskTerminal { .. }
            | Self::TaskNotFinished { .. } => StatusCode::CONFLICT,
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::Forbidden | Self::CsrfInvalid => StatusCode::FORBIDDEN,
            Self::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::TooManyConnections | Self::ServerBusy | Self::MemoryPressure => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            Self::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            Self::RequestTimeout { .. } => StatusCode::REQUEST_TIMEOUT,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn details(&self) -> Option<Value> {
        match self {
            Self::Validation { details, .. } if !details.is_empty() => Some(json!(details)),
            Self::InvalidTransition { from, to } => Some(json!({ "from": from, "to": to })),
            Self::TaskTerminal { state, .. } | Self::TaskNotFinished { state, .. } => {
                Some(json!({ "state": state }))
            }
            Self::PayloadTooLarge { limit } => Some(json!({ "maxBytes": limit })),
            _ => None,
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound { id, .. } => ApiError::TaskNotFound(id),
            StoreError::InvalidTransition { from, to } => ApiError::InvalidTransition { from, to },
            StoreError::TaskTerminal { id, state } => ApiError::TaskTerminal { id, state },
            StoreError::Validation(message) => ApiError::validation(message),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if let ApiError::Internal(detail) = &self {
            error!("Internal error while handling request: {}", detail);
        }

        let body = Envelope::failure(ErrorBody {
            code: self.code().to_string(),
            message: self.to_string(),
            details: self.details(),
        });
        let mut response = (status, Json(body)).into_response();

        if let ApiError::RateLimited { retry_after_secs } = self {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(retry_after_secs));
        }
        response
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

/// Errors from [`crate::server::A2aServer`] lifecycle calls
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Server is already running on {0}")]
    AlreadyRunning(std::net::SocketAddr),

    #[error("Server was stopped and cannot be restarted")]
    Stopped,

    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("No free port on {host} in {start}..={end}")]
    NoFreePort { host: String, start: u16, end: u16 },

    #[error("Registry error: {0}")]
    Registry(#[from] StoreError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_error_codes() {
        assert_eq!(
            ClientError::AgentNotFound {
                agent_id: "x".into()
            }
            .code(),
            "AGENT_NOT_FOUND"
        );
        let wrapped = ClientError::OperationFailed {
            code: "GET_TASK_FAILED",
            agent_id: "x".into(),
            attempts: 4,
            source: Box::new(ClientError::Timeout { timeout_ms: 1000 }),
        };
        assert_eq!(wrapped.code(), "GET_TASK_FAILED");
        assert!(wrapped.to_string().contains("after 4 attempts"));
    }

    #[test]
    fn test_client_retry_classification() {
        let retry = RetryConfig::default();
        let http = |status| ClientError::Http {
            status,
            code: None,
            message: String::new(),
        };
        assert!(ClientError::Timeout { timeout_ms: 1 }.is_retryable(&retry));
        assert!(http(503).is_retryable(&retry));
        assert!(http(429).is_retryable(&retry));
        assert!(!http(401).is_retryable(&retry));
        assert!(!http(403).is_retryable(&retry));
        assert!(!http(404).is_retryable(&retry));
        assert!(!ClientError::Cancelled.is_retryable(&retry));
        assert!(
            !ClientError::InvalidResponseSchema { violations: vec![] }.is_retryable(&retry)
        );
        assert!(!ClientError::ResponseTooLarge { limit: 1 }.is_retryable(&retry));
    }

    #[test]
    fn test_api_error_mapping() {
        let cases = [
            (ApiError::Unauthorized, 401, "UNAUTHORIZED"),
            (ApiError::Forbidden, 403, "FORBIDDEN"),
            (ApiError::TooManyConnections, 503, "TOO_MANY_CONNECTIONS"),
            (ApiError::PayloadTooLarge { limit: 10 }, 413, "PAYLOAD_TOO_LARGE"),
            (ApiError::InvalidContentLength, 400, "INVALID_CONTENT_LENGTH"),
            (ApiError::RequestTimeout { timeout_ms: 5 }, 408, "REQUEST_TIMEOUT"),
            (ApiError::RateLimited { retry_after_secs: 3 }, 429, "RATE_LIMITED"),
        ];
        for (err, status, code) in cases {
            assert_eq!(err.status().as_u16(), status);
            assert_eq!(err.code(), code);
        }
    }

    #[test]
    fn test_store_error_conversion() {
        let err: ApiError = StoreError::InvalidTransition {
            from: TaskState::Completed,
            to: TaskState::Canceled,
        }
        .into();
        assert_eq!(err.status(), StatusCode::CONFLICT);
        assert_eq!(err.code(), "INVALID_STATE_TRANSITION");

        let err: ApiError = StoreError::Closed.into();
        assert_eq!(err.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn test_rate_limited_response_has_retry_after() {
        let response = ApiError::RateLimited { retry_after_secs: 7 }.into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()[header::RETRY_AFTER], "7");
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            "application/json"
        );
    }
}

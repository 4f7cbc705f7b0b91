//! A2A client — calls peer agents resolved through the registry
//!
//! Every operation resolves the target agent, then runs the HTTP exchange
//! under a per-attempt timeout with jittered exponential backoff between
//! retries. The whole operation is additionally bounded by an overall
//! deadline, and [`A2aClient::shutdown`] aborts anything still in flight.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use courier_store::{AgentRegistry, Task, TaskSummary};
use rand::Rng;
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use reqwest::{Client, Method, Response};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use crate::config::{ClientConfig, RetryConfig};
use crate::error::ClientError;
use crate::protocol::*;
use crate::schema;

/// The client-side operations, each with its own failure code
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    SendMessage,
    GetTask,
    ListTasks,
    GetAgentCard,
    CancelTask,
    GetTaskResult,
}

impl Operation {
    /// Code used when retries are exhausted
    pub fn failure_code(&self) -> &'static str {
        match self {
            Self::SendMessage => "SEND_MESSAGE_FAILED",
            Self::GetTask => "GET_TASK_FAILED",
            Self::ListTasks => "LIST_TASKS_FAILED",
            Self::GetAgentCard => "GET_AGENT_CARD_FAILED",
            Self::CancelTask => "CANCEL_TASK_FAILED",
            Self::GetTaskResult => "GET_TASK_RESULT_FAILED",
        }
    }

    fn name(&self) -> &'static str {
        match self {
            Self::SendMessage => "send_message",
            Self::GetTask => "get_task",
            Self::ListTasks => "list_tasks",
            Self::GetAgentCard => "get_agent_card",
            Self::CancelTask => "cancel_task",
            Self::GetTaskResult => "get_task_result",
        }
    }
}

/// A fully resolved request, reusable across attempts
struct Call {
    method: Method,
    url: Url,
    query: Option<ListTasksQuery>,
    body: Option<Value>,
}

/// Scale `delay` by a uniform factor in [0.5, 1.0]
pub(crate) fn jitter(delay: Duration, enabled: bool) -> Duration {
    if !enabled || delay.is_zero() {
        return delay;
    }
    let factor: f64 = rand::rng().random_range(0.5..=1.0);
    delay.mul_f64(factor)
}

/// A2A client for communicating with registered peer agents
#[derive(Clone)]
pub struct A2aClient {
    http: Client,
    registry: Arc<AgentRegistry>,
    config: Arc<ClientConfig>,
    shutdown: CancellationToken,
}

impl A2aClient {
    pub fn new(registry: Arc<AgentRegistry>, config: ClientConfig) -> Result<Self, ClientError> {
        let http = Client::builder()
            .user_agent(concat!("courier/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(ClientError::Network)?;
        Ok(Self {
            http,
            registry,
            config: Arc::new(config),
            shutdown: CancellationToken::new(),
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Abort every in-flight and future call with [`ClientError::Cancelled`]
    pub fn shutdown(&self) {
        if !self.shutdown.is_cancelled() {
            info!("A2A client shutting down");
            self.shutdown.cancel();
        }
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Send a message, creating a task or appending to an existing one
    pub async fn send_message(
        &self,
        agent_id: &str,
        request: &SendMessageRequest,
    ) -> Result<SendMessageResponse, ClientError> {
        let body = serde_json::to_value(request).map_err(|e| ClientError::Decode(e.to_string()))?;
        let data = self
            .execute(
                Operation::SendMessage,
                agent_id,
                Method::POST,
                &["a2a", "send-message"],
                None,
                Some(body),
            )
            .await?;
        let response: SendMessageResponse = decode(data)?;
        info!(
            "Message sent to '{}': task {} ({})",
            agent_id, response.task_id, response.status
        );
        Ok(response)
    }

    pub async fn get_task(&self, agent_id: &str, task_id: &str) -> Result<Task, ClientError> {
        let data = self
            .execute(
                Operation::GetTask,
                agent_id,
                Method::GET,
                &["a2a", "tasks", task_id],
                None,
                None,
            )
            .await?;
        decode(data)
    }

    pub async fn list_tasks(
        &self,
        agent_id: &str,
        query: &ListTasksQuery,
    ) -> Result<Vec<TaskSummary>, ClientError> {
        let data = self
            .execute(
                Operation::ListTasks,
                agent_id,
                Method::GET,
                &["a2a", "tasks"],
                Some(query.clone()),
                None,
            )
            .await?;
        decode(data)
    }

    /// Fetch an agent's capability card
    pub async fn get_agent_card(&self, agent_id: &str) -> Result<AgentCard, ClientError> {
        let data = self
            .execute(
                Operation::GetAgentCard,
                agent_id,
                Method::GET,
                &["a2a", "agent-card"],
                None,
                None,
            )
            .await?;
        let card: AgentCard = decode(data)?;
        debug!(
            "Fetched agent card: {} ({} capabilities)",
            card.name,
            card.capabilities.len()
        );
        Ok(card)
    }

    pub async fn cancel_task(
        &self,
        agent_id: &str,
        task_id: &str,
    ) -> Result<CancelTaskResponse, ClientError> {
        let data = self
            .execute(
                Operation::CancelTask,
                agent_id,
                Method::POST,
                &["a2a", "tasks", task_id, "cancel"],
                None,
                None,
            )
            .await?;
        let response: CancelTaskResponse = decode(data)?;
        info!("Task {} on '{}' cancelled", task_id, agent_id);
        Ok(response)
    }

    /// Fetch the final result of a finished task. The payload is checked
    /// against the task result schema before decoding; violations are never
    /// retried.
    pub async fn get_task_result(
        &self,
        agent_id: &str,
        task_id: &str,
    ) -> Result<TaskResult, ClientError> {
        let data = self
            .execute(
                Operation::GetTaskResult,
                agent_id,
                Method::GET,
                &["a2a", "tasks", task_id, "result"],
                None,
                None,
            )
            .await?;
        schema::validate_task_result(&data)?;
        decode(data)
    }

    async fn execute(
        &self,
        op: Operation,
        agent_id: &str,
        method: Method,
        path: &[&str],
        query: Option<ListTasksQuery>,
        body: Option<Value>,
    ) -> Result<Value, ClientError> {
        if self.shutdown.is_cancelled() {
            return Err(ClientError::Cancelled);
        }

        let url = self.resolve(agent_id, path).await?;
        let call = Call {
            method,
            url,
            query,
            body,
        };

        let retry = &self.config.retry;
        let deadline = retry.overall_deadline();
        let attempts = AtomicU32::new(0);

        let outcome = tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => Err(ClientError::Cancelled),
            result = tokio::time::timeout(deadline, self.with_retries(op, agent_id, &call, &attempts)) => {
                result.unwrap_or_else(|_| {
                    warn!("{} to '{}' exceeded overall deadline of {:?}", op.name(), agent_id, deadline);
                    Err(ClientError::Timeout {
                        timeout_ms: u64::try_from(deadline.as_millis()).unwrap_or(u64::MAX),
                    })
                })
            }
        };

        outcome.map_err(|err| {
            let attempts = attempts.load(Ordering::SeqCst);
            if err.is_retryable(retry) {
                ClientError::OperationFailed {
                    code: op.failure_code(),
                    agent_id: agent_id.to_string(),
                    attempts,
                    source: Box::new(err),
                }
            } else {
                err
            }
        })
    }

    async fn with_retries(
        &self,
        op: Operation,
        agent_id: &str,
        call: &Call,
        attempts: &AtomicU32,
    ) -> Result<Value, ClientError> {
        let retry = &self.config.retry;
        let mut attempt = 0u32;

        loop {
            attempts.fetch_add(1, Ordering::SeqCst);
            debug!(
                "{} -> '{}' {} {} (attempt {})",
                op.name(),
                agent_id,
                call.method,
                call.url,
                attempt + 1
            );

            match self.attempt(call, retry).await {
                Ok(data) => return Ok(data),
                Err(err) if attempt < retry.max_retries && err.is_retryable(retry) => {
                    let delay = jitter(retry.backoff(attempt), retry.enable_jitter);
                    warn!(
                        "{} to '{}' failed ({}), retrying in {:?} ({}/{})",
                        op.name(),
                        agent_id,
                        err,
                        delay,
                        attempt + 1,
                        retry.max_retries
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn attempt(&self, call: &Call, retry: &RetryConfig) -> Result<Value, ClientError> {
        let mut request = self
            .http
            .request(call.method.clone(), call.url.clone())
            .header(ACCEPT, "application/json");
        if let Some(query) = &call.query {
            request = request.query(query);
        }
        if let Some(token) = &self.config.auth_token {
            request = request.bearer_auth(token);
        }
        if let Some(body) = &call.body {
            request = request.json(body);
        }

        let limit = self.config.max_response_bytes;
        let exchange = async {
            let response = request.send().await.map_err(classify_reqwest)?;
            read_envelope(response, limit).await
        };

        // Dropping the exchange future on expiry aborts the connection
        match tokio::time::timeout(retry.timeout(), exchange).await {
            Ok(result) => result,
            Err(_) => Err(ClientError::Timeout {
                timeout_ms: retry.timeout_ms,
            }),
        }
    }

    async fn resolve(&self, agent_id: &str, path: &[&str]) -> Result<Url, ClientError> {
        let entry = self
            .registry
            .get(agent_id)
            .await?
            .ok_or_else(|| ClientError::AgentNotFound {
                agent_id: agent_id.to_string(),
            })?;
        if !entry.is_active() {
            debug!("Agent '{}' is {}, calling anyway", agent_id, entry.status);
        }

        let invalid = |reason: String| ClientError::InvalidAgentUrl {
            agent_id: agent_id.to_string(),
            reason,
        };
        let mut url = entry.endpoint().map_err(|e| invalid(e.to_string()))?;
        url.path_segments_mut()
            .map_err(|_| invalid("URL cannot be a base".to_string()))?
            .pop_if_empty()
            .extend(path);
        Ok(url)
    }
}

fn classify_reqwest(err: reqwest::Error) -> ClientError {
    if err.is_timeout() {
        ClientError::Timeout { timeout_ms: 0 }
    } else {
        ClientError::Network(err)
    }
}

/// Read the body without ever buffering more than `limit` bytes
async fn read_body(mut response: Response, limit: usize) -> Result<Vec<u8>, ClientError> {
    let mut body = Vec::new();
    while let Some(chunk) = response.chunk().await.map_err(classify_reqwest)? {
        if body.len() + chunk.len() > limit {
            return Err(ClientError::ResponseTooLarge { limit });
        }
        body.extend_from_slice(&chunk);
    }
    Ok(body)
}

async fn read_envelope(response: Response, limit: usize) -> Result<Value, ClientError> {
    let status = response.status();

    if !status.is_success() {
        let body = read_body(response, limit).await.unwrap_or_default();
        let error = serde_json::from_slice::<Envelope<Value>>(&body)
            .ok()
            .and_then(|envelope| envelope.error);
        let (code, message) = match error {
            Some(error) => (Some(error.code), error.message),
            None => (
                None,
                status
                    .canonical_reason()
                    .unwrap_or("unexpected status")
                    .to_string(),
            ),
        };
        return Err(ClientError::Http {
            status: status.as_u16(),
            code,
            message,
        });
    }

    let content_type = response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let is_json = content_type.as_deref().is_some_and(|ct| {
        ct.split(';')
            .next()
            .is_some_and(|mime| mime.trim().eq_ignore_ascii_case("application/json"))
    });
    if !is_json {
        return Err(ClientError::InvalidContentType { content_type });
    }

    if response
        .content_length()
        .is_some_and(|declared| declared > limit as u64)
    {
        return Err(ClientError::ResponseTooLarge { limit });
    }
    let body = read_body(response, limit).await?;

    let envelope: Envelope<Value> =
        serde_json::from_slice(&body).map_err(|e| ClientError::Decode(e.to_string()))?;
    if !envelope.success {
        let error = envelope.error.unwrap_or(ErrorBody {
            code: "UNKNOWN".to_string(),
            message: "remote agent reported failure without details".to_string(),
            details: None,
        });
        return Err(ClientError::Remote {
            code: error.code,
            message: error.message,
        });
    }
    Ok(envelope.data.unwrap_or(Value::Null))
}

fn decode<T: DeserializeOwned>(data: Value) -> Result<T, ClientError> {
    serde_json::from_value(data).map_err(|e| ClientError::Decode(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_store::{Message, RegisterAgent, TaskState};
    use serde_json::json;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn fast_retry(max_retries: u32) -> RetryConfig {
        RetryConfig {
            max_retries,
            base_delay_ms: 10,
            timeout_ms: 500,
            enable_jitter: true,
            ..RetryConfig::default()
        }
    }

    async fn client_for(server: &MockServer, retry: RetryConfig) -> A2aClient {
        let registry = Arc::new(AgentRegistry::open_in_memory().unwrap());
        registry
            .register(RegisterAgent::new(
                "peer",
                "http://127.0.0.1",
                server.address().port(),
            ))
            .await
            .unwrap();
        let config = ClientConfig {
            retry,
            auth_token: Some("token-123".to_string()),
            max_response_bytes: 4096,
        };
        A2aClient::new(registry, config).unwrap()
    }

    fn ok(data: Value) -> ResponseTemplate {
        ResponseTemplate::new(200).set_body_json(json!({ "success": true, "data": data }))
    }

    fn task_json(id: &str) -> Value {
        json!({
            "id": id,
            "name": "summarize",
            "priority": "normal",
            "state": "WORKING",
            "messages": [],
            "executedBy": "peer",
            "createdAt": "2024-05-01T12:00:00Z",
            "updatedAt": "2024-05-01T12:00:01Z"
        })
    }

    #[test]
    fn test_jitter_bounds() {
        let base = Duration::from_millis(1000);
        for _ in 0..200 {
            let d = jitter(base, true);
            assert!(d >= Duration::from_millis(500) && d <= base, "{:?}", d);
        }
        assert_eq!(jitter(base, false), base);
    }

    #[test]
    fn test_failure_codes() {
        assert_eq!(Operation::SendMessage.failure_code(), "SEND_MESSAGE_FAILED");
        assert_eq!(Operation::GetTaskResult.failure_code(), "GET_TASK_RESULT_FAILED");
    }

    #[tokio::test]
    async fn test_unknown_agent_fails_fast() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ok(json!({})))
            .expect(0)
            .mount(&server)
            .await;
        let client = client_for(&server, fast_retry(3)).await;

        let err = client.get_task("nobody", "t1").await.unwrap_err();
        assert_eq!(err.code(), "AGENT_NOT_FOUND");
    }

    #[tokio::test]
    async fn test_get_task_sends_bearer_token() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/a2a/tasks/t1"))
            .and(header("authorization", "Bearer token-123"))
            .respond_with(ok(task_json("t1")))
            .expect(1)
            .mount(&server)
            .await;
        let client = client_for(&server, fast_retry(0)).await;

        let task = client.get_task("peer", "t1").await.unwrap();
        assert_eq!(task.id, "t1");
        assert_eq!(task.state, TaskState::Working);
    }

    #[tokio::test]
    async fn test_list_tasks_passes_query() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/a2a/tasks"))
            .and(query_param("status", "WORKING"))
            .and(query_param("limit", "5"))
            .respond_with(ok(json!([])))
            .expect(1)
            .mount(&server)
            .await;
        let client = client_for(&server, fast_retry(0)).await;

        let query = ListTasksQuery::default()
            .with_status(TaskState::Working)
            .page(5, 0);
        assert!(client.list_tasks("peer", &query).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_retries_transient_then_succeeds() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/a2a/send-message"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(2)
            .expect(2)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/a2a/send-message"))
            .respond_with(ok(json!({ "taskId": "t9", "status": "SUBMITTED" })))
            .expect(1)
            .mount(&server)
            .await;
        let client = client_for(&server, fast_retry(3)).await;

        let response = client
            .send_message("peer", &SendMessageRequest::new(Message::user_text("hi")))
            .await
            .unwrap();
        assert_eq!(response.task_id, "t9");
        assert_eq!(response.status, TaskState::Submitted);
    }

    #[tokio::test]
    async fn test_exhausted_retries_are_wrapped() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500))
            .expect(3)
            .mount(&server)
            .await;
        let client = client_for(&server, fast_retry(2)).await;

        match client.get_task("peer", "t1").await.unwrap_err() {
            ClientError::OperationFailed {
                code,
                attempts,
                source,
                ..
            } => {
                assert_eq!(code, "GET_TASK_FAILED");
                assert_eq!(attempts, 3);
                assert_eq!(source.status(), Some(500));
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_auth_failures_are_not_retried() {
        for status in [401u16, 403] {
            let server = MockServer::start().await;
            Mock::given(method("GET"))
                .respond_with(ResponseTemplate::new(status).set_body_json(json!({
                    "success": false,
                    "error": { "code": "FORBIDDEN", "message": "nope" }
                })))
                .expect(1)
                .mount(&server)
                .await;
            let client = client_for(&server, fast_retry(3)).await;

            match client.get_agent_card("peer").await.unwrap_err() {
                ClientError::Http {
                    status: got, code, ..
                } => {
                    assert_eq!(got, status);
                    assert_eq!(code.as_deref(), Some("FORBIDDEN"));
                }
                other => panic!("unexpected error: {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_client_error_statuses_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(409))
            .expect(1)
            .mount(&server)
            .await;
        let client = client_for(&server, fast_retry(3)).await;

        let err = client.cancel_task("peer", "t1").await.unwrap_err();
        assert_eq!(err.code(), "HTTP_ERROR");
        assert_eq!(err.status(), Some(409));
    }

    #[tokio::test]
    async fn test_rejects_non_json_content_type() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_raw("<html></html>", "text/html"))
            .expect(1)
            .mount(&server)
            .await;
        let client = client_for(&server, fast_retry(3)).await;

        let err = client.get_agent_card("peer").await.unwrap_err();
        assert_eq!(err.code(), "INVALID_CONTENT_TYPE");
    }

    #[tokio::test]
    async fn test_rejects_oversized_body() {
        let server = MockServer::start().await;
        let big = "x".repeat(10_000);
        Mock::given(method("GET"))
            .respond_with(ok(json!({ "blob": big })))
            .expect(1)
            .mount(&server)
            .await;
        let client = client_for(&server, fast_retry(3)).await;

        let err = client.get_agent_card("peer").await.unwrap_err();
        assert_eq!(err.code(), "RESPONSE_TOO_LARGE");
    }

    #[tokio::test]
    async fn test_remote_failure_envelope() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "success": false,
                "error": { "code": "BACKEND_DOWN", "message": "try later" }
            })))
            .expect(1)
            .mount(&server)
            .await;
        let client = client_for(&server, fast_retry(3)).await;

        match client.get_task("peer", "t1").await.unwrap_err() {
            ClientError::Remote { code, message } => {
                assert_eq!(code, "BACKEND_DOWN");
                assert_eq!(message, "try later");
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_malformed_json_is_decode_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_raw("{not json", "application/json"))
            .expect(1)
            .mount(&server)
            .await;
        let client = client_for(&server, fast_retry(3)).await;

        let err = client.get_task("peer", "t1").await.unwrap_err();
        assert_eq!(err.code(), "DECODE_ERROR");
    }

    #[tokio::test]
    async fn test_task_result_schema_violation_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/a2a/tasks/t1/result"))
            .respond_with(ok(json!({
                "taskId": "t1",
                "state": "COMPLETED",
                "completedAt": "2024-05-01T12:00:00Z"
            })))
            .expect(1)
            .mount(&server)
            .await;
        let client = client_for(&server, fast_retry(3)).await;

        let err = client.get_task_result("peer", "t1").await.unwrap_err();
        assert_eq!(err.code(), "INVALID_RESPONSE_SCHEMA");
    }

    #[tokio::test]
    async fn test_task_result_success() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/a2a/tasks/t1/result"))
            .respond_with(ok(json!({
                "taskId": "t1",
                "state": "FAILED",
                "error": "tool crashed",
                "executedBy": "peer",
                "completedAt": "2024-05-01T12:00:00Z",
                "durationMs": 150
            })))
            .mount(&server)
            .await;
        let client = client_for(&server, fast_retry(0)).await;

        let result = client.get_task_result("peer", "t1").await.unwrap();
        assert_eq!(result.state, TaskState::Failed);
        assert_eq!(result.error.as_deref(), Some("tool crashed"));
        assert_eq!(result.duration_ms, Some(150));
    }

    #[tokio::test]
    async fn test_attempt_timeout_is_retried() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ok(json!({})).set_delay(Duration::from_secs(2)))
            .expect(2)
            .mount(&server)
            .await;
        let mut retry = fast_retry(1);
        retry.timeout_ms = 100;
        let client = client_for(&server, retry).await;

        match client.get_agent_card("peer").await.unwrap_err() {
            ClientError::OperationFailed {
                attempts, source, ..
            } => {
                assert_eq!(attempts, 2);
                assert!(matches!(*source, ClientError::Timeout { .. }));
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_shutdown_cancels_in_flight() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ok(json!({})).set_delay(Duration::from_secs(5)))
            .mount(&server)
            .await;
        let mut retry = fast_retry(0);
        retry.timeout_ms = 10_000;
        let client = client_for(&server, retry).await;

        let pending = {
            let client = client.clone();
            tokio::spawn(async move { client.get_agent_card("peer").await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        client.shutdown();

        let err = pending.await.unwrap().unwrap_err();
        assert_eq!(err.code(), "CANCELLED");
        assert!(client.is_shut_down());

        // Later calls fail immediately
        let err = client.get_agent_card("peer").await.unwrap_err();
        assert!(matches!(err, ClientError::Cancelled));
    }
}

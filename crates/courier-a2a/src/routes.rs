//! A2A HTTP routes
//!
//! - `POST /a2a/send-message`         create a task or append to one
//! - `GET  /a2a/tasks`                list task summaries
//! - `GET  /a2a/tasks/{task_id}`      full task with message history
//! - `POST /a2a/tasks/{task_id}/cancel`
//! - `GET  /a2a/tasks/{task_id}/result`
//! - `GET  /a2a/agent-card`           public
//! - `GET  /health`                   public

use std::sync::Arc;

use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{Path, Query, State};
use axum::http::{StatusCode, Uri};
use axum::routing::{get, post};
use axum::{Json, Router};
use courier_store::{NewTask, StatusUpdate, Task, TaskFilter, TaskState, TaskStore, TaskSummary};
use tracing::{info, warn};

use crate::config::ServerLimits;
use crate::delegator::TaskDelegator;
use crate::error::{ApiError, ApiResult};
use crate::protocol::{
    AgentCard, CancelTaskResponse, Envelope, HealthStatus, ListTasksQuery, SendMessageRequest,
    SendMessageResponse, TaskResult,
};

const DEFAULT_TASK_NAME: &str = "task";

/// State shared by the route handlers
#[derive(Clone)]
pub struct AppState {
    pub store: TaskStore,
    pub card: Arc<AgentCard>,
    pub delegator: Option<Arc<dyn TaskDelegator>>,
    /// Reported back when a body is cut off by the payload cap
    pub max_payload_bytes: usize,
}

impl AppState {
    pub fn new(store: TaskStore, card: AgentCard) -> Self {
        Self {
            store,
            card: Arc::new(card),
            delegator: None,
            max_payload_bytes: ServerLimits::default().max_payload_bytes,
        }
    }

    pub fn with_delegator(mut self, delegator: Arc<dyn TaskDelegator>) -> Self {
        self.delegator = Some(delegator);
        self
    }

    pub fn with_payload_limit(mut self, max_payload_bytes: usize) -> Self {
        self.max_payload_bytes = max_payload_bytes;
        self
    }
}

/// Route table without the middleware pipeline
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/a2a/send-message", post(send_message))
        .route("/a2a/tasks", get(list_tasks))
        .route("/a2a/tasks/{task_id}", get(get_task))
        .route("/a2a/tasks/{task_id}/cancel", post(cancel_task))
        .route("/a2a/tasks/{task_id}/result", get(get_task_result))
        .route("/a2a/agent-card", get(agent_card))
        .route("/health", get(health))
        .fallback(not_found)
        .with_state(state)
}

fn json_rejection(rejection: JsonRejection, limit: usize) -> ApiError {
    if rejection.status() == StatusCode::PAYLOAD_TOO_LARGE {
        return ApiError::PayloadTooLarge { limit };
    }
    ApiError::Validation {
        message: "Invalid request body".to_string(),
        details: vec![rejection.body_text()],
    }
}

async fn load_task(store: &TaskStore, task_id: &str) -> ApiResult<Task> {
    store
        .get_task(task_id)
        .await?
        .ok_or_else(|| ApiError::TaskNotFound(task_id.to_string()))
}

async fn send_message(
    State(state): State<AppState>,
    payload: Result<Json<SendMessageRequest>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<Envelope<SendMessageResponse>>)> {
    let Json(request) = payload.map_err(|e| json_rejection(e, state.max_payload_bytes))?;

    if let Some(task_id) = request.task_id.as_deref() {
        let task = state.store.add_message(task_id, request.message).await?;

        return Ok((
            StatusCode::OK,
            Json(Envelope::ok(SendMessageResponse {
                task_id: task.id,
                status: task.state,
            })),
        ));
    }

    let name = request
        .name
        .filter(|n| !n.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_TASK_NAME.to_string());
    let mut new_task = NewTask::new(name, state.card.agent_id.clone()).with_message(request.message);
    if let Some(priority) = request.priority {
        new_task = new_task.with_priority(priority);
    }
    let task = state.store.create_task(new_task).await?;
    info!("Accepted task {} ({})", task.id, task.name);

    if let Some(delegator) = &state.delegator
        && let Err(e) = delegator.submit(&task).await
    {
        warn!("Delegator rejected task {}: {:#}", task.id, e);
    }

    Ok((
        StatusCode::CREATED,
        Json(Envelope::ok(SendMessageResponse {
            task_id: task.id,
            status: task.state,
        })),
    ))
}

async fn get_task(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
) -> ApiResult<Json<Envelope<Task>>> {
    let task = load_task(&state.store, &task_id).await?;
    Ok(Json(Envelope::ok(task)))
}

async fn list_tasks(
    State(state): State<AppState>,
    query: Result<Query<ListTasksQuery>, QueryRejection>,
) -> ApiResult<Json<Envelope<Vec<TaskSummary>>>> {
    let Query(query) = query.map_err(|e| ApiError::Validation {
        message: "Invalid query string".to_string(),
        details: vec![e.body_text()],
    })?;

    let mut filter = TaskFilter::default();
    if let Some(status) = query.status.as_deref().filter(|s| !s.is_empty()) {
        let wanted: TaskState = status.parse().map_err(|_| ApiError::Validation {
            message: format!("Unknown task status '{}'", status),
            details: vec![format!(
                "status must be one of: {}",
                TaskState::ALL.map(|s| s.as_str()).join(", ")
            )],
        })?;
        filter = filter.with_state(wanted);
    }
    if let Some(limit) = query.limit {
        filter.limit = limit;
    }
    if let Some(offset) = query.offset {
        filter.offset = offset;
    }

    let tasks = state.store.list_tasks(filter).await?;
    Ok(Json(Envelope::ok(tasks)))
}

async fn cancel_task(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
) -> ApiResult<Json<Envelope<CancelTaskResponse>>> {
    let task = load_task(&state.store, &task_id).await?;
    if task.state.is_terminal() {
        return Err(ApiError::TaskTerminal {
            id: task.id,
            state: task.state,
        });
    }

    let updated = state
        .store
        .update_task_status(&task_id, StatusUpdate::new(TaskState::Canceled))
        .await?;
    if !updated {
        return Err(ApiError::TaskNotFound(task_id));
    }
    info!("Task {} canceled", task_id);

    if let Some(delegator) = &state.delegator
        && let Err(e) = delegator.cancel(&task_id).await
    {
        warn!("Delegator failed to drop task {}: {:#}", task_id, e);
    }

    Ok(Json(Envelope::ok(CancelTaskResponse {
        task_id,
        status: TaskState::Canceled,
    })))
}

async fn get_task_result(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
) -> ApiResult<Json<Envelope<TaskResult>>> {
    let task = load_task(&state.store, &task_id).await?;
    match TaskResult::from_task(&task) {
        Some(result) => Ok(Json(Envelope::ok(result))),
        None => Err(ApiError::TaskNotFinished {
            id: task.id,
            state: task.state,
        }),
    }
}

async fn agent_card(State(state): State<AppState>) -> Json<Envelope<AgentCard>> {
    Json(Envelope::ok(state.card.as_ref().clone()))
}

async fn health(State(state): State<AppState>) -> Json<Envelope<HealthStatus>> {
    Json(Envelope::ok(HealthStatus {
        status: "ok".to_string(),
        agent_id: state.card.agent_id.clone(),
    }))
}

async fn not_found(uri: Uri) -> ApiError {
    ApiError::RouteNotFound(uri.path().to_string())
}

//! A2A wire types
//!
//! Every response body is an envelope: `{success:true,data}` on success and
//! `{success:false,error:{code,message,details?}}` on failure.

use chrono::{DateTime, Utc};
use courier_store::{Message, Task, TaskPriority, TaskState, clip_error};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Response envelope shared by every route
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope<T> {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

impl<T> Envelope<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }
}

impl Envelope<Value> {
    pub fn failure(error: ErrorBody) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

/// Agent Card — advertises identity and capabilities at /a2a/agent-card
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentCard {
    pub agent_id: String,
    pub name: String,
    pub description: String,
    pub version: String,
    pub url: String,
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub authentication: AuthConfig,
}

/// Authentication configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthConfig {
    #[serde(default)]
    pub schemes: Vec<String>,
}

/// Body of `POST /a2a/send-message`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessageRequest {
    /// Existing task to append to; a new task is created when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<TaskPriority>,
    pub message: Message,
}

impl SendMessageRequest {
    pub fn new(message: Message) -> Self {
        Self {
            task_id: None,
            name: None,
            priority: None,
            message,
        }
    }

    pub fn for_task(mut self, task_id: impl Into<String>) -> Self {
        self.task_id = Some(task_id.into());
        self
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_priority(mut self, priority: TaskPriority) -> Self {
        self.priority = Some(priority);
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessageResponse {
    pub task_id: String,
    pub status: TaskState,
}

/// Query string of `GET /a2a/tasks`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListTasksQuery {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offset: Option<u32>,
}

impl ListTasksQuery {
    pub fn with_status(mut self, status: TaskState) -> Self {
        self.status = Some(status.to_string());
        self
    }

    pub fn page(mut self, limit: u32, offset: u32) -> Self {
        self.limit = Some(limit);
        self.offset = Some(offset);
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelTaskResponse {
    pub task_id: String,
    pub status: TaskState,
}

/// Final outcome of a finished task
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskResult {
    pub task_id: String,
    pub state: TaskState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub executed_by: String,
    pub completed_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
}

impl TaskResult {
    /// Longest duration a result may report; longer runs are capped
    pub const MAX_DURATION_MS: u64 = 86_400_000;

    /// States for which a result can be reported
    pub fn is_reportable(state: TaskState) -> bool {
        matches!(
            state,
            TaskState::Completed | TaskState::Failed | TaskState::Timeout
        )
    }

    /// Build a result from a finished task; `None` for any other state
    pub fn from_task(task: &Task) -> Option<Self> {
        if !Self::is_reportable(task.state) {
            return None;
        }
        let completed_at = task.completed_at.unwrap_or(task.updated_at);
        let duration_ms = u64::try_from((completed_at - task.created_at).num_milliseconds())
            .ok()
            .map(|ms| ms.min(Self::MAX_DURATION_MS));

        Some(Self {
            task_id: task.id.clone(),
            state: task.state,
            result: task.result.clone(),
            error: task.error.clone().map(clip_error),
            executed_by: task.executed_by.clone(),
            completed_at,
            duration_ms,
        })
    }
}

/// Body of `GET /health`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthStatus {
    pub status: String,
    pub agent_id: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_store::MessageRole;
    use serde_json::json;

    #[test]
    fn test_agent_card_serialization() {
        let card = AgentCard {
            agent_id: "courier-1".to_string(),
            name: "courier".to_string(),
            description: "Task relay".to_string(),
            version: "0.1.0".to_string(),
            url: "http://localhost:3000".to_string(),
            capabilities: vec!["tasks".to_string(), "messages".to_string()],
            authentication: AuthConfig {
                schemes: vec!["bearer".to_string()],
            },
        };
        let json = serde_json::to_value(&card).unwrap();
        assert_eq!(json["agentId"], "courier-1");
        assert_eq!(json["capabilities"].as_array().unwrap().len(), 2);
    }

    #[test]
    fn test_send_message_deserialization() {
        let body = r#"{"message":{"role":"user","parts":[{"type":"text","text":"hi"}]},"priority":"high"}"#;
        let req: SendMessageRequest = serde_json::from_str(body).unwrap();
        assert!(req.task_id.is_none());
        assert_eq!(req.priority, Some(TaskPriority::High));
        assert_eq!(req.message.role, MessageRole::User);
    }

    #[test]
    fn test_envelope_shapes() {
        let ok = serde_json::to_value(Envelope::ok(json!({"a": 1}))).unwrap();
        assert_eq!(ok, json!({"success": true, "data": {"a": 1}}));

        let err = serde_json::to_value(Envelope::failure(ErrorBody {
            code: "TASK_NOT_FOUND".to_string(),
            message: "missing".to_string(),
            details: None,
        }))
        .unwrap();
        assert_eq!(err["success"], false);
        assert_eq!(err["error"]["code"], "TASK_NOT_FOUND");
        assert!(err.get("data").is_none());
    }

    #[test]
    fn test_task_result_only_for_finished_states() {
        let now = Utc::now();
        let mut task = Task {
            id: "t1".to_string(),
            name: "n".to_string(),
            priority: TaskPriority::Normal,
            state: TaskState::Working,
            messages: vec![],
            result: Some(json!("done")),
            error: None,
            executed_by: "agent-a".to_string(),
            created_at: now - chrono::TimeDelta::seconds(2),
            updated_at: now,
            completed_at: None,
        };
        assert!(TaskResult::from_task(&task).is_none());

        task.state = TaskState::Completed;
        task.completed_at = Some(now);
        let result = TaskResult::from_task(&task).unwrap();
        assert_eq!(result.duration_ms, Some(2000));

        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["state"], "COMPLETED");
        assert_eq!(json["executedBy"], "agent-a");

        task.state = TaskState::Canceled;
        assert!(TaskResult::from_task(&task).is_none());
    }

    #[test]
    fn test_long_running_failure_passes_result_schema() {
        let now = Utc::now();
        let task = Task {
            id: "t-long".to_string(),
            name: "n".to_string(),
            priority: TaskPriority::Normal,
            state: TaskState::Failed,
            messages: vec![],
            result: None,
            error: Some("x".repeat(courier_store::MAX_ERROR_CHARS + 1)),
            executed_by: "agent-a".to_string(),
            created_at: now - chrono::TimeDelta::hours(25),
            updated_at: now,
            completed_at: Some(now),
        };
        let result = TaskResult::from_task(&task).unwrap();
        assert_eq!(result.duration_ms, Some(TaskResult::MAX_DURATION_MS));
        assert_eq!(
            result.error.as_ref().map(|e| e.chars().count()),
            Some(courier_store::MAX_ERROR_CHARS)
        );

        let json = serde_json::to_value(&result).unwrap();
        crate::schema::validate_task_result(&json).unwrap();
    }
}

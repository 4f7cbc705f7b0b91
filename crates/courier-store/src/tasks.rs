//! Task store — task records, message history and the task state machine
//!
//! Messages are append-only rows in `task_messages`, ordered by `seq`.
//! Terminal tasks are immutable: no new messages, no further transitions.

use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, TransactionBehavior, params};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tracing::{debug, info, warn};

use crate::db::{self, SharedConn};
use crate::error::{StoreError, StoreResult};

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS tasks (
        id TEXT PRIMARY KEY,
        name TEXT NOT NULL,
        priority TEXT NOT NULL DEFAULT 'normal',
        state TEXT NOT NULL,
        result TEXT,
        error TEXT,
        executed_by TEXT NOT NULL,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        completed_at TEXT
    );
    CREATE TABLE IF NOT EXISTS task_messages (
        task_id TEXT NOT NULL REFERENCES tasks(id) ON DELETE CASCADE,
        seq INTEGER NOT NULL,
        role TEXT NOT NULL,
        parts TEXT NOT NULL,
        created_at TEXT NOT NULL,
        PRIMARY KEY (task_id, seq)
    );
    CREATE INDEX IF NOT EXISTS idx_tasks_state ON tasks(state);
    CREATE INDEX IF NOT EXISTS idx_tasks_created ON tasks(created_at);
";

const SELECT_TASK: &str = "SELECT id, name, priority, state, result, error, executed_by,
        created_at, updated_at, completed_at
     FROM tasks";

/// Lifecycle state of a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskState {
    Submitted,
    Working,
    InputRequired,
    Completed,
    Failed,
    Canceled,
    Rejected,
    Timeout,
}

impl TaskState {
    pub const ALL: [TaskState; 8] = [
        Self::Submitted,
        Self::Working,
        Self::InputRequired,
        Self::Completed,
        Self::Failed,
        Self::Canceled,
        Self::Rejected,
        Self::Timeout,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Submitted => "SUBMITTED",
            Self::Working => "WORKING",
            Self::InputRequired => "INPUT_REQUIRED",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Canceled => "CANCELED",
            Self::Rejected => "REJECTED",
            Self::Timeout => "TIMEOUT",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Canceled | Self::Rejected | Self::Timeout
        )
    }

    /// Whether a task in `self` may move to `next`. Self-transitions are never allowed.
    pub fn can_transition_to(&self, next: TaskState) -> bool {
        use TaskState::*;
        match self {
            Submitted => matches!(next, Working | Canceled | Rejected | Failed | Timeout),
            Working => matches!(
                next,
                InputRequired | Completed | Failed | Canceled | Timeout
            ),
            InputRequired => matches!(next, Working | Failed | Canceled | Timeout),
            Completed | Failed | Canceled | Rejected | Timeout => false,
        }
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskState {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|state| state.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| StoreError::Validation(format!("unknown task state '{}'", s)))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskPriority {
    Low,
    #[default]
    Normal,
    High,
    Urgent,
}

impl TaskPriority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Normal => "normal",
            Self::High => "high",
            Self::Urgent => "urgent",
        }
    }
}

impl FromStr for TaskPriority {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "low" => Ok(Self::Low),
            "normal" => Ok(Self::Normal),
            "high" => Ok(Self::High),
            "urgent" => Ok(Self::Urgent),
            other => Err(StoreError::Validation(format!(
                "unknown task priority '{}'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Agent,
}

impl MessageRole {
    fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Agent => "agent",
        }
    }
}

/// One piece of message content
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Part {
    Text {
        text: String,
    },
    Data {
        data: JsonValue,
    },
    #[serde(rename_all = "camelCase")]
    File {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        mime_type: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        uri: Option<String>,
        /// Base64 content when the file is inlined
        #[serde(default, skip_serializing_if = "Option::is_none")]
        bytes: Option<String>,
    },
}

impl Part {
    pub fn text(text: impl Into<String>) -> Self {
        Part::Text { text: text.into() }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub role: MessageRole,
    pub parts: Vec<Part>,
    /// Assigned by the store on insert
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

impl Message {
    pub fn new(role: MessageRole, parts: Vec<Part>) -> Self {
        Self {
            role,
            parts,
            created_at: None,
        }
    }

    pub fn user_text(text: impl Into<String>) -> Self {
        Self::new(MessageRole::User, vec![Part::text(text)])
    }

    pub fn agent_text(text: impl Into<String>) -> Self {
        Self::new(MessageRole::Agent, vec![Part::text(text)])
    }

    fn validate(&self) -> StoreResult<()> {
        if self.parts.is_empty() {
            return Err(StoreError::Validation(
                "message must contain at least one part".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: String,
    pub name: String,
    pub priority: TaskPriority,
    pub state: TaskState,
    pub messages: Vec<Message>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<JsonValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub executed_by: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

/// Listing row: a task without its message bodies
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskSummary {
    pub id: String,
    pub name: String,
    pub priority: TaskPriority,
    pub state: TaskState,
    pub executed_by: String,
    pub message_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct NewTask {
    pub name: String,
    pub priority: TaskPriority,
    pub executed_by: String,
    pub initial_message: Option<Message>,
}

impl NewTask {
    pub fn new(name: impl Into<String>, executed_by: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            priority: TaskPriority::default(),
            executed_by: executed_by.into(),
            initial_message: None,
        }
    }

    pub fn with_priority(mut self, priority: TaskPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_message(mut self, message: Message) -> Self {
        self.initial_message = Some(message);
        self
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TaskFilter {
    pub state: Option<TaskState>,
    pub limit: u32,
    pub offset: u32,
}

impl TaskFilter {
    pub const DEFAULT_LIMIT: u32 = 50;
    pub const MAX_LIMIT: u32 = 200;

    pub fn with_state(mut self, state: TaskState) -> Self {
        self.state = Some(state);
        self
    }
}

impl Default for TaskFilter {
    fn default() -> Self {
        Self {
            state: None,
            limit: Self::DEFAULT_LIMIT,
            offset: 0,
        }
    }
}

/// Longest error text kept on a task, in characters
pub const MAX_ERROR_CHARS: usize = 10_000;

/// Cut `error` down to [`MAX_ERROR_CHARS`] characters
pub fn clip_error(mut error: String) -> String {
    if let Some((cut, _)) = error.char_indices().nth(MAX_ERROR_CHARS) {
        error.truncate(cut);
    }
    error
}

#[derive(Debug, Clone)]
pub struct StatusUpdate {
    pub state: TaskState,
    pub result: Option<JsonValue>,
    pub error: Option<String>,
}

impl StatusUpdate {
    pub fn new(state: TaskState) -> Self {
        Self {
            state,
            result: None,
            error: None,
        }
    }

    pub fn with_result(mut self, result: JsonValue) -> Self {
        self.result = Some(result);
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(clip_error(error.into()));
        self
    }
}

/// SQLite-backed task store. Clones share one connection.
#[derive(Clone)]
pub struct TaskStore {
    conn: SharedConn,
}

impl TaskStore {
    pub fn open<P: AsRef<Path>>(path: P) -> StoreResult<Self> {
        info!("Opening task store at {:?}", path.as_ref());
        Ok(Self {
            conn: db::open_file(path.as_ref(), SCHEMA)?,
        })
    }

    pub fn open_in_memory() -> StoreResult<Self> {
        Ok(Self {
            conn: db::open_memory(SCHEMA)?,
        })
    }

    /// Create a task in SUBMITTED with an optional first message
    pub async fn create_task(&self, new_task: NewTask) -> StoreResult<Task> {
        if new_task.name.trim().is_empty() {
            return Err(StoreError::Validation("task name cannot be empty".to_string()));
        }
        if new_task.executed_by.trim().is_empty() {
            return Err(StoreError::Validation(
                "executed_by cannot be empty".to_string(),
            ));
        }
        if let Some(message) = &new_task.initial_message {
            message.validate()?;
        }

        db::with_conn(&self.conn, move |conn| {
            let id = uuid::Uuid::new_v4().to_string();
            let now = db::ts(Utc::now());

            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            tx.execute(
                "INSERT INTO tasks (id, name, priority, state, executed_by, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)",
                params![
                    &id,
                    &new_task.name,
                    new_task.priority.as_str(),
                    TaskState::Submitted.as_str(),
                    &new_task.executed_by,
                    &now,
                ],
            )?;
            if let Some(message) = &new_task.initial_message {
                insert_message(&tx, &id, message, &now)?;
            }
            tx.commit()?;

            debug!("Created task {} ({})", id, new_task.name);
            fetch_task(conn, &id)?.ok_or_else(|| StoreError::task_not_found(&id))
        })
        .await
    }

    /// Append a message. Terminal tasks reject new messages; a user reply to
    /// an INPUT_REQUIRED task moves it back to WORKING in the same transaction.
    pub async fn add_message(&self, task_id: &str, message: Message) -> StoreResult<Task> {
        message.validate()?;
        let task_id = task_id.to_owned();

        db::with_conn(&self.conn, move |conn| {
            let now = db::ts(Utc::now());
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

            let state = read_state(&tx, &task_id)?
                .ok_or_else(|| StoreError::task_not_found(&task_id))?;
            if state.is_terminal() {
                return Err(StoreError::TaskTerminal { id: task_id, state });
            }

            let resumes = state == TaskState::InputRequired && message.role == MessageRole::User;
            let next = if resumes { TaskState::Working } else { state };

            insert_message(&tx, &task_id, &message, &now)?;
            tx.execute(
                "UPDATE tasks SET state = ?1, updated_at = ?2 WHERE id = ?3",
                params![next.as_str(), &now, &task_id],
            )?;
            tx.commit()?;
            if resumes {
                debug!("Task {} resumed after input", task_id);
            }

            fetch_task(conn, &task_id)?.ok_or_else(|| StoreError::task_not_found(&task_id))
        })
        .await
    }

    pub async fn get_task(&self, task_id: &str) -> StoreResult<Option<Task>> {
        let task_id = task_id.to_owned();
        db::with_conn(&self.conn, move |conn| fetch_task(conn, &task_id)).await
    }

    /// Newest first; `limit` is clamped to `1..=TaskFilter::MAX_LIMIT`
    pub async fn list_tasks(&self, filter: TaskFilter) -> StoreResult<Vec<TaskSummary>> {
        let limit = filter.limit.clamp(1, TaskFilter::MAX_LIMIT);

        db::with_conn(&self.conn, move |conn| {
            let sql = "SELECT t.id, t.name, t.priority, t.state, t.executed_by, t.error,
                        t.created_at, t.updated_at, t.completed_at,
                        (SELECT COUNT(*) FROM task_messages m WHERE m.task_id = t.id)
                 FROM tasks t
                 WHERE (?1 IS NULL OR t.state = ?1)
                 ORDER BY t.created_at DESC, t.rowid DESC
                 LIMIT ?2 OFFSET ?3";
            let mut stmt = conn.prepare(sql)?;
            let state = filter.state.map(|s| s.as_str());
            let tasks = stmt
                .query_map(params![state, limit, filter.offset], row_to_summary)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(tasks)
        })
        .await
    }

    /// Move a task to a new state.
    ///
    /// Returns `Ok(false)` for an unknown id and `InvalidTransition` for an
    /// edge the state machine does not allow. The read and the write share
    /// one IMMEDIATE transaction.
    pub async fn update_task_status(&self, task_id: &str, update: StatusUpdate) -> StoreResult<bool> {
        let task_id = task_id.to_owned();

        db::with_conn(&self.conn, move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

            let Some(current) = read_state(&tx, &task_id)? else {
                return Ok(false);
            };
            if !current.can_transition_to(update.state) {
                return Err(StoreError::InvalidTransition {
                    from: current,
                    to: update.state,
                });
            }

            let now = db::ts(Utc::now());
            let completed_at = update.state.is_terminal().then(|| now.clone());
            let result = update
                .result
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?;
            let error = update.error.map(clip_error);

            tx.execute(
                "UPDATE tasks SET state = ?1,
                     result = COALESCE(?2, result),
                     error = COALESCE(?3, error),
                     updated_at = ?4,
                     completed_at = COALESCE(?5, completed_at)
                 WHERE id = ?6",
                params![
                    update.state.as_str(),
                    result,
                    error,
                    &now,
                    completed_at,
                    &task_id
                ],
            )?;
            tx.commit()?;

            debug!("Task {} {} -> {}", task_id, current, update.state);
            Ok(true)
        })
        .await
    }

    /// Move non-terminal tasks idle for longer than `older_than` to TIMEOUT
    pub async fn expire_stale_tasks(&self, older_than: Duration) -> StoreResult<usize> {
        db::with_conn(&self.conn, move |conn| {
            let now = db::ts(Utc::now());
            let cutoff = db::ts(db::cutoff(older_than));
            let message = format!("Task exceeded {}s without progress", older_than.as_secs());

            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let expired = tx.execute(
                "UPDATE tasks SET state = ?1,
                     error = COALESCE(error, ?2),
                     updated_at = ?3,
                     completed_at = ?3
                 WHERE state IN (?4, ?5, ?6) AND updated_at < ?7",
                params![
                    TaskState::Timeout.as_str(),
                    message,
                    &now,
                    TaskState::Submitted.as_str(),
                    TaskState::Working.as_str(),
                    TaskState::InputRequired.as_str(),
                    cutoff,
                ],
            )?;
            tx.commit()?;

            if expired > 0 {
                warn!("Expired {} stale tasks", expired);
            }
            Ok(expired)
        })
        .await
    }

    pub async fn close(&self) -> StoreResult<()> {
        if db::close(&self.conn).await? {
            info!("Task store closed");
        }
        Ok(())
    }
}

fn read_state(conn: &Connection, task_id: &str) -> StoreResult<Option<TaskState>> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT state FROM tasks WHERE id = ?1",
            params![task_id],
            |row| row.get(0),
        )
        .optional()?;
    raw.map(|s| s.parse()).transpose()
}

fn insert_message(conn: &Connection, task_id: &str, message: &Message, now: &str) -> StoreResult<()> {
    let parts = serde_json::to_string(&message.parts)?;
    conn.execute(
        "INSERT INTO task_messages (task_id, seq, role, parts, created_at)
         VALUES (?1,
                 (SELECT COALESCE(MAX(seq), -1) + 1 FROM task_messages WHERE task_id = ?1),
                 ?2, ?3, ?4)",
        params![task_id, message.role.as_str(), parts, now],
    )?;
    Ok(())
}

fn fetch_task(conn: &Connection, task_id: &str) -> StoreResult<Option<Task>> {
    let sql = format!("{} WHERE id = ?1", SELECT_TASK);
    let Some(mut task) = conn
        .query_row(&sql, params![task_id], row_to_task)
        .optional()?
    else {
        return Ok(None);
    };

    let mut stmt = conn.prepare(
        "SELECT role, parts, created_at FROM task_messages WHERE task_id = ?1 ORDER BY seq",
    )?;
    task.messages = stmt
        .query_map(params![task_id], row_to_message)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Some(task))
}

fn parse_enum<T: FromStr<Err = StoreError>>(idx: usize, raw: String) -> rusqlite::Result<T> {
    raw.parse().map_err(|e: StoreError| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

fn row_to_task(row: &rusqlite::Row) -> rusqlite::Result<Task> {
    Ok(Task {
        id: row.get(0)?,
        name: row.get(1)?,
        priority: parse_enum(2, row.get(2)?)?,
        state: parse_enum(3, row.get(3)?)?,
        messages: Vec::new(),
        result: db::json_column(4, row.get(4)?)?,
        error: row.get(5)?,
        executed_by: row.get(6)?,
        created_at: db::parse_ts(&row.get::<_, String>(7)?),
        updated_at: db::parse_ts(&row.get::<_, String>(8)?),
        completed_at: row
            .get::<_, Option<String>>(9)?
            .map(|s| db::parse_ts(&s)),
    })
}

fn row_to_summary(row: &rusqlite::Row) -> rusqlite::Result<TaskSummary> {
    Ok(TaskSummary {
        id: row.get(0)?,
        name: row.get(1)?,
        priority: parse_enum(2, row.get(2)?)?,
        state: parse_enum(3, row.get(3)?)?,
        executed_by: row.get(4)?,
        error: row.get(5)?,
        created_at: db::parse_ts(&row.get::<_, String>(6)?),
        updated_at: db::parse_ts(&row.get::<_, String>(7)?),
        completed_at: row
            .get::<_, Option<String>>(8)?
            .map(|s| db::parse_ts(&s)),
        message_count: row.get(9)?,
    })
}

fn row_to_message(row: &rusqlite::Row) -> rusqlite::Result<Message> {
    let role: String = row.get(0)?;
    let role = match role.as_str() {
        "agent" => MessageRole::Agent,
        _ => MessageRole::User,
    };
    let parts: String = row.get(1)?;
    let parts = serde_json::from_str(&parts).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(1, rusqlite::types::Type::Text, Box::new(e))
    })?;
    Ok(Message {
        role,
        parts,
        created_at: Some(db::parse_ts(&row.get::<_, String>(2)?)),
    })
}

//! courier-store — persistent state for Courier agents
//!
//! Two independent SQLite stores:
//! - [`AgentRegistry`]: directory of agents with heartbeat/staleness lifecycle
//! - [`TaskStore`]: task records, append-only message history and the task
//!   state machine

mod db;
pub mod error;
pub mod registry;
pub mod tasks;

pub use error::{StoreError, StoreResult};
pub use registry::{
    AgentEntry, AgentRegistry, AgentStatus, DEFAULT_CLEANUP_INTERVAL, DEFAULT_STALE_THRESHOLD,
    MAX_AGENT_ID_LEN, RegisterAgent, SweepOutcome,
};
pub use tasks::{
    MAX_ERROR_CHARS, Message, MessageRole, NewTask, Part, StatusUpdate, Task, TaskFilter,
    TaskPriority, TaskState, TaskStore, TaskSummary, clip_error,
};

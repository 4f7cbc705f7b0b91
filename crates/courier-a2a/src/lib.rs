//! A2A (Agent-to-Agent) task exchange for Courier
//!
//! Provides both the client (send tasks to peers found in the agent registry)
//! and the server (receive tasks from peers behind a hardened request
//! pipeline).

pub mod client;
pub mod config;
pub mod delegator;
pub mod error;
pub mod middleware;
pub mod protocol;
pub mod routes;
pub mod schema;
pub mod server;

pub use client::{A2aClient, Operation};
pub use config::{ClientConfig, LifecycleConfig, RetryConfig, ServerLimits};
pub use delegator::{DelegatorSweep, StoreSweep, TaskDelegator};
pub use error::{ApiError, ClientError, ServerError};
pub use protocol::{
    AgentCard, AuthConfig, CancelTaskResponse, Envelope, ErrorBody, HealthStatus, ListTasksQuery,
    SendMessageRequest, SendMessageResponse, TaskResult,
};
pub use server::{A2aServer, ServerConfig};

//! Agent registry — persistent directory of agents and their liveness
//!
//! Each agent owns at most one row, keyed by `agent_id`. Registration is an
//! upsert, heartbeats refresh `last_heartbeat`, and a background sweep marks
//! silent agents stale and later deletes them.

use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::{OptionalExtension, params};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::db::{self, SharedConn};
use crate::error::{StoreError, StoreResult};

/// Longest accepted agent identifier, in characters
pub const MAX_AGENT_ID_LEN: usize = 255;

/// Heartbeat age after which an active agent is considered stale
pub const DEFAULT_STALE_THRESHOLD: Duration = Duration::from_secs(5 * 60);

/// How often the background sweep runs
pub const DEFAULT_CLEANUP_INTERVAL: Duration = Duration::from_secs(5 * 60);

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS agents (
        agent_id TEXT PRIMARY KEY,
        base_url TEXT NOT NULL,
        port INTEGER NOT NULL,
        status TEXT NOT NULL DEFAULT 'active',
        last_heartbeat TEXT NOT NULL,
        capabilities TEXT NOT NULL DEFAULT '{}',
        metadata TEXT NOT NULL DEFAULT '{}',
        created_at TEXT NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_agents_status ON agents(status);
    CREATE INDEX IF NOT EXISTS idx_agents_heartbeat ON agents(last_heartbeat);
";

const SELECT_AGENT: &str = "SELECT agent_id, base_url, port, status, last_heartbeat,
        capabilities, metadata, created_at
     FROM agents";

/// Liveness status of a registered agent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    Active,
    Inactive,
    Stale,
}

impl AgentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Inactive => "inactive",
            Self::Stale => "stale",
        }
    }
}

impl fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AgentStatus {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "inactive" => Ok(Self::Inactive),
            "stale" => Ok(Self::Stale),
            other => Err(StoreError::Validation(format!(
                "unknown agent status '{}'",
                other
            ))),
        }
    }
}

/// A row in the agent directory
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentEntry {
    pub agent_id: String,
    pub base_url: String,
    pub port: u16,
    pub status: AgentStatus,
    pub last_heartbeat: DateTime<Utc>,
    pub capabilities: JsonValue,
    pub metadata: JsonValue,
    pub created_at: DateTime<Utc>,
}

impl AgentEntry {
    /// Base URL with the registered port applied
    pub fn endpoint(&self) -> Result<Url, url::ParseError> {
        let mut url = Url::parse(&self.base_url)?;
        // set_port only fails for cannot-be-a-base URLs, which registration rejects
        let _ = url.set_port(Some(self.port));
        Ok(url)
    }

    pub fn is_active(&self) -> bool {
        self.status == AgentStatus::Active
    }
}

/// Registration request
#[derive(Debug, Clone)]
pub struct RegisterAgent {
    pub agent_id: String,
    pub base_url: String,
    pub port: u16,
    pub capabilities: Option<JsonValue>,
    pub metadata: Option<JsonValue>,
}

impl RegisterAgent {
    pub fn new(agent_id: impl Into<String>, base_url: impl Into<String>, port: u16) -> Self {
        Self {
            agent_id: agent_id.into(),
            base_url: base_url.into(),
            port,
            capabilities: None,
            metadata: None,
        }
    }

    pub fn with_capabilities(mut self, capabilities: JsonValue) -> Self {
        self.capabilities = Some(capabilities);
        self
    }

    pub fn with_metadata(mut self, metadata: JsonValue) -> Self {
        self.metadata = Some(metadata);
        self
    }

    fn validate(&self) -> StoreResult<()> {
        validate_agent_id(&self.agent_id)?;
        let url = Url::parse(&self.base_url).map_err(|e| {
            StoreError::Validation(format!("invalid base URL '{}': {}", self.base_url, e))
        })?;
        if !matches!(url.scheme(), "http" | "https") || url.cannot_be_a_base() {
            return Err(StoreError::Validation(format!(
                "base URL must be http(s): '{}'",
                self.base_url
            )));
        }
        Ok(())
    }
}

fn validate_agent_id(agent_id: &str) -> StoreResult<()> {
    if agent_id.trim().is_empty() {
        return Err(StoreError::Validation("agent id cannot be empty".to_string()));
    }
    if agent_id.chars().count() > MAX_AGENT_ID_LEN {
        return Err(StoreError::Validation(format!(
            "agent id exceeds {} characters",
            MAX_AGENT_ID_LEN
        )));
    }
    Ok(())
}

/// Result of one sweep cycle
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepOutcome {
    pub marked_stale: usize,
    pub deleted: usize,
}

/// SQLite-backed agent directory.
///
/// Cheap to clone; clones share the connection and the sweep handle. The
/// application root owns the lifecycle and calls [`AgentRegistry::close`].
#[derive(Clone)]
pub struct AgentRegistry {
    conn: SharedConn,
    sweeper: Arc<Mutex<Option<CancellationToken>>>,
}

impl AgentRegistry {
    /// Open or create the registry database at `path`
    pub fn open<P: AsRef<Path>>(path: P) -> StoreResult<Self> {
        info!("Opening agent registry at {:?}", path.as_ref());
        Ok(Self::from_conn(db::open_file(path.as_ref(), SCHEMA)?))
    }

    /// Registry backed by a private in-memory database
    pub fn open_in_memory() -> StoreResult<Self> {
        Ok(Self::from_conn(db::open_memory(SCHEMA)?))
    }

    fn from_conn(conn: SharedConn) -> Self {
        Self {
            conn,
            sweeper: Arc::new(Mutex::new(None)),
        }
    }

    /// Insert or refresh an agent. Re-registering marks it active and
    /// refreshes its heartbeat; omitted capabilities/metadata are kept.
    pub async fn register(&self, request: RegisterAgent) -> StoreResult<AgentEntry> {
        request.validate()?;

        db::with_conn(&self.conn, move |conn| {
            let now = db::ts(Utc::now());
            let capabilities = request
                .capabilities
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?;
            let metadata = request
                .metadata
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?;

            conn.execute(
                "INSERT INTO agents (agent_id, base_url, port, status, last_heartbeat,
                                     capabilities, metadata, created_at)
                 VALUES (?1, ?2, ?3, 'active', ?4, COALESCE(?5, '{}'), COALESCE(?6, '{}'), ?4)
                 ON CONFLICT(agent_id) DO UPDATE SET
                     base_url = excluded.base_url,
                     port = excluded.port,
                     status = 'active',
                     last_heartbeat = excluded.last_heartbeat,
                     capabilities = COALESCE(?5, agents.capabilities),
                     metadata = COALESCE(?6, agents.metadata)",
                params![
                    &request.agent_id,
                    &request.base_url,
                    request.port,
                    &now,
                    capabilities,
                    metadata,
                ],
            )?;

            let entry = fetch_agent(conn, &request.agent_id)?.ok_or_else(|| {
                StoreError::NotFound {
                    entity: "agent",
                    id: request.agent_id.clone(),
                }
            })?;
            info!(
                "Registered agent '{}' at {}:{}",
                entry.agent_id, entry.base_url, entry.port
            );
            Ok(entry)
        })
        .await
    }

    /// Look up an agent by id
    pub async fn get(&self, agent_id: &str) -> StoreResult<Option<AgentEntry>> {
        let agent_id = agent_id.to_owned();
        db::with_conn(&self.conn, move |conn| fetch_agent(conn, &agent_id)).await
    }

    /// Active agents, most recent heartbeat first
    pub async fn list_active(&self) -> StoreResult<Vec<AgentEntry>> {
        db::with_conn(&self.conn, |conn| {
            let sql = format!(
                "{} WHERE status = 'active' ORDER BY last_heartbeat DESC",
                SELECT_AGENT
            );
            let mut stmt = conn.prepare(&sql)?;
            let agents = stmt
                .query_map([], row_to_agent)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(agents)
        })
        .await
    }

    /// Every row regardless of status, most recent heartbeat first
    pub async fn list_all(&self) -> StoreResult<Vec<AgentEntry>> {
        db::with_conn(&self.conn, |conn| {
            let sql = format!("{} ORDER BY last_heartbeat DESC", SELECT_AGENT);
            let mut stmt = conn.prepare(&sql)?;
            let agents = stmt
                .query_map([], row_to_agent)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(agents)
        })
        .await
    }

    /// Refresh an agent's heartbeat. Returns false for unknown ids; never inserts.
    pub async fn heartbeat(&self, agent_id: &str) -> StoreResult<bool> {
        let agent_id = agent_id.to_owned();
        db::with_conn(&self.conn, move |conn| {
            let updated = conn.execute(
                "UPDATE agents SET last_heartbeat = ?1, status = 'active' WHERE agent_id = ?2",
                params![db::ts(Utc::now()), &agent_id],
            )?;
            debug!("Heartbeat for '{}' (updated: {})", agent_id, updated > 0);
            Ok(updated > 0)
        })
        .await
    }

    /// Mark an agent inactive (graceful shutdown)
    pub async fn deactivate(&self, agent_id: &str) -> StoreResult<bool> {
        let agent_id = agent_id.to_owned();
        db::with_conn(&self.conn, move |conn| {
            let updated = conn.execute(
                "UPDATE agents SET status = 'inactive' WHERE agent_id = ?1",
                params![&agent_id],
            )?;
            if updated > 0 {
                info!("Deactivated agent '{}'", agent_id);
            }
            Ok(updated > 0)
        })
        .await
    }

    /// Mark active agents whose heartbeat is older than `threshold` as stale
    pub async fn cleanup_stale(&self, threshold: Duration) -> StoreResult<usize> {
        db::with_conn(&self.conn, move |conn| {
            let cutoff = db::ts(db::cutoff(threshold));
            let marked = conn.execute(
                "UPDATE agents SET status = 'stale'
                 WHERE status = 'active' AND last_heartbeat < ?1",
                params![cutoff],
            )?;
            if marked > 0 {
                info!("Marked {} agents stale", marked);
            }
            Ok(marked)
        })
        .await
    }

    /// Delete every stale row
    pub async fn delete_stale(&self) -> StoreResult<usize> {
        db::with_conn(&self.conn, |conn| {
            let deleted = conn.execute("DELETE FROM agents WHERE status = 'stale'", [])?;
            if deleted > 0 {
                info!("Deleted {} stale agents", deleted);
            }
            Ok(deleted)
        })
        .await
    }

    /// One sweep cycle. Both steps always run; failures are logged, not returned.
    pub async fn sweep(&self, threshold: Duration) -> SweepOutcome {
        let marked_stale = match self.cleanup_stale(threshold).await {
            Ok(n) => n,
            Err(e) => {
                error!("Registry stale-marking failed: {}", e);
                0
            }
        };
        let deleted = match self.delete_stale().await {
            Ok(n) => n,
            Err(e) => {
                error!("Registry stale deletion failed: {}", e);
                0
            }
        };
        SweepOutcome {
            marked_stale,
            deleted,
        }
    }

    /// Start the background sweep. No-op if already running.
    pub fn start_cleanup(&self, interval: Duration, threshold: Duration) {
        let mut slot = self.sweeper.lock().unwrap_or_else(|p| p.into_inner());
        if slot.is_some() {
            debug!("Registry cleanup already running");
            return;
        }

        let token = CancellationToken::new();
        *slot = Some(token.clone());
        let registry = self.clone();

        tokio::spawn(async move {
            info!(
                "Registry cleanup started (every {:?}, threshold {:?})",
                interval, threshold
            );
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let outcome = registry.sweep(threshold).await;
                debug!("Registry sweep: {:?}", outcome);
            }
            debug!("Registry cleanup stopped");
        });
    }

    /// Stop the background sweep if running
    pub fn stop_cleanup(&self) {
        let token = self
            .sweeper
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take();
        if let Some(token) = token {
            token.cancel();
        }
    }

    /// Stop the sweep and release the database. Later calls on any clone
    /// fail with [`StoreError::Closed`].
    pub async fn close(&self) -> StoreResult<()> {
        self.stop_cleanup();
        if db::close(&self.conn).await? {
            info!("Agent registry closed");
        } else {
            warn!("Agent registry already closed");
        }
        Ok(())
    }
}

fn fetch_agent(conn: &rusqlite::Connection, agent_id: &str) -> StoreResult<Option<AgentEntry>> {
    let sql = format!("{} WHERE agent_id = ?1", SELECT_AGENT);
    let entry = conn
        .query_row(&sql, params![agent_id], row_to_agent)
        .optional()?;
    Ok(entry)
}

fn row_to_agent(row: &rusqlite::Row) -> rusqlite::Result<AgentEntry> {
    let status: String = row.get(3)?;
    let status = status.parse().map_err(|e: StoreError| {
        rusqlite::Error::FromSqlConversionFailure(3, rusqlite::types::Type::Text, Box::new(e))
    })?;

    Ok(AgentEntry {
        agent_id: row.get(0)?,
        base_url: row.get(1)?,
        port: row.get(2)?,
        status,
        last_heartbeat: db::parse_ts(&row.get::<_, String>(4)?),
        capabilities: db::json_column(5, row.get(5)?)?.unwrap_or(JsonValue::Null),
        metadata: db::json_column(6, row.get(6)?)?.unwrap_or(JsonValue::Null),
        created_at: db::parse_ts(&row.get::<_, String>(7)?),
    })
}

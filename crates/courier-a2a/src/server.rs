//! A2A server lifecycle
//!
//! `start()` binds a port, registers the agent, starts the heartbeat, the
//! registry sweep and the timeout checker, then serves the routes behind the
//! middleware pipeline. `stop()` tears everything down in reverse order.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::ops::RangeInclusive;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use courier_scheduler::{
    AlertCallback, CheckerStatistics, TimeoutChecker, TimeoutCheckerConfig, TimeoutSweep,
};
use courier_store::{AgentRegistry, RegisterAgent, TaskStore};
use serde_json::json;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{LifecycleConfig, ServerLimits};
use crate::delegator::{DelegatorSweep, StoreSweep, TaskDelegator};
use crate::error::ServerError;
use crate::middleware::{self, MemoryProbe, PipelineState};
use crate::protocol::{AgentCard, AuthConfig};
use crate::routes::{self, AppState};

pub const DEFAULT_PORT_RANGE: RangeInclusive<u16> = 3000..=3100;

/// How long `stop()` waits for open connections to drain
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub agent_id: String,
    pub name: String,
    pub description: String,
    /// Bind address
    pub host: String,
    /// Fixed port; when unset the first free port in `port_range` is used
    pub port: Option<u16>,
    pub port_range: RangeInclusive<u16>,
    pub capabilities: Vec<String>,
    pub auth_token: Option<String>,
    pub limits: ServerLimits,
    pub lifecycle: LifecycleConfig,
}

impl ServerConfig {
    pub fn new(agent_id: impl Into<String>) -> Self {
        let agent_id = agent_id.into();
        Self {
            name: agent_id.clone(),
            agent_id,
            description: "Courier A2A agent".to_string(),
            host: "127.0.0.1".to_string(),
            port: None,
            port_range: DEFAULT_PORT_RANGE,
            capabilities: vec![
                "tasks".to_string(),
                "messages".to_string(),
                "cancel".to_string(),
                "results".to_string(),
            ],
            auth_token: None,
            limits: ServerLimits::default(),
            lifecycle: LifecycleConfig::default(),
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = Some(token.into());
        self
    }

    /// Host that peers should use to reach this agent
    fn advertised_host(&self) -> String {
        match self.host.parse::<IpAddr>() {
            Ok(ip) if ip.is_unspecified() => Ipv4Addr::LOCALHOST.to_string(),
            Ok(IpAddr::V6(ip)) => format!("[{}]", ip),
            _ => self.host.clone(),
        }
    }
}

struct Running {
    addr: SocketAddr,
    shutdown: CancellationToken,
    server: JoinHandle<()>,
    heartbeat: CancellationToken,
    heartbeat_task: JoinHandle<()>,
    checker: TimeoutChecker,
}

pub struct A2aServer {
    config: ServerConfig,
    registry: Arc<AgentRegistry>,
    store: TaskStore,
    delegator: Option<Arc<dyn TaskDelegator>>,
    memory_probe: Option<Arc<dyn MemoryProbe>>,
    on_circuit_open: Option<AlertCallback>,
    running: tokio::sync::Mutex<Option<Running>>,
    addr: Mutex<Option<SocketAddr>>,
    checker_stats: Mutex<Option<CheckerStatistics>>,
    stopped: std::sync::atomic::AtomicBool,
}

impl A2aServer {
    pub fn new(config: ServerConfig, registry: Arc<AgentRegistry>, store: TaskStore) -> Self {
        Self {
            config,
            registry,
            store,
            delegator: None,
            memory_probe: None,
            on_circuit_open: None,
            running: tokio::sync::Mutex::new(None),
            addr: Mutex::new(None),
            checker_stats: Mutex::new(None),
            stopped: std::sync::atomic::AtomicBool::new(false),
        }
    }

    /// Hand new tasks and cancellations to an execution backend
    pub fn with_delegator(mut self, delegator: Arc<dyn TaskDelegator>) -> Self {
        self.delegator = Some(delegator);
        self
    }

    pub fn with_memory_probe(mut self, probe: Arc<dyn MemoryProbe>) -> Self {
        self.memory_probe = Some(probe);
        self
    }

    /// Called when the timeout checker's circuit opens
    pub fn on_circuit_open(mut self, callback: AlertCallback) -> Self {
        self.on_circuit_open = Some(callback);
        self
    }

    pub fn agent_id(&self) -> &str {
        &self.config.agent_id
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.addr.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn is_running(&self) -> bool {
        self.local_addr().is_some()
    }

    pub fn store(&self) -> &TaskStore {
        &self.store
    }

    /// Timeout checker counters, while running or as of the last stop
    pub fn checker_statistics(&self) -> Option<CheckerStatistics> {
        self.checker_stats
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    /// Bind, register and begin serving. Returns the bound address.
    pub async fn start(&self) -> Result<SocketAddr, ServerError> {
        let mut running = self.running.lock().await;
        if let Some(current) = running.as_ref() {
            return Err(ServerError::AlreadyRunning(current.addr));
        }
        if self.stopped.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(ServerError::Stopped);
        }

        let listener = match self.bind().await {
            Ok(listener) => listener,
            Err(e) => {
                if let Err(close_err) = self.store.close().await {
                    warn!("Failed to close task store after bind failure: {}", close_err);
                }
                return Err(e);
            }
        };
        let addr = listener.local_addr().map_err(|source| ServerError::Bind {
            addr: self.config.host.clone(),
            source,
        })?;

        let config = &self.config;
        let lifecycle = config.lifecycle.clone().clamped();
        let base_url = format!("http://{}", config.advertised_host());

        let registration = RegisterAgent::new(&config.agent_id, &base_url, addr.port())
            .with_capabilities(json!(config.capabilities))
            .with_metadata(json!({
                "name": config.name,
                "version": env!("CARGO_PKG_VERSION"),
            }));
        self.registry.register(registration.clone()).await?;

        let (heartbeat, heartbeat_task) = self.spawn_heartbeat(registration, lifecycle.heartbeat_interval());
        self.registry
            .start_cleanup(lifecycle.registry_cleanup_interval(), lifecycle.stale_threshold());

        let checker = TimeoutChecker::new(
            self.timeout_sweep(&lifecycle),
            TimeoutCheckerConfig {
                interval: lifecycle.timeout_check_interval(),
                max_consecutive_errors: lifecycle.max_consecutive_errors,
                circuit_cooldown: lifecycle.circuit_cooldown(),
                on_circuit_open: self.on_circuit_open.clone(),
            },
        );
        checker.start();

        let card = AgentCard {
            agent_id: config.agent_id.clone(),
            name: config.name.clone(),
            description: config.description.clone(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            url: format!("{}:{}", base_url, addr.port()),
            capabilities: config.capabilities.clone(),
            authentication: AuthConfig {
                schemes: if config.auth_token.is_some() {
                    vec!["bearer".to_string()]
                } else {
                    Vec::new()
                },
            },
        };

        let mut state = AppState::new(self.store.clone(), card)
            .with_payload_limit(config.limits.clone().clamped().max_payload_bytes);
        if let Some(delegator) = &self.delegator {
            state = state.with_delegator(Arc::clone(delegator));
        }

        let mut pipeline = PipelineState::new(config.limits.clone(), config.auth_token.clone());
        if let Some(probe) = &self.memory_probe {
            pipeline = pipeline.with_memory_probe(Arc::clone(probe));
        }
        if pipeline.auth_token.is_none() {
            warn!("No A2A auth token configured; authentication is disabled");
        }
        let app = middleware::apply(routes::router(state), pipeline);

        let shutdown = CancellationToken::new();
        let signal = shutdown.clone();
        let server = tokio::spawn(async move {
            let serve = axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(async move { signal.cancelled().await });
            if let Err(e) = serve.await {
                error!("A2A server error: {}", e);
            }
        });

        info!("A2A agent '{}' listening on http://{}", config.agent_id, addr);
        *running = Some(Running {
            addr,
            shutdown,
            server,
            heartbeat,
            heartbeat_task,
            checker,
        });
        *self.addr.lock().unwrap_or_else(|p| p.into_inner()) = Some(addr);
        Ok(addr)
    }

    /// Stop serving and release resources. Every step runs even if an
    /// earlier one fails. Calling it again is a no-op.
    pub async fn stop(&self) {
        let Some(running) = self.running.lock().await.take() else {
            debug!("A2A server not running");
            return;
        };
        self.stopped.store(true, std::sync::atomic::Ordering::SeqCst);
        info!("Stopping A2A agent '{}'", self.config.agent_id);

        running.checker.stop().await;
        *self.checker_stats.lock().unwrap_or_else(|p| p.into_inner()) =
            Some(running.checker.statistics());

        running.heartbeat.cancel();
        if let Err(e) = running.heartbeat_task.await {
            warn!("Heartbeat task ended abnormally: {}", e);
        }
        self.registry.stop_cleanup();

        match self.registry.deactivate(&self.config.agent_id).await {
            Ok(true) => debug!("Agent '{}' marked inactive", self.config.agent_id),
            Ok(false) => warn!("Agent '{}' was not in the registry", self.config.agent_id),
            Err(e) => warn!("Failed to deactivate agent '{}': {}", self.config.agent_id, e),
        }

        running.shutdown.cancel();
        let mut server = running.server;
        match tokio::time::timeout(SHUTDOWN_GRACE, &mut server).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("Server task ended abnormally: {}", e),
            Err(_) => {
                warn!("Connections still open after {:?}, aborting", SHUTDOWN_GRACE);
                server.abort();
            }
        }
        *self.addr.lock().unwrap_or_else(|p| p.into_inner()) = None;

        if let Err(e) = self.store.close().await {
            warn!("Failed to close task store: {}", e);
        }
        info!("A2A agent '{}' stopped", self.config.agent_id);
    }

    async fn bind(&self) -> Result<TcpListener, ServerError> {
        let host = self.config.host.as_str();
        if let Some(port) = self.config.port {
            return TcpListener::bind((host, port))
                .await
                .map_err(|source| ServerError::Bind {
                    addr: format!("{}:{}", host, port),
                    source,
                });
        }

        for port in self.config.port_range.clone() {
            match TcpListener::bind((host, port)).await {
                Ok(listener) => return Ok(listener),
                Err(e) => debug!("Port {} unavailable: {}", port, e),
            }
        }
        Err(ServerError::NoFreePort {
            host: host.to_string(),
            start: *self.config.port_range.start(),
            end: *self.config.port_range.end(),
        })
    }

    fn timeout_sweep(&self, lifecycle: &LifecycleConfig) -> Arc<dyn TimeoutSweep> {
        match &self.delegator {
            Some(delegator) => Arc::new(DelegatorSweep::new(Arc::clone(delegator))),
            None => Arc::new(StoreSweep::new(self.store.clone(), lifecycle.task_timeout())),
        }
    }

    fn spawn_heartbeat(
        &self,
        registration: RegisterAgent,
        interval: Duration,
    ) -> (CancellationToken, JoinHandle<()>) {
        let token = CancellationToken::new();
        let child = token.clone();
        let registry = Arc::clone(&self.registry);

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = child.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                match registry.heartbeat(&registration.agent_id).await {
                    Ok(true) => debug!("Heartbeat sent for '{}'", registration.agent_id),
                    Ok(false) => {
                        warn!(
                            "Agent '{}' missing from registry, registering again",
                            registration.agent_id
                        );
                        if let Err(e) = registry.register(registration.clone()).await {
                            warn!("Re-registration failed: {}", e);
                        }
                    }
                    Err(e) => warn!("Heartbeat failed for '{}': {}", registration.agent_id, e),
                }
            }
        });
        (token, handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_store::AgentStatus;

    fn fixtures() -> (Arc<AgentRegistry>, TaskStore) {
        (
            Arc::new(AgentRegistry::open_in_memory().unwrap()),
            TaskStore::open_in_memory().unwrap(),
        )
    }

    fn ephemeral(agent_id: &str) -> ServerConfig {
        ServerConfig::new(agent_id).with_port(0)
    }

    #[test]
    fn test_advertised_host() {
        let mut config = ServerConfig::new("a");
        assert_eq!(config.advertised_host(), "127.0.0.1");
        config.host = "0.0.0.0".to_string();
        assert_eq!(config.advertised_host(), "127.0.0.1");
        config.host = "::1".to_string();
        assert_eq!(config.advertised_host(), "[::1]");
        config.host = "agents.internal".to_string();
        assert_eq!(config.advertised_host(), "agents.internal");
    }

    #[tokio::test]
    async fn test_start_registers_and_stop_deactivates() {
        let (registry, store) = fixtures();
        let server = A2aServer::new(ephemeral("agent-a"), registry.clone(), store.clone());

        let addr = server.start().await.unwrap();
        assert!(server.is_running());
        assert_eq!(server.local_addr(), Some(addr));

        let entry = registry.get("agent-a").await.unwrap().unwrap();
        assert_eq!(entry.status, AgentStatus::Active);
        assert_eq!(entry.port, addr.port());
        assert_eq!(entry.base_url, "http://127.0.0.1");

        assert!(matches!(
            server.start().await,
            Err(ServerError::AlreadyRunning(a)) if a == addr
        ));

        server.stop().await;
        assert!(!server.is_running());
        let entry = registry.get("agent-a").await.unwrap().unwrap();
        assert_eq!(entry.status, AgentStatus::Inactive);
        assert!(store.get_task("x").await.is_err());
        assert!(server.checker_statistics().is_some());

        // Second stop is a no-op; restart is refused
        server.stop().await;
        assert!(matches!(server.start().await, Err(ServerError::Stopped)));
    }

    #[tokio::test]
    async fn test_port_discovery_skips_taken_ports() {
        let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let busy = taken.local_addr().unwrap().port();
        let Some(next) = busy.checked_add(1) else {
            return;
        };

        let (registry, store) = fixtures();
        let mut config = ServerConfig::new("agent-scan");
        config.port_range = busy..=next.saturating_add(20);
        let server = A2aServer::new(config, registry, store);

        let addr = server.start().await.unwrap();
        assert_ne!(addr.port(), busy);
        assert!(addr.port() > busy);
        server.stop().await;
    }

    #[tokio::test]
    async fn test_bind_failure_closes_store() {
        let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let busy = taken.local_addr().unwrap().port();

        let (registry, store) = fixtures();
        let config = ServerConfig::new("agent-x").with_port(busy);
        let server = A2aServer::new(config, registry.clone(), store.clone());

        assert!(matches!(server.start().await, Err(ServerError::Bind { .. })));
        assert!(!server.is_running());
        assert!(store.get_task("x").await.is_err());
        assert!(registry.get("agent-x").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_no_free_port() {
        let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let busy = taken.local_addr().unwrap().port();

        let (registry, store) = fixtures();
        let mut config = ServerConfig::new("agent-y");
        config.port_range = busy..=busy;
        let server = A2aServer::new(config, registry, store);
        assert!(matches!(
            server.start().await,
            Err(ServerError::NoFreePort { start, end, .. }) if start == busy && end == busy
        ));
    }

    #[tokio::test]
    async fn test_serves_health() {
        let (registry, store) = fixtures();
        let server = A2aServer::new(ephemeral("agent-h"), registry, store);
        let addr = server.start().await.unwrap();

        let body: serde_json::Value = reqwest::get(format!("http://{}/health", addr))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(body["data"]["agentId"], "agent-h");
        server.stop().await;
    }
}

//! `courier.toml` loading
//!
//! Values come from the config file first, then `A2A_*` environment
//! variables override them. Every numeric knob goes through the same
//! clamping as the library's `from_env` constructors.

use anyhow::{Context, Result, bail};
use courier_a2a::{ClientConfig, LifecycleConfig, RetryConfig, ServerConfig, ServerLimits};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentSection {
    pub id: String,
    pub name: Option<String>,
    pub description: Option<String>,
    pub capabilities: Option<Vec<String>>,
}

impl Default for AgentSection {
    fn default() -> Self {
        Self {
            id: "courier".to_string(),
            name: None,
            description: None,
            capabilities: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    pub host: String,
    pub port: Option<u16>,
    pub port_range_start: u16,
    pub port_range_end: u16,
    pub auth_token: Option<String>,
    /// Directory holding registry.db and tasks.db
    pub data_dir: Option<PathBuf>,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: None,
            port_range_start: 3000,
            port_range_end: 3100,
            auth_token: None,
            data_dir: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CourierConfig {
    pub agent: AgentSection,
    pub server: ServerSection,
    pub retry: RetryConfig,
    pub limits: ServerLimits,
    pub lifecycle: LifecycleConfig,
}

/// `~/.config/courier/courier.toml` (platform equivalent)
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("courier").join("courier.toml"))
}

fn default_data_dir() -> Result<PathBuf> {
    dirs::data_dir()
        .map(|d| d.join("courier"))
        .context("Could not determine a data directory; pass --data-dir")
}

impl CourierConfig {
    /// Load from `path`, or from the default location when it exists
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let file = match path {
            Some(path) => Self::read(path)?,
            None => match default_config_path().filter(|p| p.exists()) {
                Some(path) => Self::read(&path)?,
                None => Self::default(),
            },
        };
        Ok(file.with_overrides(|name| std::env::var(name).ok()))
    }

    fn read(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::parse(&content).with_context(|| format!("Invalid config file {}", path.display()))
    }

    pub fn parse(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content).context("Failed to parse courier.toml")?;
        if config.agent.id.trim().is_empty() {
            bail!("[agent] id cannot be empty");
        }
        if config.server.port_range_start > config.server.port_range_end {
            bail!(
                "[server] port_range_start ({}) is above port_range_end ({})",
                config.server.port_range_start,
                config.server.port_range_end
            );
        }
        Ok(config)
    }

    /// Re-read every clamped knob through `env`, falling back to the file value
    pub fn with_overrides<F: Fn(&str) -> Option<String>>(mut self, env: F) -> Self {
        let retry_file = file_values(&self.retry);
        let mut retry = RetryConfig::from_lookup(|name| env(name).or_else(|| retry_file.get(name).cloned()));
        retry.retryable_status_codes = std::mem::take(&mut self.retry.retryable_status_codes);
        self.retry = retry;

        let limits_file = file_values(&self.limits);
        self.limits =
            ServerLimits::from_lookup(|name| env(name).or_else(|| limits_file.get(name).cloned()));

        let lifecycle_file = file_values(&self.lifecycle);
        let mut lifecycle = LifecycleConfig::from_lookup(|name| {
            env(name).or_else(|| lifecycle_file.get(name).cloned())
        });
        lifecycle.max_consecutive_errors = self.lifecycle.max_consecutive_errors;
        lifecycle.circuit_cooldown_ms = self.lifecycle.circuit_cooldown_ms;
        self.lifecycle = lifecycle.clamped();

        if let Some(token) = env("A2A_AUTH_TOKEN").filter(|t| !t.trim().is_empty()) {
            self.server.auth_token = Some(token);
        }
        self
    }

    pub fn data_dir(&self) -> Result<PathBuf> {
        match &self.server.data_dir {
            Some(dir) => Ok(dir.clone()),
            None => default_data_dir(),
        }
    }

    pub fn server_config(&self) -> ServerConfig {
        let mut config = ServerConfig::new(&self.agent.id);
        if let Some(name) = &self.agent.name {
            config.name = name.clone();
        }
        if let Some(description) = &self.agent.description {
            config.description = description.clone();
        }
        if let Some(capabilities) = &self.agent.capabilities {
            config.capabilities = capabilities.clone();
        }
        config.host = self.server.host.clone();
        config.port = self.server.port;
        config.port_range = self.server.port_range_start..=self.server.port_range_end;
        config.auth_token = self.server.auth_token.clone();
        config.limits = self.limits.clone();
        config.lifecycle = self.lifecycle.clone();
        config
    }

    pub fn client_config(&self) -> ClientConfig {
        let mut config = ClientConfig::new(self.retry.clone());
        if let Some(token) = &self.server.auth_token {
            config = config.with_token(token);
        }
        config
    }
}

/// Scalar fields of a section keyed by their `A2A_*` variable name
fn file_values<T: Serialize>(section: &T) -> HashMap<String, String> {
    let Ok(serde_json::Value::Object(fields)) = serde_json::to_value(section) else {
        return HashMap::new();
    };
    fields
        .into_iter()
        .filter_map(|(key, value)| {
            let raw = match value {
                serde_json::Value::Number(n) => n.to_string(),
                serde_json::Value::Bool(b) => b.to_string(),
                serde_json::Value::String(s) => s,
                _ => return None,
            };
            Some((format!("A2A_{}", key.to_ascii_uppercase()), raw))
        })
        .collect()
}

//! Client, server and lifecycle configuration
//!
//! Every numeric knob is clamped into a fixed range. Values outside the range
//! are pulled to the nearest bound; unparseable environment values fall back
//! to the default with a warning.

use std::ops::RangeInclusive;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

pub const DEFAULT_RETRYABLE_STATUS_CODES: [u16; 5] = [429, 500, 502, 503, 504];

const MAX_RETRIES: RangeInclusive<u32> = 0..=10;
const BASE_DELAY_MS: RangeInclusive<u64> = 100..=60_000;
const TIMEOUT_MS: RangeInclusive<u64> = 1_000..=300_000;
const BYTES: RangeInclusive<usize> = 1024..=100 * 1024 * 1024;
const CONNECTIONS_PER_IP: RangeInclusive<usize> = 1..=1_000;
const TRACKED_IPS: RangeInclusive<usize> = 100..=1_000_000;
const MEMORY_PERCENT: RangeInclusive<u8> = 50..=99;
const RATE_LIMIT_MAX: RangeInclusive<usize> = 1..=100_000;
const RATE_LIMIT_WINDOW_MS: RangeInclusive<u64> = 1_000..=3_600_000;
const HEARTBEAT_MS: RangeInclusive<u64> = 1_000..=600_000;
const CLEANUP_MS: RangeInclusive<u64> = 1_000..=3_600_000;
const STALE_MS: RangeInclusive<u64> = 1_000..=86_400_000;
const CHECK_MS: RangeInclusive<u64> = 1_000..=3_600_000;
const TASK_TIMEOUT_MS: RangeInclusive<u64> = 1_000..=604_800_000;
const CIRCUIT_ERRORS: RangeInclusive<u32> = 1..=100;
const CIRCUIT_COOLDOWN_MS: RangeInclusive<u64> = 1_000..=3_600_000;

fn clamp<T: PartialOrd + Copy>(value: T, range: &RangeInclusive<T>) -> T {
    if value < *range.start() {
        *range.start()
    } else if value > *range.end() {
        *range.end()
    } else {
        value
    }
}

/// Read a clamped number from `lookup`. Any integer text is pulled to the
/// nearest bound, including negatives and values past the type's range;
/// anything else falls back to the default.
fn bounded<T, F>(lookup: &F, name: &str, default: T, range: &RangeInclusive<T>) -> T
where
    T: Copy + std::fmt::Display + TryFrom<i128> + TryInto<i128>,
    F: Fn(&str) -> Option<String>,
{
    let Some(raw) = lookup(name) else {
        return default;
    };
    let Some(value) = parse_integer(&raw) else {
        warn!("Invalid {}='{}', using default {}", name, raw, default);
        return default;
    };
    let low: Result<i128, _> = (*range.start()).try_into();
    let high: Result<i128, _> = (*range.end()).try_into();
    let (Ok(low), Ok(high)) = (low, high) else {
        return default;
    };

    let clamped = value.clamp(low, high);
    if clamped != value {
        warn!(
            "{}={} out of range [{}, {}], using {}",
            name,
            raw.trim(),
            range.start(),
            range.end(),
            clamped
        );
    }
    T::try_from(clamped).unwrap_or(default)
}

/// Signed integer text; digit runs too long for `i128` saturate
fn parse_integer(raw: &str) -> Option<i128> {
    let text = raw.trim();
    if let Ok(value) = text.parse::<i128>() {
        return Some(value);
    }
    let (negative, digits) = match text.strip_prefix('-') {
        Some(digits) => (true, digits),
        None => (false, text.strip_prefix('+').unwrap_or(text)),
    };
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    Some(if negative { i128::MIN } else { i128::MAX })
}

fn flag<F>(lookup: &F, name: &str, default: bool) -> bool
where
    F: Fn(&str) -> Option<String>,
{
    let Some(raw) = lookup(name) else {
        return default;
    };
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => true,
        "0" | "false" | "no" | "off" => false,
        _ => {
            warn!("Invalid {}='{}', using default {}", name, raw, default);
            default
        }
    }
}

fn process_env(name: &str) -> Option<String> {
    std::env::var(name).ok()
}

/// Retry policy for outbound A2A calls
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub timeout_ms: u64,
    pub enable_jitter: bool,
    pub retryable_status_codes: Vec<u16>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 1_000,
            timeout_ms: 30_000,
            enable_jitter: true,
            retryable_status_codes: DEFAULT_RETRYABLE_STATUS_CODES.to_vec(),
        }
    }
}

impl RetryConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(process_env)
    }

    pub fn from_lookup<F: Fn(&str) -> Option<String>>(lookup: F) -> Self {
        let defaults = Self::default();
        Self {
            max_retries: bounded(&lookup, "A2A_MAX_RETRIES", defaults.max_retries, &MAX_RETRIES),
            base_delay_ms: bounded(
                &lookup,
                "A2A_BASE_DELAY_MS",
                defaults.base_delay_ms,
                &BASE_DELAY_MS,
            ),
            timeout_ms: bounded(&lookup, "A2A_TIMEOUT_MS", defaults.timeout_ms, &TIMEOUT_MS),
            enable_jitter: flag(&lookup, "A2A_ENABLE_JITTER", defaults.enable_jitter),
            retryable_status_codes: defaults.retryable_status_codes,
        }
    }

    /// Pull every field into range
    pub fn clamped(mut self) -> Self {
        self.max_retries = clamp(self.max_retries, &MAX_RETRIES);
        self.base_delay_ms = clamp(self.base_delay_ms, &BASE_DELAY_MS);
        self.timeout_ms = clamp(self.timeout_ms, &TIMEOUT_MS);
        self
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// `base_delay * 2^attempt`, before jitter. Saturates instead of overflowing.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
        Duration::from_millis(self.base_delay_ms.saturating_mul(factor))
    }

    /// Upper bound on one whole operation including every retry and backoff
    pub fn overall_deadline(&self) -> Duration {
        let attempts = u64::from(self.max_retries) + 1;
        let backoffs = (0..self.max_retries)
            .map(|attempt| self.backoff(attempt))
            .fold(Duration::ZERO, Duration::saturating_add);
        Duration::from_millis(self.timeout_ms.saturating_mul(attempts)).saturating_add(backoffs)
    }

    pub fn is_retryable_status(&self, status: u16) -> bool {
        if status == 401 || status == 403 {
            return false;
        }
        self.retryable_status_codes.contains(&status) || (500..=599).contains(&status)
    }
}

/// Settings for [`crate::client::A2aClient`]
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub retry: RetryConfig,
    pub auth_token: Option<String>,
    pub max_response_bytes: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self::new(RetryConfig::default())
    }
}

impl ClientConfig {
    pub const DEFAULT_MAX_RESPONSE_BYTES: usize = 10 * 1024 * 1024;

    pub fn new(retry: RetryConfig) -> Self {
        Self {
            retry: retry.clamped(),
            auth_token: None,
            max_response_bytes: Self::DEFAULT_MAX_RESPONSE_BYTES,
        }
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = Some(token.into());
        self
    }

    pub fn with_max_response_bytes(mut self, bytes: usize) -> Self {
        self.max_response_bytes = clamp(bytes, &BYTES);
        self
    }

    pub fn from_env() -> Self {
        Self::from_lookup(process_env)
    }

    pub fn from_lookup<F: Fn(&str) -> Option<String>>(lookup: F) -> Self {
        Self {
            retry: RetryConfig::from_lookup(&lookup),
            auth_token: lookup("A2A_AUTH_TOKEN").filter(|t| !t.trim().is_empty()),
            max_response_bytes: bounded(
                &lookup,
                "A2A_MAX_RESPONSE_BYTES",
                Self::DEFAULT_MAX_RESPONSE_BYTES,
                &BYTES,
            ),
        }
    }
}

/// Resource limits enforced by the server pipeline
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerLimits {
    pub max_payload_bytes: usize,
    pub request_timeout_ms: u64,
    pub max_connections_per_ip: usize,
    pub max_tracked_ips: usize,
    pub memory_threshold_percent: u8,
    pub rate_limit_max: usize,
    pub rate_limit_window_ms: u64,
}

impl Default for ServerLimits {
    fn default() -> Self {
        Self {
            max_payload_bytes: 10 * 1024 * 1024,
            request_timeout_ms: 30_000,
            max_connections_per_ip: 10,
            max_tracked_ips: 10_000,
            memory_threshold_percent: 85,
            rate_limit_max: 120,
            rate_limit_window_ms: 60_000,
        }
    }
}

impl ServerLimits {
    pub fn from_env() -> Self {
        Self::from_lookup(process_env)
    }

    pub fn from_lookup<F: Fn(&str) -> Option<String>>(lookup: F) -> Self {
        let d = Self::default();
        Self {
            max_payload_bytes: bounded(&lookup, "A2A_MAX_PAYLOAD_BYTES", d.max_payload_bytes, &BYTES),
            request_timeout_ms: bounded(
                &lookup,
                "A2A_REQUEST_TIMEOUT_MS",
                d.request_timeout_ms,
                &TIMEOUT_MS,
            ),
            max_connections_per_ip: bounded(
                &lookup,
                "A2A_MAX_CONNECTIONS_PER_IP",
                d.max_connections_per_ip,
                &CONNECTIONS_PER_IP,
            ),
            max_tracked_ips: bounded(
                &lookup,
                "A2A_MAX_TRACKED_IPS",
                d.max_tracked_ips,
                &TRACKED_IPS,
            ),
            memory_threshold_percent: bounded(
                &lookup,
                "A2A_MEMORY_THRESHOLD_PERCENT",
                d.memory_threshold_percent,
                &MEMORY_PERCENT,
            ),
            rate_limit_max: bounded(&lookup, "A2A_RATE_LIMIT_MAX", d.rate_limit_max, &RATE_LIMIT_MAX),
            rate_limit_window_ms: bounded(
                &lookup,
                "A2A_RATE_LIMIT_WINDOW_MS",
                d.rate_limit_window_ms,
                &RATE_LIMIT_WINDOW_MS,
            ),
        }
    }

    pub fn clamped(mut self) -> Self {
        self.max_payload_bytes = clamp(self.max_payload_bytes, &BYTES);
        self.request_timeout_ms = clamp(self.request_timeout_ms, &TIMEOUT_MS);
        self.max_connections_per_ip = clamp(self.max_connections_per_ip, &CONNECTIONS_PER_IP);
        self.max_tracked_ips = clamp(self.max_tracked_ips, &TRACKED_IPS);
        self.memory_threshold_percent = clamp(self.memory_threshold_percent, &MEMORY_PERCENT);
        self.rate_limit_max = clamp(self.rate_limit_max, &RATE_LIMIT_MAX);
        self.rate_limit_window_ms = clamp(self.rate_limit_window_ms, &RATE_LIMIT_WINDOW_MS);
        self
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn rate_limit_window(&self) -> Duration {
        Duration::from_millis(self.rate_limit_window_ms)
    }
}

/// Background timer settings for a running server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LifecycleConfig {
    pub heartbeat_interval_ms: u64,
    pub registry_cleanup_interval_ms: u64,
    pub stale_threshold_ms: u64,
    pub timeout_check_interval_ms: u64,
    /// Idle time after which the built-in sweep expires a non-terminal task
    pub task_timeout_ms: u64,
    pub max_consecutive_errors: u32,
    pub circuit_cooldown_ms: u64,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: 30_000,
            registry_cleanup_interval_ms: 300_000,
            stale_threshold_ms: 300_000,
            timeout_check_interval_ms: 60_000,
            task_timeout_ms: 3_600_000,
            max_consecutive_errors: 5,
            circuit_cooldown_ms: 300_000,
        }
    }
}

impl LifecycleConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(process_env)
    }

    pub fn from_lookup<F: Fn(&str) -> Option<String>>(lookup: F) -> Self {
        let d = Self::default();
        Self {
            heartbeat_interval_ms: bounded(
                &lookup,
                "A2A_HEARTBEAT_INTERVAL_MS",
                d.heartbeat_interval_ms,
                &HEARTBEAT_MS,
            ),
            registry_cleanup_interval_ms: bounded(
                &lookup,
                "A2A_REGISTRY_CLEANUP_INTERVAL_MS",
                d.registry_cleanup_interval_ms,
                &CLEANUP_MS,
            ),
            stale_threshold_ms: bounded(
                &lookup,
                "A2A_STALE_THRESHOLD_MS",
                d.stale_threshold_ms,
                &STALE_MS,
            ),
            timeout_check_interval_ms: bounded(
                &lookup,
                "A2A_TIMEOUT_CHECK_INTERVAL_MS",
                d.timeout_check_interval_ms,
                &CHECK_MS,
            ),
            task_timeout_ms: bounded(
                &lookup,
                "A2A_TASK_TIMEOUT_MS",
                d.task_timeout_ms,
                &TASK_TIMEOUT_MS,
            ),
            max_consecutive_errors: d.max_consecutive_errors,
            circuit_cooldown_ms: d.circuit_cooldown_ms,
        }
    }

    pub fn clamped(mut self) -> Self {
        self.heartbeat_interval_ms = clamp(self.heartbeat_interval_ms, &HEARTBEAT_MS);
        self.registry_cleanup_interval_ms =
            clamp(self.registry_cleanup_interval_ms, &CLEANUP_MS);
        self.stale_threshold_ms = clamp(self.stale_threshold_ms, &STALE_MS);
        self.timeout_check_interval_ms = clamp(self.timeout_check_interval_ms, &CHECK_MS);
        self.task_timeout_ms = clamp(self.task_timeout_ms, &TASK_TIMEOUT_MS);
        self.max_consecutive_errors = clamp(self.max_consecutive_errors, &CIRCUIT_ERRORS);
        self.circuit_cooldown_ms = clamp(self.circuit_cooldown_ms, &CIRCUIT_COOLDOWN_MS);
        self
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn registry_cleanup_interval(&self) -> Duration {
        Duration::from_millis(self.registry_cleanup_interval_ms)
    }

    pub fn stale_threshold(&self) -> Duration {
        Duration::from_millis(self.stale_threshold_ms)
    }

    pub fn timeout_check_interval(&self) -> Duration {
        Duration::from_millis(self.timeout_check_interval_ms)
    }

    pub fn task_timeout(&self) -> Duration {
        Duration::from_millis(self.task_timeout_ms)
    }

    pub fn circuit_cooldown(&self) -> Duration {
        Duration::from_millis(self.circuit_cooldown_ms)
    }
}

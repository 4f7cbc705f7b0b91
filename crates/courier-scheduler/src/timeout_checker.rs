//! Periodic timeout sweep with circuit breaking
//!
//! Each tick runs [`TimeoutSweep::check_timeouts`] on its own task. Errors and
//! panics both count as failures; enough consecutive failures open the
//! circuit, after which ticks are skipped until the cooldown allows a probe.

use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::circuit::{CircuitBreaker, CircuitState};

/// Work performed on every tick
#[async_trait]
pub trait TimeoutSweep: Send + Sync + 'static {
    /// Expire overdue work. Returns how many items were timed out.
    async fn check_timeouts(&self) -> anyhow::Result<usize>;
}

/// Details passed to the alert callback when the circuit opens
#[derive(Debug, Clone)]
pub struct CircuitAlert {
    pub consecutive_errors: u32,
    pub last_error: String,
    pub cooldown: Duration,
}

pub type AlertCallback = Arc<dyn Fn(&CircuitAlert) + Send + Sync>;

#[derive(Clone)]
pub struct TimeoutCheckerConfig {
    pub interval: Duration,
    pub max_consecutive_errors: u32,
    pub circuit_cooldown: Duration,
    pub on_circuit_open: Option<AlertCallback>,
}

impl Default for TimeoutCheckerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            max_consecutive_errors: 5,
            circuit_cooldown: Duration::from_secs(300),
            on_circuit_open: None,
        }
    }
}

impl fmt::Debug for TimeoutCheckerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimeoutCheckerConfig")
            .field("interval", &self.interval)
            .field("max_consecutive_errors", &self.max_consecutive_errors)
            .field("circuit_cooldown", &self.circuit_cooldown)
            .field("on_circuit_open", &self.on_circuit_open.is_some())
            .finish()
    }
}

/// Outcome of a single tick
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckOutcome {
    /// Circuit open and cooling down
    Skipped,
    Succeeded { timed_out: usize },
    Failed { error: String },
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckerStatistics {
    pub total_checks: u64,
    pub successful_checks: u64,
    pub failed_checks: u64,
    pub skipped_checks: u64,
    pub consecutive_errors: u32,
    pub circuit_state: CircuitState,
    /// Failed share of the checks that actually ran
    pub error_rate: f64,
    pub last_success: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub last_error_at: Option<DateTime<Utc>>,
    pub is_running: bool,
}

#[derive(Debug, Default)]
struct Counters {
    total: u64,
    succeeded: u64,
    failed: u64,
    skipped: u64,
    last_success: Option<DateTime<Utc>>,
    last_error: Option<(String, DateTime<Utc>)>,
}

struct Shared {
    breaker: Mutex<CircuitBreaker>,
    counters: Mutex<Counters>,
}

struct Running {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

pub struct TimeoutChecker {
    sweep: Arc<dyn TimeoutSweep>,
    config: TimeoutCheckerConfig,
    shared: Arc<Shared>,
    running: Mutex<Option<Running>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl TimeoutChecker {
    pub fn new(sweep: Arc<dyn TimeoutSweep>, config: TimeoutCheckerConfig) -> Self {
        let breaker = CircuitBreaker::new(config.max_consecutive_errors, config.circuit_cooldown);
        Self {
            sweep,
            config,
            shared: Arc::new(Shared {
                breaker: Mutex::new(breaker),
                counters: Mutex::new(Counters::default()),
            }),
            running: Mutex::new(None),
        }
    }

    /// Spawn the periodic loop. No-op if already running.
    pub fn start(&self) {
        let mut running = lock(&self.running);
        if running.as_ref().is_some_and(|r| !r.handle.is_finished()) {
            debug!("Timeout checker already running");
            return;
        }

        let token = CancellationToken::new();
        let child = token.clone();
        let sweep = Arc::clone(&self.sweep);
        let shared = Arc::clone(&self.shared);
        let config = self.config.clone();

        let handle = tokio::spawn(async move {
            info!(
                "Timeout checker started (every {:?}, circuit opens after {} errors)",
                config.interval, config.max_consecutive_errors
            );
            let mut ticker = tokio::time::interval(config.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = child.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                tick(&sweep, &shared, &config).await;
            }
            info!("Timeout checker stopped");
        });

        *running = Some(Running { token, handle });
    }

    /// Stop the loop and wait for an in-progress tick to finish
    pub async fn stop(&self) {
        let running = lock(&self.running).take();
        if let Some(Running { token, handle }) = running {
            token.cancel();
            if let Err(e) = handle.await {
                warn!("Timeout checker task ended abnormally: {}", e);
            }
        }
    }

    pub fn is_running(&self) -> bool {
        lock(&self.running)
            .as_ref()
            .is_some_and(|r| !r.handle.is_finished())
    }

    /// Run one tick now, outside the schedule
    pub async fn run_once(&self) -> CheckOutcome {
        tick(&self.sweep, &self.shared, &self.config).await
    }

    /// Close the circuit and clear the consecutive error count
    pub fn reset_circuit(&self) {
        lock(&self.shared.breaker).reset();
        info!("Timeout checker circuit manually reset");
    }

    pub fn statistics(&self) -> CheckerStatistics {
        let (circuit_state, consecutive_errors) = {
            let breaker = lock(&self.shared.breaker);
            (breaker.state(), breaker.consecutive_errors())
        };
        let counters = lock(&self.shared.counters);
        let executed = counters.succeeded + counters.failed;
        let error_rate = if executed == 0 {
            0.0
        } else {
            counters.failed as f64 / executed as f64
        };

        CheckerStatistics {
            total_checks: counters.total,
            successful_checks: counters.succeeded,
            failed_checks: counters.failed,
            skipped_checks: counters.skipped,
            consecutive_errors,
            circuit_state,
            error_rate,
            last_success: counters.last_success,
            last_error: counters.last_error.as_ref().map(|(msg, _)| msg.clone()),
            last_error_at: counters.last_error.as_ref().map(|(_, at)| *at),
            is_running: self.is_running(),
        }
    }
}

impl Drop for TimeoutChecker {
    fn drop(&mut self) {
        if let Some(running) = lock(&self.running).take() {
            running.token.cancel();
        }
    }
}

async fn tick(
    sweep: &Arc<dyn TimeoutSweep>,
    shared: &Shared,
    config: &TimeoutCheckerConfig,
) -> CheckOutcome {
    let allowed = {
        let mut breaker = lock(&shared.breaker);
        let allowed = breaker.allow();
        if !allowed {
            debug!(
                "Timeout check skipped: circuit open ({:?} remaining)",
                breaker.remaining_cooldown().unwrap_or_default()
            );
        }
        allowed
    };

    if !allowed {
        let mut counters = lock(&shared.counters);
        counters.total += 1;
        counters.skipped += 1;
        return CheckOutcome::Skipped;
    }

    let sweep = Arc::clone(sweep);
    let result = tokio::spawn(async move { sweep.check_timeouts().await }).await;

    let error = match result {
        Ok(Ok(timed_out)) => {
            let recovered = lock(&shared.breaker).record_success();
            if recovered {
                info!("Timeout checker circuit closed after successful probe");
            }
            let mut counters = lock(&shared.counters);
            counters.total += 1;
            counters.succeeded += 1;
            counters.last_success = Some(Utc::now());
            if timed_out > 0 {
                info!("Timeout check expired {} tasks", timed_out);
            } else {
                debug!("Timeout check found nothing to expire");
            }
            return CheckOutcome::Succeeded { timed_out };
        }
        Ok(Err(e)) => format!("{:#}", e),
        Err(join) if join.is_panic() => format!("timeout check panicked: {}", join),
        Err(join) => format!("timeout check aborted: {}", join),
    };

    let (opened, consecutive_errors) = {
        let mut breaker = lock(&shared.breaker);
        let opened = breaker.record_failure();
        (opened, breaker.consecutive_errors())
    };
    {
        let mut counters = lock(&shared.counters);
        counters.total += 1;
        counters.failed += 1;
        counters.last_error = Some((error.clone(), Utc::now()));
    }
    warn!(
        "Timeout check failed ({} consecutive): {}",
        consecutive_errors, error
    );

    if opened {
        error!(
            "Timeout checker circuit opened after {} consecutive errors; pausing for {:?}",
            consecutive_errors, config.circuit_cooldown
        );
        if let Some(callback) = &config.on_circuit_open {
            let alert = CircuitAlert {
                consecutive_errors,
                last_error: error.clone(),
                cooldown: config.circuit_cooldown,
            };
            // A broken alert sink must not take the checker loop down with it
            if catch_unwind(AssertUnwindSafe(|| callback(&alert))).is_err() {
                error!("Timeout checker alert callback panicked");
            }
        }
    }

    CheckOutcome::Failed { error }
}

//! Consecutive-failure circuit breaker

use std::fmt;
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    #[default]
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    const fn valid_transitions(&self) -> &'static [CircuitState] {
        match self {
            CircuitState::Closed => &[CircuitState::Open],
            CircuitState::Open => &[CircuitState::HalfOpen],
            CircuitState::HalfOpen => &[CircuitState::Closed, CircuitState::Open],
        }
    }

    fn can_transition_to(&self, target: CircuitState) -> bool {
        self.valid_transitions().contains(&target)
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CircuitState::Closed => "CLOSED",
            CircuitState::Open => "OPEN",
            CircuitState::HalfOpen => "HALF_OPEN",
        })
    }
}

/// Opens after `threshold` consecutive failures and lets a single probe
/// through once `cooldown` has elapsed.
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    state: CircuitState,
    consecutive_errors: u32,
    threshold: u32,
    cooldown: Duration,
    opened_at: Option<Instant>,
}

impl CircuitBreaker {
    pub fn new(threshold: u32, cooldown: Duration) -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_errors: 0,
            threshold: threshold.max(1),
            cooldown,
            opened_at: None,
        }
    }

    pub fn state(&self) -> CircuitState {
        self.state
    }

    pub fn consecutive_errors(&self) -> u32 {
        self.consecutive_errors
    }

    fn transition_to(&mut self, next: CircuitState) {
        debug_assert!(
            self.state.can_transition_to(next),
            "Invalid circuit state transition: {:?} -> {:?}",
            self.state,
            next
        );
        self.state = next;
    }

    /// Whether a call may proceed now. Moves OPEN to HALF_OPEN once the
    /// cooldown has elapsed.
    pub fn allow(&mut self) -> bool {
        match self.state {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => match self.opened_at {
                Some(at) if at.elapsed() >= self.cooldown => {
                    self.transition_to(CircuitState::HalfOpen);
                    true
                }
                Some(_) => false,
                None => {
                    // Open without a timestamp cannot cool down; treat as expired
                    self.transition_to(CircuitState::HalfOpen);
                    true
                }
            },
        }
    }

    /// Time left before the next probe, if the circuit is open
    pub fn remaining_cooldown(&self) -> Option<Duration> {
        if self.state != CircuitState::Open {
            return None;
        }
        let at = self.opened_at?;
        Some(self.cooldown.saturating_sub(at.elapsed()))
    }

    /// Returns true if this success closed a half-open circuit
    pub fn record_success(&mut self) -> bool {
        let recovered = self.state == CircuitState::HalfOpen;
        if recovered {
            self.transition_to(CircuitState::Closed);
        }
        self.consecutive_errors = 0;
        self.opened_at = None;
        recovered
    }

    /// Returns true if this failure opened the circuit
    pub fn record_failure(&mut self) -> bool {
        self.consecutive_errors = self.consecutive_errors.saturating_add(1);
        let should_open = match self.state {
            CircuitState::Closed => self.consecutive_errors >= self.threshold,
            CircuitState::HalfOpen => true,
            CircuitState::Open => false,
        };
        if should_open {
            self.transition_to(CircuitState::Open);
            self.opened_at = Some(Instant::now());
        }
        should_open
    }

    /// Force the circuit closed and clear the error count
    pub fn reset(&mut self) {
        self.state = CircuitState::Closed;
        self.consecutive_errors = 0;
        self.opened_at = None;
    }
}

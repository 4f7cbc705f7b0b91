//! courier-scheduler - Periodic timeout sweeps with circuit breaking
//!
//! This crate provides:
//! - A consecutive-failure circuit breaker
//! - A timeout checker that runs a sweep on a fixed interval, skipping ticks
//!   while the circuit is open

pub mod circuit;
pub mod timeout_checker;

pub use circuit::{CircuitBreaker, CircuitState};
pub use timeout_checker::{
    AlertCallback, CheckOutcome, CheckerStatistics, CircuitAlert, TimeoutChecker,
    TimeoutCheckerConfig, TimeoutSweep,
};

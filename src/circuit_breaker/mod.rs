//! Failure isolation for calls to users' endpoints
//!
//! Closed -> Open after `failure_threshold` consecutive failures, Open ->
//! HalfOpen after `reset_timeout` (lazily on the next call, or from the
//! [`AutomaticResetManager`] timer), HalfOpen -> Closed after
//! `success_threshold` consecutive successes, HalfOpen -> Open on any failure.

mod breaker;
mod metrics;
mod registry;
mod reset;

pub use breaker::{
    BreakerError, BreakerObserver, CallOutcome, CircuitBreaker, CircuitBreakerConfig,
    CircuitBreakerStats, CircuitState, StateTransition,
};
pub use metrics::{BreakerCounters, BreakerMetricsCollector};
pub use registry::BreakerRegistry;
pub use reset::AutomaticResetManager;

/// Breaker guarding pool-acquire-and-forward calls
pub const SSH_FORWARD_BREAKER: &str = "ssh_forward";

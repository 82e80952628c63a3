//! Three-state circuit breaker with per-call timeouts

use std::future::Future;
use std::sync::atomic::{AtomicI64, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::time::Instant;

use crate::config::CircuitBreakerSettings;

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum CircuitState {
    /// Calls flow through normally
    Closed = 0,
    /// Calls are rejected without being attempted
    Open = 1,
    /// A limited number of probe calls are let through
    HalfOpen = 2,
}

impl From<u8> for CircuitState {
    fn from(value: u8) -> Self {
        match value {
            1 => CircuitState::Open,
            2 => CircuitState::HalfOpen,
            _ => CircuitState::Closed,
        }
    }
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before opening
    pub failure_threshold: u32,
    /// Consecutive half-open successes before closing
    pub success_threshold: u32,
    /// Per-call timeout
    pub timeout: Duration,
    /// Time spent open before probing
    pub reset_timeout: Duration,
    /// Concurrent probes allowed while half-open
    pub half_open_max_probes: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self::from(&CircuitBreakerSettings::default())
    }
}

impl From<&CircuitBreakerSettings> for CircuitBreakerConfig {
    fn from(settings: &CircuitBreakerSettings) -> Self {
        Self {
            failure_threshold: settings.failure_threshold,
            success_threshold: settings.success_threshold,
            timeout: Duration::from_millis(settings.timeout_ms),
            reset_timeout: Duration::from_millis(settings.reset_timeout_ms),
            half_open_max_probes: settings.half_open_max_probes,
        }
    }
}

#[derive(Error, Debug)]
pub enum BreakerError<E> {
    #[error("Circuit breaker '{name}' is open")]
    CircuitOpen { name: String },

    #[error("Call through '{name}' timed out after {timeout:?}")]
    Timeout { name: String, timeout: Duration },

    #[error("{0}")]
    Inner(E),
}

/// Emitted on every state change
#[derive(Debug, Clone, Serialize)]
pub struct StateTransition {
    pub name: String,
    pub from: CircuitState,
    pub to: CircuitState,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallOutcome {
    Success,
    Failure,
    Timeout,
    /// Rejected without invoking the operation
    Rejected,
    /// Completed with an error the caller chose not to count
    Ignored,
}

impl CallOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallOutcome::Success => "success",
            CallOutcome::Failure => "failure",
            CallOutcome::Timeout => "timeout",
            CallOutcome::Rejected => "rejected",
            CallOutcome::Ignored => "ignored",
        }
    }
}

/// Passive listener. Must not block: it runs inline on the call path.
pub trait BreakerObserver: Send + Sync {
    fn on_call(&self, breaker: &str, outcome: CallOutcome);

    fn on_transition(&self, _transition: &StateTransition) {}
}

#[derive(Debug, Clone, Serialize)]
pub struct CircuitBreakerStats {
    pub name: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    pub last_transition_at: DateTime<Utc>,
}

pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    /// Current state (0=Closed, 1=Open, 2=HalfOpen)
    state: AtomicU8,
    /// Consecutive failures while closed
    failure_count: AtomicU32,
    /// Consecutive successes while half-open
    success_count: AtomicU32,
    half_open_in_flight: AtomicU32,
    epoch: Instant,
    /// Milliseconds after `epoch` of the last transition
    last_transition_ms: AtomicU64,
    last_transition_unix_ms: AtomicI64,
    transitions: broadcast::Sender<StateTransition>,
    observers: Vec<Arc<dyn BreakerObserver>>,
}

/// Admission granted by the breaker; a half-open slot is held until drop
enum Admission<'a> {
    Closed,
    HalfOpen { _slot: HalfOpenSlot<'a> },
}

impl Admission<'_> {
    fn state(&self) -> CircuitState {
        match self {
            Admission::Closed => CircuitState::Closed,
            Admission::HalfOpen { .. } => CircuitState::HalfOpen,
        }
    }
}

struct HalfOpenSlot<'a> {
    in_flight: &'a AtomicU32,
}

impl Drop for HalfOpenSlot<'_> {
    fn drop(&mut self) {
        self.in_flight.fetch_sub(1, Ordering::AcqRel);
    }
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self::with_observers(name, config, Vec::new())
    }

    pub fn with_observers(
        name: impl Into<String>,
        config: CircuitBreakerConfig,
        observers: Vec<Arc<dyn BreakerObserver>>,
    ) -> Self {
        let (transitions, _) = broadcast::channel(64);
        Self {
            name: name.into(),
            config,
            state: AtomicU8::new(CircuitState::Closed as u8),
            failure_count: AtomicU32::new(0),
            success_count: AtomicU32::new(0),
            half_open_in_flight: AtomicU32::new(0),
            epoch: Instant::now(),
            last_transition_ms: AtomicU64::new(0),
            last_transition_unix_ms: AtomicI64::new(Utc::now().timestamp_millis()),
            transitions,
            observers,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    pub fn state(&self) -> CircuitState {
        CircuitState::from(self.state.load(Ordering::Acquire))
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StateTransition> {
        self.transitions.subscribe()
    }

    /// When an open circuit becomes eligible for probing
    pub fn open_deadline(&self) -> Option<Instant> {
        if self.state() != CircuitState::Open {
            return None;
        }
        let opened = Duration::from_millis(self.last_transition_ms.load(Ordering::Acquire));
        Some(self.epoch + opened + self.config.reset_timeout)
    }

    /// Move Open to HalfOpen once `reset_timeout` has elapsed. Returns true if
    /// this call performed the transition.
    pub fn try_half_open(&self) -> bool {
        match self.open_deadline() {
            Some(deadline) if Instant::now() >= deadline => {
                self.transition(CircuitState::Open, CircuitState::HalfOpen)
            }
            _ => false,
        }
    }

    /// Run `operation` through the breaker; every error counts as a failure
    pub async fn execute<F, Fut, T, E>(&self, operation: F) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.execute_classified(operation, |_| true).await
    }

    /// Like `execute`, but errors for which `should_count` returns false
    /// leave the counters untouched
    pub async fn execute_classified<F, Fut, T, E, C>(
        &self,
        operation: F,
        should_count: C,
    ) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        C: Fn(&E) -> bool,
    {
        let admission = self.admit()?;
        let admitted = admission.state();

        let result = tokio::time::timeout(self.config.timeout, operation()).await;
        let outcome = match &result {
            Ok(Ok(_)) => {
                self.on_success(admitted);
                CallOutcome::Success
            }
            Ok(Err(e)) if should_count(e) => {
                self.on_failure(admitted);
                CallOutcome::Failure
            }
            Ok(Err(_)) => CallOutcome::Ignored,
            Err(_) => {
                self.on_failure(admitted);
                CallOutcome::Timeout
            }
        };
        drop(admission);
        self.notify_call(outcome);

        match result {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(BreakerError::Inner(e)),
            Err(_) => Err(BreakerError::Timeout {
                name: self.name.clone(),
                timeout: self.config.timeout,
            }),
        }
    }

    fn admit<E>(&self) -> Result<Admission<'_>, BreakerError<E>> {
        self.try_half_open();

        match self.state() {
            CircuitState::Closed => return Ok(Admission::Closed),
            CircuitState::HalfOpen => {
                let max = self.config.half_open_max_probes;
                let reserved = self
                    .half_open_in_flight
                    .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                        (n < max).then_some(n + 1)
                    })
                    .is_ok();
                if reserved {
                    return Ok(Admission::HalfOpen {
                        _slot: HalfOpenSlot {
                            in_flight: &self.half_open_in_flight,
                        },
                    });
                }
            }
            CircuitState::Open => {}
        }

        self.notify_call(CallOutcome::Rejected);
        Err(BreakerError::CircuitOpen {
            name: self.name.clone(),
        })
    }

    fn on_success(&self, admitted: CircuitState) {
        if self.state() != admitted {
            return;
        }
        match admitted {
            CircuitState::Closed => {
                self.failure_count.store(0, Ordering::Release);
            }
            CircuitState::HalfOpen => {
                let successes = self.success_count.fetch_add(1, Ordering::AcqRel) + 1;
                if successes >= self.config.success_threshold
                    && self.transition(CircuitState::HalfOpen, CircuitState::Closed)
                {
                    tracing::info!(breaker = %self.name, "Circuit breaker closed after successful recovery");
                }
            }
            CircuitState::Open => {}
        }
    }

    fn on_failure(&self, admitted: CircuitState) {
        if self.state() != admitted {
            return;
        }
        match admitted {
            CircuitState::Closed => {
                let failures = self.failure_count.fetch_add(1, Ordering::AcqRel) + 1;
                if failures >= self.config.failure_threshold
                    && self.transition(CircuitState::Closed, CircuitState::Open)
                {
                    tracing::warn!(
                        breaker = %self.name,
                        failures = failures,
                        "Circuit breaker opened due to failures"
                    );
                }
            }
            CircuitState::HalfOpen => {
                if self.transition(CircuitState::HalfOpen, CircuitState::Open) {
                    tracing::warn!(breaker = %self.name, "Circuit breaker reopened after failure in half-open state");
                }
            }
            CircuitState::Open => {}
        }
    }

    /// Compare-and-swap between two states; only the winner emits
    fn transition(&self, from: CircuitState, to: CircuitState) -> bool {
        // open_deadline() must never pair the Open state with an older timestamp
        if to == CircuitState::Open {
            self.last_transition_ms
                .store(self.epoch.elapsed().as_millis() as u64, Ordering::Release);
        }

        if self
            .state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }

        match to {
            CircuitState::Closed => {
                self.failure_count.store(0, Ordering::Release);
                self.success_count.store(0, Ordering::Release);
            }
            CircuitState::Open | CircuitState::HalfOpen => {
                self.success_count.store(0, Ordering::Release);
            }
        }
        self.emit(from, to);
        true
    }

    fn emit(&self, from: CircuitState, to: CircuitState) {
        let timestamp = Utc::now();
        self.last_transition_ms
            .store(self.epoch.elapsed().as_millis() as u64, Ordering::Release);
        self.last_transition_unix_ms
            .store(timestamp.timestamp_millis(), Ordering::Release);

        let transition = StateTransition {
            name: self.name.clone(),
            from,
            to,
            timestamp,
        };

        tracing::debug!(
            breaker = %self.name,
            from = from.as_str(),
            to = to.as_str(),
            "Circuit breaker state transition"
        );

        for observer in &self.observers {
            observer.on_transition(&transition);
        }
        // No receivers is fine
        let _ = self.transitions.send(transition);
    }

    fn notify_call(&self, outcome: CallOutcome) {
        for observer in &self.observers {
            observer.on_call(&self.name, outcome);
        }
    }

    /// Force the circuit closed (operator action). An open circuit still
    /// passes through HalfOpen, so Open never moves straight to Closed.
    pub fn reset(&self) {
        let previous = self.state();
        loop {
            match self.state() {
                CircuitState::Closed => break,
                CircuitState::Open => {
                    self.transition(CircuitState::Open, CircuitState::HalfOpen);
                }
                CircuitState::HalfOpen => {
                    if self.transition(CircuitState::HalfOpen, CircuitState::Closed) {
                        tracing::info!(breaker = %self.name, from = previous.as_str(), "Circuit breaker manually reset");
                        break;
                    }
                }
            }
        }
        self.failure_count.store(0, Ordering::Release);
        self.success_count.store(0, Ordering::Release);
    }

    pub fn stats(&self) -> CircuitBreakerStats {
        let last_transition_at = Utc
            .timestamp_millis_opt(self.last_transition_unix_ms.load(Ordering::Acquire))
            .single()
            .unwrap_or_else(Utc::now);

        CircuitBreakerStats {
            name: self.name.clone(),
            state: self.state(),
            failure_count: self.failure_count.load(Ordering::Acquire),
            success_count: self.success_count.load(Ordering::Acquire),
            last_transition_at,
        }
    }
}

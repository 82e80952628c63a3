use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use serde::Serialize;

use super::breaker::{BreakerObserver, CallOutcome, StateTransition};
use crate::metrics::BreakerMetrics;

#[derive(Default)]
struct Counters {
    requests: AtomicU64,
    failures: AtomicU64,
    successes: AtomicU64,
    rejections: AtomicU64,
    state_changes: AtomicU64,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct BreakerCounters {
    pub name: String,
    pub requests: u64,
    pub failures: u64,
    pub successes: u64,
    pub rejections: u64,
    pub state_changes: u64,
}

/// Aggregates call outcomes and transitions per breaker and mirrors them to
/// Prometheus. Never influences the breakers it observes.
#[derive(Default)]
pub struct BreakerMetricsCollector {
    breakers: DashMap<String, Counters>,
}

impl BreakerMetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self, name: &str) -> Option<BreakerCounters> {
        self.breakers.get(name).map(|c| to_counters(name, &c))
    }

    pub fn all(&self) -> Vec<BreakerCounters> {
        let mut all: Vec<_> = self
            .breakers
            .iter()
            .map(|entry| to_counters(entry.key(), entry.value()))
            .collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }
}

fn to_counters(name: &str, c: &Counters) -> BreakerCounters {
    BreakerCounters {
        name: name.to_string(),
        requests: c.requests.load(Ordering::Relaxed),
        failures: c.failures.load(Ordering::Relaxed),
        successes: c.successes.load(Ordering::Relaxed),
        rejections: c.rejections.load(Ordering::Relaxed),
        state_changes: c.state_changes.load(Ordering::Relaxed),
    }
}

impl BreakerObserver for BreakerMetricsCollector {
    fn on_call(&self, breaker: &str, outcome: CallOutcome) {
        {
            let counters = self.breakers.entry(breaker.to_string()).or_default();
            counters.requests.fetch_add(1, Ordering::Relaxed);
            match outcome {
                CallOutcome::Success => {
                    counters.successes.fetch_add(1, Ordering::Relaxed);
                }
                CallOutcome::Failure | CallOutcome::Timeout => {
                    counters.failures.fetch_add(1, Ordering::Relaxed);
                }
                CallOutcome::Rejected => {
                    counters.rejections.fetch_add(1, Ordering::Relaxed);
                }
                CallOutcome::Ignored => {}
            }
        }
        BreakerMetrics::record_call(breaker, outcome.as_str());
    }

    fn on_transition(&self, transition: &StateTransition) {
        self.breakers
            .entry(transition.name.clone())
            .or_default()
            .state_changes
            .fetch_add(1, Ordering::Relaxed);
        BreakerMetrics::record_transition(
            &transition.name,
            transition.from.as_str(),
            transition.to.as_str(),
        );
        BreakerMetrics::set_state(&transition.name, transition.to as i64);
    }
}

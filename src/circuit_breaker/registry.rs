use std::sync::Arc;

use dashmap::DashMap;

use super::breaker::{BreakerObserver, CircuitBreaker, CircuitBreakerConfig, CircuitBreakerStats};

/// Owns one breaker per protected operation class
pub struct BreakerRegistry {
    breakers: DashMap<String, Arc<CircuitBreaker>>,
    config: CircuitBreakerConfig,
    observers: Vec<Arc<dyn BreakerObserver>>,
}

impl BreakerRegistry {
    pub fn new(config: CircuitBreakerConfig, observers: Vec<Arc<dyn BreakerObserver>>) -> Self {
        Self {
            breakers: DashMap::new(),
            config,
            observers,
        }
    }

    pub fn get_or_create(&self, name: &str) -> Arc<CircuitBreaker> {
        self.breakers
            .entry(name.to_string())
            .or_insert_with(|| {
                tracing::debug!(breaker = %name, "Creating circuit breaker");
                Arc::new(CircuitBreaker::with_observers(
                    name,
                    self.config.clone(),
                    self.observers.clone(),
                ))
            })
            .clone()
    }

    pub fn get(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.get(name).map(|b| Arc::clone(&b))
    }

    pub fn all(&self) -> Vec<Arc<CircuitBreaker>> {
        let mut all: Vec<_> = self.breakers.iter().map(|b| Arc::clone(&b)).collect();
        all.sort_by(|a, b| a.name().cmp(b.name()));
        all
    }

    pub fn stats(&self) -> Vec<CircuitBreakerStats> {
        self.all().iter().map(|b| b.stats()).collect()
    }

    /// Force a breaker closed. Returns false for unknown names.
    pub fn reset(&self, name: &str) -> bool {
        match self.get(name) {
            Some(breaker) => {
                breaker.reset();
                true
            }
            None => false,
        }
    }
}

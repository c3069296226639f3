//! Circuit breaker registry for managing multiple circuit breakers

use std::sync::Arc;

use dashmap::DashMap;

use super::breaker::CircuitBreaker;
use super::types::{CircuitBreakerConfig, CircuitBreakerStats};

/// Collection of circuit breakers, one per dependency name, created lazily
pub struct CircuitBreakerRegistry {
    breakers: DashMap<String, Arc<CircuitBreaker>>,
    default_config: CircuitBreakerConfig,
}

impl CircuitBreakerRegistry {
    /// Create a new registry with default config
    pub fn new() -> Self {
        Self::with_config(CircuitBreakerConfig::default())
    }

    /// Create a registry with custom default config
    pub fn with_config(config: CircuitBreakerConfig) -> Self {
        Self {
            breakers: DashMap::new(),
            default_config: config,
        }
    }

    /// Get or create a circuit breaker for a component
    pub fn get(&self, name: &str) -> Arc<CircuitBreaker> {
        self.get_with_config(name, self.default_config.clone())
    }

    /// Get or create with custom config
    pub fn get_with_config(&self, name: &str, config: CircuitBreakerConfig) -> Arc<CircuitBreaker> {
        self.breakers
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::with_config(name, config)))
            .clone()
    }

    /// Look up an existing breaker without creating one
    pub fn find(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.get(name).map(|entry| entry.value().clone())
    }

    /// Get all circuit breaker names, sorted
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.breakers.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Get stats for all circuit breakers, sorted by name
    pub fn all_stats(&self) -> Vec<(String, CircuitBreakerStats)> {
        let mut results: Vec<_> = self
            .breakers
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().stats()))
            .collect();
        results.sort_by(|a, b| a.0.cmp(&b.0));
        results
    }

    /// Force one breaker closed; false when no breaker has that name
    pub fn reset(&self, name: &str) -> bool {
        match self.find(name) {
            Some(breaker) => {
                breaker.reset();
                true
            }
            None => false,
        }
    }
}

impl Default for CircuitBreakerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

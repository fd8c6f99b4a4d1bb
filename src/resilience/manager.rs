//! # Circuit Breaker Manager
//!
//! Registry of circuit breakers keyed by dependency name. Each dependency gets
//! its own breaker and its own lock, so one failing dependency never trips or
//! slows another.

use crate::config::CircuitBreakerSettings;
use crate::resilience::{BreakerStats, CircuitBreaker, StateSummary, SystemBreakerStats};
use dashmap::DashMap;
use std::sync::Arc;
use tracing::{info, warn};

/// Manager for multiple circuit breakers across system components
#[derive(Debug)]
pub struct CircuitBreakerManager {
    /// Collection of circuit breakers by component name
    circuit_breakers: DashMap<String, Arc<CircuitBreaker>>,

    /// Configuration
    settings: CircuitBreakerSettings,
}

impl CircuitBreakerManager {
    pub fn new(settings: CircuitBreakerSettings) -> Self {
        info!(
            max_circuit_breakers = settings.max_circuit_breakers,
            configured_components = settings.component_configs.len(),
            "Initializing circuit breaker manager"
        );

        Self {
            circuit_breakers: DashMap::new(),
            settings,
        }
    }

    /// Get or create circuit breaker for a component
    ///
    /// Idempotent: every lookup of the same name returns the same instance.
    pub fn get_circuit_breaker(&self, component_name: &str) -> Arc<CircuitBreaker> {
        if let Some(breaker) = self.circuit_breakers.get(component_name) {
            return Arc::clone(breaker.value());
        }

        let current_count = self.circuit_breakers.len();
        let entry = self
            .circuit_breakers
            .entry(component_name.to_string())
            .or_insert_with(|| {
                if current_count >= self.settings.max_circuit_breakers {
                    warn!(
                        component = component_name,
                        current_count = current_count,
                        max_allowed = self.settings.max_circuit_breakers,
                        "Circuit breaker limit reached, creating anyway"
                    );
                }

                let component_config = self
                    .settings
                    .config_for_component(component_name)
                    .to_resilience_config();

                info!(
                    component = component_name,
                    failure_threshold = component_config.failure_threshold,
                    "Created new circuit breaker"
                );

                Arc::new(CircuitBreaker::new(
                    component_name.to_string(),
                    component_config,
                ))
            });

        Arc::clone(entry.value())
    }

    /// Look up an existing breaker without creating one
    pub fn get(&self, component_name: &str) -> Option<Arc<CircuitBreaker>> {
        self.circuit_breakers
            .get(component_name)
            .map(|breaker| Arc::clone(breaker.value()))
    }

    /// Get all circuit breaker names, sorted
    pub fn list_components(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .circuit_breakers
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        names.sort();
        names
    }

    pub fn component_stats(&self, component_name: &str) -> Option<BreakerStats> {
        self.get(component_name).map(|breaker| breaker.stats())
    }

    /// Get system-wide circuit breaker stats
    pub fn all_stats(&self) -> SystemBreakerStats {
        // Clone the handles first so no map shard is locked while breakers are read
        let breakers: Vec<Arc<CircuitBreaker>> = self
            .circuit_breakers
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();

        SystemBreakerStats::new(breakers.iter().map(|b| b.stats()).collect())
    }

    pub fn state_summary(&self) -> StateSummary {
        self.all_stats().state_summary()
    }

    pub fn system_health_score(&self) -> f64 {
        self.all_stats().health_score()
    }

    /// Force open all circuit breakers (emergency stop)
    pub fn force_open_all(&self) {
        warn!("Forcing all circuit breakers open (emergency stop)");
        for breaker in self.handles() {
            breaker.force_open();
        }
    }

    /// Force close all circuit breakers (emergency recovery)
    pub fn force_close_all(&self) {
        warn!("Forcing all circuit breakers closed (emergency recovery)");
        for breaker in self.handles() {
            breaker.force_closed();
        }
    }

    /// Remove circuit breaker for a component
    ///
    /// Callers still holding the old `Arc` keep using the removed instance.
    pub fn remove_circuit_breaker(&self, component_name: &str) -> bool {
        if self.circuit_breakers.remove(component_name).is_some() {
            info!(
                component = component_name,
                remaining_count = self.circuit_breakers.len(),
                "Removed circuit breaker"
            );
            true
        } else {
            false
        }
    }

    pub fn len(&self) -> usize {
        self.circuit_breakers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.circuit_breakers.is_empty()
    }

    pub fn settings(&self) -> &CircuitBreakerSettings {
        &self.settings
    }

    fn handles(&self) -> Vec<Arc<CircuitBreaker>> {
        self.circuit_breakers
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }
}

//! # Circuit Breaker Configuration
//!
//! Thresholds for a single breaker. For system-wide settings with per-component
//! overrides see `crate::config::CircuitBreakerSettings`.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration for a single circuit breaker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Number of consecutive failures before opening circuit
    pub failure_threshold: u32,

    /// Time since the last failure before an Open breaker lets a trial call through
    pub recovery_timeout: Duration,

    /// Consecutive successes in half-open state needed to close circuit
    pub success_threshold: u32,
}

impl CircuitBreakerConfig {
    /// Create configuration for the embedded database
    pub fn for_database() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(30),
            success_threshold: 2,
        }
    }

    /// Create configuration for external API calls such as payment processing
    pub fn for_external_api() -> Self {
        Self {
            failure_threshold: 3,
            recovery_timeout: Duration::from_secs(60),
            success_threshold: 3,
        }
    }

    /// Validate configuration parameters
    ///
    /// A zero recovery timeout is allowed: the breaker then half-opens on the
    /// first call after any time has passed.
    pub fn validate(&self) -> Result<(), String> {
        if self.failure_threshold == 0 {
            return Err("failure_threshold must be greater than 0".to_string());
        }

        if self.failure_threshold > 100 {
            return Err("failure_threshold should not exceed 100".to_string());
        }

        if self.recovery_timeout > Duration::from_secs(3600) {
            return Err("recovery_timeout should not exceed 3600 seconds".to_string());
        }

        if self.success_threshold == 0 {
            return Err("success_threshold must be greater than 0".to_string());
        }

        if self.success_threshold > 50 {
            return Err("success_threshold should not exceed 50".to_string());
        }

        Ok(())
    }
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(60),
            success_threshold: 3,
        }
    }
}

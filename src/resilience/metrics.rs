//! # Circuit Breaker Statistics
//!
//! Read-only snapshots of breaker state, safe to serialize for admin display
//! and consumed by the health loop.

use crate::resilience::CircuitState;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Snapshot of a single circuit breaker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BreakerStats {
    /// Dependency name the breaker guards
    pub name: String,

    /// Current circuit breaker state
    pub state: CircuitState,

    /// Consecutive failures in the current Closed period
    pub failure_count: u32,

    /// Consecutive successes in the current HalfOpen period
    pub success_count: u32,

    /// Wall-clock time of the most recent failure
    pub last_failure_time: Option<DateTime<Utc>>,

    /// Wall-clock time of the most recent state transition
    pub last_state_change: DateTime<Utc>,

    pub failure_threshold: u32,
    pub recovery_timeout: Duration,
    pub success_threshold: u32,

    /// Calls that executed the operation
    pub total_calls: u64,
    pub total_successes: u64,
    pub total_failures: u64,

    /// Calls short-circuited while Open
    pub total_rejections: u64,

    /// Number of times the breaker has opened
    pub times_opened: u64,

    /// Rolling average duration of successful calls
    pub average_response_time: Duration,
}

impl BreakerStats {
    /// Failure rate over executed calls (0.0 to 1.0)
    pub fn failure_rate(&self) -> f64 {
        if self.total_calls == 0 {
            return 0.0;
        }
        self.total_failures as f64 / self.total_calls as f64
    }

    /// Check if stats indicate healthy operation
    pub fn is_healthy(&self) -> bool {
        match self.state {
            CircuitState::Closed => self.total_calls < 10 || self.failure_rate() < 0.1,
            CircuitState::Open => false,
            CircuitState::HalfOpen => true,
        }
    }

    /// Human-readable state description
    pub fn state_description(&self) -> &'static str {
        match self.state {
            CircuitState::Closed => "Healthy - Normal operation",
            CircuitState::Open => "Failing - Rejecting all calls",
            CircuitState::HalfOpen => "Recovering - Testing dependency health",
        }
    }

    /// Format stats for logging
    pub fn format_summary(&self) -> String {
        format!(
            "{}: {} | Calls: {} | Failures: {} | Rejected: {} | Avg: {}ms",
            self.name,
            self.state_description(),
            self.total_calls,
            self.total_failures,
            self.total_rejections,
            self.average_response_time.as_millis()
        )
    }
}

/// Count of breakers per state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateSummary {
    pub closed: usize,
    pub open: usize,
    pub half_open: usize,
}

/// System-wide breaker snapshot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemBreakerStats {
    /// Individual breakers, sorted by name
    pub breakers: Vec<BreakerStats>,

    pub collected_at: DateTime<Utc>,
}

impl SystemBreakerStats {
    pub fn new(mut breakers: Vec<BreakerStats>) -> Self {
        breakers.sort_by(|a, b| a.name.cmp(&b.name));
        Self {
            breakers,
            collected_at: Utc::now(),
        }
    }

    pub fn state_summary(&self) -> StateSummary {
        let mut summary = StateSummary::default();
        for stats in &self.breakers {
            match stats.state {
                CircuitState::Closed => summary.closed += 1,
                CircuitState::Open => summary.open += 1,
                CircuitState::HalfOpen => summary.half_open += 1,
            }
        }
        summary
    }

    /// Breakers that are not healthy
    pub fn unhealthy_breakers(&self) -> Vec<&BreakerStats> {
        self.breakers.iter().filter(|s| !s.is_healthy()).collect()
    }

    /// Calculate system-wide health score (0.0 to 1.0)
    pub fn health_score(&self) -> f64 {
        if self.breakers.is_empty() {
            return 1.0;
        }

        let healthy_count = self.breakers.iter().filter(|s| s.is_healthy()).count();
        healthy_count as f64 / self.breakers.len() as f64
    }

    pub fn total_calls(&self) -> u64 {
        self.breakers.iter().map(|s| s.total_calls).sum()
    }

    pub fn total_failures(&self) -> u64 {
        self.breakers.iter().map(|s| s.total_failures).sum()
    }

    pub fn format_summary(&self) -> String {
        let summary = self.state_summary();
        format!(
            "Circuit Breakers: {} total | {} closed | {} open | {} half-open | Health: {:.1}%",
            self.breakers.len(),
            summary.closed,
            summary.open,
            summary.half_open,
            self.health_score() * 100.0
        )
    }
}

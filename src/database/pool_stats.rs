//! # Connection Pool Statistics
//!
//! Counters live inside the pool's state and are only mutated under the pool
//! lock. Readers get a [`PoolStats`] snapshot copied out under that same lock,
//! so every field in one snapshot describes the same instant.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Counters owned by the pool, guarded by the pool lock
#[derive(Debug, Default)]
pub(crate) struct PoolCounters {
    pub failed_connections: u64,
    pub total_queries: u64,
    pub total_acquisitions: u64,
    pub total_acquire_time: Duration,
    pub max_acquire_time: Duration,
    pub slow_acquires: u64,
    pub exhausted_count: u64,
    pub recycled_connections: u64,
    pub peak_active: usize,
}

impl PoolCounters {
    pub fn record_acquire(&mut self, duration: Duration, slow_threshold: Duration) {
        self.total_acquisitions += 1;
        self.total_acquire_time += duration;
        self.max_acquire_time = self.max_acquire_time.max(duration);
        if duration >= slow_threshold {
            self.slow_acquires += 1;
        }
    }

    pub fn average_acquire_time(&self) -> Duration {
        if self.total_acquisitions == 0 {
            return Duration::ZERO;
        }
        self.total_acquire_time
            .div_f64(self.total_acquisitions as f64)
    }
}

/// Point-in-time snapshot of pool statistics.
///
/// Plain DTO for serialization and display. Produced by `ConnectionPool::stats()`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PoolStats {
    /// Open connections, including ones still being created
    pub total_connections: usize,
    pub active_connections: usize,
    pub idle_connections: usize,
    pub overflow_connections: usize,

    /// Connection creation attempts that failed
    pub failed_connections: u64,

    /// Statements executed through the pool
    pub total_queries: u64,

    pub total_acquisitions: u64,
    pub average_acquire_time: Duration,
    pub max_acquire_time: Duration,
    pub slow_acquires: u64,

    /// Acquisitions refused because base and overflow slots were all taken
    pub exhausted_count: u64,

    /// Connections replaced for exceeding the recycle age
    pub recycled_connections: u64,

    pub peak_active: usize,

    /// `pool_size + max_overflow`
    pub max_connections: usize,

    pub closed: bool,
}

impl PoolStats {
    /// Share of the connection ceiling currently checked out (0.0 to 1.0)
    pub fn utilization(&self) -> f64 {
        if self.max_connections == 0 {
            return 0.0;
        }
        self.active_connections as f64 / self.max_connections as f64
    }
}

/// Anything that can report pool statistics; the health loop reads through this
pub trait PoolStatsSource: Send + Sync {
    fn pool_stats(&self) -> PoolStats;
}

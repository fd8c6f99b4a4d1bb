//! Host-level resource sampling for the health loop.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sysinfo::System;
use tracing::debug;

/// Load and memory snapshot. `None` means the platform didn't report it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HostMetrics {
    pub load_average_1m: Option<f64>,
    pub cpu_count: Option<usize>,
    pub memory_total_bytes: Option<u64>,
    pub memory_available_bytes: Option<u64>,
}

impl HostMetrics {
    /// One-minute load average divided by CPU count
    pub fn load_per_cpu(&self) -> Option<f64> {
        match (self.load_average_1m, self.cpu_count) {
            (Some(load), Some(cpus)) if cpus > 0 => Some(load / cpus as f64),
            _ => None,
        }
    }

    /// Used share of total memory (0.0 to 1.0)
    pub fn memory_utilization(&self) -> Option<f64> {
        match (self.memory_total_bytes, self.memory_available_bytes) {
            (Some(total), Some(available)) if total > 0 => {
                Some(total.saturating_sub(available) as f64 / total as f64)
            }
            _ => None,
        }
    }
}

pub trait HostMetricsSource: Send + Sync {
    fn collect(&self) -> HostMetrics;
}

/// Samples the running host through `sysinfo`
pub struct SystemHostMetrics {
    system: Mutex<System>,
}

impl SystemHostMetrics {
    pub fn new() -> Self {
        Self {
            system: Mutex::new(System::new()),
        }
    }
}

impl Default for SystemHostMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for SystemHostMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SystemHostMetrics").finish_non_exhaustive()
    }
}

impl HostMetricsSource for SystemHostMetrics {
    fn collect(&self) -> HostMetrics {
        if !sysinfo::IS_SUPPORTED_SYSTEM {
            return HostMetrics::default();
        }

        let (total, available) = {
            let mut system = self.system.lock();
            system.refresh_memory();
            (system.total_memory(), system.available_memory())
        };

        let load = System::load_average().one;
        let cpu_count = std::thread::available_parallelism()
            .ok()
            .map(|p| p.get());

        let metrics = HostMetrics {
            // Windows reports zeros rather than failing
            load_average_1m: (cfg!(unix)).then_some(load),
            cpu_count,
            memory_total_bytes: (total > 0).then_some(total),
            memory_available_bytes: (total > 0).then_some(available),
        };
        debug!(?metrics, "Sampled host metrics");
        metrics
    }
}

/// Returns the same snapshot every time; can be swapped at runtime
#[derive(Debug, Default)]
pub struct FixedHostMetrics {
    metrics: Mutex<HostMetrics>,
}

impl FixedHostMetrics {
    pub fn new(metrics: HostMetrics) -> Self {
        Self {
            metrics: Mutex::new(metrics),
        }
    }

    pub fn set(&self, metrics: HostMetrics) {
        *self.metrics.lock() = metrics;
    }
}

impl HostMetricsSource for FixedHostMetrics {
    fn collect(&self) -> HostMetrics {
        self.metrics.lock().clone()
    }
}

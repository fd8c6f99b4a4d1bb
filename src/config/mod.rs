//! # Riskwatch Core Configuration
//!
//! Every component in this crate is built from an explicit configuration
//! struct. Nothing reads environment variables on its own; the
//! [`ConfigManager`] is the single place where YAML files are loaded,
//! environment overrides are merged and values are validated.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use riskwatch_core::config::ConfigManager;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let manager = ConfigManager::load_from_file("config/riskwatch.yaml", "production")?;
//!
//! let pool_size = manager.config().pool.pool_size;
//! let workers = manager.config().task_processor.worker_count;
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod loader;

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

pub use error::{ConfigResult, ConfigurationError};
pub use loader::ConfigManager;

/// Root configuration structure mirroring riskwatch.yaml
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct RiskwatchConfig {
    /// Embedded store connection pooling
    pub pool: PoolConfig,

    /// Circuit breakers per named dependency
    pub circuit_breakers: CircuitBreakerSettings,

    /// Background task processing
    pub task_processor: TaskProcessorConfig,

    /// Error event aggregation
    pub error_aggregator: ErrorAggregatorConfig,

    /// Health polling and alert thresholds
    pub health: HealthConfig,

    /// Structured logging
    pub logging: LoggingConfig,
}

impl RiskwatchConfig {
    /// Validate every section. Only misconfiguration is allowed to abort startup.
    pub fn validate(&self) -> ConfigResult<()> {
        self.pool.validate()?;
        self.circuit_breakers.validate()?;
        self.task_processor.validate()?;
        self.error_aggregator.validate()?;
        self.health.validate()?;
        Ok(())
    }
}

/// Connection pool configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Connection string for the embedded store
    pub database_url: String,

    /// Number of base (recyclable) connections
    pub pool_size: usize,

    /// Extra connections allowed beyond `pool_size`; closed on release
    pub max_overflow: usize,

    /// Maximum connection age before it is replaced instead of reused
    pub recycle_time_ms: u64,

    /// Interval between background maintenance passes
    pub maintenance_interval_ms: u64,

    /// Connections opened eagerly by `warm_up`
    pub min_idle: usize,

    /// Check idle connections with `is_valid` before handing them out
    pub validate_on_checkout: bool,

    /// Acquisitions slower than this are counted as slow
    pub slow_acquire_threshold_ms: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite::memory:".to_string(),
            pool_size: 10,
            max_overflow: 20,
            recycle_time_ms: 3_600_000,
            maintenance_interval_ms: 300_000,
            min_idle: 2,
            validate_on_checkout: false,
            slow_acquire_threshold_ms: 100,
        }
    }
}

impl PoolConfig {
    pub fn recycle_time(&self) -> Duration {
        Duration::from_millis(self.recycle_time_ms)
    }

    pub fn maintenance_interval(&self) -> Duration {
        Duration::from_millis(self.maintenance_interval_ms)
    }

    /// Upper bound on simultaneously open connections
    pub fn max_connections(&self) -> usize {
        self.pool_size + self.max_overflow
    }

    pub fn validate(&self) -> ConfigResult<()> {
        if self.pool_size == 0 {
            return Err(ConfigurationError::invalid_value(
                "pool.pool_size",
                self.pool_size,
                "must be greater than 0",
            ));
        }
        if self.min_idle > self.pool_size {
            return Err(ConfigurationError::invalid_value(
                "pool.min_idle",
                self.min_idle,
                "must not exceed pool_size",
            ));
        }
        if self.maintenance_interval_ms == 0 {
            return Err(ConfigurationError::invalid_value(
                "pool.maintenance_interval_ms",
                self.maintenance_interval_ms,
                "must be greater than 0",
            ));
        }
        if self.database_url.trim().is_empty() {
            return Err(ConfigurationError::invalid_value(
                "pool.database_url",
                "",
                "must not be empty",
            ));
        }
        Ok(())
    }
}

/// Thresholds for a single named breaker
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct CircuitBreakerComponentConfig {
    pub failure_threshold: u32,
    pub recovery_timeout_ms: u64,
    pub success_threshold: u32,
}

impl Default for CircuitBreakerComponentConfig {
    fn default() -> Self {
        Self::from(&crate::resilience::CircuitBreakerConfig::default())
    }
}

impl From<&crate::resilience::CircuitBreakerConfig> for CircuitBreakerComponentConfig {
    fn from(config: &crate::resilience::CircuitBreakerConfig) -> Self {
        Self {
            failure_threshold: config.failure_threshold,
            recovery_timeout_ms: config.recovery_timeout.as_millis() as u64,
            success_threshold: config.success_threshold,
        }
    }
}

impl CircuitBreakerComponentConfig {
    /// Convert to the resilience module's format
    pub fn to_resilience_config(&self) -> crate::resilience::CircuitBreakerConfig {
        crate::resilience::CircuitBreakerConfig {
            failure_threshold: self.failure_threshold,
            recovery_timeout: Duration::from_millis(self.recovery_timeout_ms),
            success_threshold: self.success_threshold,
        }
    }
}

/// Circuit breaker configuration with per-component overrides
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CircuitBreakerSettings {
    /// Breakers created by the manager before a warning is logged
    pub max_circuit_breakers: usize,

    /// Configuration for components without an explicit entry
    pub default_config: CircuitBreakerComponentConfig,

    /// Specific configurations for named components
    pub component_configs: HashMap<String, CircuitBreakerComponentConfig>,
}

impl Default for CircuitBreakerSettings {
    fn default() -> Self {
        use crate::resilience::CircuitBreakerConfig;

        let component_configs = HashMap::from([
            (
                "database".to_string(),
                CircuitBreakerComponentConfig::from(&CircuitBreakerConfig::for_database()),
            ),
            (
                "payment_processing".to_string(),
                CircuitBreakerComponentConfig::from(&CircuitBreakerConfig::for_external_api()),
            ),
        ]);

        Self {
            max_circuit_breakers: 50,
            default_config: CircuitBreakerComponentConfig::default(),
            component_configs,
        }
    }
}

impl CircuitBreakerSettings {
    /// Get configuration for a specific component
    pub fn config_for_component(&self, component_name: &str) -> CircuitBreakerComponentConfig {
        self.component_configs
            .get(component_name)
            .cloned()
            .unwrap_or_else(|| self.default_config.clone())
    }

    pub fn validate(&self) -> ConfigResult<()> {
        self.default_config
            .to_resilience_config()
            .validate()
            .map_err(|error| ConfigurationError::ValidationError {
                error: format!("circuit_breakers.default_config: {error}"),
            })?;

        for (name, component) in &self.component_configs {
            component
                .to_resilience_config()
                .validate()
                .map_err(|error| ConfigurationError::ValidationError {
                    error: format!("circuit_breakers.component_configs.{name}: {error}"),
                })?;
        }

        Ok(())
    }
}

/// Exponential retry delay, applied through the scheduler
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct RetryBackoffConfig {
    pub base_delay_ms: u64,
    pub multiplier: f64,
    pub max_delay_ms: u64,
}

impl Default for RetryBackoffConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 1_000,
            multiplier: 2.0,
            max_delay_ms: 60_000,
        }
    }
}

impl RetryBackoffConfig {
    /// Longest delay a retry may be parked for (one day)
    pub const MAX_DELAY_LIMIT_MS: u64 = 86_400_000;

    /// Delay before the given retry (1-based)
    pub fn delay_for_retry(&self, retry_count: u32) -> Duration {
        let exponent = retry_count.saturating_sub(1) as i32;
        let delay_ms = self.base_delay_ms as f64 * self.multiplier.powi(exponent);
        let capped = delay_ms.min(self.max_delay_ms as f64).max(0.0);
        Duration::from_millis(capped as u64)
    }
}

/// Background task processor configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TaskProcessorConfig {
    /// Fixed number of tasks executing concurrently
    pub worker_count: usize,

    /// Maximum pending tasks in the priority queue
    pub queue_size: usize,

    /// Maximum tasks dispatched per scheduling pass
    pub batch_size: usize,

    /// How often the scheduler promotes delayed tasks
    pub scheduler_interval_ms: u64,

    /// Idle wake-up interval for the dispatcher
    pub dispatch_poll_interval_ms: u64,

    /// Retries granted to tasks that don't set their own
    pub default_max_retries: u32,

    /// Per-task execution timeout
    pub task_timeout_ms: u64,

    /// Completed task records kept for inspection
    pub completed_history_limit: usize,

    /// Delay retries through the scheduler instead of resubmitting immediately
    pub retry_backoff: Option<RetryBackoffConfig>,

    /// Time allowed for in-flight tasks during shutdown
    pub shutdown_timeout_ms: u64,
}

impl Default for TaskProcessorConfig {
    fn default() -> Self {
        Self {
            worker_count: 4,
            queue_size: 1000,
            batch_size: 10,
            scheduler_interval_ms: 1_000,
            dispatch_poll_interval_ms: 100,
            default_max_retries: 3,
            task_timeout_ms: 300_000,
            completed_history_limit: 1000,
            retry_backoff: None,
            shutdown_timeout_ms: 30_000,
        }
    }
}

impl TaskProcessorConfig {
    pub fn task_timeout(&self) -> Duration {
        Duration::from_millis(self.task_timeout_ms)
    }

    pub fn scheduler_interval(&self) -> Duration {
        Duration::from_millis(self.scheduler_interval_ms)
    }

    pub fn dispatch_poll_interval(&self) -> Duration {
        Duration::from_millis(self.dispatch_poll_interval_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    pub fn validate(&self) -> ConfigResult<()> {
        if self.worker_count == 0 {
            return Err(ConfigurationError::invalid_value(
                "task_processor.worker_count",
                self.worker_count,
                "must be greater than 0",
            ));
        }
        if self.queue_size == 0 {
            return Err(ConfigurationError::invalid_value(
                "task_processor.queue_size",
                self.queue_size,
                "must be greater than 0",
            ));
        }
        if self.batch_size == 0 {
            return Err(ConfigurationError::invalid_value(
                "task_processor.batch_size",
                self.batch_size,
                "must be greater than 0",
            ));
        }
        if self.scheduler_interval_ms == 0 || self.dispatch_poll_interval_ms == 0 {
            return Err(ConfigurationError::ValidationError {
                error: "task_processor polling intervals must be greater than 0".to_string(),
            });
        }
        if self.task_timeout_ms == 0 {
            return Err(ConfigurationError::invalid_value(
                "task_processor.task_timeout_ms",
                self.task_timeout_ms,
                "must be greater than 0",
            ));
        }
        if let Some(backoff) = &self.retry_backoff {
            if backoff.multiplier < 1.0 {
                return Err(ConfigurationError::invalid_value(
                    "task_processor.retry_backoff.multiplier",
                    backoff.multiplier,
                    "must be at least 1.0",
                ));
            }
            if backoff.max_delay_ms > RetryBackoffConfig::MAX_DELAY_LIMIT_MS {
                return Err(ConfigurationError::invalid_value(
                    "task_processor.retry_backoff.max_delay_ms",
                    backoff.max_delay_ms,
                    "must not exceed one day (86400000 ms)",
                ));
            }
            if backoff.base_delay_ms > backoff.max_delay_ms {
                return Err(ConfigurationError::invalid_value(
                    "task_processor.retry_backoff.base_delay_ms",
                    backoff.base_delay_ms,
                    "must not exceed max_delay_ms",
                ));
            }
        }
        Ok(())
    }
}

/// Error aggregation configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ErrorAggregatorConfig {
    /// Events kept in the in-memory ring
    pub window_size: usize,

    /// Age after which events are pruned from memory and the store
    pub retention_seconds: u64,

    /// Window used for the per-minute error rate
    pub rate_window_seconds: u64,

    /// Interval of the background pruning pass
    pub prune_interval_seconds: u64,

    /// Count events against an already registered breaker of the same service
    pub feed_circuit_breakers: bool,
}

impl Default for ErrorAggregatorConfig {
    fn default() -> Self {
        Self {
            window_size: 1000,
            retention_seconds: 7 * 24 * 3600,
            rate_window_seconds: 300,
            prune_interval_seconds: 3600,
            feed_circuit_breakers: true,
        }
    }
}

impl ErrorAggregatorConfig {
    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_seconds)
    }

    pub fn rate_window(&self) -> Duration {
        Duration::from_secs(self.rate_window_seconds)
    }

    pub fn prune_interval(&self) -> Duration {
        Duration::from_secs(self.prune_interval_seconds)
    }

    pub fn validate(&self) -> ConfigResult<()> {
        if self.window_size == 0 {
            return Err(ConfigurationError::invalid_value(
                "error_aggregator.window_size",
                self.window_size,
                "must be greater than 0",
            ));
        }
        if self.rate_window_seconds == 0 || self.prune_interval_seconds == 0 {
            return Err(ConfigurationError::ValidationError {
                error: "error_aggregator windows must be greater than 0".to_string(),
            });
        }
        Ok(())
    }
}

/// Health polling and alert thresholds
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct HealthConfig {
    pub check_interval_ms: u64,

    /// Active / (pool_size + max_overflow) above which the pool is degraded
    pub pool_utilization_threshold: f64,

    /// New connection-creation failures per check before alerting
    pub pool_creation_failure_threshold: u64,

    /// Errors per minute before alerting
    pub error_rate_per_minute_threshold: f64,

    /// Critical events inside the rate window before alerting
    pub critical_error_threshold: u64,

    /// Queued / queue_size above which the task processor is degraded
    pub task_queue_utilization_threshold: f64,

    /// One-minute load average per CPU before alerting
    pub load_per_cpu_threshold: f64,

    /// Used / total memory before alerting
    pub memory_utilization_threshold: f64,

    /// Resolved alerts kept for inspection
    pub resolved_alert_history: usize,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            check_interval_ms: 30_000,
            pool_utilization_threshold: 0.9,
            pool_creation_failure_threshold: 3,
            error_rate_per_minute_threshold: 10.0,
            critical_error_threshold: 1,
            task_queue_utilization_threshold: 0.9,
            load_per_cpu_threshold: 2.0,
            memory_utilization_threshold: 0.9,
            resolved_alert_history: 100,
        }
    }
}

impl HealthConfig {
    pub fn check_interval(&self) -> Duration {
        Duration::from_millis(self.check_interval_ms)
    }

    pub fn validate(&self) -> ConfigResult<()> {
        if self.check_interval_ms == 0 {
            return Err(ConfigurationError::invalid_value(
                "health.check_interval_ms",
                self.check_interval_ms,
                "must be greater than 0",
            ));
        }

        let ratios = [
            ("health.pool_utilization_threshold", self.pool_utilization_threshold),
            (
                "health.task_queue_utilization_threshold",
                self.task_queue_utilization_threshold,
            ),
            (
                "health.memory_utilization_threshold",
                self.memory_utilization_threshold,
            ),
        ];
        for (field, value) in ratios {
            if !(value > 0.0 && value <= 1.0) {
                return Err(ConfigurationError::invalid_value(
                    field,
                    value,
                    "must be within (0, 1]",
                ));
            }
        }
        Ok(())
    }
}

/// Logging output configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Explicit filter directive; defaults from the environment name
    pub level: Option<String>,

    /// When set, JSON logs are also written to a file in this directory
    pub log_directory: Option<PathBuf>,
}

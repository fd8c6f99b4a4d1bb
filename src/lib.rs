#![allow(clippy::doc_markdown)] // Allow technical terms like SQLite, SQLx in docs
#![allow(clippy::missing_errors_doc)] // Allow public functions without # Errors sections
#![allow(clippy::must_use_candidate)] // Allow methods without must_use when context is clear

//! # Riskwatch Core
//!
//! Resilience and concurrency core for the Riskwatch compliance and
//! risk-monitoring backend.
//!
//! ## Overview
//!
//! Request-handling code borrows database connections from a bounded pool,
//! wraps calls to external dependencies in per-dependency circuit breakers, and
//! hands background work to a prioritized task processor. An error aggregator
//! and a health loop observe all of it from outside the request path.
//!
//! ## Module Organization
//!
//! - [`database`] - bounded connection pool with overflow, recycling and stats
//! - [`resilience`] - circuit breakers and their manager
//! - [`execution`] - priority task queue, scheduler, workers and retries
//! - [`monitoring`] - error aggregation, host metrics and the health loop
//! - [`system_context`] - one-call wiring and lifecycle for all of the above
//! - [`config`] - YAML configuration with environment overrides
//! - [`error`] - structured error handling
//! - [`logging`] / [`metrics`] - tracing setup and OpenTelemetry instruments
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use riskwatch_core::config::ConfigManager;
//! use riskwatch_core::execution::{AsyncTask, TaskExecutionError};
//! use riskwatch_core::system_context::SystemContext;
//! use serde_json::Value;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = ConfigManager::load_from_file("config/riskwatch.yaml", "production")?;
//! let context = SystemContext::new(config)?;
//! context.start().await?;
//!
//! let breaker = context.circuit_breaker_manager.get_circuit_breaker("sanctions_api");
//! let _ = breaker
//!     .call(|| async { Ok::<_, std::io::Error>("screened") })
//!     .await;
//!
//! let task = AsyncTask::from_fn("refresh_watchlist", |_args: Value| async {
//!     Ok::<_, TaskExecutionError>(Value::Null)
//! });
//! let _ = context.task_processor.submit(task);
//!
//! println!("status: {}", context.health_report().status);
//! context.shutdown().await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod database;
pub mod error;
pub mod execution;
pub mod lifecycle;
pub mod logging;
pub mod metrics;
pub mod monitoring;
pub mod resilience;
pub mod system_context;

pub use config::{ConfigManager, RiskwatchConfig};
pub use database::{ConnectionPool, PoolStats, PoolUnavailable, PooledConnection};
pub use error::{RiskwatchError, RiskwatchResult};
pub use execution::{AsyncTask, TaskProcessor, TaskProcessorStats, TaskRejected, TaskStatus};
pub use lifecycle::ShutdownSignal;
pub use monitoring::{ErrorAggregator, ErrorEvent, ErrorSeverity, HealthMonitor, HealthReport, HealthStatus};
pub use resilience::{CircuitBreaker, CircuitBreakerError, CircuitBreakerManager, CircuitState};
pub use system_context::SystemContext;

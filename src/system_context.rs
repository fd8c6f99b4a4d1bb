//! # System Context
//!
//! Single bootstrap path that wires the pool, breakers, task processor, error
//! aggregator and health monitor from one configuration, and owns the shared
//! shutdown signal for their background loops.

use crate::config::{ConfigManager, RiskwatchConfig};
use crate::database::{ConnectionPool, SqliteConnectionManager, SqliteConnectionPool};
use crate::error::{RiskwatchError, RiskwatchResult};
use crate::execution::TaskProcessor;
use crate::lifecycle::ShutdownSignal;
use crate::monitoring::{
    ErrorAggregator, HealthMonitor, HealthReport, HostMetricsSource, SqliteErrorEventStore,
    SystemHostMetrics,
};
use crate::resilience::CircuitBreakerManager;
use futures::future::join_all;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

pub struct SystemContext {
    config_manager: Arc<ConfigManager>,

    /// Pool over the embedded store; also backs the error event table
    pub database_pool: SqliteConnectionPool,

    pub circuit_breaker_manager: Arc<CircuitBreakerManager>,
    pub task_processor: TaskProcessor,
    pub error_aggregator: Arc<ErrorAggregator>,
    pub health_monitor: Arc<HealthMonitor>,

    shutdown: Arc<ShutdownSignal>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
}

impl std::fmt::Debug for SystemContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SystemContext")
            .field("environment", &self.config_manager.environment())
            .field("database_pool", &self.database_pool)
            .field("task_processor", &self.task_processor)
            .field("started", &self.started.load(Ordering::Acquire))
            .finish()
    }
}

impl SystemContext {
    /// Build every component from the loaded configuration
    pub fn new(config_manager: Arc<ConfigManager>) -> RiskwatchResult<Self> {
        Self::with_host_metrics(config_manager, Arc::new(SystemHostMetrics::new()))
    }

    /// Wrap an in-memory configuration and build from it
    pub fn from_config(config: RiskwatchConfig, environment: &str) -> RiskwatchResult<Self> {
        Self::new(ConfigManager::from_config(config, environment)?)
    }

    /// Build with an explicit host metrics source
    pub fn with_host_metrics(
        config_manager: Arc<ConfigManager>,
        host_metrics: Arc<dyn HostMetricsSource>,
    ) -> RiskwatchResult<Self> {
        let config = config_manager.config();
        config.validate()?;

        info!(
            environment = config_manager.environment(),
            "Initializing system context"
        );

        // Every new connection gets the event table, including private in-memory databases
        let manager = SqliteConnectionManager::new(config.pool.database_url.clone())
            .with_init_statement(SqliteErrorEventStore::SCHEMA);
        let database_pool = ConnectionPool::new("riskwatch", manager, config.pool.clone())?;

        let circuit_breaker_manager =
            Arc::new(CircuitBreakerManager::new(config.circuit_breakers.clone()));

        let task_processor = TaskProcessor::new(config.task_processor.clone())?;

        let store = Arc::new(SqliteErrorEventStore::new(database_pool.clone()));
        let mut error_aggregator = ErrorAggregator::new(config.error_aggregator.clone(), store);
        if config.error_aggregator.feed_circuit_breakers {
            error_aggregator = error_aggregator.with_circuit_breakers(circuit_breaker_manager.clone());
        }
        let error_aggregator = Arc::new(error_aggregator);

        let health_monitor = Arc::new(
            HealthMonitor::new(config.health.clone())
                .with_pool(Arc::new(database_pool.clone()))
                .with_breakers(circuit_breaker_manager.clone())
                .with_tasks(Arc::new(task_processor.clone()))
                .with_errors(error_aggregator.clone())
                .with_host_metrics(host_metrics),
        );

        Ok(Self {
            config_manager,
            database_pool,
            circuit_breaker_manager,
            task_processor,
            error_aggregator,
            health_monitor,
            shutdown: ShutdownSignal::new(),
            handles: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &RiskwatchConfig {
        self.config_manager.config()
    }

    pub fn config_manager(&self) -> &Arc<ConfigManager> {
        &self.config_manager
    }

    /// Warm the pool, then spawn maintenance, dispatcher, scheduler, health and prune loops
    pub async fn start(&self) -> RiskwatchResult<()> {
        if self.shutdown.is_triggered() {
            return Err(RiskwatchError::InvalidState(
                "System context has been shut down".to_string(),
            ));
        }
        if self.started.swap(true, Ordering::AcqRel) {
            return Err(RiskwatchError::InvalidState(
                "System context is already running".to_string(),
            ));
        }

        let warmed = match self.database_pool.warm_up().await {
            Ok(warmed) => warmed,
            Err(e) => {
                // Nothing was spawned yet, so a later start may try again
                self.started.store(false, Ordering::Release);
                return Err(e.into());
            }
        };
        self.task_processor.start()?;

        let handles = [
            tokio::spawn(
                self.database_pool
                    .clone()
                    .run_maintenance_loop(self.shutdown.clone()),
            ),
            tokio::spawn(
                self.health_monitor
                    .clone()
                    .run_health_loop(self.shutdown.clone()),
            ),
            tokio::spawn(
                self.error_aggregator
                    .clone()
                    .run_prune_loop(self.shutdown.clone()),
            ),
        ];
        self.handles.lock().extend(handles);

        info!(warmed_connections = warmed, "System context started");
        Ok(())
    }

    /// Evaluate health now rather than waiting for the next loop tick
    pub fn health_report(&self) -> HealthReport {
        self.health_monitor.evaluate()
    }

    pub fn is_running(&self) -> bool {
        self.started.load(Ordering::Acquire) && !self.shutdown.is_triggered()
    }

    /// Stop intake, stop every loop, wait for in-flight tasks, then close the pool
    ///
    /// The pool is closed even when tasks outlive the processor's shutdown timeout;
    /// that timeout is reported as the error.
    pub async fn shutdown(&self) -> RiskwatchResult<()> {
        if self.shutdown.is_triggered() {
            return Ok(());
        }
        info!("System context shutting down");
        self.shutdown.trigger();

        let processor_result = self
            .task_processor
            .shutdown(self.config().task_processor.shutdown_timeout())
            .await;

        let handles: Vec<JoinHandle<()>> = self.handles.lock().drain(..).collect();
        for (index, result) in join_all(handles).await.into_iter().enumerate() {
            if let Err(e) = result {
                warn!(loop_index = index, error = %e, "Background loop ended abnormally");
            }
        }

        self.database_pool.close_all().await;
        info!("System context stopped");
        processor_result
    }
}

//! Shared fixtures for integration tests
#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use riskwatch_core::config::{PoolConfig, RiskwatchConfig, TaskProcessorConfig};
use riskwatch_core::database::{ConnectionManager, ConnectionPool};
use riskwatch_core::execution::{AsyncTask, TaskExecutionError};
use riskwatch_core::{RiskwatchError, RiskwatchResult};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

pub fn init_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("riskwatch_core=debug")
        .with_test_writer()
        .try_init();
}

/// In-process connection manager that hands out numbered handles
#[derive(Debug, Default)]
pub struct CountingManager {
    next_serial: AtomicU64,
    pub fail_create: AtomicBool,
    pub closed: AtomicU64,
}

#[derive(Debug)]
pub struct CountingConnection {
    pub serial: u64,
}

#[async_trait]
impl ConnectionManager for CountingManager {
    type Connection = CountingConnection;

    async fn create(&self) -> RiskwatchResult<CountingConnection> {
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(RiskwatchError::DatabaseError("store offline".to_string()));
        }
        Ok(CountingConnection {
            serial: self.next_serial.fetch_add(1, Ordering::SeqCst),
        })
    }

    async fn is_valid(&self, _conn: &mut CountingConnection) -> bool {
        true
    }

    async fn close(&self, _conn: CountingConnection) {
        self.closed.fetch_add(1, Ordering::SeqCst);
    }

    async fn execute(&self, _conn: &mut CountingConnection, _sql: &str) -> RiskwatchResult<u64> {
        Ok(0)
    }
}

pub fn pool_config(pool_size: usize, max_overflow: usize) -> PoolConfig {
    PoolConfig {
        pool_size,
        max_overflow,
        min_idle: 0,
        ..Default::default()
    }
}

pub fn counting_pool(pool_size: usize, max_overflow: usize) -> ConnectionPool<CountingManager> {
    ConnectionPool::new(
        "test",
        CountingManager::default(),
        pool_config(pool_size, max_overflow),
    )
    .expect("valid pool config")
}

pub fn processor_config(worker_count: usize, queue_size: usize) -> TaskProcessorConfig {
    TaskProcessorConfig {
        worker_count,
        queue_size,
        batch_size: worker_count,
        dispatch_poll_interval_ms: 5,
        scheduler_interval_ms: 10,
        task_timeout_ms: 2_000,
        ..Default::default()
    }
}

/// Task that appends `label` to `log` when it runs
pub fn logging_task(label: &str, priority: i32, log: Arc<Mutex<Vec<String>>>) -> AsyncTask {
    let label_owned = label.to_string();
    AsyncTask::from_fn(label, move |_args: Value| {
        let log = Arc::clone(&log);
        let label = label_owned.clone();
        async move {
            log.lock().push(label);
            Ok::<_, TaskExecutionError>(json!("done"))
        }
    })
    .with_priority(priority)
}

/// File-backed database so every pooled connection sees the same tables
pub fn temp_database_url(dir: &TempDir) -> String {
    format!(
        "sqlite://{}?mode=rwc",
        dir.path().join("riskwatch.db").display()
    )
}

pub fn context_config(dir: &TempDir) -> RiskwatchConfig {
    let mut config = RiskwatchConfig::default();
    config.pool.database_url = temp_database_url(dir);
    config.pool.pool_size = 3;
    config.pool.max_overflow = 1;
    config.pool.min_idle = 1;
    config.task_processor = processor_config(2, 16);
    config.task_processor.shutdown_timeout_ms = 2_000;
    config.health.check_interval_ms = 50;
    config
}

pub async fn eventually<F>(timeout: Duration, mut condition: F)
where
    F: FnMut() -> bool,
{
    tokio::time::timeout(timeout, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

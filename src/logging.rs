//! # Structured Logging Module
//!
//! Environment-aware structured logging with console output and optional JSON
//! file output, plus helpers that keep the fields of recurring log lines
//! consistent across components.

use crate::config::LoggingConfig;
use chrono::Utc;
use std::process;
use std::sync::OnceLock;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

static LOGGER_INITIALIZED: OnceLock<Option<WorkerGuard>> = OnceLock::new();

/// Initialize structured logging for the given environment
///
/// Safe to call more than once; only the first call installs a subscriber, and
/// an already-installed global subscriber is left in place.
pub fn init_structured_logging(config: &LoggingConfig, environment: &str) {
    LOGGER_INITIALIZED.get_or_init(|| {
        let log_level = config
            .level
            .clone()
            .unwrap_or_else(|| get_log_level(environment).to_string());

        let console_layer = fmt::layer()
            .with_target(true)
            .with_thread_ids(true)
            .with_level(true)
            .with_ansi(true)
            .with_filter(EnvFilter::new(log_level.clone()));

        let (file_layer, guard, log_file) = match &config.log_directory {
            Some(log_dir) => {
                if let Err(e) = std::fs::create_dir_all(log_dir) {
                    eprintln!(
                        "Failed to create log directory {}: {e}; file logging disabled",
                        log_dir.display()
                    );
                    (None, None, None)
                } else {
                    let file_name = log_file_name(environment);
                    let file_appender = tracing_appender::rolling::never(log_dir, &file_name);
                    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);
                    let layer = fmt::layer()
                        .with_writer(file_writer)
                        .with_target(true)
                        .with_thread_ids(true)
                        .with_level(true)
                        .with_ansi(false)
                        .json()
                        .with_filter(EnvFilter::new(log_level.clone()));
                    (
                        Some(layer),
                        Some(guard),
                        Some(log_dir.join(file_name).display().to_string()),
                    )
                }
            }
            None => (None, None, None),
        };

        let subscriber = tracing_subscriber::registry()
            .with(console_layer)
            .with(file_layer);

        if subscriber.try_init().is_err() {
            tracing::debug!("Global tracing subscriber already initialized - continuing with existing subscriber");
        }

        tracing::info!(
            pid = process::id(),
            environment = %environment,
            log_level = %log_level,
            log_file = log_file.as_deref(),
            "Structured logging initialized"
        );

        guard
    });
}

fn log_file_name(environment: &str) -> String {
    format!(
        "{}.{}.{}.log",
        environment,
        process::id(),
        Utc::now().format("%Y%m%d_%H%M%S")
    )
}

/// Log level based on environment
fn get_log_level(environment: &str) -> &'static str {
    match environment {
        "production" => "info",
        _ => "debug",
    }
}

/// Log structured data for connection pool operations
pub fn log_pool_operation(operation: &str, active: usize, idle: usize, details: Option<&str>) {
    tracing::debug!(
        operation = %operation,
        active = active,
        idle = idle,
        details = details,
        timestamp = %Utc::now().to_rfc3339(),
        "POOL_OPERATION"
    );
}

/// Log a circuit breaker state transition
pub fn log_breaker_transition(component: &str, from: &str, to: &str, reason: &str) {
    tracing::info!(
        component = %component,
        from = %from,
        to = %to,
        reason = %reason,
        timestamp = %Utc::now().to_rfc3339(),
        "BREAKER_TRANSITION"
    );
}

/// Log structured data for task operations
pub fn log_task_operation(
    operation: &str,
    task_id: &str,
    task_name: &str,
    priority: i32,
    status: &str,
    details: Option<&str>,
) {
    tracing::info!(
        operation = %operation,
        task_id = %task_id,
        task_name = %task_name,
        priority = priority,
        status = %status,
        details = details,
        timestamp = %Utc::now().to_rfc3339(),
        "TASK_OPERATION"
    );
}

/// Log error with full context
pub fn log_error(component: &str, operation: &str, error: &str, context: Option<&str>) {
    tracing::error!(
        component = %component,
        operation = %operation,
        error = %error,
        context = context,
        timestamp = %Utc::now().to_rfc3339(),
        "ERROR"
    );
}

//! # Resilience Metrics
//!
//! OpenTelemetry instruments for the pool, circuit breakers, task processor and
//! health loop. Without an installed meter provider every instrument is a no-op,
//! so components record unconditionally.
//!
//! ```rust
//! use riskwatch_core::metrics::*;
//! use opentelemetry::KeyValue;
//!
//! pool_acquisitions_total().add(1, &[]);
//! breaker_transitions_total().add(1, &[KeyValue::new("component", "database")]);
//! ```

use opentelemetry::metrics::{Counter, Histogram, Meter};
use std::sync::OnceLock;

static RISKWATCH_METER: OnceLock<Meter> = OnceLock::new();

fn meter() -> &'static Meter {
    RISKWATCH_METER.get_or_init(|| opentelemetry::global::meter("riskwatch-core"))
}

// ============================================================================
// Connection pool
// ============================================================================

/// Successful connection checkouts
pub fn pool_acquisitions_total() -> Counter<u64> {
    meter()
        .u64_counter("riskwatch.pool.acquisitions.total")
        .with_description("Total successful connection acquisitions")
        .build()
}

/// Checkouts refused because the pool was exhausted, closed or failed to connect
///
/// Labels:
/// - reason: exhausted, creation_failed, closed
pub fn pool_unavailable_total() -> Counter<u64> {
    meter()
        .u64_counter("riskwatch.pool.unavailable.total")
        .with_description("Total acquisitions that returned unavailable")
        .build()
}

/// Connections closed because they exceeded the recycle age
pub fn pool_recycled_total() -> Counter<u64> {
    meter()
        .u64_counter("riskwatch.pool.recycled.total")
        .with_description("Total connections replaced for exceeding recycle time")
        .build()
}

pub fn pool_acquire_duration() -> Histogram<f64> {
    meter()
        .f64_histogram("riskwatch.pool.acquire.duration")
        .with_description("Connection acquisition latency")
        .with_unit("ms")
        .build()
}

// ============================================================================
// Circuit breakers
// ============================================================================

/// Labels:
/// - component: breaker name
/// - to: closed, open, half_open
pub fn breaker_transitions_total() -> Counter<u64> {
    meter()
        .u64_counter("riskwatch.circuit_breaker.transitions.total")
        .with_description("Total circuit breaker state transitions")
        .build()
}

/// Calls short-circuited by an open breaker
pub fn breaker_rejections_total() -> Counter<u64> {
    meter()
        .u64_counter("riskwatch.circuit_breaker.rejections.total")
        .with_description("Total calls rejected by an open circuit breaker")
        .build()
}

// ============================================================================
// Task processor
// ============================================================================

pub fn tasks_submitted_total() -> Counter<u64> {
    meter()
        .u64_counter("riskwatch.tasks.submitted.total")
        .with_description("Total tasks accepted into the queue")
        .build()
}

pub fn tasks_rejected_total() -> Counter<u64> {
    meter()
        .u64_counter("riskwatch.tasks.rejected.total")
        .with_description("Total tasks rejected because the queue was full or closed")
        .build()
}

pub fn tasks_completed_total() -> Counter<u64> {
    meter()
        .u64_counter("riskwatch.tasks.completed.total")
        .with_description("Total tasks completed successfully")
        .build()
}

pub fn tasks_retried_total() -> Counter<u64> {
    meter()
        .u64_counter("riskwatch.tasks.retried.total")
        .with_description("Total task retries")
        .build()
}

/// Tasks that exhausted their retries
pub fn tasks_failed_total() -> Counter<u64> {
    meter()
        .u64_counter("riskwatch.tasks.failed.total")
        .with_description("Total tasks moved to the permanently failed record")
        .build()
}

pub fn task_duration() -> Histogram<f64> {
    meter()
        .f64_histogram("riskwatch.tasks.duration")
        .with_description("Task execution time per attempt")
        .with_unit("ms")
        .build()
}

// ============================================================================
// Health and errors
// ============================================================================

pub fn health_evaluations_total() -> Counter<u64> {
    meter()
        .u64_counter("riskwatch.health.evaluations.total")
        .with_description("Total health evaluation cycles completed")
        .build()
}

/// Labels:
/// - rule: alert rule name
pub fn alerts_raised_total() -> Counter<u64> {
    meter()
        .u64_counter("riskwatch.health.alerts.raised.total")
        .with_description("Total alerts raised")
        .build()
}

pub fn alerts_resolved_total() -> Counter<u64> {
    meter()
        .u64_counter("riskwatch.health.alerts.resolved.total")
        .with_description("Total alerts resolved")
        .build()
}

/// Labels:
/// - severity: low, medium, high, critical
pub fn error_events_total() -> Counter<u64> {
    meter()
        .u64_counter("riskwatch.errors.events.total")
        .with_description("Total error events recorded")
        .build()
}

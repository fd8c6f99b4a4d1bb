//! # Error Aggregation
//!
//! Records failure events in a bounded in-memory window, persists them for
//! audit and feeds them into the circuit breaker of the originating service.
//! Per-service recovery handlers get one best-effort invocation per event.

use crate::config::ErrorAggregatorConfig;
use crate::error::RiskwatchResult;
use crate::lifecycle::ShutdownSignal;
use crate::logging::log_error;
use crate::metrics;
use crate::monitoring::ErrorEventStore;
use crate::resilience::CircuitBreakerManager;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use opentelemetry::KeyValue;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorSeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl ErrorSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorSeverity::Low => "low",
            ErrorSeverity::Medium => "medium",
            ErrorSeverity::High => "high",
            ErrorSeverity::Critical => "critical",
        }
    }
}

impl fmt::Display for ErrorSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ErrorSeverity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low" => Ok(ErrorSeverity::Low),
            "medium" => Ok(ErrorSeverity::Medium),
            "high" => Ok(ErrorSeverity::High),
            "critical" => Ok(ErrorSeverity::Critical),
            other => Err(format!("unknown error severity: {other}")),
        }
    }
}

/// An immutable record of one failure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorEvent {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,

    /// Free-form classification, e.g. `timeout` or `upstream_5xx`
    pub kind: String,
    pub severity: ErrorSeverity,

    /// Originating service; matches circuit breaker names
    pub service: String,
    pub message: String,
    pub context: Value,
}

impl ErrorEvent {
    pub fn new(
        kind: impl Into<String>,
        severity: ErrorSeverity,
        service: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            kind: kind.into(),
            severity,
            service: service.into(),
            message: message.into(),
            context: Value::Null,
        }
    }

    pub fn with_context(mut self, context: Value) -> Self {
        self.context = context;
        self
    }

    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }
}

/// Best-effort reaction to an error from one service
#[async_trait]
pub trait RecoveryHandler: Send + Sync + 'static {
    async fn recover(&self, event: ErrorEvent) -> RiskwatchResult<()>;
}

#[async_trait]
impl<F, Fut> RecoveryHandler for F
where
    F: Fn(ErrorEvent) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = RiskwatchResult<()>> + Send + 'static,
{
    async fn recover(&self, event: ErrorEvent) -> RiskwatchResult<()> {
        (self)(event).await
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeverityCounts {
    pub low: u64,
    pub medium: u64,
    pub high: u64,
    pub critical: u64,
}

impl SeverityCounts {
    fn add(&mut self, severity: ErrorSeverity) {
        match severity {
            ErrorSeverity::Low => self.low += 1,
            ErrorSeverity::Medium => self.medium += 1,
            ErrorSeverity::High => self.high += 1,
            ErrorSeverity::Critical => self.critical += 1,
        }
    }

    pub fn total(&self) -> u64 {
        self.low + self.medium + self.high + self.critical
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceErrorCount {
    pub service: String,
    pub count: u64,
}

/// Snapshot of aggregated error statistics
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ErrorStats {
    /// Events recorded since startup
    pub total_recorded: u64,

    /// Events currently held in the in-memory window
    pub in_window: usize,

    /// Events in the rate window
    pub recent_count: u64,
    pub error_rate_per_minute: f64,

    /// Severity breakdown over the rate window
    pub recent_by_severity: SeverityCounts,

    /// Severity breakdown over the whole in-memory window
    pub by_severity: SeverityCounts,

    /// Services with the most events in the window, most first
    pub top_services: Vec<ServiceErrorCount>,

    pub recovery_attempts: u64,
    pub recovery_failures: u64,
    pub persist_failures: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PruneReport {
    pub memory: usize,
    pub store: u64,
}

#[derive(Debug, Default)]
struct AggregatorCounters {
    total_recorded: u64,
    recovery_attempts: u64,
    recovery_failures: u64,
    persist_failures: u64,
}

const TOP_SERVICES: usize = 5;

pub struct ErrorAggregator {
    config: ErrorAggregatorConfig,
    window: Mutex<VecDeque<ErrorEvent>>,
    counters: Mutex<AggregatorCounters>,
    store: Arc<dyn ErrorEventStore>,
    breakers: Option<Arc<CircuitBreakerManager>>,
    recovery_handlers: DashMap<String, Arc<dyn RecoveryHandler>>,
}

impl fmt::Debug for ErrorAggregator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ErrorAggregator")
            .field("window_size", &self.config.window_size)
            .field("in_window", &self.window.lock().len())
            .field("store", &self.store)
            .field("recovery_handlers", &self.recovery_handlers.len())
            .finish()
    }
}

impl ErrorAggregator {
    pub fn new(config: ErrorAggregatorConfig, store: Arc<dyn ErrorEventStore>) -> Self {
        Self {
            window: Mutex::new(VecDeque::with_capacity(config.window_size.min(4096))),
            counters: Mutex::new(AggregatorCounters::default()),
            store,
            breakers: None,
            recovery_handlers: DashMap::new(),
            config,
        }
    }

    /// Count events against existing breakers with the same service name
    pub fn with_circuit_breakers(mut self, breakers: Arc<CircuitBreakerManager>) -> Self {
        self.breakers = Some(breakers);
        self
    }

    /// Register the recovery handler for a service, replacing any previous one
    pub fn register_recovery_handler(
        &self,
        service: impl Into<String>,
        handler: Arc<dyn RecoveryHandler>,
    ) {
        let service = service.into();
        debug!(service = %service, "Registered recovery handler");
        self.recovery_handlers.insert(service, handler);
    }

    pub fn store(&self) -> &Arc<dyn ErrorEventStore> {
        &self.store
    }

    /// Record one event
    ///
    /// Never fails: persistence and recovery problems are logged and counted.
    pub async fn record(&self, event: ErrorEvent) {
        {
            let mut window = self.window.lock();
            if window.len() >= self.config.window_size {
                window.pop_front();
            }
            window.push_back(event.clone());
        }
        self.counters.lock().total_recorded += 1;
        metrics::error_events_total()
            .add(1, &[KeyValue::new("severity", event.severity.as_str())]);

        match event.severity {
            ErrorSeverity::Low => debug!(
                service = %event.service,
                kind = %event.kind,
                message = %event.message,
                "Error event recorded"
            ),
            ErrorSeverity::Medium => info!(
                service = %event.service,
                kind = %event.kind,
                message = %event.message,
                "Error event recorded"
            ),
            ErrorSeverity::High => warn!(
                service = %event.service,
                kind = %event.kind,
                message = %event.message,
                "Error event recorded"
            ),
            ErrorSeverity::Critical => error!(
                service = %event.service,
                kind = %event.kind,
                message = %event.message,
                "Critical error event recorded"
            ),
        }

        if let Err(e) = self.store.append(&event).await {
            self.counters.lock().persist_failures += 1;
            log_error(
                "error_aggregator",
                "persist",
                &e.to_string(),
                Some(&format!("event {}", event.id)),
            );
        }

        if self.config.feed_circuit_breakers {
            if let Some(breaker) = self.breakers.as_ref().and_then(|b| b.get(&event.service)) {
                breaker.record_failure_manual(Duration::ZERO);
            }
        }

        let handler = self
            .recovery_handlers
            .get(&event.service)
            .map(|entry| Arc::clone(entry.value()));
        if let Some(handler) = handler {
            self.counters.lock().recovery_attempts += 1;
            let service = event.service.clone();
            if let Err(e) = handler.recover(event).await {
                self.counters.lock().recovery_failures += 1;
                warn!(service = %service, error = %e, "Recovery handler failed; not retrying");
            }
        }
    }

    pub fn stats(&self) -> ErrorStats {
        let rate_window = self.config.rate_window();
        let cutoff = Utc::now()
            - chrono::Duration::from_std(rate_window).unwrap_or_else(|_| chrono::Duration::zero());

        let mut stats = ErrorStats::default();
        let mut per_service: HashMap<&str, u64> = HashMap::new();

        let window = self.window.lock();
        stats.in_window = window.len();
        for event in window.iter() {
            stats.by_severity.add(event.severity);
            *per_service.entry(event.service.as_str()).or_default() += 1;
            if event.timestamp >= cutoff {
                stats.recent_by_severity.add(event.severity);
            }
        }

        let mut top: Vec<ServiceErrorCount> = per_service
            .into_iter()
            .map(|(service, count)| ServiceErrorCount {
                service: service.to_string(),
                count,
            })
            .collect();
        drop(window);

        top.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.service.cmp(&b.service)));
        top.truncate(TOP_SERVICES);
        stats.top_services = top;

        stats.recent_count = stats.recent_by_severity.total();
        let minutes = rate_window.as_secs_f64() / 60.0;
        stats.error_rate_per_minute = if minutes > 0.0 {
            stats.recent_count as f64 / minutes
        } else {
            0.0
        };

        let counters = self.counters.lock();
        stats.total_recorded = counters.total_recorded;
        stats.recovery_attempts = counters.recovery_attempts;
        stats.recovery_failures = counters.recovery_failures;
        stats.persist_failures = counters.persist_failures;
        stats
    }

    /// Most recent events, newest first
    pub fn recent(&self, limit: usize) -> Vec<ErrorEvent> {
        self.window.lock().iter().rev().take(limit).cloned().collect()
    }

    pub fn events_for_service(&self, service: &str) -> Vec<ErrorEvent> {
        self.window
            .lock()
            .iter()
            .filter(|event| event.service == service)
            .cloned()
            .collect()
    }

    /// Drop events older than the retention window from memory and the store
    pub async fn prune(&self) -> RiskwatchResult<PruneReport> {
        let retention = chrono::Duration::from_std(self.config.retention())
            .unwrap_or_else(|_| chrono::Duration::days(36_500));
        let cutoff = Utc::now()
            .checked_sub_signed(retention)
            .unwrap_or(DateTime::<Utc>::MIN_UTC);

        let memory = {
            let mut window = self.window.lock();
            let before = window.len();
            window.retain(|event| event.timestamp >= cutoff);
            before - window.len()
        };

        let store = self.store.prune_before(cutoff).await?;
        if memory > 0 || store > 0 {
            info!(memory = memory, store = store, "Pruned expired error events");
        }
        Ok(PruneReport { memory, store })
    }

    /// Periodic pruning until `shutdown` is triggered
    pub async fn run_prune_loop(self: Arc<Self>, shutdown: Arc<ShutdownSignal>) {
        let mut interval = tokio::time::interval(self.config.prune_interval());
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        interval.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.wait() => break,
                _ = interval.tick() => {
                    if let Err(e) = self.prune().await {
                        log_error("error_aggregator", "prune", &e.to_string(), None);
                    }
                }
            }
        }
        debug!("Error prune loop stopped");
    }
}

//! # Health Loop
//!
//! Read-only observer over the pool, circuit breakers, task processor, error
//! aggregator and host. Each evaluation applies threshold rules, derives an
//! aggregate [`HealthStatus`] and raises or clears alerts.
//!
//! Alerts are keyed by rule name. A rule that is already alerting stays a single
//! active alert until a later evaluation finds it no longer firing.
//!
//! | Rule | Fires when | Severity |
//! |------|------------|----------|
//! | `pool_utilization` | active / max connections above threshold | warning |
//! | `pool_creation_failures` | new creation failures since last check reach threshold | warning |
//! | `circuit_open:<name>` | breaker `<name>` is Open | critical |
//! | `error_rate` | errors per minute above threshold | warning |
//! | `critical_errors` | critical events in the rate window reach threshold | critical |
//! | `task_queue_saturation` | queued / queue capacity above threshold | warning |
//! | `host_load` | load average per CPU above threshold | warning |
//! | `host_memory` | used memory share above threshold | warning |

use crate::config::HealthConfig;
use crate::database::{PoolStats, PoolStatsSource};
use crate::execution::{TaskProcessorStats, TaskStatsSource};
use crate::lifecycle::ShutdownSignal;
use crate::metrics;
use crate::monitoring::{ErrorAggregator, ErrorStats, HostMetrics, HostMetricsSource};
use crate::resilience::{CircuitBreakerManager, CircuitState, SystemBreakerStats};
use chrono::{DateTime, Utc};
use opentelemetry::KeyValue;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Aggregate status; ordered so the worst status is the maximum
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::Degraded => "degraded",
            Self::Unhealthy => "unhealthy",
        }
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertSeverity {
    Warning,
    Critical,
}

impl AlertSeverity {
    fn status(self) -> HealthStatus {
        match self {
            Self::Warning => HealthStatus::Degraded,
            Self::Critical => HealthStatus::Unhealthy,
        }
    }

    fn as_str(&self) -> &'static str {
        match self {
            Self::Warning => "warning",
            Self::Critical => "critical",
        }
    }
}

/// Status of one observed component
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthCheck {
    /// `pool`, `breaker:<name>`, `tasks`, `errors` or `host`
    pub component: String,
    pub status: HealthStatus,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub rule: String,
    pub severity: AlertSeverity,
    pub message: String,

    /// Observed value on the most recent evaluation that fired
    pub value: f64,
    pub threshold: f64,

    pub raised_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

/// Result of one evaluation, with the inputs it was computed from
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub checks: Vec<HealthCheck>,
    pub active_alerts: Vec<Alert>,
    pub pool: Option<PoolStats>,
    pub breakers: Option<SystemBreakerStats>,
    pub tasks: Option<TaskProcessorStats>,
    pub errors: Option<ErrorStats>,
    pub host: Option<HostMetrics>,
    pub evaluated_at: DateTime<Utc>,
}

impl HealthReport {
    pub fn is_healthy(&self) -> bool {
        self.status == HealthStatus::Healthy
    }

    pub fn check(&self, component: &str) -> Option<&HealthCheck> {
        self.checks.iter().find(|check| check.component == component)
    }
}

struct Firing {
    component: String,
    severity: AlertSeverity,
    message: String,
    value: f64,
    threshold: f64,
}

#[derive(Default)]
struct AlertState {
    active: BTreeMap<String, Alert>,
    resolved: VecDeque<Alert>,
    last_failed_connections: Option<u64>,
    last_report: Option<HealthReport>,
}

pub struct HealthMonitor {
    config: HealthConfig,
    pool: Option<Arc<dyn PoolStatsSource>>,
    breakers: Option<Arc<CircuitBreakerManager>>,
    tasks: Option<Arc<dyn TaskStatsSource>>,
    errors: Option<Arc<ErrorAggregator>>,
    host: Option<Arc<dyn HostMetricsSource>>,
    state: Mutex<AlertState>,
}

impl fmt::Debug for HealthMonitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HealthMonitor")
            .field("config", &self.config)
            .field("pool", &self.pool.is_some())
            .field("breakers", &self.breakers.is_some())
            .field("tasks", &self.tasks.is_some())
            .field("errors", &self.errors.is_some())
            .field("host", &self.host.is_some())
            .finish()
    }
}

impl HealthMonitor {
    pub fn new(config: HealthConfig) -> Self {
        Self {
            config,
            pool: None,
            breakers: None,
            tasks: None,
            errors: None,
            host: None,
            state: Mutex::new(AlertState::default()),
        }
    }

    pub fn with_pool(mut self, pool: Arc<dyn PoolStatsSource>) -> Self {
        self.pool = Some(pool);
        self
    }

    pub fn with_breakers(mut self, breakers: Arc<CircuitBreakerManager>) -> Self {
        self.breakers = Some(breakers);
        self
    }

    pub fn with_tasks(mut self, tasks: Arc<dyn TaskStatsSource>) -> Self {
        self.tasks = Some(tasks);
        self
    }

    pub fn with_errors(mut self, errors: Arc<ErrorAggregator>) -> Self {
        self.errors = Some(errors);
        self
    }

    pub fn with_host_metrics(mut self, host: Arc<dyn HostMetricsSource>) -> Self {
        self.host = Some(host);
        self
    }

    pub fn config(&self) -> &HealthConfig {
        &self.config
    }

    /// Gather every source, apply the rules and update alert state
    pub fn evaluate(&self) -> HealthReport {
        let pool = self.pool.as_ref().map(|source| source.pool_stats());
        let breakers = self.breakers.as_ref().map(|manager| manager.all_stats());
        let tasks = self.tasks.as_ref().map(|source| source.task_stats());
        let errors = self.errors.as_ref().map(|aggregator| aggregator.stats());
        let host = self.host.as_ref().map(|source| source.collect());

        let mut state = self.state.lock();
        let mut firing: HashMap<String, Firing> = HashMap::new();
        let mut checks: BTreeMap<String, (HealthStatus, String)> = BTreeMap::new();

        if let Some(pool) = &pool {
            let previous = state.last_failed_connections.unwrap_or(0);
            let new_failures = pool.failed_connections.saturating_sub(previous);
            state.last_failed_connections = Some(pool.failed_connections);
            self.pool_rules(pool, new_failures, &mut firing, &mut checks);
        }
        if let Some(breakers) = &breakers {
            self.breaker_rules(breakers, &mut firing, &mut checks);
        }
        if let Some(errors) = &errors {
            self.error_rules(errors, &mut firing, &mut checks);
        }
        if let Some(tasks) = &tasks {
            self.task_rules(tasks, &mut firing, &mut checks);
        }
        if let Some(host) = &host {
            self.host_rules(host, &mut firing, &mut checks);
        }

        // A firing rule forces its component to at least the rule's status
        for alert in firing.values() {
            let entry = checks
                .entry(alert.component.clone())
                .or_insert((HealthStatus::Healthy, String::new()));
            if alert.severity.status() > entry.0 {
                *entry = (alert.severity.status(), alert.message.clone());
            }
        }

        let now = Utc::now();
        self.reconcile_alerts(&mut state, firing, now);

        let checks: Vec<HealthCheck> = checks
            .into_iter()
            .map(|(component, (status, message))| HealthCheck {
                component,
                status,
                message,
            })
            .collect();
        let status = checks
            .iter()
            .map(|check| check.status)
            .max()
            .unwrap_or(HealthStatus::Healthy);

        let report = HealthReport {
            status,
            checks,
            active_alerts: state.active.values().cloned().collect(),
            pool,
            breakers,
            tasks,
            errors,
            host,
            evaluated_at: now,
        };
        state.last_report = Some(report.clone());
        drop(state);

        metrics::health_evaluations_total().add(1, &[KeyValue::new("status", status.as_str())]);
        debug!(status = %status, alerts = report.active_alerts.len(), "Health evaluated");
        report
    }

    fn pool_rules(
        &self,
        pool: &PoolStats,
        new_failures: u64,
        firing: &mut HashMap<String, Firing>,
        checks: &mut BTreeMap<String, (HealthStatus, String)>,
    ) {
        let utilization = pool.utilization();
        let message = format!(
            "{}/{} connections active ({:.0}%)",
            pool.active_connections,
            pool.max_connections,
            utilization * 100.0
        );
        if pool.closed {
            checks.insert("pool".to_string(), (HealthStatus::Unhealthy, "pool is closed".to_string()));
        } else {
            checks.insert("pool".to_string(), (HealthStatus::Healthy, message.clone()));
        }

        if utilization > self.config.pool_utilization_threshold {
            firing.insert(
                "pool_utilization".to_string(),
                Firing {
                    component: "pool".to_string(),
                    severity: AlertSeverity::Warning,
                    message,
                    value: utilization,
                    threshold: self.config.pool_utilization_threshold,
                },
            );
        }

        if new_failures >= self.config.pool_creation_failure_threshold {
            firing.insert(
                "pool_creation_failures".to_string(),
                Firing {
                    component: "pool".to_string(),
                    severity: AlertSeverity::Warning,
                    message: format!("{new_failures} connection creations failed since last check"),
                    value: new_failures as f64,
                    threshold: self.config.pool_creation_failure_threshold as f64,
                },
            );
        }
    }

    fn breaker_rules(
        &self,
        breakers: &SystemBreakerStats,
        firing: &mut HashMap<String, Firing>,
        checks: &mut BTreeMap<String, (HealthStatus, String)>,
    ) {
        for stats in &breakers.breakers {
            let component = format!("breaker:{}", stats.name);
            match stats.state {
                CircuitState::Closed => {
                    checks.insert(component, (HealthStatus::Healthy, stats.format_summary()));
                }
                CircuitState::HalfOpen => {
                    checks.insert(component, (HealthStatus::Degraded, stats.format_summary()));
                }
                CircuitState::Open => {
                    firing.insert(
                        format!("circuit_open:{}", stats.name),
                        Firing {
                            component: component.clone(),
                            severity: AlertSeverity::Critical,
                            message: format!("circuit breaker for {} is open", stats.name),
                            value: stats.failure_count as f64,
                            threshold: stats.failure_threshold as f64,
                        },
                    );
                    checks.insert(component, (HealthStatus::Unhealthy, stats.format_summary()));
                }
            }
        }
    }

    fn error_rules(
        &self,
        errors: &ErrorStats,
        firing: &mut HashMap<String, Firing>,
        checks: &mut BTreeMap<String, (HealthStatus, String)>,
    ) {
        checks.insert(
            "errors".to_string(),
            (
                HealthStatus::Healthy,
                format!("{:.1} errors/min", errors.error_rate_per_minute),
            ),
        );

        if errors.error_rate_per_minute > self.config.error_rate_per_minute_threshold {
            firing.insert(
                "error_rate".to_string(),
                Firing {
                    component: "errors".to_string(),
                    severity: AlertSeverity::Warning,
                    message: format!(
                        "error rate {:.1}/min exceeds {:.1}/min",
                        errors.error_rate_per_minute, self.config.error_rate_per_minute_threshold
                    ),
                    value: errors.error_rate_per_minute,
                    threshold: self.config.error_rate_per_minute_threshold,
                },
            );
        }

        let critical = errors.recent_by_severity.critical;
        if critical >= self.config.critical_error_threshold && critical > 0 {
            firing.insert(
                "critical_errors".to_string(),
                Firing {
                    component: "errors".to_string(),
                    severity: AlertSeverity::Critical,
                    message: format!("{critical} critical errors in the rate window"),
                    value: critical as f64,
                    threshold: self.config.critical_error_threshold as f64,
                },
            );
        }
    }

    fn task_rules(
        &self,
        tasks: &TaskProcessorStats,
        firing: &mut HashMap<String, Firing>,
        checks: &mut BTreeMap<String, (HealthStatus, String)>,
    ) {
        let utilization = tasks.queue_utilization();
        let message = format!(
            "{}/{} queued, {} processing",
            tasks.queued, tasks.queue_capacity, tasks.processing
        );
        checks.insert("tasks".to_string(), (HealthStatus::Healthy, message.clone()));

        if utilization > self.config.task_queue_utilization_threshold {
            firing.insert(
                "task_queue_saturation".to_string(),
                Firing {
                    component: "tasks".to_string(),
                    severity: AlertSeverity::Warning,
                    message,
                    value: utilization,
                    threshold: self.config.task_queue_utilization_threshold,
                },
            );
        }
    }

    fn host_rules(
        &self,
        host: &HostMetrics,
        firing: &mut HashMap<String, Firing>,
        checks: &mut BTreeMap<String, (HealthStatus, String)>,
    ) {
        let load = host.load_per_cpu();
        let memory = host.memory_utilization();
        let message = match (load, memory) {
            (Some(load), Some(memory)) => {
                format!("load {load:.2}/cpu, memory {:.0}% used", memory * 100.0)
            }
            (Some(load), None) => format!("load {load:.2}/cpu"),
            (None, Some(memory)) => format!("memory {:.0}% used", memory * 100.0),
            (None, None) => "host metrics unavailable".to_string(),
        };
        checks.insert("host".to_string(), (HealthStatus::Healthy, message));

        if let Some(load) = load.filter(|load| *load > self.config.load_per_cpu_threshold) {
            firing.insert(
                "host_load".to_string(),
                Firing {
                    component: "host".to_string(),
                    severity: AlertSeverity::Warning,
                    message: format!("load average {load:.2} per cpu"),
                    value: load,
                    threshold: self.config.load_per_cpu_threshold,
                },
            );
        }

        if let Some(memory) = memory.filter(|memory| *memory > self.config.memory_utilization_threshold) {
            firing.insert(
                "host_memory".to_string(),
                Firing {
                    component: "host".to_string(),
                    severity: AlertSeverity::Warning,
                    message: format!("memory {:.0}% used", memory * 100.0),
                    value: memory,
                    threshold: self.config.memory_utilization_threshold,
                },
            );
        }
    }

    fn reconcile_alerts(
        &self,
        state: &mut AlertState,
        mut firing: HashMap<String, Firing>,
        now: DateTime<Utc>,
    ) {
        let cleared: Vec<String> = state
            .active
            .keys()
            .filter(|rule| !firing.contains_key(*rule))
            .cloned()
            .collect();

        for rule in cleared {
            if let Some(mut alert) = state.active.remove(&rule) {
                alert.resolved_at = Some(now);
                info!(rule = %rule, "Alert resolved");
                metrics::alerts_resolved_total().add(1, &[KeyValue::new("rule", rule.clone())]);

                state.resolved.push_back(alert);
                while state.resolved.len() > self.config.resolved_alert_history {
                    state.resolved.pop_front();
                }
            }
        }

        for (rule, fired) in firing.drain() {
            match state.active.get_mut(&rule) {
                Some(alert) => {
                    alert.value = fired.value;
                    alert.message = fired.message;
                }
                None => {
                    warn!(
                        rule = %rule,
                        severity = fired.severity.as_str(),
                        value = fired.value,
                        threshold = fired.threshold,
                        message = %fired.message,
                        "Alert raised"
                    );
                    metrics::alerts_raised_total().add(1, &[KeyValue::new("rule", rule.clone())]);
                    state.active.insert(
                        rule.clone(),
                        Alert {
                            rule,
                            severity: fired.severity,
                            message: fired.message,
                            value: fired.value,
                            threshold: fired.threshold,
                            raised_at: now,
                            resolved_at: None,
                        },
                    );
                }
            }
        }
    }

    pub fn last_report(&self) -> Option<HealthReport> {
        self.state.lock().last_report.clone()
    }

    /// Active alerts ordered by rule name
    pub fn active_alerts(&self) -> Vec<Alert> {
        self.state.lock().active.values().cloned().collect()
    }

    /// Resolved alerts, oldest first
    pub fn resolved_alerts(&self) -> Vec<Alert> {
        self.state.lock().resolved.iter().cloned().collect()
    }

    /// Evaluate on every `check_interval` until `shutdown` is triggered
    pub async fn run_health_loop(self: Arc<Self>, shutdown: Arc<ShutdownSignal>) {
        let mut interval = tokio::time::interval(self.config.check_interval());
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.wait() => break,
                _ = interval.tick() => {
                    self.evaluate();
                }
            }
        }
        debug!("Health loop stopped");
    }
}

//! # Circuit Breaker Implementation
//!
//! Fault isolation for a single named dependency. The classic three states:
//! Closed (normal operation), Open (failing fast) and Half-Open (testing
//! recovery).
//!
//! All bookkeeping for one breaker sits behind that breaker's own lock, so
//! transitions are linearized per breaker while unrelated breakers never
//! contend. The lock is never held while the protected operation runs.

use crate::logging::log_breaker_transition;
use crate::metrics;
use crate::resilience::{BreakerStats, CircuitBreakerConfig};
use chrono::{DateTime, Utc};
use opentelemetry::KeyValue;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Circuit breaker states representing the current operational mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation - all calls are allowed through
    Closed,
    /// Failure mode - all calls fail fast without executing
    Open,
    /// Testing recovery - calls go through, one failure reopens
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors that can occur during circuit breaker operation
#[derive(Debug, thiserror::Error)]
pub enum CircuitBreakerError<E> {
    /// Circuit is open, the operation was not attempted
    #[error("Circuit breaker is open for {component}")]
    CircuitOpen { component: String },

    /// Operation failed and was recorded
    #[error("Operation failed: {0}")]
    OperationFailed(E),
}

impl<E> CircuitBreakerError<E> {
    pub fn is_circuit_open(&self) -> bool {
        matches!(self, CircuitBreakerError::CircuitOpen { .. })
    }

    /// The operation's own error, if it ran
    pub fn into_operation_error(self) -> Option<E> {
        match self {
            CircuitBreakerError::OperationFailed(e) => Some(e),
            CircuitBreakerError::CircuitOpen { .. } => None,
        }
    }
}

/// Mutable breaker state, guarded by the breaker's lock
#[derive(Debug)]
struct BreakerCore {
    state: CircuitState,
    consecutive_failures: u32,
    consecutive_successes: u32,
    last_failure: Option<Instant>,
    last_failure_time: Option<DateTime<Utc>>,
    last_state_change: DateTime<Utc>,
    total_calls: u64,
    total_successes: u64,
    total_failures: u64,
    total_rejections: u64,
    times_opened: u64,
    average_response_time: Duration,
}

impl BreakerCore {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            consecutive_successes: 0,
            last_failure: None,
            last_failure_time: None,
            last_state_change: Utc::now(),
            total_calls: 0,
            total_successes: 0,
            total_failures: 0,
            total_rejections: 0,
            times_opened: 0,
            average_response_time: Duration::ZERO,
        }
    }

    /// Move to `to`, resetting both consecutive counters. Returns the previous state.
    fn transition(&mut self, to: CircuitState) -> CircuitState {
        let from = self.state;
        self.state = to;
        self.consecutive_failures = 0;
        self.consecutive_successes = 0;
        self.last_state_change = Utc::now();
        if to == CircuitState::Open {
            self.times_opened += 1;
        }
        from
    }
}

/// Core circuit breaker implementation
#[derive(Debug)]
pub struct CircuitBreaker {
    /// Component name for logging and metrics
    name: String,

    /// Configuration parameters
    config: CircuitBreakerConfig,

    core: Mutex<BreakerCore>,
}

impl CircuitBreaker {
    /// Create a new circuit breaker with the given name and configuration
    pub fn new(name: String, config: CircuitBreakerConfig) -> Self {
        debug!(
            component = %name,
            failure_threshold = config.failure_threshold,
            recovery_timeout_ms = config.recovery_timeout.as_millis() as u64,
            success_threshold = config.success_threshold,
            "Circuit breaker initialized"
        );

        Self {
            name,
            config,
            core: Mutex::new(BreakerCore::new()),
        }
    }

    /// Get current circuit state
    pub fn state(&self) -> CircuitState {
        self.core.lock().state
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Execute an operation with circuit breaker protection
    ///
    /// While Open the operation is not invoked and `CircuitOpen` is returned.
    /// Otherwise the operation runs, is timed and its outcome is recorded.
    pub async fn call<F, T, E, Fut>(&self, operation: F) -> Result<T, CircuitBreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        if !self.should_allow() {
            return Err(CircuitBreakerError::CircuitOpen {
                component: self.name.clone(),
            });
        }

        let start_time = Instant::now();
        let result = operation().await;
        let duration = start_time.elapsed();

        match &result {
            Ok(_) => self.record_success(duration),
            Err(_) => self.record_failure(duration),
        }

        result.map_err(CircuitBreakerError::OperationFailed)
    }

    /// Pre-flight check for callers that record outcomes manually
    ///
    /// Moves an Open breaker to HalfOpen once the recovery timeout has passed
    /// since the last failure. A refused call is counted as a rejection.
    pub fn should_allow(&self) -> bool {
        let mut core = self.core.lock();
        match core.state {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => {
                let recovered = core
                    .last_failure
                    .map(|at| at.elapsed() > self.config.recovery_timeout)
                    .unwrap_or(true);

                if recovered {
                    let from = core.transition(CircuitState::HalfOpen);
                    drop(core);
                    self.on_transition(from, CircuitState::HalfOpen, "recovery timeout elapsed");
                    true
                } else {
                    core.total_rejections += 1;
                    drop(core);
                    metrics::breaker_rejections_total()
                        .add(1, &[KeyValue::new("component", self.name.clone())]);
                    debug!(component = %self.name, "Call short-circuited by open breaker");
                    false
                }
            }
        }
    }

    /// Record a successful operation
    fn record_success(&self, duration: Duration) {
        let mut core = self.core.lock();
        core.total_calls += 1;
        core.total_successes += 1;

        core.average_response_time =
            running_mean(core.average_response_time, duration, core.total_successes);

        match core.state {
            CircuitState::Closed => {
                core.consecutive_failures = 0;
            }
            CircuitState::HalfOpen => {
                core.consecutive_successes += 1;
                if core.consecutive_successes >= self.config.success_threshold {
                    let from = core.transition(CircuitState::Closed);
                    drop(core);
                    self.on_transition(from, CircuitState::Closed, "success threshold reached");
                }
            }
            CircuitState::Open => {
                // A call admitted before the breaker opened finished late
                debug!(component = %self.name, "Success recorded while circuit is open");
            }
        }
    }

    /// Record a failed operation
    fn record_failure(&self, duration: Duration) {
        let mut core = self.core.lock();
        core.total_calls += 1;
        core.total_failures += 1;
        core.last_failure = Some(Instant::now());
        core.last_failure_time = Some(Utc::now());

        warn!(
            component = %self.name,
            duration_ms = duration.as_millis() as u64,
            state = %core.state,
            "Protected operation failed"
        );

        match core.state {
            CircuitState::Closed => {
                core.consecutive_failures += 1;
                if core.consecutive_failures >= self.config.failure_threshold {
                    let from = core.transition(CircuitState::Open);
                    drop(core);
                    self.on_transition(from, CircuitState::Open, "failure threshold reached");
                }
            }
            CircuitState::HalfOpen => {
                // Any failure while recovering reopens immediately
                let from = core.transition(CircuitState::Open);
                drop(core);
                self.on_transition(from, CircuitState::Open, "failure while half-open");
            }
            CircuitState::Open => {
                // Already tripped; the counter is not advanced
            }
        }
    }

    fn on_transition(&self, from: CircuitState, to: CircuitState, reason: &str) {
        log_breaker_transition(&self.name, from.as_str(), to.as_str(), reason);
        metrics::breaker_transitions_total().add(
            1,
            &[
                KeyValue::new("component", self.name.clone()),
                KeyValue::new("to", to.as_str()),
            ],
        );
        if to == CircuitState::Open {
            warn!(
                component = %self.name,
                failure_threshold = self.config.failure_threshold,
                recovery_timeout_ms = self.config.recovery_timeout.as_millis() as u64,
                "Circuit breaker opened (failing fast)"
            );
        }
    }

    /// Manually record a successful operation
    ///
    /// Use with [`should_allow`](Self::should_allow) when the protected work
    /// can't be expressed as a single future.
    pub fn record_success_manual(&self, duration: Duration) {
        self.record_success(duration);
    }

    /// Manually record a failed operation
    pub fn record_failure_manual(&self, duration: Duration) {
        self.record_failure(duration);
    }

    /// Force circuit to open state (for emergency situations)
    pub fn force_open(&self) {
        warn!(component = %self.name, "Circuit breaker forced open");
        let mut core = self.core.lock();
        core.last_failure = Some(Instant::now());
        let from = core.transition(CircuitState::Open);
        drop(core);
        self.on_transition(from, CircuitState::Open, "forced open");
    }

    /// Force circuit to closed state (for emergency recovery)
    pub fn force_closed(&self) {
        warn!(component = %self.name, "Circuit breaker forced closed");
        let from = self.core.lock().transition(CircuitState::Closed);
        self.on_transition(from, CircuitState::Closed, "forced closed");
    }

    /// Discard all state and totals
    pub fn reset(&self) {
        *self.core.lock() = BreakerCore::new();
    }

    /// Consistent snapshot taken under the breaker's lock
    pub fn stats(&self) -> BreakerStats {
        let core = self.core.lock();
        BreakerStats {
            name: self.name.clone(),
            state: core.state,
            failure_count: core.consecutive_failures,
            success_count: core.consecutive_successes,
            last_failure_time: core.last_failure_time,
            last_state_change: core.last_state_change,
            failure_threshold: self.config.failure_threshold,
            recovery_timeout: self.config.recovery_timeout,
            success_threshold: self.config.success_threshold,
            total_calls: core.total_calls,
            total_successes: core.total_successes,
            total_failures: core.total_failures,
            total_rejections: core.total_rejections,
            times_opened: core.times_opened,
            average_response_time: core.average_response_time,
        }
    }

    /// Check if circuit is healthy (closed state with low failure rate)
    pub fn is_healthy(&self) -> bool {
        self.stats().is_healthy()
    }
}

/// Cumulative mean after adding the `count`-th sample
fn running_mean(previous: Duration, sample: Duration, count: u64) -> Duration {
    if count <= 1 {
        return sample;
    }
    let previous_secs = previous.as_secs_f64();
    let next = previous_secs + (sample.as_secs_f64() - previous_secs) / count as f64;
    Duration::try_from_secs_f64(next.max(0.0)).unwrap_or(previous)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn breaker(failure_threshold: u32, recovery_timeout: Duration, success_threshold: u32) -> CircuitBreaker {
        CircuitBreaker::new(
            "test".to_string(),
            CircuitBreakerConfig {
                failure_threshold,
                recovery_timeout,
                success_threshold,
            },
        )
    }

    async fn fail(circuit: &CircuitBreaker) {
        let _ = circuit.call(|| async { Err::<(), _>("error") }).await;
    }

    async fn succeed(circuit: &CircuitBreaker) {
        let _ = circuit.call(|| async { Ok::<_, String>(()) }).await;
    }

    #[test]
    fn test_running_mean_handles_large_counts() {
        let ms = Duration::from_millis;
        let near = |a: Duration, b: Duration| (a.as_secs_f64() - b.as_secs_f64()).abs() < 1e-6;

        assert_eq!(running_mean(Duration::ZERO, ms(10), 1), ms(10));
        assert!(near(running_mean(ms(10), ms(30), 2), ms(20)));
        assert!(near(running_mean(ms(20), ms(20), (1 << 32) + 1), ms(20)));
    }

    #[tokio::test]
    async fn test_circuit_breaker_normal_operation() {
        let circuit = breaker(3, Duration::from_millis(100), 2);

        assert_eq!(circuit.state(), CircuitState::Closed);

        let result = circuit.call(|| async { Ok::<_, String>("success") }).await;
        assert_eq!(result.unwrap(), "success");

        let stats = circuit.stats();
        assert_eq!(stats.total_calls, 1);
        assert_eq!(stats.total_successes, 1);
        assert_eq!(stats.total_failures, 0);
    }

    #[tokio::test]
    async fn test_opens_exactly_at_threshold() {
        let circuit = breaker(3, Duration::from_secs(60), 1);

        fail(&circuit).await;
        fail(&circuit).await;
        assert_eq!(circuit.state(), CircuitState::Closed);
        assert_eq!(circuit.stats().failure_count, 2);

        fail(&circuit).await;
        assert_eq!(circuit.state(), CircuitState::Open);
        // Counters reset on transition
        assert_eq!(circuit.stats().failure_count, 0);
        assert_eq!(circuit.stats().times_opened, 1);
    }

    #[tokio::test]
    async fn test_success_resets_failure_count() {
        let circuit = breaker(3, Duration::from_secs(60), 1);

        fail(&circuit).await;
        fail(&circuit).await;
        succeed(&circuit).await;
        assert_eq!(circuit.stats().failure_count, 0);

        fail(&circuit).await;
        fail(&circuit).await;
        assert_eq!(circuit.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_open_breaker_short_circuits() {
        let circuit = breaker(1, Duration::from_secs(60), 1);
        fail(&circuit).await;

        let invoked = AtomicUsize::new(0);
        let result = circuit
            .call(|| async {
                invoked.fetch_add(1, Ordering::SeqCst);
                Ok::<_, String>("should not execute")
            })
            .await;

        assert!(matches!(result, Err(CircuitBreakerError::CircuitOpen { .. })));
        assert_eq!(invoked.load(Ordering::SeqCst), 0);
        assert_eq!(circuit.stats().total_rejections, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_after_recovery_timeout() {
        let circuit = breaker(1, Duration::from_millis(50), 2);
        fail(&circuit).await;
        assert_eq!(circuit.state(), CircuitState::Open);

        tokio::time::advance(Duration::from_millis(60)).await;

        succeed(&circuit).await;
        assert_eq!(circuit.state(), CircuitState::HalfOpen);
        assert_eq!(circuit.stats().success_count, 1);

        succeed(&circuit).await;
        assert_eq!(circuit.state(), CircuitState::Closed);
        assert_eq!(circuit.stats().success_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_failure_reopens_half_open() {
        let circuit = breaker(5, Duration::from_millis(10), 10);
        for _ in 0..5 {
            fail(&circuit).await;
        }
        tokio::time::advance(Duration::from_millis(20)).await;

        succeed(&circuit).await;
        succeed(&circuit).await;
        assert_eq!(circuit.state(), CircuitState::HalfOpen);

        fail(&circuit).await;
        assert_eq!(circuit.state(), CircuitState::Open);
        assert_eq!(circuit.stats().times_opened, 2);
    }

    #[tokio::test]
    async fn test_late_failure_while_open_does_not_count() {
        let circuit = breaker(1, Duration::from_secs(60), 1);
        fail(&circuit).await;
        assert_eq!(circuit.state(), CircuitState::Open);

        circuit.record_failure_manual(Duration::from_millis(5));
        let stats = circuit.stats();
        assert_eq!(stats.state, CircuitState::Open);
        assert_eq!(stats.failure_count, 0);
        assert_eq!(stats.times_opened, 1);
        assert_eq!(stats.total_failures, 2);
    }

    #[tokio::test]
    async fn test_concurrent_failures_open_once() {
        let circuit = Arc::new(breaker(3, Duration::from_secs(60), 1));
        let mut handles = Vec::new();
        for _ in 0..16 {
            let circuit = Arc::clone(&circuit);
            handles.push(tokio::spawn(async move {
                circuit.record_failure_manual(Duration::from_millis(1));
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let stats = circuit.stats();
        assert_eq!(stats.state, CircuitState::Open);
        assert_eq!(stats.times_opened, 1);
        assert_eq!(stats.total_failures, 16);
    }

    #[tokio::test]
    async fn test_operation_error_is_propagated() {
        let circuit = breaker(5, Duration::from_secs(60), 1);
        let result = circuit.call(|| async { Err::<(), _>("boom") }).await;
        let err = result.unwrap_err();
        assert!(!err.is_circuit_open());
        assert_eq!(err.into_operation_error(), Some("boom"));
        assert!(circuit.stats().last_failure_time.is_some());
    }

    #[tokio::test]
    async fn test_force_operations() {
        let circuit = breaker(1, Duration::from_secs(1), 1);

        circuit.force_open();
        assert_eq!(circuit.state(), CircuitState::Open);

        circuit.force_closed();
        assert_eq!(circuit.state(), CircuitState::Closed);

        circuit.reset();
        assert_eq!(circuit.stats().times_opened, 0);
    }
}

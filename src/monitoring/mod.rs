//! # Monitoring
//!
//! Observers that sit outside the request path: the error aggregator with its
//! persistent event store, host resource sampling, and the health loop that
//! turns all of it into an aggregate status and alerts.

pub mod error_aggregator;
pub mod event_store;
pub mod health;
pub mod host_metrics;

pub use error_aggregator::{
    ErrorAggregator, ErrorEvent, ErrorSeverity, ErrorStats, PruneReport, RecoveryHandler,
    ServiceErrorCount, SeverityCounts,
};
pub use event_store::{ErrorEventStore, InMemoryErrorEventStore, SqliteErrorEventStore};
pub use health::{Alert, AlertSeverity, HealthCheck, HealthMonitor, HealthReport, HealthStatus};
pub use host_metrics::{FixedHostMetrics, HostMetrics, HostMetricsSource, SystemHostMetrics};

//! # Resilience Module
//!
//! Fault isolation for named dependencies. Each dependency gets its own
//! circuit breaker so failures in one cannot exhaust resources needed by
//! another.
//!
//! ## Usage
//!
//! ```rust
//! use riskwatch_core::resilience::{CircuitBreaker, CircuitBreakerConfig};
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = CircuitBreakerConfig {
//!     failure_threshold: 5,
//!     recovery_timeout: Duration::from_secs(30),
//!     success_threshold: 2,
//! };
//!
//! let circuit_breaker = CircuitBreaker::new("sanctions_api".to_string(), config);
//!
//! let result = circuit_breaker
//!     .call(|| async { Ok::<&str, std::io::Error>("screened") })
//!     .await?;
//! assert_eq!(result, "screened");
//! # Ok(())
//! # }
//! ```

pub mod circuit_breaker;
pub mod config;
pub mod manager;
pub mod metrics;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerError, CircuitState};
pub use config::CircuitBreakerConfig;
pub use manager::CircuitBreakerManager;
pub use metrics::{BreakerStats, StateSummary, SystemBreakerStats};

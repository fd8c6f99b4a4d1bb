//! Error types for the Riskwatch resilience core.
//!
//! Component-level failures that callers are expected to handle (pool
//! exhaustion, open breakers, rejected tasks) have their own typed errors in
//! their modules. `RiskwatchError` covers everything that crosses component
//! boundaries or aborts startup.

use crate::config::ConfigurationError;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum RiskwatchError {
    #[error("Configuration error: {0}")]
    ConfigurationError(String),
    #[error("Database error: {0}")]
    DatabaseError(String),
    #[error("Validation error: {0}")]
    ValidationError(String),
    #[error("Invalid state: {0}")]
    InvalidState(String),
    #[error("Timeout error: {0}")]
    Timeout(String),
    #[error("Circuit breaker open: {0}")]
    CircuitBreakerOpen(String),
    #[error("Task error: {0}")]
    TaskError(String),
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<serde_json::Error> for RiskwatchError {
    fn from(error: serde_json::Error) -> Self {
        RiskwatchError::ValidationError(format!("JSON serialization error: {error}"))
    }
}

impl From<sqlx::Error> for RiskwatchError {
    fn from(err: sqlx::Error) -> Self {
        RiskwatchError::DatabaseError(err.to_string())
    }
}

impl From<ConfigurationError> for RiskwatchError {
    fn from(err: ConfigurationError) -> Self {
        RiskwatchError::ConfigurationError(err.to_string())
    }
}

pub type RiskwatchResult<T> = anyhow::Result<T, RiskwatchError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_includes_category() {
        let err = RiskwatchError::CircuitBreakerOpen("database".to_string());
        assert_eq!(err.to_string(), "Circuit breaker open: database");

        let err = RiskwatchError::Timeout("task 42".to_string());
        assert_eq!(err.to_string(), "Timeout error: task 42");
    }

    #[test]
    fn test_configuration_error_conversion() {
        let config_err = ConfigurationError::ValidationError {
            error: "pool_size must be greater than 0".to_string(),
        };
        let err: RiskwatchError = config_err.into();
        assert!(matches!(err, RiskwatchError::ConfigurationError(_)));
        assert!(err.to_string().contains("pool_size"));
    }

    #[test]
    fn test_json_error_conversion() {
        let json_err = serde_json::from_str::<serde_json::Value>("{not json").unwrap_err();
        let err: RiskwatchError = json_err.into();
        assert!(matches!(err, RiskwatchError::ValidationError(_)));
    }
}

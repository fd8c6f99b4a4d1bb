//! # Configuration Loader
//!
//! Loads `riskwatch.yaml`, merges the block for the active environment over the
//! base values and validates the result.
//!
//! ```yaml
//! pool:
//!   pool_size: 10
//!   max_overflow: 20
//! production:
//!   pool:
//!     pool_size: 25
//! ```

use super::error::{ConfigResult, ConfigurationError};
use super::RiskwatchConfig;
use serde_yaml::Value as YamlValue;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

/// Environment sections recognised at the top level of the config file
const ENVIRONMENTS: [&str; 3] = ["development", "test", "production"];

/// Loaded, validated configuration plus the environment it was resolved for
#[derive(Debug, Clone)]
pub struct ConfigManager {
    config: RiskwatchConfig,
    environment: String,
    source: Option<PathBuf>,
}

impl ConfigManager {
    /// Wrap an in-memory configuration (validated)
    pub fn from_config(config: RiskwatchConfig, environment: &str) -> ConfigResult<Arc<Self>> {
        config.validate()?;
        Ok(Arc::new(Self {
            config,
            environment: environment.to_string(),
            source: None,
        }))
    }

    /// Load configuration from a YAML file for an explicit environment
    pub fn load_from_file(
        path: impl AsRef<Path>,
        environment: &str,
    ) -> ConfigResult<Arc<ConfigManager>> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(ConfigurationError::ConfigFileNotFound {
                path: path.to_path_buf(),
            });
        }

        debug!(
            environment = environment,
            path = %path.display(),
            "Loading configuration"
        );

        let content = Self::read_config_file_safely(path)?;
        let config = Self::parse_with_environment(&content, environment, &path.display().to_string())?;
        config.validate()?;

        info!(
            environment = environment,
            pool_size = config.pool.pool_size,
            max_overflow = config.pool.max_overflow,
            worker_count = config.task_processor.worker_count,
            "Configuration loaded successfully"
        );

        Ok(Arc::new(ConfigManager {
            config,
            environment: environment.to_string(),
            source: Some(path.to_path_buf()),
        }))
    }

    /// Parse YAML text, applying the overrides for `environment`
    pub fn parse_with_environment(
        yaml_content: &str,
        environment: &str,
        origin: &str,
    ) -> ConfigResult<RiskwatchConfig> {
        if !ENVIRONMENTS.contains(&environment) {
            return Err(ConfigurationError::EnvironmentConfigError {
                environment: environment.to_string(),
                error: format!("expected one of {ENVIRONMENTS:?}"),
            });
        }

        let mut yaml_data: YamlValue = if yaml_content.trim().is_empty() {
            YamlValue::Mapping(Default::default())
        } else {
            serde_yaml::from_str(yaml_content).map_err(|e| ConfigurationError::InvalidYaml {
                file_path: origin.to_string(),
                error: e.to_string(),
            })?
        };

        if let Some(env_overrides) = yaml_data
            .get(YamlValue::String(environment.to_string()))
            .cloned()
        {
            debug!(environment = environment, "Applying environment-specific overrides");
            Self::merge_yaml_values(&mut yaml_data, env_overrides)?;
        }

        if let YamlValue::Mapping(ref mut map) = yaml_data {
            for env in ENVIRONMENTS {
                map.remove(YamlValue::String(env.to_string()));
            }
        }

        serde_yaml::from_value(yaml_data).map_err(|e| ConfigurationError::InvalidYaml {
            file_path: origin.to_string(),
            error: format!("Failed to deserialize configuration: {e}"),
        })
    }

    pub fn config(&self) -> &RiskwatchConfig {
        &self.config
    }

    pub fn environment(&self) -> &str {
        &self.environment
    }

    /// File the configuration came from, if any
    pub fn source(&self) -> Option<&Path> {
        self.source.as_deref()
    }

    /// Environment name for binaries that want one; the library never calls this.
    pub fn detect_environment() -> String {
        std::env::var("RISKWATCH_ENV").unwrap_or_else(|_| "development".to_string())
    }

    fn read_config_file_safely(path: &Path) -> ConfigResult<String> {
        const MAX_CONFIG_FILE_SIZE: u64 = 1024 * 1024;

        let metadata = std::fs::metadata(path).map_err(|e| ConfigurationError::FileReadError {
            file_path: path.display().to_string(),
            error: e.to_string(),
        })?;

        if !metadata.is_file() {
            return Err(ConfigurationError::invalid_value(
                "file_type",
                "directory or special file",
                "Configuration path must point to a regular file",
            ));
        }

        if metadata.len() > MAX_CONFIG_FILE_SIZE {
            return Err(ConfigurationError::invalid_value(
                "file_size",
                metadata.len(),
                "Configuration file exceeds the 1MB limit",
            ));
        }

        std::fs::read_to_string(path).map_err(|e| ConfigurationError::FileReadError {
            file_path: path.display().to_string(),
            error: e.to_string(),
        })
    }

    /// Recursively merge YAML values (environment overrides into base config)
    fn merge_yaml_values(base: &mut YamlValue, override_value: YamlValue) -> ConfigResult<()> {
        match (&mut *base, override_value) {
            (YamlValue::Mapping(base_map), YamlValue::Mapping(override_map)) => {
                for (key, value) in override_map {
                    if let Some(existing_value) = base_map.get_mut(&key) {
                        Self::merge_yaml_values(existing_value, value)?;
                    } else {
                        base_map.insert(key, value);
                    }
                }
            }
            (base_ref, override_val) => {
                *base_ref = override_val;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn create_test_config_yaml() -> &'static str {
        r#"
pool:
  database_url: "sqlite::memory:"
  pool_size: 4
  max_overflow: 2
  recycle_time_ms: 600000

circuit_breakers:
  default_config:
    failure_threshold: 5
    recovery_timeout_ms: 30000
    success_threshold: 2
  component_configs:
    payment_processing:
      failure_threshold: 3
      recovery_timeout_ms: 60000
      success_threshold: 1

task_processor:
  worker_count: 2
  queue_size: 50

test:
  pool:
    pool_size: 2
  task_processor:
    retry_backoff:
      base_delay_ms: 10
      multiplier: 2.0
      max_delay_ms: 100

production:
  pool:
    pool_size: 25
    max_overflow: 10
"#
    }

    fn write_config(content: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_basic_config_loading() {
        let file = write_config(create_test_config_yaml());
        let manager = ConfigManager::load_from_file(file.path(), "development").unwrap();

        assert_eq!(manager.environment(), "development");
        assert_eq!(manager.config().pool.pool_size, 4);
        assert_eq!(manager.config().pool.max_overflow, 2);
        assert_eq!(manager.config().task_processor.worker_count, 2);
        assert!(manager.config().task_processor.retry_backoff.is_none());
        assert_eq!(manager.source(), Some(file.path()));
    }

    #[test]
    fn test_environment_specific_overrides() {
        let file = write_config(create_test_config_yaml());

        let test_manager = ConfigManager::load_from_file(file.path(), "test").unwrap();
        assert_eq!(test_manager.config().pool.pool_size, 2);
        // Untouched sibling keys survive the merge
        assert_eq!(test_manager.config().pool.max_overflow, 2);
        assert!(test_manager.config().task_processor.retry_backoff.is_some());

        let prod_manager = ConfigManager::load_from_file(file.path(), "production").unwrap();
        assert_eq!(prod_manager.config().pool.pool_size, 25);
        assert_eq!(prod_manager.config().pool.max_overflow, 10);
    }

    #[test]
    fn test_component_breaker_configs_loaded() {
        let file = write_config(create_test_config_yaml());
        let manager = ConfigManager::load_from_file(file.path(), "development").unwrap();

        let payment = manager
            .config()
            .circuit_breakers
            .config_for_component("payment_processing");
        assert_eq!(payment.failure_threshold, 3);
        assert_eq!(payment.success_threshold, 1);
    }

    #[test]
    fn test_missing_sections_use_defaults() {
        let config = ConfigManager::parse_with_environment("pool:\n  pool_size: 3\n", "test", "inline")
            .unwrap();
        assert_eq!(config.pool.pool_size, 3);
        assert_eq!(config.task_processor.queue_size, 1000);
        assert_eq!(config.health.pool_utilization_threshold, 0.9);
    }

    #[test]
    fn test_config_file_not_found() {
        let result = ConfigManager::load_from_file("/nonexistent/riskwatch.yaml", "test");
        assert!(matches!(
            result,
            Err(ConfigurationError::ConfigFileNotFound { .. })
        ));
    }

    #[test]
    fn test_invalid_yaml_rejected() {
        let file = write_config("pool: [unclosed");
        let result = ConfigManager::load_from_file(file.path(), "test");
        assert!(matches!(result, Err(ConfigurationError::InvalidYaml { .. })));
    }

    #[test]
    fn test_unknown_environment_rejected() {
        let result = ConfigManager::parse_with_environment("", "staging", "inline");
        assert!(matches!(
            result,
            Err(ConfigurationError::EnvironmentConfigError { .. })
        ));
    }

    #[test]
    fn test_validation_runs_on_load() {
        let file = write_config("task_processor:\n  worker_count: 0\n");
        let result = ConfigManager::load_from_file(file.path(), "test");
        assert!(matches!(result, Err(ConfigurationError::InvalidValue { .. })));
    }
}

//! Configuration Loader
//!
//! Layers a configuration file (TOML, YAML or JSON, chosen by extension) under
//! `COURIER__SECTION__KEY` environment overrides, then validates the result.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use config::{Config, Environment, File};
use tracing::debug;

use super::error::{ConfigResult, ConfigurationError};
use super::BusConfig;

/// Environment variable prefix for overrides
pub const ENV_PREFIX: &str = "COURIER";

/// Loaded, validated configuration
#[derive(Debug)]
pub struct ConfigManager {
    config: BusConfig,
    source: Option<PathBuf>,
}

impl ConfigManager {
    /// Load configuration from a file with environment overrides
    pub fn load_from_file(path: impl AsRef<Path>) -> ConfigResult<Arc<ConfigManager>> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(ConfigurationError::ConfigFileNotFound {
                path: path.to_path_buf(),
            });
        }

        debug!("Loading configuration from: {}", path.display());

        let settings = Config::builder()
            .add_source(File::from(path))
            .add_source(Self::environment())
            .build()?;

        let config = Self::deserialize(settings, &path.display().to_string())?;

        Ok(Arc::new(Self {
            config,
            source: Some(path.to_path_buf()),
        }))
    }

    /// Build configuration from defaults and environment overrides only
    pub fn from_env() -> ConfigResult<Arc<ConfigManager>> {
        let settings = Config::builder().add_source(Self::environment()).build()?;
        let config = Self::deserialize(settings, "environment")?;

        Ok(Arc::new(Self {
            config,
            source: None,
        }))
    }

    /// Wrap an already-built configuration after validating it
    pub fn from_config(config: BusConfig) -> ConfigResult<Arc<ConfigManager>> {
        config.validate()?;
        Ok(Arc::new(Self {
            config,
            source: None,
        }))
    }

    pub fn config(&self) -> &BusConfig {
        &self.config
    }

    /// File the configuration was read from, if any
    pub fn source(&self) -> Option<&Path> {
        self.source.as_deref()
    }

    fn environment() -> Environment {
        Environment::with_prefix(ENV_PREFIX)
            .prefix_separator("__")
            .separator("__")
            .try_parsing(true)
    }

    fn deserialize(settings: Config, source_name: &str) -> ConfigResult<BusConfig> {
        let config: BusConfig =
            settings
                .try_deserialize()
                .map_err(|e| ConfigurationError::LoadFailed {
                    source_name: source_name.to_string(),
                    error: e.to_string(),
                })?;

        config.validate()?;

        debug!(
            "Configuration loaded successfully: {}",
            serde_json::to_string(&config).unwrap_or_else(|_| "[serialization error]".to_string())
        );

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_load_from_toml_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
[router]
default_max_retries = 6

[delivery]
exponential_backoff = true
worker_count = 2

[events]
channel_capacity = 64
"#
        )
        .unwrap();

        let manager = ConfigManager::load_from_file(file.path()).unwrap();
        let config = manager.config();
        assert_eq!(config.router.default_max_retries, 6);
        assert!(config.delivery.exponential_backoff);
        assert_eq!(config.delivery.worker_count, Some(2));
        assert_eq!(config.events.channel_capacity, 64);
        assert_eq!(config.delivery.permits_per_worker, 5);
        assert_eq!(manager.source(), Some(file.path()));
    }

    #[test]
    fn test_missing_file_is_reported() {
        let err = ConfigManager::load_from_file("/definitely/not/here.toml").unwrap_err();
        assert!(matches!(err, ConfigurationError::ConfigFileNotFound { .. }));
    }

    #[test]
    fn test_invalid_file_values_fail_validation() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "[delivery]\npermits_per_worker = 0").unwrap();

        let err = ConfigManager::load_from_file(file.path()).unwrap_err();
        assert!(matches!(err, ConfigurationError::InvalidValue { .. }));
    }
}

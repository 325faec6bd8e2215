//! Configuration loading with hierarchical merging.

use anyhow::{Context, Result};
use figment::providers::{Env, Format, Serialized, Yaml};
use figment::Figment;
use thiserror::Error;

use crate::domain::models::Config;

/// Configuration validation errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid max_workers: {0}. Must be between 1 and 100")]
    InvalidMaxWorkers(usize),

    #[error("Invalid min_workers: {min}. Must not exceed max_workers ({max})")]
    InvalidMinWorkers { min: usize, max: usize },

    #[error("Invalid tick_ms: {0}. Must be at least 10")]
    InvalidTickMs(u64),

    #[error("Invalid log level: {0}. Must be one of: trace, debug, info, warn, error")]
    InvalidLogLevel(String),

    #[error("Invalid log format: {0}. Must be one of: json, pretty")]
    InvalidLogFormat(String),

    #[error("Database path cannot be empty")]
    EmptyDatabasePath,

    #[error("Invalid max_connections: {0}. Must be at least 1")]
    InvalidMaxConnections(u32),

    #[error("Memory namespace cannot be empty")]
    EmptyNamespace,
}

/// Loader with hierarchical merging.
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration.
    ///
    /// Precedence (lowest to highest):
    /// 1. Programmatic defaults (Serialized)
    /// 2. .orchflow/config.yaml (project config)
    /// 3. .orchflow/local.yaml (local overrides, optional)
    /// 4. Environment variables (ORCHFLOW_* prefix, highest priority)
    pub fn load() -> Result<Config> {
        let config: Config = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Yaml::file(".orchflow/config.yaml"))
            .merge(Yaml::file(".orchflow/local.yaml"))
            .merge(Env::prefixed("ORCHFLOW_").split("__"))
            .extract()
            .context("Failed to extract configuration from figment")?;

        Self::validate(&config)?;
        Ok(config)
    }

    /// Load configuration from a specific file.
    pub fn load_from_file(path: impl AsRef<std::path::Path>) -> Result<Config> {
        let config: Config = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Yaml::file(path.as_ref()))
            .extract()
            .context(format!(
                "Failed to load config from {}",
                path.as_ref().display()
            ))?;

        Self::validate(&config)?;
        Ok(config)
    }

    /// Validate configuration after loading.
    pub fn validate(config: &Config) -> Result<(), ConfigError> {
        if config.runtime.max_workers == 0 || config.runtime.max_workers > 100 {
            return Err(ConfigError::InvalidMaxWorkers(config.runtime.max_workers));
        }
        if config.runtime.min_workers > config.runtime.max_workers {
            return Err(ConfigError::InvalidMinWorkers {
                min: config.runtime.min_workers,
                max: config.runtime.max_workers,
            });
        }
        if config.scheduler.tick_ms < 10 {
            return Err(ConfigError::InvalidTickMs(config.scheduler.tick_ms));
        }

        if config.database.path.is_empty() {
            return Err(ConfigError::EmptyDatabasePath);
        }
        if config.database.max_connections == 0 {
            return Err(ConfigError::InvalidMaxConnections(
                config.database.max_connections,
            ));
        }

        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&config.logging.level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(config.logging.level.clone()));
        }
        let valid_log_formats = ["json", "pretty"];
        if !valid_log_formats.contains(&config.logging.format.as_str()) {
            return Err(ConfigError::InvalidLogFormat(config.logging.format.clone()));
        }

        if config.memory.namespace.trim().is_empty() {
            return Err(ConfigError::EmptyNamespace);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        assert!(ConfigLoader::validate(&Config::default()).is_ok());
    }

    #[test]
    fn test_invalid_max_workers() {
        let mut config = Config::default();
        config.runtime.max_workers = 0;
        assert!(matches!(
            ConfigLoader::validate(&config),
            Err(ConfigError::InvalidMaxWorkers(0))
        ));
    }

    #[test]
    fn test_min_exceeding_max() {
        let mut config = Config::default();
        config.runtime.min_workers = 10;
        config.runtime.max_workers = 4;
        assert!(matches!(
            ConfigLoader::validate(&config),
            Err(ConfigError::InvalidMinWorkers { .. })
        ));
    }

    #[test]
    fn test_invalid_log_level() {
        let mut config = Config::default();
        config.logging.level = "verbose".to_string();
        assert!(ConfigLoader::validate(&config).is_err());
    }

    #[test]
    fn test_load_from_yaml_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(
            &path,
            "runtime:\n  max_workers: 12\nscheduler:\n  discipline: priority\n  tick_ms: 50\n",
        )
        .unwrap();

        let config = ConfigLoader::load_from_file(&path).unwrap();
        assert_eq!(config.runtime.max_workers, 12);
        assert_eq!(config.scheduler.tick_ms, 50);
        assert_eq!(
            config.scheduler.discipline,
            crate::domain::models::SchedulingDiscipline::Priority
        );
        // Untouched sections keep their defaults
        assert_eq!(config.memory.namespace, "orchflow");
    }
}

//! Configuration loading with hierarchical merging.

use anyhow::{Context, Result};
use figment::providers::{Env, Format, Serialized, Yaml};
use figment::Figment;
use thiserror::Error;
use tracing::warn;

use crate::domain::models::Config;

/// Configuration validation errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid max_agents: {0}. Must be between 1 and 1000")]
    InvalidMaxAgents(u32),

    #[error("Invalid log level: {0}. Must be one of: debug, info, warn, error")]
    InvalidLogLevel(String),

    #[error("Database path cannot be empty")]
    EmptyDataPath,

    #[error("Invalid max_connections: {0}. Must be at least 1")]
    InvalidMaxConnections(usize),

    #[error("Invalid interval: {name} must be positive")]
    InvalidInterval { name: &'static str },

    #[error("Invalid queue size: {0}. Must be at least 1")]
    InvalidQueueSize(usize),

    #[error(
        "Invalid backoff configuration: initial_backoff_ms ({0}) must be less than max_backoff_ms ({1})"
    )]
    InvalidBackoff(u64, u64),
}

/// Environment keys the loader understands, used to warn on typos.
const KNOWN_ENV_KEYS: &[&str] = &[
    "DATA_PATH",
    "AUTH_TOKEN",
    "BIND_HOST",
    "BIND_PORT",
    "LOG_LEVEL",
    "MAX_AGENTS",
    "SCALE_INTERVAL_MS",
    "METRICS_INTERVAL_MS",
    "MAX_CONNECTIONS",
];

/// Configuration loader with hierarchical merging.
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration with precedence (lowest to highest):
    /// 1. Programmatic defaults
    /// 2. `apiary.yaml` in the working directory
    /// 3. Environment variables (`APIARY_` prefix)
    pub fn load() -> Result<Config> {
        Self::warn_unknown_env_keys();

        let config: Config = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Yaml::file("apiary.yaml"))
            .merge(Env::prefixed("APIARY_").split("__"))
            .extract()
            .context("Failed to extract configuration")?;

        Self::validate(&config)?;
        Ok(config)
    }

    /// Load configuration from a specific file, for tests and tooling.
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

    /// Warn about `APIARY_*` variables that match no known top-level key.
    /// Nested keys use the `SECTION__FIELD` form and are not checked.
    fn warn_unknown_env_keys() {
        for (name, _) in std::env::vars() {
            let Some(suffix) = name.strip_prefix("APIARY_") else {
                continue;
            };
            if suffix.contains("__") {
                continue;
            }
            if !KNOWN_ENV_KEYS.contains(&suffix) {
                warn!(key = %name, "Ignoring unknown configuration key");
            }
        }
    }

    /// Validate configuration after loading.
    pub fn validate(config: &Config) -> Result<(), ConfigError> {
        if config.max_agents == 0 || config.max_agents > 1000 {
            return Err(ConfigError::InvalidMaxAgents(config.max_agents));
        }
        if config.data_path.is_empty() {
            return Err(ConfigError::EmptyDataPath);
        }

        let valid_log_levels = ["debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&config.log_level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(config.log_level.clone()));
        }

        if config.max_connections == 0 {
            return Err(ConfigError::InvalidMaxConnections(config.max_connections));
        }
        if config.scale_interval_ms == 0 {
            return Err(ConfigError::InvalidInterval { name: "scale_interval_ms" });
        }
        if config.metrics_interval_ms == 0 {
            return Err(ConfigError::InvalidInterval { name: "metrics_interval_ms" });
        }
        if config.coordinator.max_queue_size == 0 {
            return Err(ConfigError::InvalidQueueSize(config.coordinator.max_queue_size));
        }
        if config.retry.initial_backoff_ms >= config.retry.max_backoff_ms {
            return Err(ConfigError::InvalidBackoff(
                config.retry.initial_backoff_ms,
                config.retry.max_backoff_ms,
            ));
        }
        Ok(())
    }
}

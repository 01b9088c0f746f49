//! Application configuration.
//!
//! Aggregates configuration from all modules into a single Config struct
//! that can be loaded from YAML files or environment variables.

mod client;
mod messaging;

pub use client::{LogSinkConfig, ServiceConfig};
pub use messaging::{BrokerConfig, ConsumerConfig, DEFAULT_AMQP_PORT};

use serde::Deserialize;

use crate::bus::Topology;

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "tasknotify.yaml";
/// Environment variable for configuration file path.
pub const CONFIG_ENV_VAR: &str = "TASKNOTIFY_CONFIG";
/// Prefix for configuration environment variables.
pub const CONFIG_ENV_PREFIX: &str = "TASKNOTIFY";
/// Environment variable for logging configuration.
pub const LOG_ENV_VAR: &str = "TASKNOTIFY_LOG";
/// Environment variable selecting the log output format (`json` or text).
pub const LOG_FORMAT_ENV_VAR: &str = "TASKNOTIFY_LOG_FORMAT";

/// Legacy environment variable for the broker host.
pub const RABBITMQ_HOST_ENV_VAR: &str = "RABBITMQ_HOST";
/// Legacy environment variable for the broker port.
pub const RABBITMQ_PORT_ENV_VAR: &str = "RABBITMQ_PORT";
/// Legacy environment variable for the log service base address.
pub const LOGSERVICE_URL_ENV_VAR: &str = "LOGSERVICE_URL";

/// Configuration loading errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Configuration error: {0}")]
    Load(#[from] ::config::ConfigError),
}

/// Main application configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Producing service identity.
    pub service: ServiceConfig,
    /// Broker connection and topology.
    pub broker: BrokerConfig,
    /// HTTP log sink.
    pub log_sink: LogSinkConfig,
    /// Log consumer.
    pub consumer: ConsumerConfig,
}

impl Config {
    /// Load configuration from file and environment.
    ///
    /// Configuration sources (in order of priority, later overrides earlier):
    /// 1. `tasknotify.yaml` in current directory (if exists)
    /// 2. File specified by `path` argument (if provided)
    /// 3. File specified by `CONFIG_ENV_VAR` environment variable (if set)
    /// 4. Environment variables with `CONFIG_ENV_PREFIX` prefix
    /// 5. Legacy `RABBITMQ_HOST`, `RABBITMQ_PORT` and `LOGSERVICE_URL`
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        use ::config::{Config as ConfigLib, Environment, File, FileFormat};

        let mut builder = ConfigLib::builder()
            .add_source(File::new(DEFAULT_CONFIG_FILE, FileFormat::Yaml).required(false));

        if let Some(config_path) = path {
            builder = builder.add_source(File::new(config_path, FileFormat::Yaml).required(true));
        }

        if let Ok(config_path) = std::env::var(CONFIG_ENV_VAR) {
            builder = builder.add_source(File::new(&config_path, FileFormat::Yaml).required(true));
        }

        let config = builder
            .add_source(
                Environment::with_prefix(CONFIG_ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            // Legacy env vars for backwards compatibility
            .set_override_option("broker.host", std::env::var(RABBITMQ_HOST_ENV_VAR).ok())?
            .set_override_option("broker.port", std::env::var(RABBITMQ_PORT_ENV_VAR).ok())?
            .set_override_option("log_sink.base_url", std::env::var(LOGSERVICE_URL_ENV_VAR).ok())?
            .build()?;

        let config: Config = config.try_deserialize()?;
        Ok(config)
    }

    /// Broker topology for this deployment.
    pub fn topology(&self) -> Topology {
        messaging::topology(&self.broker, &self.consumer)
    }

    /// Create config for testing.
    pub fn for_test() -> Self {
        Self::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::io::Write;

    fn clear_env() {
        for var in [
            CONFIG_ENV_VAR,
            RABBITMQ_HOST_ENV_VAR,
            RABBITMQ_PORT_ENV_VAR,
            LOGSERVICE_URL_ENV_VAR,
            "TASKNOTIFY__BROKER__HOST",
            "TASKNOTIFY__LOG_SINK__TIMEOUT_MS",
        ] {
            std::env::remove_var(var);
        }
    }

    #[test]
    fn test_config_default() {
        let config = Config::default();
        assert_eq!(config.broker.host, "localhost");
        assert_eq!(config.broker.port, 5672);
        assert_eq!(config.log_sink.base_url, "http://localhost:8081");
        assert_eq!(config.service.source, "TaskAPI");
        assert_eq!(config.topology(), Topology::default());
    }

    #[test]
    #[serial]
    fn test_load_without_sources_uses_defaults() {
        clear_env();
        let config = Config::load(None).unwrap();
        assert_eq!(config.broker.host, "localhost");
        assert_eq!(config.log_sink.timeout_ms, 3_000);
    }

    #[test]
    #[serial]
    fn test_prefixed_env_overrides() {
        clear_env();
        std::env::set_var("TASKNOTIFY__BROKER__HOST", "broker.internal");
        std::env::set_var("TASKNOTIFY__LOG_SINK__TIMEOUT_MS", "1500");

        let config = Config::load(None).unwrap();
        clear_env();

        assert_eq!(config.broker.host, "broker.internal");
        assert_eq!(config.log_sink.timeout_ms, 1500);
    }

    #[test]
    #[serial]
    fn test_legacy_env_overrides() {
        clear_env();
        std::env::set_var("TASKNOTIFY__BROKER__HOST", "ignored");
        std::env::set_var(RABBITMQ_HOST_ENV_VAR, "rabbitmq");
        std::env::set_var(RABBITMQ_PORT_ENV_VAR, "5673");
        std::env::set_var(LOGSERVICE_URL_ENV_VAR, "http://logservice:8081");

        let config = Config::load(None).unwrap();
        clear_env();

        assert_eq!(config.broker.host, "rabbitmq");
        assert_eq!(config.broker.port, 5673);
        assert_eq!(config.log_sink.base_url, "http://logservice:8081");
    }

    #[test]
    #[serial]
    fn test_load_from_yaml_file() {
        clear_env();
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(
            file,
            "service:\n  source: billing\nconsumer:\n  queue: audit_queue\n  prefetch: 16\n"
        )
        .unwrap();

        let config = Config::load(file.path().to_str()).unwrap();

        assert_eq!(config.service.source, "billing");
        assert_eq!(config.consumer.queue, "audit_queue");
        assert_eq!(config.consumer.prefetch, Some(16));
        assert_eq!(config.topology().queue, "audit_queue");
    }

    #[test]
    #[serial]
    fn test_missing_explicit_file_is_an_error() {
        clear_env();
        let result = Config::load(Some("/nonexistent/tasknotify.yaml"));
        assert!(result.is_err());
    }
}

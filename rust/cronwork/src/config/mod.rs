//! Configuration management for cronwork.
//!
//! Configuration is layered: built-in defaults, then optional files
//! `config/cronwork.{yaml,toml,json}`, then `CRONWORK__*` environment
//! variables. A `.env` file is loaded first when present.
//!
//! ```rust,ignore
//! use cronwork::config::AppConfig;
//!
//! let config = AppConfig::load()?;
//! ```

pub mod error;
pub mod validator;

pub use error::{ConfigResult, ConfigurationError};
pub use validator::ConfigValidator;

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Main application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// HTTP server configuration.
    #[serde(default)]
    pub server: ServerConfig,
    /// Storage configuration.
    #[serde(default)]
    pub database: DatabaseConfig,
    /// Execution queue configuration.
    #[serde(default)]
    pub queue: QueueConfig,
    /// Command executor configuration.
    #[serde(default)]
    pub executor: ExecutorConfig,
    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl AppConfig {
    /// Load configuration from environment and config files, then validate it.
    ///
    /// Use [`Self::load_unchecked`] to skip validation.
    pub fn load() -> anyhow::Result<Self> {
        let config = Self::load_unchecked()?;

        ConfigValidator::validate(&config)
            .map_err(|e| anyhow::anyhow!("Configuration validation failed:\n\n{}", e))?;

        Ok(config)
    }

    /// Load configuration without validation.
    pub fn load_unchecked() -> anyhow::Result<Self> {
        // Load .env file if present
        let _ = dotenvy::dotenv();

        let config = config::Config::builder()
            .set_default("server.host", default_host())?
            .set_default("server.port", i64::from(default_port()))?
            .set_default("database.path", default_database_path())?
            .set_default("queue.name", default_queue_name())?
            .set_default("queue.concurrency", default_concurrency() as i64)?
            .add_source(config::File::with_name("config/cronwork").required(false))
            .add_source(
                config::Environment::with_prefix("CRONWORK")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let mut app_config: AppConfig = config.try_deserialize()?;

        if let Ok(path) = std::env::var("DATABASE_PATH") {
            app_config.database.path = path;
        }

        Ok(app_config)
    }
}

/// HTTP server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Host to bind to.
    #[serde(default = "default_host")]
    pub host: String,
    /// API port.
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    3030
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

/// Storage configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// SQLite database file. `:memory:` keeps everything in process.
    #[serde(default = "default_database_path")]
    pub path: String,
}

fn default_database_path() -> String {
    "sqlite.db".to_string()
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_database_path(),
        }
    }
}

/// Execution queue configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Queue name, used in logs.
    #[serde(default = "default_queue_name")]
    pub name: String,
    /// Maximum number of commands running at once.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    /// Attempts per job before it is failed for good.
    #[serde(default = "default_attempts")]
    pub attempts: u32,
    /// How often due jobs are promoted and picked up.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Lifecycle event channel capacity.
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

fn default_queue_name() -> String {
    "executions".to_string()
}

fn default_concurrency() -> usize {
    5
}

fn default_attempts() -> u32 {
    1
}

fn default_poll_interval_ms() -> u64 {
    250
}

fn default_event_capacity() -> usize {
    1024
}

impl QueueConfig {
    /// Poll interval as a `Duration`.
    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            name: default_queue_name(),
            concurrency: default_concurrency(),
            attempts: default_attempts(),
            poll_interval_ms: default_poll_interval_ms(),
            event_capacity: default_event_capacity(),
        }
    }
}

/// Command executor configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorConfig {
    /// Shell used as `<shell> -c <command>`.
    #[serde(default = "default_shell")]
    pub shell: String,
    /// Per-stream output cap, in characters.
    #[serde(default = "default_output_cap")]
    pub output_cap: usize,
}

fn default_shell() -> String {
    "bash".to_string()
}

fn default_output_cap() -> usize {
    10_000
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            shell: default_shell(),
            output_cap: default_output_cap(),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level.
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Whether to use JSON format.
    #[serde(default)]
    pub json: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = AppConfig::default();
        assert_eq!(config.server.port, 3030);
        assert_eq!(config.database.path, "sqlite.db");
        assert_eq!(config.queue.name, "executions");
        assert_eq!(config.queue.concurrency, 5);
        assert_eq!(config.queue.attempts, 1);
        assert_eq!(config.queue.poll_interval(), Duration::from_millis(250));
        assert_eq!(config.executor.output_cap, 10_000);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_partial_sections_fill_defaults() {
        let config: AppConfig =
            serde_json::from_str(r#"{"queue":{"concurrency":2},"server":{"port":9000}}"#)
                .unwrap();
        assert_eq!(config.queue.concurrency, 2);
        assert_eq!(config.queue.name, "executions");
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.server.host, "0.0.0.0");
    }
}

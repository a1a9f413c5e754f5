//! Startup validation of the loaded configuration.

use super::error::{ConfigResult, ConfigurationError};
use super::AppConfig;

const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// Checks the loaded configuration and reports every problem at once.
#[derive(Debug)]
pub struct ConfigValidator;

impl ConfigValidator {
    /// Validate the entire application configuration.
    ///
    /// Returns `Ok(())` if valid, or a `ConfigurationError` with all issues.
    pub fn validate(config: &AppConfig) -> ConfigResult<()> {
        let mut errors = Vec::new();

        if config.server.host.trim().is_empty() {
            errors.push(ConfigurationError::missing_required(
                "server.host",
                "binding the HTTP listener",
                "CRONWORK__SERVER__HOST",
            ));
        }

        if config.database.path.trim().is_empty() {
            errors.push(ConfigurationError::missing_required(
                "database.path",
                "storing task definitions and execution history",
                "DATABASE_PATH",
            ));
        }

        if config.queue.name.trim().is_empty() {
            errors.push(ConfigurationError::missing_required(
                "queue.name",
                "naming the execution queue",
                "CRONWORK__QUEUE__NAME",
            ));
        }

        if config.queue.concurrency == 0 {
            errors.push(ConfigurationError::invalid(
                "queue.concurrency must be at least 1",
                "Set CRONWORK__QUEUE__CONCURRENCY to a positive number (default 5).",
            ));
        }

        if config.queue.attempts == 0 {
            errors.push(ConfigurationError::invalid(
                "queue.attempts must be at least 1",
                "Set CRONWORK__QUEUE__ATTEMPTS to 1 to disable retries.",
            ));
        }

        if config.queue.poll_interval_ms == 0 {
            errors.push(ConfigurationError::invalid(
                "queue.poll_interval_ms must be positive",
                "Set CRONWORK__QUEUE__POLL_INTERVAL_MS (default 250).",
            ));
        }

        if config.queue.event_capacity == 0 {
            errors.push(ConfigurationError::invalid(
                "queue.event_capacity must be positive",
                "Set CRONWORK__QUEUE__EVENT_CAPACITY (default 1024).",
            ));
        }

        if config.executor.shell.trim().is_empty() {
            errors.push(ConfigurationError::missing_required(
                "executor.shell",
                "running task commands",
                "CRONWORK__EXECUTOR__SHELL",
            ));
        }

        if config.executor.output_cap == 0 {
            errors.push(ConfigurationError::invalid(
                "executor.output_cap must be positive",
                "Set CRONWORK__EXECUTOR__OUTPUT_CAP (default 10000).",
            ));
        }

        if !LOG_LEVELS.contains(&config.logging.level.to_lowercase().as_str()) {
            errors.push(ConfigurationError::invalid(
                format!("unknown log level '{}'", config.logging.level),
                format!("Use one of: {}.", LOG_LEVELS.join(", ")),
            ));
        }

        ConfigurationError::collect(errors)
    }
}

//! Orchestrator configuration.
//!
//! This module provides configuration options for the job orchestrator,
//! including polling cadence, concurrency and retry limits, stage timeouts,
//! storage locations, and the external commands and webhook wired in by the
//! binary.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur during configuration operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// An environment variable has an invalid value.
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    /// Configuration validation failed.
    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),
}

/// Configuration for the job orchestrator.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    // Scheduling settings
    /// Interval between readiness polls.
    pub poll_interval: Duration,
    /// Maximum number of jobs processed concurrently.
    pub max_concurrent: usize,

    // Retry settings
    /// Number of failed attempts after which a job fails for good.
    pub max_retries: u32,
    /// Backoff before the first retry; doubled for each further retry.
    pub base_backoff: Duration,

    // Execution settings
    /// Upper bound on every collaborator call.
    pub stage_timeout: Duration,
    /// How long shutdown waits for in-flight jobs before aborting them.
    pub shutdown_timeout: Duration,
    /// Root of the per-job work directories.
    pub temp_dir: PathBuf,
    /// Whether jobs left in progress by a previous run are recovered at start-up.
    pub recover_interrupted: bool,

    // Wiring used by the binary
    /// SQLite connection string.
    pub database_url: String,
    /// Webhook receiving job notifications.
    pub notify_webhook: Option<String>,
    /// Command implementing the produce stage.
    pub produce_command: Option<String>,
    /// Command implementing the assemble stage.
    pub assemble_command: Option<String>,
    /// Command implementing the publish stage.
    pub publish_command: Option<String>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(30),
            max_concurrent: 3,

            max_retries: 3,
            base_backoff: Duration::from_secs(60),

            stage_timeout: Duration::from_secs(1800), // 30 minutes
            shutdown_timeout: Duration::from_secs(60),
            temp_dir: PathBuf::from("./temp"),
            recover_interrupted: true,

            database_url: "sqlite://contentforge.db?mode=rwc".to_string(),
            notify_webhook: None,
            produce_command: None,
            assemble_command: None,
            publish_command: None,
        }
    }
}

impl OrchestratorConfig {
    /// Creates a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `CONTENTFORGE_POLL_INTERVAL_SECS`: Readiness poll interval (default: 30)
    /// - `CONTENTFORGE_MAX_CONCURRENT_JOBS`: Maximum concurrent jobs (default: 3)
    /// - `CONTENTFORGE_MAX_RETRIES`: Failed attempts before a job fails (default: 3)
    /// - `CONTENTFORGE_RETRY_BASE_DELAY_SECS`: First retry backoff (default: 60)
    /// - `CONTENTFORGE_STAGE_TIMEOUT_SECS`: Per-stage timeout (default: 1800)
    /// - `CONTENTFORGE_SHUTDOWN_TIMEOUT_SECS`: Graceful shutdown window (default: 60)
    /// - `CONTENTFORGE_TEMP_DIR`: Work directory root (default: ./temp)
    /// - `CONTENTFORGE_RECOVER_INTERRUPTED`: Recover in-progress jobs at start-up (default: true)
    /// - `DATABASE_URL`: SQLite connection URL (default: sqlite://contentforge.db?mode=rwc)
    /// - `CONTENTFORGE_NOTIFY_WEBHOOK`: Notification webhook URL
    /// - `CONTENTFORGE_PRODUCE_COMMAND`, `CONTENTFORGE_ASSEMBLE_COMMAND`,
    ///   `CONTENTFORGE_PUBLISH_COMMAND`: Stage commands
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if a variable has an invalid value.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Creates configuration from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        // Scheduling settings
        if let Some(val) = lookup("CONTENTFORGE_POLL_INTERVAL_SECS") {
            let secs: u64 = parse_env_value(&val, "CONTENTFORGE_POLL_INTERVAL_SECS")?;
            config.poll_interval = Duration::from_secs(secs);
        }

        if let Some(val) = lookup("CONTENTFORGE_MAX_CONCURRENT_JOBS") {
            config.max_concurrent = parse_env_value(&val, "CONTENTFORGE_MAX_CONCURRENT_JOBS")?;
        }

        // Retry settings
        if let Some(val) = lookup("CONTENTFORGE_MAX_RETRIES") {
            config.max_retries = parse_env_value(&val, "CONTENTFORGE_MAX_RETRIES")?;
        }

        if let Some(val) = lookup("CONTENTFORGE_RETRY_BASE_DELAY_SECS") {
            let secs: u64 = parse_env_value(&val, "CONTENTFORGE_RETRY_BASE_DELAY_SECS")?;
            config.base_backoff = Duration::from_secs(secs);
        }

        // Execution settings
        if let Some(val) = lookup("CONTENTFORGE_STAGE_TIMEOUT_SECS") {
            let secs: u64 = parse_env_value(&val, "CONTENTFORGE_STAGE_TIMEOUT_SECS")?;
            config.stage_timeout = Duration::from_secs(secs);
        }

        if let Some(val) = lookup("CONTENTFORGE_SHUTDOWN_TIMEOUT_SECS") {
            let secs: u64 = parse_env_value(&val, "CONTENTFORGE_SHUTDOWN_TIMEOUT_SECS")?;
            config.shutdown_timeout = Duration::from_secs(secs);
        }

        if let Some(val) = lookup("CONTENTFORGE_TEMP_DIR") {
            config.temp_dir = PathBuf::from(val);
        }

        if let Some(val) = lookup("CONTENTFORGE_RECOVER_INTERRUPTED") {
            config.recover_interrupted = parse_env_bool(&val, "CONTENTFORGE_RECOVER_INTERRUPTED")?;
        }

        // Wiring
        if let Some(val) = lookup("DATABASE_URL") {
            config.database_url = val;
        }

        config.notify_webhook = non_empty(lookup("CONTENTFORGE_NOTIFY_WEBHOOK"));
        config.produce_command = non_empty(lookup("CONTENTFORGE_PRODUCE_COMMAND"));
        config.assemble_command = non_empty(lookup("CONTENTFORGE_ASSEMBLE_COMMAND"));
        config.publish_command = non_empty(lookup("CONTENTFORGE_PUBLISH_COMMAND"));

        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration values.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationFailed` if any values are invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.poll_interval.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "poll_interval must be greater than 0".to_string(),
            ));
        }

        if self.max_concurrent == 0 {
            return Err(ConfigError::ValidationFailed(
                "max_concurrent must be greater than 0".to_string(),
            ));
        }

        if self.stage_timeout.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "stage_timeout must be greater than 0".to_string(),
            ));
        }

        if self.temp_dir.as_os_str().is_empty() {
            return Err(ConfigError::ValidationFailed(
                "temp_dir cannot be empty".to_string(),
            ));
        }

        if self.database_url.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "database_url cannot be empty".to_string(),
            ));
        }

        if let Some(url) = &self.notify_webhook {
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                return Err(ConfigError::ValidationFailed(format!(
                    "notify_webhook must be an http(s) URL, got '{}'",
                    url
                )));
            }
        }

        Ok(())
    }

    /// Longest delay between polls while the job store keeps failing.
    pub fn max_poll_backoff(&self) -> Duration {
        self.poll_interval.saturating_mul(10)
    }

    /// Builder method to set the poll interval.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Builder method to set max concurrent jobs.
    pub fn with_max_concurrent(mut self, max: usize) -> Self {
        self.max_concurrent = max;
        self
    }

    /// Builder method to set max retries.
    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    /// Builder method to set the base backoff delay.
    pub fn with_base_backoff(mut self, delay: Duration) -> Self {
        self.base_backoff = delay;
        self
    }

    /// Builder method to set the per-stage timeout.
    pub fn with_stage_timeout(mut self, timeout: Duration) -> Self {
        self.stage_timeout = timeout;
        self
    }

    /// Builder method to set the shutdown timeout.
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Builder method to set the temp directory.
    pub fn with_temp_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.temp_dir = path.into();
        self
    }

    /// Builder method to toggle crash recovery.
    pub fn with_recover_interrupted(mut self, enabled: bool) -> Self {
        self.recover_interrupted = enabled;
        self
    }

    /// Builder method to set the database URL.
    pub fn with_database_url(mut self, url: impl Into<String>) -> Self {
        self.database_url = url.into();
        self
    }

    /// Builder method to set the notification webhook.
    pub fn with_notify_webhook(mut self, url: impl Into<String>) -> Self {
        self.notify_webhook = Some(url.into());
        self
    }
}

/// Parse an environment variable value into a type.
fn parse_env_value<T: std::str::FromStr>(value: &str, key: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("could not parse '{}'", value),
    })
}

/// Parse an environment variable as a boolean.
fn parse_env_bool(value: &str, key: &str) -> Result<bool, ConfigError> {
    match value.trim().to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("expected boolean value, got '{}'", value),
        }),
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_default_config() {
        let config = OrchestratorConfig::default();
        assert_eq!(config.poll_interval, Duration::from_secs(30));
        assert_eq!(config.max_concurrent, 3);
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.base_backoff, Duration::from_secs(60));
        assert_eq!(config.stage_timeout, Duration::from_secs(1800));
        assert_eq!(config.temp_dir, PathBuf::from("./temp"));
        assert!(config.recover_interrupted);
        assert!(config.notify_webhook.is_none());
    }

    #[test]
    fn test_config_builder() {
        let config = OrchestratorConfig::new()
            .with_poll_interval(Duration::from_millis(250))
            .with_max_concurrent(8)
            .with_max_retries(5)
            .with_base_backoff(Duration::from_secs(10))
            .with_stage_timeout(Duration::from_secs(60))
            .with_shutdown_timeout(Duration::from_secs(5))
            .with_temp_dir("/tmp/cf")
            .with_recover_interrupted(false)
            .with_database_url("sqlite::memory:")
            .with_notify_webhook("https://hooks.example.com/cf");

        assert_eq!(config.poll_interval, Duration::from_millis(250));
        assert_eq!(config.max_concurrent, 8);
        assert_eq!(config.max_retries, 5);
        assert_eq!(config.base_backoff, Duration::from_secs(10));
        assert_eq!(config.stage_timeout, Duration::from_secs(60));
        assert_eq!(config.shutdown_timeout, Duration::from_secs(5));
        assert_eq!(config.temp_dir, PathBuf::from("/tmp/cf"));
        assert!(!config.recover_interrupted);
        assert_eq!(config.database_url, "sqlite::memory:");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation_valid_config() {
        assert!(OrchestratorConfig::default().validate().is_ok());
    }

    #[test]
    fn test_validation_invalid_max_concurrent() {
        let result = OrchestratorConfig::default().with_max_concurrent(0).validate();
        assert!(result.unwrap_err().to_string().contains("max_concurrent"));
    }

    #[test]
    fn test_validation_invalid_poll_interval() {
        let result = OrchestratorConfig::default()
            .with_poll_interval(Duration::ZERO)
            .validate();
        assert!(result.unwrap_err().to_string().contains("poll_interval"));
    }

    #[test]
    fn test_validation_invalid_stage_timeout() {
        let result = OrchestratorConfig::default()
            .with_stage_timeout(Duration::ZERO)
            .validate();
        assert!(result.unwrap_err().to_string().contains("stage_timeout"));
    }

    #[test]
    fn test_validation_invalid_webhook() {
        let result = OrchestratorConfig::default()
            .with_notify_webhook("ftp://example.com")
            .validate();
        assert!(result.unwrap_err().to_string().contains("notify_webhook"));
    }

    #[test]
    fn test_zero_backoff_allowed() {
        let config = OrchestratorConfig::default().with_base_backoff(Duration::ZERO);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_max_poll_backoff() {
        let config = OrchestratorConfig::default().with_poll_interval(Duration::from_secs(30));
        assert_eq!(config.max_poll_backoff(), Duration::from_secs(300));
    }

    #[test]
    fn test_from_lookup() {
        let config = OrchestratorConfig::from_lookup(lookup_from(&[
            ("CONTENTFORGE_POLL_INTERVAL_SECS", "5"),
            ("CONTENTFORGE_MAX_CONCURRENT_JOBS", "2"),
            ("CONTENTFORGE_MAX_RETRIES", "4"),
            ("CONTENTFORGE_RETRY_BASE_DELAY_SECS", "15"),
            ("CONTENTFORGE_RECOVER_INTERRUPTED", "off"),
            ("DATABASE_URL", "sqlite://jobs.db"),
            ("CONTENTFORGE_PUBLISH_COMMAND", "./publish.sh --dry-run"),
            ("CONTENTFORGE_PRODUCE_COMMAND", "  "),
        ]))
        .unwrap();

        assert_eq!(config.poll_interval, Duration::from_secs(5));
        assert_eq!(config.max_concurrent, 2);
        assert_eq!(config.max_retries, 4);
        assert_eq!(config.base_backoff, Duration::from_secs(15));
        assert!(!config.recover_interrupted);
        assert_eq!(config.database_url, "sqlite://jobs.db");
        assert_eq!(config.publish_command.as_deref(), Some("./publish.sh --dry-run"));
        assert!(config.produce_command.is_none());
    }

    #[test]
    fn test_from_lookup_invalid_value() {
        let err = OrchestratorConfig::from_lookup(lookup_from(&[(
            "CONTENTFORGE_MAX_CONCURRENT_JOBS",
            "many",
        )]))
        .unwrap_err();
        assert!(err.to_string().contains("CONTENTFORGE_MAX_CONCURRENT_JOBS"));
    }

    #[test]
    fn test_from_lookup_runs_validation() {
        let err = OrchestratorConfig::from_lookup(lookup_from(&[(
            "CONTENTFORGE_MAX_CONCURRENT_JOBS",
            "0",
        )]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::ValidationFailed(_)));
    }

    #[test]
    fn test_parse_env_bool() {
        assert!(parse_env_bool("true", "test").unwrap());
        assert!(parse_env_bool("1", "test").unwrap());
        assert!(parse_env_bool("yes", "test").unwrap());
        assert!(parse_env_bool("ON", "test").unwrap());

        assert!(!parse_env_bool("false", "test").unwrap());
        assert!(!parse_env_bool("0", "test").unwrap());
        assert!(!parse_env_bool("no", "test").unwrap());
        assert!(!parse_env_bool("off", "test").unwrap());

        assert!(parse_env_bool("invalid", "test").is_err());
    }

    #[test]
    fn test_config_error_display() {
        let err = ConfigError::InvalidValue {
            key: "KEY".to_string(),
            message: "bad value".to_string(),
        };
        assert!(err.to_string().contains("KEY"));
        assert!(err.to_string().contains("bad value"));

        let err = ConfigError::ValidationFailed("test failure".to_string());
        assert!(err.to_string().contains("test failure"));
    }
}

//! File-backed configuration for taskweave.
//!
//! Settings are read from `taskweave.toml` and layered file → environment →
//! explicit builder calls.
//!
//! # Configuration File Format
//!
//! ```toml
//! [scheduler]
//! max_concurrent = 4
//! max_retries = 2
//! task_timeout_ms = 30000
//!
//! [logging]
//! level = "info"
//! json = false
//! ```

use crate::dag::ControllerConfig;
use crate::errors::ConfigError;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Default file name looked up by `load_or_default`.
pub const CONFIG_FILE_NAME: &str = "taskweave.toml";

const ENV_MAX_CONCURRENT: &str = "TASKWEAVE_MAX_CONCURRENT";
const ENV_MAX_RETRIES: &str = "TASKWEAVE_MAX_RETRIES";
const ENV_TASK_TIMEOUT_MS: &str = "TASKWEAVE_TASK_TIMEOUT_MS";

/// Scheduler settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerSection {
    /// Maximum tasks executing at once
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    /// Repairs allowed per task
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Per-execution timeout in milliseconds
    #[serde(default)]
    pub task_timeout_ms: Option<u64>,
}

fn default_max_concurrent() -> usize {
    4
}

fn default_max_retries() -> u32 {
    2
}

impl Default for SchedulerSection {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
            max_retries: default_max_retries(),
            task_timeout_ms: None,
        }
    }
}

/// Logging settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive when `TASKWEAVE_LOG` is unset
    #[serde(default = "default_level")]
    pub level: String,
    /// Emit JSON lines instead of human-readable output
    #[serde(default)]
    pub json: bool,
}

fn default_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
            json: false,
        }
    }
}

/// Root of `taskweave.toml`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskweaveToml {
    #[serde(default)]
    pub scheduler: SchedulerSection,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl TaskweaveToml {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::parse(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse taskweave.toml")
    }

    /// Load `taskweave.toml` from a directory, or defaults if it is absent.
    pub fn load_or_default(dir: &Path) -> Result<Self> {
        let config_path = dir.join(CONFIG_FILE_NAME);
        if config_path.exists() {
            Self::load(&config_path)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to a TOML file.
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize taskweave.toml")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Override scheduler values from `TASKWEAVE_*` environment variables.
    pub fn apply_env_overrides(mut self) -> Result<Self> {
        if let Some(value) = env_value::<usize>(ENV_MAX_CONCURRENT)? {
            self.scheduler.max_concurrent = value;
        }
        if let Some(value) = env_value::<u32>(ENV_MAX_RETRIES)? {
            self.scheduler.max_retries = value;
        }
        if let Some(value) = env_value::<u64>(ENV_TASK_TIMEOUT_MS)? {
            self.scheduler.task_timeout_ms = Some(value);
        }
        Ok(self)
    }

    /// Build the controller configuration, rejecting unusable values.
    pub fn controller_config(&self) -> Result<ControllerConfig, ConfigError> {
        let config = ControllerConfig {
            max_concurrent: self.scheduler.max_concurrent,
            max_retries: self.scheduler.max_retries,
            task_timeout_ms: self.scheduler.task_timeout_ms,
        };
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration and return any warnings.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if let Err(e) = self.controller_config() {
            warnings.push(e.to_string());
        }
        if self.scheduler.max_retries > 10 {
            warnings.push(format!(
                "max_retries = {} allows many repair rounds per task",
                self.scheduler.max_retries
            ));
        }
        if tracing_subscriber::EnvFilter::try_new(&self.logging.level).is_err() {
            warnings.push(format!(
                "Invalid logging level '{}': expected a filter such as 'info' or 'taskweave=debug'",
                self.logging.level
            ));
        }

        warnings
    }
}

fn env_value<T>(name: &str) -> Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .with_context(|| format!("Invalid value for {}: '{}'", name, raw)),
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;
    use tempfile::TempDir;

    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    #[test]
    fn test_defaults() {
        let config = TaskweaveToml::default();
        assert_eq!(config.scheduler.max_concurrent, 4);
        assert_eq!(config.scheduler.max_retries, 2);
        assert!(config.scheduler.task_timeout_ms.is_none());
        assert_eq!(config.logging.level, "info");
        assert!(config.validate().is_empty());
    }

    #[test]
    fn test_parse_full_file() {
        let content = r#"
[scheduler]
max_concurrent = 8
max_retries = 3
task_timeout_ms = 1500

[logging]
level = "debug"
json = true
"#;
        let config = TaskweaveToml::parse(content).unwrap();
        assert_eq!(config.scheduler.max_concurrent, 8);
        assert!(config.logging.json);

        let controller = config.controller_config().unwrap();
        assert_eq!(controller.max_retries, 3);
        assert_eq!(controller.task_timeout(), Some(Duration::from_millis(1500)));
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let config = TaskweaveToml::parse("[scheduler]\nmax_retries = 0\n").unwrap();
        assert_eq!(config.scheduler.max_concurrent, 4);
        assert_eq!(config.scheduler.max_retries, 0);
        assert_eq!(config.logging, LoggingConfig::default());
    }

    #[test]
    fn test_zero_concurrency_is_rejected() {
        let config = TaskweaveToml::parse("[scheduler]\nmax_concurrent = 0\n").unwrap();
        assert!(config.controller_config().is_err());
        let warnings = config.validate();
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].contains("max_concurrent"));
    }

    #[test]
    fn test_parse_error_has_context() {
        let err = TaskweaveToml::parse("[scheduler\n").unwrap_err();
        assert!(err.to_string().contains("taskweave.toml"));
    }

    #[test]
    fn test_load_or_default_and_save() {
        let dir = TempDir::new().unwrap();
        let missing = TaskweaveToml::load_or_default(dir.path()).unwrap();
        assert_eq!(missing, TaskweaveToml::default());

        let mut config = TaskweaveToml::default();
        config.scheduler.max_concurrent = 2;
        config.scheduler.task_timeout_ms = Some(500);
        config.save(&dir.path().join(CONFIG_FILE_NAME)).unwrap();

        let loaded = TaskweaveToml::load_or_default(dir.path()).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_env_overrides() {
        let _guard = ENV_MUTEX.lock().unwrap();

        unsafe {
            std::env::set_var(ENV_MAX_CONCURRENT, "7");
            std::env::set_var(ENV_TASK_TIMEOUT_MS, "250");
            std::env::remove_var(ENV_MAX_RETRIES);
        }
        let config = TaskweaveToml::default().apply_env_overrides().unwrap();
        assert_eq!(config.scheduler.max_concurrent, 7);
        assert_eq!(config.scheduler.max_retries, 2);
        assert_eq!(config.scheduler.task_timeout_ms, Some(250));

        unsafe { std::env::set_var(ENV_MAX_RETRIES, "many") };
        let err = TaskweaveToml::default().apply_env_overrides().unwrap_err();
        assert!(err.to_string().contains(ENV_MAX_RETRIES));

        unsafe {
            std::env::remove_var(ENV_MAX_CONCURRENT);
            std::env::remove_var(ENV_TASK_TIMEOUT_MS);
            std::env::remove_var(ENV_MAX_RETRIES);
        }
    }
}

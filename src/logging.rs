//! Logging setup using `tracing` + `tracing-subscriber`.
//!
//! Priority for the filter:
//! 1. `TASKWEAVE_LOG` environment variable (e.g. "debug", "taskweave=trace")
//! 2. `level` from the `[logging]` config section

use crate::config::LoggingConfig;
use anyhow::{Result, anyhow};
use tracing_subscriber::EnvFilter;

/// Environment variable consulted before the configured level.
pub const LOG_ENV_VAR: &str = "TASKWEAVE_LOG";

/// Build the filter from the environment, falling back to the config.
pub fn build_filter(config: &LoggingConfig) -> Result<EnvFilter> {
    match std::env::var(LOG_ENV_VAR) {
        Ok(directives) if !directives.trim().is_empty() => EnvFilter::try_new(directives.trim())
            .map_err(|e| anyhow!("Invalid {} value: {}", LOG_ENV_VAR, e)),
        _ => EnvFilter::try_new(&config.level)
            .map_err(|e| anyhow!("Invalid logging level '{}': {}", config.level, e)),
    }
}

/// Install the global subscriber. Fails if one is already installed.
pub fn init_logging(config: &LoggingConfig) -> Result<()> {
    let filter = build_filter(config)?;
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false);

    let installed = if config.json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    installed.map_err(|e| anyhow!("Failed to install tracing subscriber: {}", e))
}

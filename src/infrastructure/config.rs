//! Engine configuration.
//!
//! The core consumes exactly four environment variables: `ASSISTANT_COMMAND`,
//! `DATABASE_URL`, `DEFAULT_WORKSPACE_ROOT`, and `ISOLATED_SUBDIR`. Logging
//! knobs ride along for the binary. Defaults first, environment on top.

use figment::providers::{Env, Serialized};
use figment::Figment;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read configuration: {0}")]
    ReadFailed(String),
    #[error("invalid log level: {0}. Must be one of: trace, debug, info, warn, error")]
    InvalidLogLevel(String),
    #[error("invalid log format: {0}. Must be one of: json, pretty")]
    InvalidLogFormat(String),
    #[error("database URL cannot be empty")]
    EmptyDatabaseUrl,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Executable name or path of the external assistant.
    pub assistant_command: String,
    /// Passed through to the persistence gateway, never parsed here.
    pub database_url: String,
    /// Root used for tasks created without an explicit repository path.
    pub default_workspace_root: String,
    /// Directory under a repository root that holds isolated checkouts.
    pub isolated_subdir: String,
    pub log_level: String,
    pub log_format: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            assistant_command: "assistant".to_string(),
            database_url: "sqlite://taskpilot.db".to_string(),
            default_workspace_root: ".".to_string(),
            isolated_subdir: ".isolated".to_string(),
            log_level: "info".to_string(),
            log_format: "pretty".to_string(),
        }
    }
}

impl EngineConfig {
    /// Load defaults and overlay the allow-listed environment variables.
    pub fn load() -> Result<Self, ConfigError> {
        let config: EngineConfig = Figment::new()
            .merge(Serialized::defaults(EngineConfig::default()))
            .merge(Env::raw().only(&[
                "ASSISTANT_COMMAND",
                "DATABASE_URL",
                "DEFAULT_WORKSPACE_ROOT",
                "ISOLATED_SUBDIR",
                "LOG_LEVEL",
                "LOG_FORMAT",
            ]))
            .extract()
            .map_err(|e| ConfigError::ReadFailed(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.database_url.is_empty() {
            return Err(ConfigError::EmptyDatabaseUrl);
        }
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.log_level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(self.log_level.clone()));
        }
        let valid_formats = ["json", "pretty"];
        if !valid_formats.contains(&self.log_format.as_str()) {
            return Err(ConfigError::InvalidLogFormat(self.log_format.clone()));
        }
        Ok(())
    }
}

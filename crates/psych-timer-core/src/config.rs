//! Server and run configuration.
//!
//! Loaded from a TOML file, then overridden from `PSYCH_TIMER_*` environment
//! variables, then validated. Every field has a default so a missing file
//! or a partial file is fine.

use std::{
    net::SocketAddr,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use thiserror::Error;

const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// Configuration error.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to parse config file {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// What happens when an operator connects while a session is bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictPolicy {
    /// Refuse the new connection and keep the current session.
    #[default]
    Reject,
    /// Bind the new connection and terminate the current session.
    Replace,
}

/// Top-level server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address the HTTP server listens on.
    pub bind: SocketAddr,

    /// Sent to every operator as the INSTRUCTIONS status right after connecting.
    pub instructions: String,

    /// Default tracing level when `RUST_LOG` is unset.
    pub log_level: String,

    /// Operator session settings.
    pub session: SessionConfig,

    /// Run settings.
    pub run: RunConfig,
}

/// Operator session handling.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// What to do when a second operator connects.
    pub conflict_policy: ConflictPolicy,

    /// Cooperatively cancel the in-flight run when the operator disconnects.
    pub cancel_on_disconnect: bool,
}

/// Settings for each timed run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    /// Directory that receives one event log per subject.
    pub log_dir: PathBuf,

    /// How long a run lasts once released, in milliseconds.
    pub run_duration_ms: u64,

    /// Hold each run until the operator sends CONTINUE.
    pub await_continue: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([127, 0, 0, 1], 8080)),
            instructions: "Enter a subject ID and press Start when the participant is ready."
                .to_string(),
            log_level: "info".to_string(),
            session: SessionConfig::default(),
            run: RunConfig::default(),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            conflict_policy: ConflictPolicy::Reject,
            cancel_on_disconnect: true,
        }
    }
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            log_dir: PathBuf::from("."),
            run_duration_ms: 60_000,
            await_continue: true,
        }
    }
}

impl ServerConfig {
    /// Load configuration from a TOML file with environment overrides.
    ///
    /// # Errors
    /// Returns error if the file cannot be read or parsed, or the result is
    /// invalid.
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config: Self = toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;

        config.apply_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Apply `PSYCH_TIMER_*` overrides using `lookup` to read variables.
    ///
    /// Values that fail to parse are ignored.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(bind) = lookup("PSYCH_TIMER_BIND") {
            match bind.parse() {
                Ok(addr) => self.bind = addr,
                Err(e) => tracing::warn!("Ignoring PSYCH_TIMER_BIND={bind}: {e}"),
            }
        }

        if let Some(dir) = lookup("PSYCH_TIMER_LOG_DIR") {
            if !dir.trim().is_empty() {
                self.run.log_dir = PathBuf::from(dir);
            }
        }

        if let Some(level) = lookup("PSYCH_TIMER_LOG_LEVEL") {
            self.log_level = level;
        }
    }

    /// Check values that serde cannot check.
    ///
    /// # Errors
    /// Returns error describing the first invalid field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !LOG_LEVELS.contains(&self.log_level.to_lowercase().as_str()) {
            return Err(ConfigError::Invalid(format!(
                "log_level must be one of {LOG_LEVELS:?}, got {:?}",
                self.log_level
            )));
        }
        if self.run.run_duration_ms == 0 {
            return Err(ConfigError::Invalid(
                "run.run_duration_ms must be greater than zero".to_string(),
            ));
        }
        if self.run.log_dir.as_os_str().is_empty() {
            return Err(ConfigError::Invalid("run.log_dir must not be empty".to_string()));
        }
        Ok(())
    }
}

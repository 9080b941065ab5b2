//! inferadmin.toml configuration with `INFERADMIN_*` environment overrides.

use std::path::{Path, PathBuf};
use std::time::Duration;

use inferadmin_dispatch::DispatcherConfig;
use inferadmin_state::StateDir;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Prefix of environment variables that override file settings.
pub const ENV_PREFIX: &str = "INFERADMIN_";

pub const DEFAULT_LOG_FILTER: &str = "info,inferadmind=debug,inferadmin=debug";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config file {path}: {reason}")]
    Read { path: PathBuf, reason: String },

    #[error("invalid config file: {0}")]
    Parse(String),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct InferAdminConfig {
    pub state_dir: PathBuf,
    /// One directory per model, named after the model with `/` as `_`.
    pub model_storage_path: PathBuf,
    pub io_pool_size: usize,
    /// 0 means processors minus one.
    pub cpu_pool_size: usize,
    pub queue_capacity: usize,
    pub shutdown_timeout_secs: u64,
    pub docker_binary: PathBuf,
    /// Upper bound for a single engine call (image pulls get longer).
    pub engine_timeout_secs: u64,
    /// Used when `RUST_LOG` is not set.
    pub log_filter: String,
    /// Emit logs as JSON lines instead of text.
    pub log_json: bool,
}

impl Default for InferAdminConfig {
    fn default() -> Self {
        let dispatcher = DispatcherConfig::default();
        let state_dir = StateDir::default_root();
        let model_storage_path = state_dir
            .parent()
            .map(|root| root.join("models"))
            .unwrap_or_else(|| PathBuf::from("models"));
        Self {
            state_dir,
            model_storage_path,
            io_pool_size: dispatcher.io_pool_size,
            cpu_pool_size: dispatcher.cpu_pool_size,
            queue_capacity: dispatcher.queue_capacity,
            shutdown_timeout_secs: dispatcher.shutdown_timeout.as_secs(),
            docker_binary: PathBuf::from("docker"),
            engine_timeout_secs: 60,
            log_filter: DEFAULT_LOG_FILTER.to_string(),
            log_json: false,
        }
    }
}

impl InferAdminConfig {
    /// Defaults, then the file at `path` (if any), then environment overrides.
    pub fn load<I>(path: Option<&Path>, env: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env(env)?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        toml::from_str(&content).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Apply `INFERADMIN_<FIELD>` overrides. Unrelated variables are ignored.
    pub fn apply_env<I>(&mut self, env: I) -> Result<(), ConfigError>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        for (key, value) in env {
            let Some(field) = key.strip_prefix(ENV_PREFIX) else {
                continue;
            };
            match field.to_ascii_lowercase().as_str() {
                "state_dir" => self.state_dir = PathBuf::from(value),
                "model_storage_path" => self.model_storage_path = PathBuf::from(value),
                "io_pool_size" => self.io_pool_size = parse_number(&key, &value)?,
                "cpu_pool_size" => self.cpu_pool_size = parse_number(&key, &value)?,
                "queue_capacity" => self.queue_capacity = parse_number(&key, &value)?,
                "shutdown_timeout_secs" => self.shutdown_timeout_secs = parse_number(&key, &value)?,
                "docker_binary" => self.docker_binary = PathBuf::from(value),
                "engine_timeout_secs" => self.engine_timeout_secs = parse_number(&key, &value)?,
                "log_filter" => self.log_filter = value,
                "log_json" => self.log_json = parse_bool(&key, &value)?,
                _ => {}
            }
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.io_pool_size == 0 {
            return Err(ConfigError::Invalid("io_pool_size must be at least 1".to_string()));
        }
        if self.queue_capacity == 0 {
            return Err(ConfigError::Invalid("queue_capacity must be at least 1".to_string()));
        }
        if self.engine_timeout_secs == 0 {
            return Err(ConfigError::Invalid("engine_timeout_secs must be at least 1".to_string()));
        }
        if self.state_dir.as_os_str().is_empty() {
            return Err(ConfigError::Invalid("state_dir must not be empty".to_string()));
        }
        if self.model_storage_path.as_os_str().is_empty() {
            return Err(ConfigError::Invalid("model_storage_path must not be empty".to_string()));
        }
        Ok(())
    }

    pub fn dispatcher(&self) -> DispatcherConfig {
        DispatcherConfig {
            io_pool_size: self.io_pool_size,
            cpu_pool_size: self.cpu_pool_size,
            queue_capacity: self.queue_capacity,
            shutdown_timeout: Duration::from_secs(self.shutdown_timeout_secs),
        }
    }

    pub fn engine_timeout(&self) -> Duration {
        Duration::from_secs(self.engine_timeout_secs)
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::Invalid(format!("{key}={value:?} is not a valid number")))
}

fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::Invalid(format!("{key}={value:?} is not a boolean"))),
    }
}

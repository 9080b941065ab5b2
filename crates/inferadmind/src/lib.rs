//! inferadmind — configuration and process lifecycle for the InferAdmin CLI.

pub mod config;
pub mod lifecycle;

pub use config::{ConfigError, InferAdminConfig, DEFAULT_LOG_FILTER, ENV_PREFIX};
pub use lifecycle::{init_logging, Lifecycle, WatchReport};

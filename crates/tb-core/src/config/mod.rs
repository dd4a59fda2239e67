//! Configuration management for the target broker

mod broker;
pub mod serde_utils;
mod target;

pub use broker::{BrokerConfig, PrincipalConfig};
pub use target::{
    ConsoleConfig, ConsoleDriverConfig, Explicit, PowerComponentConfig, PowerDriverConfig,
    TargetConfig, TargetType, TestingPolicy, Toolchain,
};

use crate::error::ConfigError;
use std::path::{Path, PathBuf};

/// Get the default configuration directory
pub fn default_config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("tb-broker")
}

/// Get the default configuration file path
pub fn default_config_path() -> PathBuf {
    default_config_dir().join("config.toml")
}

/// Load configuration from a file
pub fn load_config<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, ConfigError> {
    if !path.exists() {
        return Err(ConfigError::NotFound(path.to_path_buf()));
    }

    let content = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::Invalid(format!("Failed to read config: {}", e)))?;

    let config: T = toml::from_str(&content)?;
    Ok(config)
}

/// Load and validate the broker configuration
pub fn load_broker_config(path: &Path) -> Result<BrokerConfig, ConfigError> {
    let config: BrokerConfig = load_config(path)?;
    config.validate()?;
    Ok(config)
}

//! Broker daemon configuration

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::time::Duration;

use super::serde_utils::duration_secs;
use super::TargetConfig;
use crate::error::ConfigError;
use crate::types::Principal;

/// Configuration for the broker daemon
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Address the REST boundary binds to
    pub bind_address: String,

    /// Interval between liveness pings to the process supervisor
    #[serde(with = "duration_secs")]
    pub liveness_interval: Duration,

    /// Interval between allocation expiry sweeps
    #[serde(with = "duration_secs")]
    pub reaper_interval: Duration,

    /// Upper bound on a single driver call
    #[serde(with = "duration_secs")]
    pub driver_timeout: Duration,

    /// Idle timeout applied when an acquire names no expiry policy
    #[serde(with = "duration_secs")]
    pub default_idle_timeout: Duration,

    /// Maximum bytes returned by one console read
    pub console_chunk_size: usize,

    /// Maximum bytes of one console generation kept in memory; older
    /// output is dropped first
    pub console_buffer_limit: usize,

    /// Principals allowed to talk to the broker
    pub principals: Vec<PrincipalConfig>,

    /// Target catalog
    pub targets: Vec<TargetConfig>,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:5000".to_string(),
            liveness_interval: Duration::from_secs(10),
            reaper_interval: Duration::from_secs(5),
            driver_timeout: Duration::from_secs(60),
            default_idle_timeout: Duration::from_secs(300),
            console_chunk_size: 64 * 1024,
            console_buffer_limit: 1024 * 1024,
            principals: Vec::new(),
            targets: Vec::new(),
        }
    }
}

impl BrokerConfig {
    /// Reject malformed entries before the registry is built
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.console_chunk_size == 0 || self.console_buffer_limit == 0 {
            return Err(ConfigError::Invalid(
                "console_chunk_size and console_buffer_limit must be greater than zero".into(),
            ));
        }
        if self.liveness_interval.is_zero() || self.reaper_interval.is_zero() {
            return Err(ConfigError::Invalid(
                "liveness_interval and reaper_interval must be non-zero".into(),
            ));
        }
        if self.driver_timeout.is_zero() {
            return Err(ConfigError::Invalid("driver_timeout must be non-zero".into()));
        }

        let mut ids = HashSet::new();
        for target in &self.targets {
            target.validate()?;
            if !ids.insert(target.id.as_str()) {
                return Err(ConfigError::Duplicate {
                    kind: "target",
                    name: target.id.clone(),
                });
            }
        }

        let mut names = HashSet::new();
        for principal in &self.principals {
            principal.validate()?;
            if !names.insert(principal.name.as_str()) {
                return Err(ConfigError::Duplicate {
                    kind: "principal",
                    name: principal.name.clone(),
                });
            }
        }

        Ok(())
    }
}

/// A principal and the hash of the bearer token it authenticates with
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrincipalConfig {
    pub name: String,
    /// Hex-encoded SHA-256 of the token
    pub token_sha256: String,
    #[serde(default)]
    pub admin: bool,
}

impl PrincipalConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.name.trim().is_empty() {
            return Err(ConfigError::Invalid("principal with empty name".into()));
        }
        let valid_hash = self.token_sha256.len() == 64
            && self.token_sha256.chars().all(|c| c.is_ascii_hexdigit());
        if !valid_hash {
            return Err(ConfigError::Invalid(format!(
                "principal {}: token_sha256 must be 64 hex characters",
                self.name
            )));
        }
        Ok(())
    }

    /// Hash a bearer token the way `token_sha256` is stored
    pub fn hash_token(token: &str) -> String {
        hex::encode(Sha256::digest(token.as_bytes()))
    }

    /// Whether `token` authenticates this principal
    pub fn matches_token(&self, token: &str) -> bool {
        let presented = Self::hash_token(token);
        let stored = self.token_sha256.to_ascii_lowercase();
        // Compare every byte so timing doesn't leak the prefix length
        presented.len() == stored.len()
            && presented
                .bytes()
                .zip(stored.bytes())
                .fold(0u8, |acc, (a, b)| acc | (a ^ b))
                == 0
    }

    pub fn principal(&self) -> Principal {
        Principal {
            name: self.name.clone(),
            admin: self.admin,
        }
    }
}

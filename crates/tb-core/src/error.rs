//! Core error types for the target broker

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Top-level error type returned by every broker operation
#[derive(Error, Debug)]
pub enum BrokerError {
    /// Referenced target, component, console or allocation does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// Caller lacks the rights for this operation
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// One or more targets are exclusively held by someone else
    #[error("Busy: {0}")]
    Busy(String),

    /// Lost a race against a concurrent state transition
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Operation on a disabled console or target
    #[error("Not enabled: {0}")]
    NotEnabled(String),

    /// A driver capability failed
    #[error("Driver failure on {target}/{component} ({action}): {source}")]
    DriverFailure {
        target: String,
        component: String,
        action: String,
        #[source]
        source: DriverError,
    },

    /// Malformed request
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Internal consistency fault; the offending operation was aborted
    #[error("Invariant violation: {0}")]
    InvariantViolation(String),
}

impl BrokerError {
    /// Stable, machine-readable kind of this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            BrokerError::NotFound(_) => ErrorKind::NotFound,
            BrokerError::Unauthorized(_) => ErrorKind::Unauthorized,
            BrokerError::Busy(_) => ErrorKind::Busy,
            BrokerError::Conflict(_) => ErrorKind::Conflict,
            BrokerError::NotEnabled(_) => ErrorKind::NotEnabled,
            BrokerError::DriverFailure { .. } => ErrorKind::DriverFailure,
            BrokerError::InvalidInput(_) => ErrorKind::InvalidInput,
            BrokerError::InvariantViolation(_) => ErrorKind::InvariantViolation,
        }
    }

    /// Wrap a driver error with the context it happened in
    pub fn driver(
        target: impl Into<String>,
        component: impl Into<String>,
        action: impl Into<String>,
        source: DriverError,
    ) -> Self {
        BrokerError::DriverFailure {
            target: target.into(),
            component: component.into(),
            action: action.into(),
            source,
        }
    }
}

/// Machine-readable error kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NotFound,
    Unauthorized,
    Busy,
    Conflict,
    NotEnabled,
    DriverFailure,
    InvalidInput,
    InvariantViolation,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::NotFound => "not_found",
            ErrorKind::Unauthorized => "unauthorized",
            ErrorKind::Busy => "busy",
            ErrorKind::Conflict => "conflict",
            ErrorKind::NotEnabled => "not_enabled",
            ErrorKind::DriverFailure => "driver_failure",
            ErrorKind::InvalidInput => "invalid_input",
            ErrorKind::InvariantViolation => "invariant_violation",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors reported by power and console driver capabilities
#[derive(Error, Debug)]
pub enum DriverError {
    /// I/O error talking to the hardware or child process
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// External command exited unsuccessfully
    #[error("Command `{command}` failed: {reason}")]
    Command { command: String, reason: String },

    /// Operation did not complete within the driver timeout
    #[error("Timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// Capability not implemented by this driver
    #[error("Unsupported operation: {0}")]
    Unsupported(&'static str),

    /// The underlying stream was closed
    #[error("Stream closed")]
    Closed,

    /// Any other driver-specific failure
    #[error("{0}")]
    Other(String),
}

/// Configuration-related errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Config file not found
    #[error("Config file not found: {0}")]
    NotFound(PathBuf),

    /// Invalid configuration
    #[error("Invalid config: {0}")]
    Invalid(String),

    /// TOML parse error
    #[error("TOML parse error: {0}")]
    Parse(#[from] toml::de::Error),

    /// Two entries share an identifier that must be unique
    #[error("Duplicate {kind}: {name}")]
    Duplicate { kind: &'static str, name: String },
}

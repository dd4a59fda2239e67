//! Core domain types

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::BrokerError;

/// Unique identifier for a target
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TargetId(pub String);

impl TargetId {
    /// Create a new target ID
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the raw ID string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TargetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for TargetId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for TargetId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Unique identifier for an allocation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AllocationId(pub uuid::Uuid);

impl AllocationId {
    /// Generate a fresh random allocation ID
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl fmt::Display for AllocationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Same hyphenated form the id has in JSON
        write!(f, "{}", self.0.hyphenated())
    }
}

impl FromStr for AllocationId {
    type Err = BrokerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        uuid::Uuid::parse_str(s)
            .map(Self)
            .map_err(|_| BrokerError::InvalidInput(format!("malformed allocation id '{}'", s)))
    }
}

/// An authenticated user or service identity
///
/// The broker trusts whatever produced this value; authentication happens
/// at the boundary before any core operation is called.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Principal {
    /// User or service name
    pub name: String,
    /// Whether this principal may force-release and administer targets
    #[serde(default)]
    pub admin: bool,
}

impl Principal {
    /// Create a regular (non-admin) principal
    pub fn user(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            admin: false,
        }
    }

    /// Create an admin principal
    pub fn admin(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            admin: true,
        }
    }
}

impl fmt::Display for Principal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}

/// Power action requested on a rail or component
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PowerAction {
    On,
    Off,
    Cycle,
}

impl fmt::Display for PowerAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PowerAction::On => write!(f, "on"),
            PowerAction::Off => write!(f, "off"),
            PowerAction::Cycle => write!(f, "cycle"),
        }
    }
}

impl FromStr for PowerAction {
    type Err = BrokerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "on" => Ok(PowerAction::On),
            "off" => Ok(PowerAction::Off),
            "cycle" => Ok(PowerAction::Cycle),
            other => Err(BrokerError::InvalidInput(format!(
                "unknown power action '{}'",
                other
            ))),
        }
    }
}

/// Which components of a power rail an action applies to
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ComponentSelector {
    /// Every component except those marked explicit for the action
    All,
    /// Every component, explicit ones included
    Full,
    /// A single named component
    Named(String),
}

impl ComponentSelector {
    /// Parse the boundary's optional `component` parameter
    pub fn parse(component: Option<&str>) -> Self {
        match component {
            None | Some("all") | Some("") => ComponentSelector::All,
            Some("full") => ComponentSelector::Full,
            Some(name) => ComponentSelector::Named(name.to_string()),
        }
    }
}

impl fmt::Display for ComponentSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ComponentSelector::All => write!(f, "all"),
            ComponentSelector::Full => write!(f, "full"),
            ComponentSelector::Named(name) => write!(f, "{}", name),
        }
    }
}

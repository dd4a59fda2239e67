//! Target definitions
//!
//! Targets are declared once in the broker configuration and validated at
//! load time; the registry built from them is trusted afterwards.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::time::Duration;

use crate::error::ConfigError;

/// Kind of device under test
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetType {
    /// Physical microcontroller board
    Mcu,
    /// Emulated QEMU instance
    Qemu,
}

/// Toolchains a target can build for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Toolchain {
    Zephyr,
    Gnuarmemb,
    Xtools,
    Espressif,
    Llvm,
    Host,
}

/// Test selection policy for a target
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestingPolicy {
    /// Whether test runners pick this target by default
    #[serde(default = "default_true")]
    pub default: bool,
    /// Test tags that are never run on this target
    #[serde(default)]
    pub ignore_tags: Vec<String>,
}

impl Default for TestingPolicy {
    fn default() -> Self {
        Self {
            default: true,
            ignore_tags: Vec::new(),
        }
    }
}

/// Power actions for which a component is only driven when named
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Explicit {
    /// Only powered on when explicitly selected
    On,
    /// Only powered off when explicitly selected
    Off,
    /// Only powered on or off when explicitly selected
    Both,
}

impl Explicit {
    /// Whether an implicit "on" skips this component
    pub fn skips_on(self) -> bool {
        matches!(self, Explicit::On | Explicit::Both)
    }

    /// Whether an implicit "off" skips this component
    pub fn skips_off(self) -> bool {
        matches!(self, Explicit::Off | Explicit::Both)
    }
}

/// Driver bound to a power component
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PowerDriverConfig {
    /// In-memory component with no hardware behind it
    Simulated {
        #[serde(default)]
        initial: bool,
    },
    /// Shell commands; `state` exits 0 when the component is powered
    Command {
        on: String,
        off: String,
        state: String,
    },
}

/// One named component of a target's power rail
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PowerComponentConfig {
    pub name: String,
    pub driver: PowerDriverConfig,
    #[serde(default)]
    pub explicit: Option<Explicit>,
}

/// Driver bound to a console
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ConsoleDriverConfig {
    /// Echoes written bytes back as output
    Loopback,
    /// Child process; stdin receives writes, stdout is the stream
    Command {
        program: String,
        #[serde(default)]
        args: Vec<String>,
        /// Restart the process when it exits while the console is enabled
        #[serde(default = "default_true")]
        respawn: bool,
    },
}

/// One named console of a target
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsoleConfig {
    pub name: String,
    pub driver: ConsoleDriverConfig,
    /// Enable the console when the broker starts
    #[serde(default = "default_true")]
    pub enabled: bool,
}

/// Static definition of a target
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetConfig {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub target_type: TargetType,
    pub arch: String,
    pub toolchains: Vec<Toolchain>,
    /// RAM capacity in bytes
    pub ram: u64,
    /// Flash capacity in bytes
    pub flash: u64,
    #[serde(default)]
    pub features: Vec<String>,
    #[serde(default)]
    pub testing: TestingPolicy,
    /// Power rail, in the order components must be powered
    #[serde(default)]
    pub power: Vec<PowerComponentConfig>,
    /// Wait between the off and on halves of a power cycle
    #[serde(
        default = "default_cycle_wait",
        with = "super::serde_utils::duration_secs_f64"
    )]
    pub power_cycle_wait: Duration,
    #[serde(default)]
    pub consoles: Vec<ConsoleConfig>,
    /// Initial values of runtime properties
    #[serde(default)]
    pub properties: BTreeMap<String, serde_json::Value>,
}

/// Selector keywords a component name may not shadow
const RESERVED_COMPONENT_NAMES: &[&str] = &["all", "full"];

impl TargetConfig {
    /// Check the entry is well formed
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !is_valid_id(&self.id) {
            return Err(ConfigError::Invalid(format!(
                "target id '{}' must be non-empty and use only [A-Za-z0-9._-]",
                self.id
            )));
        }
        if self.name.trim().is_empty() {
            return Err(ConfigError::Invalid(format!("target {}: empty name", self.id)));
        }
        if self.arch.trim().is_empty() {
            return Err(ConfigError::Invalid(format!("target {}: empty arch", self.id)));
        }
        if self.toolchains.is_empty() {
            return Err(ConfigError::Invalid(format!(
                "target {}: at least one toolchain is required",
                self.id
            )));
        }

        let mut seen = HashSet::new();
        for component in &self.power {
            if component.name.is_empty() || RESERVED_COMPONENT_NAMES.contains(&component.name.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "target {}: invalid power component name '{}'",
                    self.id, component.name
                )));
            }
            if !seen.insert(component.name.as_str()) {
                return Err(ConfigError::Duplicate {
                    kind: "power component",
                    name: format!("{}/{}", self.id, component.name),
                });
            }
            if let PowerDriverConfig::Command { on, off, state } = &component.driver {
                if on.trim().is_empty() || off.trim().is_empty() || state.trim().is_empty() {
                    return Err(ConfigError::Invalid(format!(
                        "target {}: power component {} has an empty command",
                        self.id, component.name
                    )));
                }
            }
        }

        let mut seen = HashSet::new();
        for console in &self.consoles {
            if console.name.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "target {}: empty console name",
                    self.id
                )));
            }
            if !seen.insert(console.name.as_str()) {
                return Err(ConfigError::Duplicate {
                    kind: "console",
                    name: format!("{}/{}", self.id, console.name),
                });
            }
            if let ConsoleDriverConfig::Command { program, .. } = &console.driver {
                if program.trim().is_empty() {
                    return Err(ConfigError::Invalid(format!(
                        "target {}: console {} has an empty program",
                        self.id, console.name
                    )));
                }
            }
        }

        Ok(())
    }
}

fn is_valid_id(id: &str) -> bool {
    !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
}

fn default_true() -> bool {
    true
}

fn default_cycle_wait() -> Duration {
    Duration::from_secs(2)
}

//! Power rail control
//!
//! Each target has an ordered rail of named power components. Actions on
//! one target are serialized by a per-target lock; different targets never
//! wait on each other.

mod controller;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use tb_core::config::Explicit;
use tb_core::types::{ComponentSelector, PowerAction};
use tb_core::{BrokerError, TargetId};

pub use controller::PowerController;

/// What happened to one component during an action
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum OutcomeStatus {
    /// The driver carried out the action
    Succeeded,
    /// Already in the requested state; the driver was not invoked
    Unchanged,
    Failed { reason: String },
    /// Skipped because an earlier component failed
    NotAttempted,
}

impl OutcomeStatus {
    pub fn is_ok(&self) -> bool {
        matches!(self, OutcomeStatus::Succeeded | OutcomeStatus::Unchanged)
    }
}

/// Result of one step on one component
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComponentOutcome {
    pub component: String,
    pub action: PowerAction,
    #[serde(flatten)]
    pub status: OutcomeStatus,
}

/// Per-component result of an `apply`
///
/// A cycle over several components lists the whole off phase followed by
/// the whole on phase.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PowerReport {
    pub target: TargetId,
    pub action: PowerAction,
    pub selector: String,
    pub outcomes: Vec<ComponentOutcome>,
    /// Component whose failure aborted the action
    pub failed: Option<String>,
}

impl PowerReport {
    pub fn is_success(&self) -> bool {
        self.failed.is_none()
    }

    /// Outcome of `action` on `component`, if it was part of the plan
    pub fn outcome(&self, component: &str, action: PowerAction) -> Option<&OutcomeStatus> {
        self.outcomes
            .iter()
            .find(|o| o.component == component && o.action == action)
            .map(|o| &o.status)
    }
}

/// Overall state of a rail beyond plain on/off
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Substate {
    /// Regular components agree; explicit ones may differ
    Normal,
    /// Every component, explicit ones included, is on
    Full,
    /// Regular components disagree
    Inconsistent,
}

/// State of one component as last queried
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComponentStatus {
    pub name: String,
    pub state: bool,
    pub explicit: Option<Explicit>,
    /// Unix milliseconds of the last change made through the broker
    pub last_transition: u64,
}

/// Snapshot of a rail taken within one transaction
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PowerList {
    /// Whether every regular component is on
    pub state: bool,
    pub substate: Substate,
    /// In rail order
    pub components: Vec<ComponentStatus>,
}

impl PowerList {
    pub(crate) fn aggregate(components: Vec<ComponentStatus>) -> Self {
        if components.is_empty() {
            return Self {
                state: false,
                substate: Substate::Normal,
                components,
            };
        }

        let regular: Vec<bool> = components
            .iter()
            .filter(|c| c.explicit.is_none())
            .map(|c| c.state)
            .collect();
        let considered: Vec<bool> = if regular.is_empty() {
            components.iter().map(|c| c.state).collect()
        } else {
            regular
        };

        let state = considered.iter().all(|on| *on);
        let mixed = considered.iter().any(|on| *on) && !state;
        let substate = if components.iter().all(|c| c.state) {
            Substate::Full
        } else if mixed {
            Substate::Inconsistent
        } else {
            Substate::Normal
        };
        Self {
            state,
            substate,
            components,
        }
    }

    pub fn get(&self, component: &str) -> Option<bool> {
        self.components
            .iter()
            .find(|c| c.name == component)
            .map(|c| c.state)
    }
}

/// One step of a power sequence
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SequenceStep {
    Power {
        action: PowerAction,
        selector: ComponentSelector,
    },
    Wait(Duration),
}

impl FromStr for SequenceStep {
    type Err = BrokerError;

    /// `on:<selector>`, `off:<selector>`, `cycle:<selector>` or
    /// `wait:<seconds>`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (op, arg) = s.split_once(':').unwrap_or((s, ""));
        let op = op.trim();
        let arg = arg.trim();
        if op == "wait" {
            let secs: f64 = arg.parse().map_err(|_| {
                BrokerError::InvalidInput(format!("invalid wait time '{}'", arg))
            })?;
            let wait = Duration::try_from_secs_f64(secs).map_err(|_| {
                BrokerError::InvalidInput(format!("invalid wait time '{}'", arg))
            })?;
            return Ok(SequenceStep::Wait(wait));
        }

        let action: PowerAction = op.parse()?;
        Ok(SequenceStep::Power {
            action,
            selector: ComponentSelector::parse(Some(arg)),
        })
    }
}

impl fmt::Display for SequenceStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SequenceStep::Power { action, selector } => write!(f, "{}:{}", action, selector),
            SequenceStep::Wait(wait) => write!(f, "wait:{}", wait.as_secs_f64()),
        }
    }
}

/// Result of a power sequence; stops at the first failing step
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SequenceReport {
    pub reports: Vec<PowerReport>,
    pub completed: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status(name: &str, state: bool, explicit: Option<Explicit>) -> ComponentStatus {
        ComponentStatus {
            name: name.into(),
            state,
            explicit,
            last_transition: 0,
        }
    }

    #[test]
    fn test_aggregate_substates() {
        let list = PowerList::aggregate(vec![
            status("relay", true, None),
            status("board", true, None),
            status("jtag", false, Some(Explicit::On)),
        ]);
        assert!(list.state);
        assert_eq!(list.substate, Substate::Normal);

        let list = PowerList::aggregate(vec![
            status("relay", true, None),
            status("jtag", true, Some(Explicit::Both)),
        ]);
        assert_eq!(list.substate, Substate::Full);

        let list = PowerList::aggregate(vec![
            status("relay", true, None),
            status("board", false, None),
        ]);
        assert!(!list.state);
        assert_eq!(list.substate, Substate::Inconsistent);
    }

    #[test]
    fn test_parse_sequence_steps() {
        assert_eq!(
            "on:all".parse::<SequenceStep>().unwrap(),
            SequenceStep::Power {
                action: PowerAction::On,
                selector: ComponentSelector::All
            }
        );
        assert_eq!(
            "cycle:relay".parse::<SequenceStep>().unwrap(),
            SequenceStep::Power {
                action: PowerAction::Cycle,
                selector: ComponentSelector::Named("relay".into())
            }
        );
        assert_eq!(
            "wait:1.5".parse::<SequenceStep>().unwrap(),
            SequenceStep::Wait(Duration::from_millis(1500))
        );
        assert!("wait:-1".parse::<SequenceStep>().is_err());
        assert!("reboot:all".parse::<SequenceStep>().is_err());
    }

    #[test]
    fn test_outcome_serializes_flat() {
        let outcome = ComponentOutcome {
            component: "relay".into(),
            action: PowerAction::Off,
            status: OutcomeStatus::Failed {
                reason: "stuck".into(),
            },
        };
        let json = serde_json::to_value(&outcome).unwrap();
        assert_eq!(json["status"], "failed");
        assert_eq!(json["reason"], "stuck");
        assert_eq!(json["action"], "off");
    }
}

//! Allocation management
//!
//! Arbitrates exclusive ownership of groups of targets among principals,
//! queues requests for busy targets and grants guests scoped access.

mod guest;
mod manager;
mod reaper;

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use tb_core::config::serde_utils::duration_secs;
use tb_core::{AllocationId, TargetId};

pub use manager::AllocationManager;
pub use reaper::{run_expiry_reaper, sweep_expired};

/// Targets reserved together, keyed by the alias the client uses for them
pub type TargetGroup = BTreeMap<String, BTreeSet<TargetId>>;

/// Lifecycle of an allocation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AllocationState {
    /// Waiting for every target of its group to be free
    Queued,
    /// Owns every target of its group
    Active,
    /// Gone; kept only by callers still holding a handle
    Released,
}

/// When an allocation is released without the owner asking
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExpiryPolicy {
    /// Lives until released
    Never,
    /// Expires at an absolute Unix time in milliseconds
    Endtime { at: u64 },
    /// Expires after `timeout` without keepalive or target activity
    Idle {
        #[serde(with = "duration_secs")]
        timeout: Duration,
    },
}

/// Result of an acquire request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireOutcome {
    /// Every target of the group is now owned by the allocation
    Granted(AllocationId),
    /// Admitted to the FIFO queue; will be promoted automatically
    Queued {
        id: AllocationId,
        position: usize,
    },
}

impl AcquireOutcome {
    pub fn id(&self) -> AllocationId {
        match self {
            AcquireOutcome::Granted(id) => *id,
            AcquireOutcome::Queued { id, .. } => *id,
        }
    }
}

/// Serializable view of an allocation
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AllocationInfo {
    pub id: AllocationId,
    pub owner: String,
    pub state: AllocationState,
    /// 1-based position in the queue while queued
    pub queue_position: Option<usize>,
    pub group: TargetGroup,
    pub guests: BTreeSet<String>,
    pub created_at: u64,
    pub last_activity: u64,
    pub expiry: ExpiryPolicy,
}

/// Allocation lifecycle notifications
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AllocationEvent {
    Granted { id: AllocationId, owner: String },
    Queued { id: AllocationId, position: usize },
    Promoted { id: AllocationId },
    Released { id: AllocationId, forced: bool },
    Expired { id: AllocationId },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expiry_policy_serde() {
        let idle: ExpiryPolicy =
            serde_json::from_str(r#"{"kind":"idle","timeout":30}"#).unwrap();
        assert_eq!(
            idle,
            ExpiryPolicy::Idle {
                timeout: Duration::from_secs(30)
            }
        );

        let end: ExpiryPolicy = serde_json::from_str(r#"{"kind":"endtime","at":1700}"#).unwrap();
        assert_eq!(end, ExpiryPolicy::Endtime { at: 1700 });
    }

    #[test]
    fn test_state_serializes_snake_case() {
        assert_eq!(
            serde_json::to_string(&AllocationState::Queued).unwrap(),
            r#""queued""#
        );
    }
}

//! Per-node execution status.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Status of a node within an execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum NodeStatus {
    /// Not yet attempted in this run
    Pending,
    /// Backend call in flight
    InProgress,
    /// Resource exists in the desired state
    Succeeded,
    /// Apply or delete failed; see the node's error
    Failed,
    /// Resource was deleted by rollback or teardown
    RolledBack,
}

impl NodeStatus {
    /// Whether the status is terminal for a stage barrier
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::RolledBack)
    }

    /// Whether a transition to `next` is allowed within a run.
    ///
    /// Forward: Pending -> InProgress -> Succeeded | Failed.
    /// Rollback and teardown: Succeeded | Pending -> RolledBack | Failed,
    /// Failed -> RolledBack. A Pending node reaches rollback only while it
    /// still holds the handle of a resource created by an earlier run.
    #[must_use]
    pub const fn can_transition_to(&self, next: NodeStatus) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::InProgress)
                | (Self::InProgress, Self::Succeeded)
                | (Self::InProgress, Self::Failed)
                | (Self::Succeeded, Self::RolledBack)
                | (Self::Succeeded, Self::Failed)
                | (Self::Pending, Self::RolledBack)
                | (Self::Pending, Self::Failed)
                | (Self::Failed, Self::RolledBack)
        )
    }

    /// Status a node starts from when a prior result is resumed
    #[must_use]
    pub const fn resume_from(&self) -> NodeStatus {
        match self {
            Self::Succeeded => Self::Succeeded,
            Self::Pending | Self::InProgress | Self::Failed | Self::RolledBack => Self::Pending,
        }
    }
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::InProgress => "in-progress",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::RolledBack => "rolled-back",
        };
        f.write_str(s)
    }
}

/// Rejected status transition
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Illegal status transition for {node}: {from} -> {to}")]
pub struct StatusTransitionError {
    /// Node whose transition was rejected
    pub node: String,
    /// Current status
    pub from: NodeStatus,
    /// Requested status
    pub to: NodeStatus,
}

//! Execution results.
//!
//! An [`ExecutionResult`] is both the report of a run and the input to the
//! next one: handles and fingerprints recorded here let a later apply skip
//! unchanged nodes and let teardown find what to delete.

use crate::backend::BackendHandle;
use chrono::{DateTime, Utc};
use meridian_core::{Fingerprint, NodeId, NodeStatus, ResourceKind, RunId, StackId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Which plan a run walked
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    /// Forward plan
    Apply,
    /// Teardown plan
    Teardown,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Apply => f.write_str("apply"),
            Self::Teardown => f.write_str("teardown"),
        }
    }
}

/// Overall outcome of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    /// Every node reached its target status
    Succeeded,
    /// At least one node failed
    Failed,
    /// Cancelled between stages
    Cancelled,
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Succeeded => f.write_str("succeeded"),
            Self::Failed => f.write_str("failed"),
            Self::Cancelled => f.write_str("cancelled"),
        }
    }
}

/// Where a failure happened
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePhase {
    /// Creating or updating
    Apply,
    /// Deleting during rollback
    Rollback,
    /// Deleting during teardown
    Teardown,
}

/// Per-node state after a run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeRecord {
    /// Kind of the node
    pub kind: ResourceKind,
    /// Final status
    pub status: NodeStatus,
    /// Handle of the live resource, if one exists
    #[serde(default)]
    pub handle: Option<BackendHandle>,
    /// Fingerprint of the declaration last applied
    #[serde(default)]
    pub fingerprint: Option<Fingerprint>,
    /// Backend calls made for this node in the run
    #[serde(default)]
    pub attempts: u32,
    /// Error text when the node failed
    #[serde(default)]
    pub error: Option<String>,
}

impl NodeRecord {
    /// A record nobody has touched
    #[must_use]
    pub fn pending(kind: ResourceKind) -> Self {
        Self {
            kind,
            status: NodeStatus::Pending,
            handle: None,
            fingerprint: None,
            attempts: 0,
            error: None,
        }
    }

    /// Whether a live resource may exist behind this record.
    ///
    /// Any record with a handle counts, including a Pending node reset by a
    /// changed declaration that the run never got to.
    #[must_use]
    pub fn holds_resource(&self) -> bool {
        self.handle.is_some() && self.status != NodeStatus::RolledBack
    }
}

/// A failed node and its blast radius
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureReport {
    /// Node that failed
    pub node: NodeId,
    /// Phase the failure happened in
    pub phase: FailurePhase,
    /// Error text
    pub error: String,
    /// Transitive dependents that were never attempted
    pub blocked: Vec<NodeId>,
    /// Nodes deleted by the rollback this failure triggered
    pub rolled_back: Vec<NodeId>,
}

impl fmt::Display for FailureReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} failed: {}", self.node, self.error)?;
        if !self.blocked.is_empty() {
            let blocked: Vec<&str> = self.blocked.iter().map(NodeId::as_str).collect();
            write!(f, " (blocked: {})", blocked.join(", "))?;
        }
        Ok(())
    }
}

/// Report of one apply or teardown run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionResult {
    /// Run identity
    pub run: RunId,
    /// Stack the run acted on
    pub stack: StackId,
    /// Plan that was walked
    pub operation: Operation,
    /// Overall outcome
    pub outcome: Outcome,
    /// Stages that completed
    pub stages_completed: usize,
    /// Every node of the graph with its final record
    pub nodes: BTreeMap<NodeId, NodeRecord>,
    /// Failures in the order they were recorded
    #[serde(default)]
    pub failures: Vec<FailureReport>,
    /// Run start
    pub started_at: DateTime<Utc>,
    /// Run end
    pub finished_at: DateTime<Utc>,
}

impl ExecutionResult {
    /// Status of a node
    #[must_use]
    pub fn status(&self, id: &NodeId) -> Option<NodeStatus> {
        self.nodes.get(id).map(|r| r.status)
    }

    /// Record of a node
    #[must_use]
    pub fn record(&self, id: &NodeId) -> Option<&NodeRecord> {
        self.nodes.get(id)
    }

    /// Ids of the nodes in `status`
    #[must_use]
    pub fn nodes_with(&self, status: NodeStatus) -> Vec<&NodeId> {
        self.nodes
            .iter()
            .filter(|(_, r)| r.status == status)
            .map(|(id, _)| id)
            .collect()
    }

    /// Number of nodes in `status`
    #[must_use]
    pub fn count(&self, status: NodeStatus) -> usize {
        self.nodes.values().filter(|r| r.status == status).count()
    }

    /// Whether the run succeeded
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.outcome == Outcome::Succeeded
    }

    /// Whether any live resource may remain
    #[must_use]
    pub fn has_live_resources(&self) -> bool {
        self.nodes.values().any(NodeRecord::holds_resource)
    }

    /// Process exit code for the run
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        match self.outcome {
            Outcome::Succeeded => 0,
            Outcome::Failed | Outcome::Cancelled => 1,
        }
    }

    /// Wall-clock duration of the run
    #[must_use]
    pub fn duration(&self) -> chrono::Duration {
        self.finished_at - self.started_at
    }
}

impl fmt::Display for ExecutionResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {}: {} succeeded, {} failed, {} rolled back, {} pending",
            self.operation,
            self.stack,
            self.outcome,
            self.count(NodeStatus::Succeeded),
            self.count(NodeStatus::Failed),
            self.count(NodeStatus::RolledBack),
            self.count(NodeStatus::Pending),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> ExecutionResult {
        let now = Utc::now();
        let mut nodes = BTreeMap::new();
        let mut ok = NodeRecord::pending(ResourceKind::Network);
        ok.status = NodeStatus::Succeeded;
        ok.handle = Some(BackendHandle::new(NodeId::new("vpc"), ResourceKind::Network, "vpc-1"));
        nodes.insert(NodeId::new("vpc"), ok);
        let mut failed = NodeRecord::pending(ResourceKind::Role);
        failed.status = NodeStatus::Failed;
        failed.error = Some("Permission denied: iam".into());
        nodes.insert(NodeId::new("role"), failed);
        nodes.insert(NodeId::new("svc"), NodeRecord::pending(ResourceKind::Service));

        ExecutionResult {
            run: RunId::new(),
            stack: StackId::new("demo"),
            operation: Operation::Apply,
            outcome: Outcome::Failed,
            stages_completed: 0,
            nodes,
            failures: vec![FailureReport {
                node: NodeId::new("role"),
                phase: FailurePhase::Apply,
                error: "Permission denied: iam".into(),
                blocked: vec![NodeId::new("svc")],
                rolled_back: Vec::new(),
            }],
            started_at: now,
            finished_at: now,
        }
    }

    #[test]
    fn test_counts_and_exit_code() {
        let result = sample();
        assert_eq!(result.count(NodeStatus::Succeeded), 1);
        assert_eq!(result.nodes_with(NodeStatus::Pending), vec![&NodeId::new("svc")]);
        assert_eq!(result.exit_code(), 1);
        assert!(!result.is_success());
        assert!(result.has_live_resources());
    }

    #[test]
    fn test_failure_display() {
        let result = sample();
        assert_eq!(
            result.failures[0].to_string(),
            "role failed: Permission denied: iam (blocked: svc)"
        );
    }

    #[test]
    fn test_json_roundtrip() {
        let result = sample();
        let json = serde_json::to_string(&result).unwrap();
        let back: ExecutionResult = serde_json::from_str(&json).unwrap();
        assert_eq!(back, result);
    }
}

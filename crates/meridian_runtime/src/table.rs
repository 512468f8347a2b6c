//! Per-run node status table.
//!
//! Every status change goes through [`NodeStatus::can_transition_to`]; an
//! illegal transition is an engine bug and surfaces as an error rather than
//! silently corrupting the persisted result.

use crate::backend::BackendHandle;
use crate::result::{ExecutionResult, NodeRecord};
use meridian_core::{CoreError, CoreResult, Fingerprint, NodeId, NodeStatus, StatusTransitionError};
use meridian_plan::Graph;
use std::collections::BTreeMap;

/// Node records of one run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatusTable {
    records: BTreeMap<NodeId, NodeRecord>,
}

impl StatusTable {
    /// Every node of the graph, pending
    #[must_use]
    pub fn fresh(graph: &Graph) -> Self {
        let records = graph
            .nodes()
            .map(|node| (node.id.clone(), NodeRecord::pending(node.kind)))
            .collect();
        Self { records }
    }

    /// Seed an apply run, resuming from `prior` when given.
    ///
    /// Succeeded nodes whose declaration is unchanged stay Succeeded and are
    /// skipped. Changed nodes and every other status restart at Pending,
    /// keeping any handle so the resource is updated rather than recreated.
    #[must_use]
    pub fn for_apply(graph: &Graph, prior: Option<&ExecutionResult>) -> Self {
        let mut table = Self::fresh(graph);
        let Some(prior) = prior else {
            return table;
        };

        for node in graph.nodes() {
            let Some(previous) = prior.record(&node.id) else {
                continue;
            };
            if previous.kind != node.kind {
                tracing::warn!(node = %node.id, from = %previous.kind, to = %node.kind, "kind changed, node will be created fresh");
                continue;
            }

            let mut record = previous.clone();
            record.attempts = 0;
            record.status = previous.status.resume_from();
            if record.status == NodeStatus::Succeeded
                && record.fingerprint != Some(Fingerprint::of(node))
            {
                tracing::debug!(node = %node.id, "declaration changed since last apply");
                record.status = NodeStatus::Pending;
            }
            if record.status == NodeStatus::Pending {
                record.error = None;
            }
            table.records.insert(node.id.clone(), record);
        }
        table
    }

    /// Seed a teardown run from the last known state
    #[must_use]
    pub fn for_teardown(graph: &Graph, prior: Option<&ExecutionResult>) -> Self {
        let mut table = Self::fresh(graph);
        let Some(prior) = prior else {
            return table;
        };

        for node in graph.nodes() {
            if let Some(previous) = prior.record(&node.id) {
                let mut record = previous.clone();
                record.attempts = 0;
                if record.status == NodeStatus::InProgress {
                    record.status = NodeStatus::Failed;
                }
                table.records.insert(node.id.clone(), record);
            }
        }
        table
    }

    /// Record of a node
    #[must_use]
    pub fn get(&self, id: &NodeId) -> Option<&NodeRecord> {
        self.records.get(id)
    }

    /// Status of a node
    #[must_use]
    pub fn status(&self, id: &NodeId) -> Option<NodeStatus> {
        self.records.get(id).map(|r| r.status)
    }

    /// Handle of a node
    #[must_use]
    pub fn handle(&self, id: &NodeId) -> Option<&BackendHandle> {
        self.records.get(id).and_then(|r| r.handle.as_ref())
    }

    /// Whether a live resource may exist behind the node
    #[must_use]
    pub fn holds_resource(&self, id: &NodeId) -> bool {
        self.records.get(id).is_some_and(NodeRecord::holds_resource)
    }

    /// Iterate records in id order
    pub fn iter(&self) -> impl Iterator<Item = (&NodeId, &NodeRecord)> + '_ {
        self.records.iter()
    }

    /// Move a node to `next`
    ///
    /// # Errors
    ///
    /// Returns error if the node is unknown or the transition is illegal
    pub fn transition(&mut self, id: &NodeId, next: NodeStatus) -> CoreResult<&mut NodeRecord> {
        let record = self.records.get_mut(id).ok_or_else(|| CoreError::NotFound {
            kind: "node".to_string(),
            id: id.to_string(),
        })?;
        if !record.status.can_transition_to(next) {
            return Err(StatusTransitionError {
                node: id.to_string(),
                from: record.status,
                to: next,
            }
            .into());
        }
        record.status = next;
        Ok(record)
    }

    /// Start work on a pending node, returning the handle it already holds
    ///
    /// # Errors
    ///
    /// Returns error if the node is not pending
    pub fn begin(&mut self, id: &NodeId) -> CoreResult<Option<BackendHandle>> {
        let record = self.transition(id, NodeStatus::InProgress)?;
        record.error = None;
        Ok(record.handle.clone())
    }

    /// Attach a handle without changing status
    pub fn attach_handle(&mut self, id: &NodeId, handle: BackendHandle) {
        if let Some(record) = self.records.get_mut(id) {
            record.handle = Some(handle);
        }
    }

    /// Add backend attempts to a node's count
    pub fn add_attempts(&mut self, id: &NodeId, attempts: u32) {
        if let Some(record) = self.records.get_mut(id) {
            record.attempts += attempts;
        }
    }

    /// Mark an in-progress node applied
    ///
    /// # Errors
    ///
    /// Returns error if the node is not in progress
    pub fn succeed(&mut self, id: &NodeId, fingerprint: Fingerprint) -> CoreResult<()> {
        let record = self.transition(id, NodeStatus::Succeeded)?;
        record.fingerprint = Some(fingerprint);
        record.error = None;
        Ok(())
    }

    /// Mark a node failed.
    ///
    /// A node that is already Failed keeps its status; the new error is
    /// appended to the first one.
    ///
    /// # Errors
    ///
    /// Returns error if the node cannot move to Failed
    pub fn fail(&mut self, id: &NodeId, error: impl Into<String>) -> CoreResult<()> {
        let error = error.into();
        if self.status(id) == Some(NodeStatus::Failed) {
            if let Some(record) = self.records.get_mut(id) {
                record.error = Some(match record.error.take() {
                    Some(first) => format!("{}; {}", first, error),
                    None => error,
                });
            }
            return Ok(());
        }
        let record = self.transition(id, NodeStatus::Failed)?;
        record.error = Some(error);
        Ok(())
    }

    /// Mark a node's resource deleted
    ///
    /// # Errors
    ///
    /// Returns error if the node holds no resource from this or an earlier run
    pub fn roll_back(&mut self, id: &NodeId) -> CoreResult<()> {
        let record = self.transition(id, NodeStatus::RolledBack)?;
        record.handle = None;
        record.fingerprint = None;
        Ok(())
    }

    /// Consume into the persisted record map
    #[must_use]
    pub fn into_records(self) -> BTreeMap<NodeId, NodeRecord> {
        self.records
    }
}

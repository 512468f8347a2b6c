//! Compile-time errors.
//!
//! Every variant is raised before any backend call is made.

use meridian_core::NodeId;

/// Error building, validating or compiling a graph
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GraphError {
    /// The reference relation contains a cycle
    #[error("Dependency cycle: {}", format_cycle(.cycle))]
    Cycle {
        /// Nodes on the cycle, in dependency order
        cycle: Vec<NodeId>,
    },

    /// A reference names a node that was not declared
    #[error("Node {from} references unknown node {to}")]
    DanglingReference {
        /// Referencing node
        from: NodeId,
        /// Missing target
        to: NodeId,
    },

    /// The same id was declared twice
    #[error("Node {id} is declared more than once")]
    DuplicateNode {
        /// Duplicated id
        id: NodeId,
    },

    /// A node violates a kind-specific rule
    #[error("Invalid node {node}: {reason}")]
    InvalidNode {
        /// Offending node
        node: NodeId,
        /// Rule that was violated
        reason: String,
    },
}

fn format_cycle(cycle: &[NodeId]) -> String {
    let mut parts: Vec<&str> = cycle.iter().map(NodeId::as_str).collect();
    if let Some(first) = cycle.first() {
        parts.push(first.as_str());
    }
    parts.join(" -> ")
}

//! Compiler from a dependency graph to staged plans.
//!
//! Stages are computed with Kahn's algorithm: every node whose dependencies
//! are all placed goes into the next stage. Nodes inside a stage are sorted
//! by id so identical input always yields an identical plan. The teardown
//! plan is the forward plan with its stage order reversed.

use crate::error::GraphError;
use crate::graph::Graph;
use crate::validate::{PlanWarning, Validator};
use meridian_core::NodeId;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// A set of nodes with no dependency edges between them
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Stage {
    nodes: Vec<NodeId>,
}

impl Stage {
    /// Create a stage; ids are sorted and deduplicated
    #[must_use]
    pub fn new(nodes: impl IntoIterator<Item = NodeId>) -> Self {
        let set: BTreeSet<NodeId> = nodes.into_iter().collect();
        Self {
            nodes: set.into_iter().collect(),
        }
    }

    /// Node ids in ascending order
    #[must_use]
    pub fn nodes(&self) -> &[NodeId] {
        &self.nodes
    }

    /// Whether the stage holds `id`
    #[must_use]
    pub fn contains(&self, id: &NodeId) -> bool {
        self.nodes.binary_search(id).is_ok()
    }

    /// Number of nodes
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Check if empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.nodes.iter().map(NodeId::as_str).collect();
        write!(f, "{{{}}}", names.join(", "))
    }
}

/// Ordered sequence of stages
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct Plan {
    stages: Vec<Stage>,
}

impl Plan {
    /// Create a plan from stages
    #[must_use]
    pub fn new(stages: Vec<Stage>) -> Self {
        Self { stages }
    }

    /// Stages in execution order
    #[must_use]
    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    /// Index of the stage holding `id`
    #[must_use]
    pub fn stage_of(&self, id: &NodeId) -> Option<usize> {
        self.stages.iter().position(|s| s.contains(id))
    }

    /// Every node id, stage by stage
    pub fn node_ids(&self) -> impl Iterator<Item = &NodeId> {
        self.stages.iter().flat_map(|s| s.nodes.iter())
    }

    /// The mirror image of this plan
    #[must_use]
    pub fn reversed(&self) -> Plan {
        Plan {
            stages: self.stages.iter().rev().cloned().collect(),
        }
    }

    /// Number of stages
    #[must_use]
    pub fn len(&self) -> usize {
        self.stages.len()
    }

    /// Total number of nodes
    #[must_use]
    pub fn node_count(&self) -> usize {
        self.stages.iter().map(Stage::len).sum()
    }

    /// Check if plan is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }
}

impl fmt::Display for Plan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let stages: Vec<String> = self.stages.iter().map(Stage::to_string).collect();
        write!(f, "[{}]", stages.join(", "))
    }
}

/// Output from compiling a graph
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledPlan {
    /// Create/update order
    pub forward: Plan,
    /// Exact reverse of `forward`
    pub teardown: Plan,
    /// Validation warnings
    pub warnings: Vec<PlanWarning>,
}

/// Compiler for transforming a graph into plans
#[derive(Debug, Clone, Default)]
pub struct PlanCompiler {
    validator: Validator,
}

impl PlanCompiler {
    /// Create a new compiler with the default validator
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Use a custom validator
    #[must_use]
    pub fn with_validator(mut self, validator: Validator) -> Self {
        self.validator = validator;
        self
    }

    /// Validate and compile a graph
    ///
    /// # Errors
    ///
    /// Returns `InvalidNode` from validation, or `Cycle` if the graph was
    /// assembled without going through the builder
    pub fn compile(&self, graph: &Graph) -> Result<CompiledPlan, GraphError> {
        let warnings = self.validator.validate(graph)?;
        let forward = stages(graph)?;
        let teardown = forward.reversed();

        tracing::debug!(
            stages = forward.len(),
            nodes = forward.node_count(),
            warnings = warnings.len(),
            "compiled plan"
        );

        Ok(CompiledPlan {
            forward,
            teardown,
            warnings,
        })
    }
}

/// Kahn's algorithm with whole-frontier extraction.
fn stages(graph: &Graph) -> Result<Plan, GraphError> {
    let mut unresolved: BTreeMap<&NodeId, usize> = graph
        .nodes()
        .map(|node| (&node.id, node.references.len()))
        .collect();

    let mut frontier: Vec<&NodeId> = unresolved
        .iter()
        .filter(|(_, count)| **count == 0)
        .map(|(id, _)| *id)
        .collect();

    let mut stages = Vec::new();
    while !frontier.is_empty() {
        let mut next: BTreeSet<&NodeId> = BTreeSet::new();
        for id in &frontier {
            unresolved.remove(*id);
        }
        for id in &frontier {
            for dependent in graph.dependents(id) {
                if let Some(count) = unresolved.get_mut(dependent) {
                    *count = count.saturating_sub(1);
                    if *count == 0 {
                        next.insert(dependent);
                    }
                }
            }
        }
        stages.push(Stage::new(frontier.iter().map(|id| (*id).clone())));
        frontier = next.into_iter().collect();
    }

    if !unresolved.is_empty() {
        return Err(GraphError::Cycle {
            cycle: unresolved.keys().map(|id| (*id).clone()).collect(),
        });
    }

    Ok(Plan::new(stages))
}

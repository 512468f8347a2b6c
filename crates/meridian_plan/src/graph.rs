//! Dependency graph over declared resource nodes.
//!
//! Edges are derived from each node's `references`: `A` referencing `B`
//! means `A` depends on `B`, so `B` must be stable before `A` is applied.
//! Building a graph checks that every reference resolves and that the
//! reference relation is acyclic.

use crate::error::GraphError;
use indexmap::IndexMap;
use meridian_core::{NodeId, ResourceKind, ResourceNode};
use std::collections::{BTreeMap, BTreeSet, HashMap, btree_set};

static EMPTY: BTreeSet<NodeId> = BTreeSet::new();

/// A dependency edge: `dependent` depends on `dependency`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Edge {
    /// Node holding the reference
    pub dependent: NodeId,
    /// Node being referenced
    pub dependency: NodeId,
}

impl Edge {
    /// Create a new edge
    #[must_use]
    pub fn new(dependent: NodeId, dependency: NodeId) -> Self {
        Self {
            dependent,
            dependency,
        }
    }
}

/// Validated, acyclic dependency graph
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Graph {
    /// Nodes in declaration order
    nodes: IndexMap<NodeId, ResourceNode>,
    /// Reverse edges: node -> nodes that reference it
    dependents: BTreeMap<NodeId, BTreeSet<NodeId>>,
}

impl Graph {
    /// Build a graph from a set of declared nodes
    ///
    /// # Errors
    ///
    /// Returns `DuplicateNode`, `DanglingReference` or `Cycle`
    pub fn build(nodes: impl IntoIterator<Item = ResourceNode>) -> Result<Self, GraphError> {
        let mut builder = GraphBuilder::new();
        for node in nodes {
            builder.add_node(node)?;
        }
        builder.build()
    }

    /// Get node by id
    #[must_use]
    pub fn node(&self, id: &NodeId) -> Option<&ResourceNode> {
        self.nodes.get(id)
    }

    /// Iterate nodes in declaration order
    pub fn nodes(&self) -> impl Iterator<Item = &ResourceNode> {
        self.nodes.values()
    }

    /// Iterate node ids in declaration order
    pub fn node_ids(&self) -> impl Iterator<Item = &NodeId> {
        self.nodes.keys()
    }

    /// Nodes the given node depends on
    #[must_use]
    pub fn dependencies(&self, id: &NodeId) -> &BTreeSet<NodeId> {
        self.nodes.get(id).map_or(&EMPTY, |n| &n.references)
    }

    /// Nodes that depend directly on the given node
    #[must_use]
    pub fn dependents(&self, id: &NodeId) -> &BTreeSet<NodeId> {
        self.dependents.get(id).unwrap_or(&EMPTY)
    }

    /// Every node that depends on the given node, directly or transitively
    #[must_use]
    pub fn transitive_dependents(&self, id: &NodeId) -> BTreeSet<NodeId> {
        let mut seen = BTreeSet::new();
        let mut stack: Vec<&NodeId> = self.dependents(id).iter().collect();
        while let Some(current) = stack.pop() {
            if seen.insert(current.clone()) {
                stack.extend(self.dependents(current));
            }
        }
        seen
    }

    /// Direct dependencies of `id` having the given kind
    #[must_use]
    pub fn dependencies_of_kind(&self, id: &NodeId, kind: ResourceKind) -> Vec<&ResourceNode> {
        self.dependencies(id)
            .iter()
            .filter_map(|dep| self.nodes.get(dep))
            .filter(|node| node.kind == kind)
            .collect()
    }

    /// All edges, sorted
    #[must_use]
    pub fn edges(&self) -> Vec<Edge> {
        let mut edges: Vec<Edge> = self
            .nodes
            .values()
            .flat_map(|node| {
                node.references
                    .iter()
                    .map(move |dep| Edge::new(node.id.clone(), dep.clone()))
            })
            .collect();
        edges.sort();
        edges
    }

    /// Get total node count
    #[must_use]
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Get total edge count
    #[must_use]
    pub fn edge_count(&self) -> usize {
        self.nodes.values().map(|n| n.references.len()).sum()
    }

    /// Check if graph is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

/// Accumulates declared nodes and validates them into a [`Graph`]
#[derive(Debug, Default)]
pub struct GraphBuilder {
    nodes: IndexMap<NodeId, ResourceNode>,
}

impl GraphBuilder {
    /// Create a new empty builder
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a node
    ///
    /// # Errors
    ///
    /// Returns error if a node with the same id was already added
    pub fn add_node(&mut self, node: ResourceNode) -> Result<(), GraphError> {
        if self.nodes.contains_key(&node.id) {
            return Err(GraphError::DuplicateNode { id: node.id });
        }
        self.nodes.insert(node.id.clone(), node);
        Ok(())
    }

    /// Validate references and acyclicity, producing the graph
    ///
    /// # Errors
    ///
    /// Returns `DanglingReference` for the first unresolved reference (in id
    /// order) or `Cycle` naming every node on the first cycle found.
    pub fn build(self) -> Result<Graph, GraphError> {
        let mut ids: Vec<&NodeId> = self.nodes.keys().collect();
        ids.sort();

        for id in &ids {
            for reference in &self.nodes[*id].references {
                if !self.nodes.contains_key(reference) {
                    return Err(GraphError::DanglingReference {
                        from: (*id).clone(),
                        to: reference.clone(),
                    });
                }
            }
        }

        if let Some(cycle) = find_cycle(&self.nodes, &ids) {
            return Err(GraphError::Cycle { cycle });
        }

        let mut dependents: BTreeMap<NodeId, BTreeSet<NodeId>> = BTreeMap::new();
        for node in self.nodes.values() {
            for reference in &node.references {
                dependents
                    .entry(reference.clone())
                    .or_default()
                    .insert(node.id.clone());
            }
        }

        tracing::debug!(nodes = self.nodes.len(), "built dependency graph");

        Ok(Graph {
            nodes: self.nodes,
            dependents,
        })
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    InProgress,
    Done,
}

fn references<'a>(nodes: &'a IndexMap<NodeId, ResourceNode>, id: &NodeId) -> btree_set::Iter<'a, NodeId> {
    nodes.get(id).map_or(&EMPTY, |n| &n.references).iter()
}

/// Depth-first search tracking the in-progress path.
///
/// Runs on an explicit stack so arbitrarily long reference chains cannot
/// exhaust the thread's stack.
fn find_cycle<'a>(
    nodes: &'a IndexMap<NodeId, ResourceNode>,
    roots: &[&'a NodeId],
) -> Option<Vec<NodeId>> {
    let mut marks: HashMap<&NodeId, Mark> = HashMap::new();

    for root in roots {
        if marks.contains_key(*root) {
            continue;
        }

        // Each frame is a node on the current path and its unvisited references.
        marks.insert(*root, Mark::InProgress);
        let mut path: Vec<(&'a NodeId, btree_set::Iter<'a, NodeId>)> = vec![(*root, references(nodes, root))];

        while let Some((_, deps)) = path.last_mut() {
            let Some(dep) = deps.next() else {
                if let Some((done, _)) = path.pop() {
                    marks.insert(done, Mark::Done);
                }
                continue;
            };
            match marks.get(dep).copied() {
                Some(Mark::InProgress) => {
                    let start = path.iter().position(|(p, _)| *p == dep).unwrap_or(0);
                    return Some(path[start..].iter().map(|(p, _)| (*p).clone()).collect());
                }
                Some(Mark::Done) => {}
                None => {
                    marks.insert(dep, Mark::InProgress);
                    path.push((dep, references(nodes, dep)));
                }
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn node(id: &str, refs: &[&str]) -> ResourceNode {
        refs.iter().fold(ResourceNode::new(id, ResourceKind::Network), |n, r| {
            n.with_reference(*r)
        })
    }

    #[test]
    fn test_graph_empty() {
        let graph = Graph::build(Vec::new()).unwrap();
        assert!(graph.is_empty());
        assert_eq!(graph.edge_count(), 0);
    }

    #[test]
    fn test_graph_edges_and_dependents() {
        let graph = Graph::build(vec![
            node("S", &["C"]),
            node("C", &["T"]),
            node("T", &["R"]),
            node("R", &[]),
            node("N", &[]),
        ])
        .unwrap();

        assert_eq!(graph.node_count(), 5);
        assert_eq!(graph.edge_count(), 3);
        let dependents: Vec<&NodeId> = graph.dependents(&NodeId::new("T")).iter().collect();
        assert_eq!(dependents, vec![&NodeId::new("C")]);

        let all = graph.transitive_dependents(&NodeId::new("R"));
        let names: Vec<&str> = all.iter().map(NodeId::as_str).collect();
        assert_eq!(names, vec!["C", "S", "T"]);
        assert!(graph.transitive_dependents(&NodeId::new("N")).is_empty());
    }

    #[test]
    fn test_graph_declaration_order_kept() {
        let graph = Graph::build(vec![node("z", &[]), node("a", &[])]).unwrap();
        let ids: Vec<&str> = graph.node_ids().map(NodeId::as_str).collect();
        assert_eq!(ids, vec!["z", "a"]);
    }

    #[test]
    fn test_dangling_reference() {
        let result = Graph::build(vec![node("C", &["X"]), node("T", &[])]);
        assert_eq!(
            result,
            Err(GraphError::DanglingReference {
                from: NodeId::new("C"),
                to: NodeId::new("X"),
            })
        );
    }

    #[test]
    fn test_duplicate_node() {
        let result = Graph::build(vec![node("a", &[]), node("a", &[])]);
        assert_eq!(result, Err(GraphError::DuplicateNode { id: NodeId::new("a") }));
    }

    #[test]
    fn test_self_reference_is_cycle() {
        let result = Graph::build(vec![node("a", &["a"])]);
        assert_eq!(result, Err(GraphError::Cycle { cycle: vec![NodeId::new("a")] }));
    }

    #[test]
    fn test_cycle_names_full_path() {
        let result = Graph::build(vec![
            node("root", &["a"]),
            node("a", &["b"]),
            node("b", &["c"]),
            node("c", &["a"]),
        ]);
        match result {
            Err(GraphError::Cycle { cycle }) => {
                let names: Vec<&str> = cycle.iter().map(NodeId::as_str).collect();
                assert_eq!(names, vec!["a", "b", "c"]);
            }
            other => panic!("expected cycle, got {:?}", other),
        }
    }

    fn chain(len: usize) -> Vec<ResourceNode> {
        (0..len)
            .map(|i| {
                let id = format!("n{:06}", i);
                if i == 0 {
                    node(&id, &[])
                } else {
                    node(&id, &[&format!("n{:06}", i - 1)])
                }
            })
            .collect()
    }

    #[test]
    fn test_long_reference_chain() {
        let graph = Graph::build(chain(100_000)).unwrap();
        assert_eq!(graph.edge_count(), 99_999);

        let mut looped = chain(100_000);
        looped[0] = node("n000000", &["n099999"]);
        match Graph::build(looped) {
            Err(GraphError::Cycle { cycle }) => assert_eq!(cycle.len(), 100_000),
            other => panic!("expected cycle, got {:?}", other.map(|g| g.node_count())),
        }
    }

    #[test]
    fn test_dependencies_of_kind() {
        let graph = Graph::build(vec![
            ResourceNode::new("ns", ResourceKind::Namespace),
            ResourceNode::new("svc", ResourceKind::Service),
            ResourceNode::new("reg", ResourceKind::ServiceRegistration)
                .with_reference("ns")
                .with_reference("svc"),
        ])
        .unwrap();
        let namespaces = graph.dependencies_of_kind(&NodeId::new("reg"), ResourceKind::Namespace);
        assert_eq!(namespaces.len(), 1);
        assert_eq!(namespaces[0].id.as_str(), "ns");
    }

    proptest! {
        #[test]
        fn prop_ring_cycle_names_every_member(len in 1usize..12, offset in 0usize..12) {
            let names: Vec<String> = (0..len).map(|i| format!("n{:02}", i)).collect();
            let mut nodes: Vec<ResourceNode> = (0..len)
                .map(|i| {
                    ResourceNode::new(names[i].as_str(), ResourceKind::Network)
                        .with_reference(names[(i + 1) % len].as_str())
                })
                .collect();
            nodes.rotate_left(offset % len);

            match Graph::build(nodes) {
                Err(GraphError::Cycle { cycle }) => {
                    let mut found: Vec<String> = cycle.iter().map(|n| n.to_string()).collect();
                    found.sort();
                    prop_assert_eq!(found, names);
                }
                other => prop_assert!(false, "expected cycle, got {:?}", other),
            }
        }
    }
}

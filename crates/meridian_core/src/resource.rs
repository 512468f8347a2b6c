//! Declared resource nodes.
//!
//! A [`ResourceNode`] is one provisionable unit of a stack together with the
//! ids of the nodes it references. References are the only source of
//! dependency edges.

use crate::id::NodeId;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Capability tag of a resource node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    /// Virtual network the cluster and namespace live in
    Network,
    /// Managed compute cluster
    Cluster,
    /// Private DNS namespace
    Namespace,
    /// IAM role assumed by tasks
    Role,
    /// Log group the container writes to
    LogSink,
    /// Task definition (cpu, memory, role)
    TaskTemplate,
    /// Container image, port mappings and log driver
    ContainerSpec,
    /// Security group and its ingress rules
    SecurityRule,
    /// Running compute service (desired count, public ip)
    Service,
    /// DNS registration binding a name to a service's endpoints
    ServiceRegistration,
}

impl ResourceKind {
    /// All kinds, in declaration order
    pub const ALL: [ResourceKind; 10] = [
        Self::Network,
        Self::Cluster,
        Self::Namespace,
        Self::Role,
        Self::LogSink,
        Self::TaskTemplate,
        Self::ContainerSpec,
        Self::SecurityRule,
        Self::Service,
        Self::ServiceRegistration,
    ];

    /// Stable lowercase name
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Network => "network",
            Self::Cluster => "cluster",
            Self::Namespace => "namespace",
            Self::Role => "role",
            Self::LogSink => "log_sink",
            Self::TaskTemplate => "task_template",
            Self::ContainerSpec => "container_spec",
            Self::SecurityRule => "security_rule",
            Self::Service => "service",
            Self::ServiceRegistration => "service_registration",
        }
    }

    /// Whether nodes of this kind produce live endpoints
    #[must_use]
    pub const fn is_compute(&self) -> bool {
        matches!(self, Self::Service)
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A declared resource with attributes and references
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceNode {
    /// Unique node id within a stack
    pub id: NodeId,
    /// Capability tag
    pub kind: ResourceKind,
    /// Declared attributes, passed to the backend untouched
    #[serde(default)]
    pub attributes: BTreeMap<String, Value>,
    /// Ids of nodes this one depends on
    #[serde(default)]
    pub references: BTreeSet<NodeId>,
}

impl ResourceNode {
    /// Create a node with no attributes or references
    #[must_use]
    pub fn new(id: impl Into<NodeId>, kind: ResourceKind) -> Self {
        Self {
            id: id.into(),
            kind,
            attributes: BTreeMap::new(),
            references: BTreeSet::new(),
        }
    }

    /// Add a reference
    #[must_use]
    pub fn with_reference(mut self, to: impl Into<NodeId>) -> Self {
        self.references.insert(to.into());
        self
    }

    /// Set an attribute
    #[must_use]
    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    /// Get an attribute
    #[must_use]
    pub fn attribute(&self, key: &str) -> Option<&Value> {
        self.attributes.get(key)
    }

    /// Get a string attribute
    #[must_use]
    pub fn str_attribute(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).and_then(Value::as_str)
    }

    /// Get a boolean attribute, falling back to `default`
    #[must_use]
    pub fn bool_attribute(&self, key: &str, default: bool) -> bool {
        self.attributes
            .get(key)
            .and_then(Value::as_bool)
            .unwrap_or(default)
    }

    /// Whether this node references `id`
    #[must_use]
    pub fn references_node(&self, id: &NodeId) -> bool {
        self.references.contains(id)
    }
}

//! Kind-specific rules checked before a plan is compiled.
//!
//! Network exposure is never implied: a service gets a public address only
//! when it declares `assign_public_ip`, and a security rule admits traffic
//! only through its declared `ingress` entries. Declaring either toward the
//! whole internet is allowed but reported as a warning.

use crate::error::GraphError;
use crate::graph::Graph;
use meridian_core::{NodeId, ResourceKind, ResourceNode};
use serde::Deserialize;
use std::fmt;

/// Non-fatal finding attached to a compiled plan
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlanWarning {
    /// A node is reachable from any address
    PublicExposure {
        /// Exposed node
        node: NodeId,
        /// What exposes it
        detail: String,
    },
    /// A service declares zero running tasks
    ZeroDesiredCount {
        /// Service node
        node: NodeId,
    },
}

impl fmt::Display for PlanWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PublicExposure { node, detail } => {
                write!(f, "{} is publicly exposed: {}", node, detail)
            }
            Self::ZeroDesiredCount { node } => {
                write!(f, "{} declares desired_count 0; its registration starts empty", node)
            }
        }
    }
}

/// One declared ingress entry of a security rule
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
struct IngressRule {
    cidr: String,
    port: u32,
    #[serde(default)]
    protocol: Option<String>,
}

const ANY_IPV4: &str = "0.0.0.0/0";
const ANY_IPV6: &str = "::/0";

/// Validator for kind-specific rules
#[derive(Debug, Clone, Default)]
pub struct Validator {
    /// Escalate public exposure from warning to error
    pub deny_public_exposure: bool,
}

impl Validator {
    /// Create a new validator
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject public exposure instead of warning about it
    #[must_use]
    pub fn deny_public_exposure(mut self) -> Self {
        self.deny_public_exposure = true;
        self
    }

    /// Validate every node of the graph
    ///
    /// # Errors
    ///
    /// Returns the first `InvalidNode` found, in declaration order
    pub fn validate(&self, graph: &Graph) -> Result<Vec<PlanWarning>, GraphError> {
        let mut warnings = Vec::new();

        for node in graph.nodes() {
            match node.kind {
                ResourceKind::ServiceRegistration => check_registration(graph, node)?,
                ResourceKind::Service => check_service(node, &mut warnings)?,
                ResourceKind::SecurityRule => check_security_rule(node, &mut warnings)?,
                _ => {}
            }
        }

        if self.deny_public_exposure {
            if let Some(PlanWarning::PublicExposure { node, detail }) = warnings
                .iter()
                .find(|w| matches!(w, PlanWarning::PublicExposure { .. }))
            {
                return Err(GraphError::InvalidNode {
                    node: node.clone(),
                    reason: format!("public exposure denied: {}", detail),
                });
            }
        }

        Ok(warnings)
    }
}

fn check_registration(graph: &Graph, node: &ResourceNode) -> Result<(), GraphError> {
    for kind in [ResourceKind::Namespace, ResourceKind::Service] {
        let count = graph.dependencies_of_kind(&node.id, kind).len();
        if count != 1 {
            return Err(GraphError::InvalidNode {
                node: node.id.clone(),
                reason: format!("must reference exactly one {} node, found {}", kind, count),
            });
        }
    }

    if let Some(record_type) = node.attribute("dns_record_type") {
        let valid = record_type
            .as_str()
            .is_some_and(|t| matches!(t, "A" | "AAAA" | "SRV"));
        if !valid {
            return Err(GraphError::InvalidNode {
                node: node.id.clone(),
                reason: format!("unsupported dns_record_type {}", record_type),
            });
        }
    }
    Ok(())
}

fn check_service(node: &ResourceNode, warnings: &mut Vec<PlanWarning>) -> Result<(), GraphError> {
    if let Some(count) = node.attribute("desired_count") {
        match count.as_u64() {
            Some(0) => warnings.push(PlanWarning::ZeroDesiredCount {
                node: node.id.clone(),
            }),
            Some(_) => {}
            None => {
                return Err(GraphError::InvalidNode {
                    node: node.id.clone(),
                    reason: format!("desired_count must be a non-negative integer, got {}", count),
                });
            }
        }
    }

    if node.bool_attribute("assign_public_ip", false) {
        warnings.push(PlanWarning::PublicExposure {
            node: node.id.clone(),
            detail: "assign_public_ip is set".to_string(),
        });
    }
    Ok(())
}

fn check_security_rule(
    node: &ResourceNode,
    warnings: &mut Vec<PlanWarning>,
) -> Result<(), GraphError> {
    let Some(raw) = node.attribute("ingress") else {
        return Ok(());
    };

    let rules: Vec<IngressRule> =
        serde_json::from_value(raw.clone()).map_err(|e| GraphError::InvalidNode {
            node: node.id.clone(),
            reason: format!("malformed ingress: {}", e),
        })?;

    for rule in rules {
        if rule.port == 0 || rule.port > u32::from(u16::MAX) {
            return Err(GraphError::InvalidNode {
                node: node.id.clone(),
                reason: format!("ingress port {} out of range", rule.port),
            });
        }
        if let Some(protocol) = &rule.protocol {
            if !matches!(protocol.as_str(), "tcp" | "udp") {
                return Err(GraphError::InvalidNode {
                    node: node.id.clone(),
                    reason: format!("unsupported ingress protocol {}", protocol),
                });
            }
        }
        if rule.cidr == ANY_IPV4 || rule.cidr == ANY_IPV6 {
            warnings.push(PlanWarning::PublicExposure {
                node: node.id.clone(),
                detail: format!("ingress from {} on port {}", rule.cidr, rule.port),
            });
        }
    }
    Ok(())
}

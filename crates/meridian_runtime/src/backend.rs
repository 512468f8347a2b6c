//! The control-plane seam.
//!
//! The engine never talks to a cloud API directly; everything goes through a
//! [`ResourceBackend`] injected at construction. Implementations must make
//! `create` and `update` idempotent for a given node id, since the engine
//! retries them.

use async_trait::async_trait;
use meridian_core::{NodeId, ResourceKind, ResourceNode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

/// Backend identifier of a created resource
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BackendHandle {
    /// Node the resource was created for
    pub node: NodeId,
    /// Kind of the resource
    pub kind: ResourceKind,
    /// Provider-assigned id (ARN, resource id, ...)
    pub physical_id: String,
}

impl BackendHandle {
    /// Create a handle
    #[must_use]
    pub fn new(node: NodeId, kind: ResourceKind, physical_id: impl Into<String>) -> Self {
        Self {
            node,
            kind,
            physical_id: physical_id.into(),
        }
    }
}

impl fmt::Display for BackendHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.node, self.physical_id)
    }
}

/// Observed state of a resource
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceState {
    /// Handle that was read
    pub handle: BackendHandle,
    /// Attributes as the provider reports them
    pub attributes: BTreeMap<String, Value>,
}

/// Retry classification of a backend error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Worth retrying with backoff
    Transient,
    /// Retrying cannot help
    Permanent,
}

/// Backend error
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BackendError {
    /// Provider throttled the request
    #[error("Rate limited: {0}")]
    RateLimited(String),

    /// A dependency exists but is not visible yet
    #[error("Not yet consistent: {0}")]
    Propagating(String),

    /// Provider temporarily unavailable
    #[error("Backend unavailable: {0}")]
    Unavailable(String),

    /// Call exceeded the per-node timeout
    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    /// Declared attributes were rejected
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// Credentials lack the required permission
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// Handle does not name an existing resource
    #[error("Resource not found: {0}")]
    NotFound(String),

    /// Any other permanent rejection
    #[error("Backend rejected request: {0}")]
    Rejected(String),
}

impl BackendError {
    /// Retry classification
    #[must_use]
    pub const fn class(&self) -> ErrorClass {
        match self {
            Self::RateLimited(_) | Self::Propagating(_) | Self::Unavailable(_) | Self::Timeout(_) => {
                ErrorClass::Transient
            }
            Self::InvalidConfiguration(_)
            | Self::PermissionDenied(_)
            | Self::NotFound(_)
            | Self::Rejected(_) => ErrorClass::Permanent,
        }
    }

    /// Whether the error is worth retrying
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self.class(), ErrorClass::Transient)
    }
}

/// Create/read/update/delete per resource kind
#[async_trait]
pub trait ResourceBackend: Send + Sync {
    /// Create the resource for `node`
    async fn create(&self, node: &ResourceNode) -> Result<BackendHandle, BackendError>;

    /// Read the current state behind a handle
    async fn read(&self, handle: &BackendHandle) -> Result<ResourceState, BackendError>;

    /// Replace the attributes of an existing resource
    async fn update(
        &self,
        handle: &BackendHandle,
        attributes: &BTreeMap<String, Value>,
    ) -> Result<(), BackendError>;

    /// Delete the resource behind a handle
    async fn delete(&self, handle: &BackendHandle) -> Result<(), BackendError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        assert!(BackendError::RateLimited("slow down".into()).is_transient());
        assert!(BackendError::Propagating("role".into()).is_transient());
        assert!(BackendError::Timeout(Duration::from_secs(1)).is_transient());
        assert!(!BackendError::PermissionDenied("iam:PassRole".into()).is_transient());
        assert!(!BackendError::InvalidConfiguration("cpu".into()).is_transient());
        assert_eq!(BackendError::NotFound("x".into()).class(), ErrorClass::Permanent);
    }

    #[test]
    fn test_handle_display() {
        let handle = BackendHandle::new(NodeId::new("vpc"), ResourceKind::Network, "vpc-0abc");
        assert_eq!(handle.to_string(), "vpc(vpc-0abc)");
    }
}

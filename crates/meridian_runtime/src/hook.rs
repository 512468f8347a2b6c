//! Lifecycle hooks run around backend calls.
//!
//! A hook is how subsystems outside the control plane, such as service
//! discovery, take part in a run. `on_applied` runs after a node's resource
//! exists; a failure there fails the node. `before_delete` runs before the
//! resource is deleted; a failure there keeps the node from being deleted.

use crate::backend::BackendHandle;
use async_trait::async_trait;
use meridian_core::{ResourceKind, ResourceNode, StackId};

/// Error raised by a hook
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct HookError {
    /// What went wrong
    pub message: String,
}

impl HookError {
    /// Create an error
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// A dependency of the node a hook runs for
#[derive(Debug, Clone)]
pub struct ResolvedDependency<'a> {
    /// Declared dependency
    pub node: &'a ResourceNode,
    /// Its handle, if it exists
    pub handle: Option<BackendHandle>,
}

/// What a hook sees about a node
#[derive(Debug, Clone)]
pub struct HookContext<'a> {
    /// Stack of the run
    pub stack: &'a StackId,
    /// The node
    pub node: &'a ResourceNode,
    /// Its handle
    pub handle: &'a BackendHandle,
    /// Direct dependencies in id order
    pub dependencies: Vec<ResolvedDependency<'a>>,
}

impl<'a> HookContext<'a> {
    /// The single dependency of `kind`, if exactly one exists
    #[must_use]
    pub fn dependency_of_kind(&self, kind: ResourceKind) -> Option<&ResolvedDependency<'a>> {
        let mut matching = self.dependencies.iter().filter(|d| d.node.kind == kind);
        match (matching.next(), matching.next()) {
            (Some(dep), None) => Some(dep),
            _ => None,
        }
    }
}

/// Hook invoked by the engine
#[async_trait]
pub trait LifecycleHook: Send + Sync {
    /// Called after a node's resource was created or updated
    async fn on_applied(&self, ctx: &HookContext<'_>) -> Result<(), HookError>;

    /// Called before a node's resource is deleted
    async fn before_delete(&self, ctx: &HookContext<'_>) -> Result<(), HookError>;
}

/// Hook that does nothing
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopHook;

#[async_trait]
impl LifecycleHook for NoopHook {
    async fn on_applied(&self, _ctx: &HookContext<'_>) -> Result<(), HookError> {
        Ok(())
    }

    async fn before_delete(&self, _ctx: &HookContext<'_>) -> Result<(), HookError> {
        Ok(())
    }
}

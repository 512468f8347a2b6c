//! Lifecycle hook wiring service registrations into the binder.
//!
//! A `service_registration` node is bound once its resource exists and
//! deregistered before its resource is deleted. Record attributes:
//!
//! - `name`: record name, defaults to the node id
//! - `dns_record_type`: `A`, `AAAA` or `SRV`, defaults to `A`
//! - `ttl`: seconds, defaults to 60
//!
//! The namespace is the referenced namespace node's `name` attribute (or
//! its id); the target task is the referenced service's physical id.

use crate::binder::Binder;
use crate::binding::BindingSpec;
use crate::dns::{RecordKey, RecordType};
use crate::error::BindingError;
use async_trait::async_trait;
use meridian_core::{ResourceKind, TaskId};
use meridian_runtime::{HookContext, HookError, LifecycleHook};
use std::sync::Arc;

/// Binds registration nodes as they are applied and deleted
pub struct DiscoveryHook {
    binder: Arc<Binder>,
}

impl DiscoveryHook {
    /// Create a hook over `binder`
    #[must_use]
    pub fn new(binder: Arc<Binder>) -> Self {
        Self { binder }
    }

    /// The binder this hook drives
    #[must_use]
    pub fn binder(&self) -> &Arc<Binder> {
        &self.binder
    }
}

fn invalid(ctx: &HookContext<'_>, reason: impl Into<String>) -> BindingError {
    BindingError::InvalidRegistration {
        node: ctx.node.id.to_string(),
        reason: reason.into(),
    }
}

/// Record address of a registration node
fn record_key(ctx: &HookContext<'_>) -> Result<RecordKey, BindingError> {
    let node = ctx.node;
    let namespace = ctx
        .dependency_of_kind(ResourceKind::Namespace)
        .ok_or_else(|| invalid(ctx, "no namespace dependency"))?;
    let namespace = namespace
        .node
        .str_attribute("name")
        .unwrap_or(namespace.node.id.as_str());
    let name = node.str_attribute("name").unwrap_or(node.id.as_str());
    let record_type = match node.str_attribute("dns_record_type") {
        None => RecordType::A,
        Some(raw) => RecordType::parse(raw)
            .ok_or_else(|| invalid(ctx, format!("unsupported dns_record_type {}", raw)))?,
    };
    Ok(RecordKey::new(namespace, name, record_type))
}

/// Full binding spec of a registration node
fn binding_spec(ctx: &HookContext<'_>) -> Result<BindingSpec, BindingError> {
    let key = record_key(ctx)?;
    let service = ctx
        .dependency_of_kind(ResourceKind::Service)
        .ok_or_else(|| invalid(ctx, "no service dependency"))?;
    let handle = service
        .handle
        .as_ref()
        .ok_or_else(|| invalid(ctx, format!("service {} has no handle", service.node.id)))?;

    let mut spec = BindingSpec::new(key, TaskId::new(handle.physical_id.clone()));
    if let Some(ttl) = ctx.node.attribute("ttl") {
        let ttl = ttl
            .as_u64()
            .and_then(|t| u32::try_from(t).ok())
            .ok_or_else(|| invalid(ctx, format!("ttl must be a positive integer, got {}", ttl)))?;
        spec = spec.with_ttl(ttl);
    }
    Ok(spec)
}

#[async_trait]
impl LifecycleHook for DiscoveryHook {
    async fn on_applied(&self, ctx: &HookContext<'_>) -> Result<(), HookError> {
        if ctx.node.kind != ResourceKind::ServiceRegistration {
            return Ok(());
        }
        let spec = binding_spec(ctx).map_err(|e| HookError::new(e.to_string()))?;
        let binding = self
            .binder
            .register(spec)
            .await
            .map_err(|e| HookError::new(e.to_string()))?;
        tracing::info!(
            node = %ctx.node.id,
            record = %binding.key,
            endpoints = binding.endpoints.len(),
            "registration bound"
        );
        Ok(())
    }

    async fn before_delete(&self, ctx: &HookContext<'_>) -> Result<(), HookError> {
        if ctx.node.kind != ResourceKind::ServiceRegistration {
            return Ok(());
        }
        let key = record_key(ctx).map_err(|e| HookError::new(e.to_string()))?;
        self.binder
            .deregister(&key)
            .await
            .map_err(|e| HookError::new(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binder::BinderConfig;
    use crate::testing::{ChannelSource, MemoryDns, ep, fast_retry};
    use meridian_core::{EndpointSet, NodeId, ResourceNode, StackId};
    use meridian_runtime::{BackendHandle, ResolvedDependency};
    use std::time::Duration;

    struct Fixture {
        stack: StackId,
        ns: ResourceNode,
        svc: ResourceNode,
        reg: ResourceNode,
        svc_handle: BackendHandle,
        reg_handle: BackendHandle,
    }

    impl Fixture {
        fn new(reg: ResourceNode) -> Self {
            Self {
                stack: StackId::new("s"),
                ns: ResourceNode::new("ns", ResourceKind::Namespace).with_attribute("name", "internal.local"),
                svc: ResourceNode::new("svc", ResourceKind::Service),
                reg,
                svc_handle: BackendHandle::new(NodeId::new("svc"), ResourceKind::Service, "svc-phys"),
                reg_handle: BackendHandle::new(NodeId::new("reg"), ResourceKind::ServiceRegistration, "reg-phys"),
            }
        }

        fn ctx(&self) -> HookContext<'_> {
            HookContext {
                stack: &self.stack,
                node: &self.reg,
                handle: &self.reg_handle,
                dependencies: vec![
                    ResolvedDependency { node: &self.ns, handle: None },
                    ResolvedDependency {
                        node: &self.svc,
                        handle: Some(self.svc_handle.clone()),
                    },
                ],
            }
        }
    }

    fn registration() -> ResourceNode {
        ResourceNode::new("reg", ResourceKind::ServiceRegistration)
            .with_reference("ns")
            .with_reference("svc")
            .with_attribute("name", "web")
    }

    fn hook() -> (Arc<MemoryDns>, Arc<ChannelSource>, DiscoveryHook) {
        let dns = Arc::new(MemoryDns::default());
        let source = Arc::new(ChannelSource::default());
        let config = BinderConfig::default()
            .with_bind_timeout(Duration::from_millis(200))
            .with_dns_retry(fast_retry());
        let binder = Arc::new(Binder::new(dns.clone(), source.clone(), config));
        (dns, source, DiscoveryHook::new(binder))
    }

    #[test]
    fn test_binding_spec_from_context() {
        let fixture = Fixture::new(registration().with_attribute("dns_record_type", "SRV").with_attribute("ttl", 10));
        let spec = binding_spec(&fixture.ctx()).unwrap();
        assert_eq!(spec.key, RecordKey::new("internal.local", "web", RecordType::Srv));
        assert_eq!(spec.target, TaskId::new("svc-phys"));
        assert_eq!(spec.ttl, 10);
    }

    #[test]
    fn test_missing_service_handle_rejected() {
        let fixture = Fixture::new(registration());
        let mut ctx = fixture.ctx();
        ctx.dependencies[1].handle = None;
        assert!(matches!(
            binding_spec(&ctx),
            Err(BindingError::InvalidRegistration { .. })
        ));
    }

    #[tokio::test]
    async fn test_apply_then_delete_registration() {
        let (dns, source, hook) = hook();
        let fixture = Fixture::new(registration());
        let endpoints: EndpointSet = [ep(1), ep(2)].into_iter().collect();
        source.publish(&TaskId::new("svc-phys"), endpoints.clone());

        hook.on_applied(&fixture.ctx()).await.unwrap();
        let key = RecordKey::new("internal.local", "web", RecordType::A);
        assert_eq!(dns.record(&key), Some(endpoints));

        hook.before_delete(&fixture.ctx()).await.unwrap();
        assert_eq!(dns.record(&key), None);
    }

    #[tokio::test]
    async fn test_other_kinds_ignored() {
        let (dns, _source, hook) = hook();
        let mut fixture = Fixture::new(registration());
        fixture.reg = ResourceNode::new("reg", ResourceKind::LogSink);
        hook.on_applied(&fixture.ctx()).await.unwrap();
        assert!(dns.log().is_empty());
    }
}

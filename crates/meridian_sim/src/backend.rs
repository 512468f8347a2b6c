//! Simulated control plane.
//!
//! Resources live in a [`SimWorld`] keyed by physical id. Creating or
//! updating a `service` starts its tasks: `desired_count` endpoints on
//! `container_port` (default 80) are published to the endpoint source under
//! the service's physical id. Deleting the service publishes an empty set.

use crate::failure::{FailureModel, FaultInjector, Injection};
use crate::seed::SimSeed;
use crate::source::SimEndpointSource;
use async_trait::async_trait;
use meridian_core::{Endpoint, EndpointSet, NodeId, ResourceKind, ResourceNode, TaskId};
use meridian_runtime::{BackendError, BackendHandle, ResourceBackend, ResourceState};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

const DEFAULT_PORT: u16 = 80;
const MAX_TASKS: u64 = 250;

/// Backend operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendOp {
    /// `create`
    Create,
    /// `read`
    Read,
    /// `update`
    Update,
    /// `delete`
    Delete,
}

/// One call seen by [`SimBackend`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendCall {
    /// Operation
    pub op: BackendOp,
    /// Node the call was for
    pub node: NodeId,
}

/// A live simulated resource
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimResource {
    /// Handle given out at creation
    pub handle: BackendHandle,
    /// Current attributes
    pub attributes: BTreeMap<String, Value>,
    /// Creation sequence number
    pub ordinal: u64,
}

impl SimResource {
    /// Endpoints of the resource's running tasks; empty unless it is a service
    #[must_use]
    pub fn endpoints(&self) -> EndpointSet {
        if self.handle.kind != ResourceKind::Service {
            return EndpointSet::new();
        }
        let count = self
            .attributes
            .get("desired_count")
            .and_then(Value::as_u64)
            .unwrap_or(1)
            .min(MAX_TASKS);
        let port = self
            .attributes
            .get("container_port")
            .and_then(Value::as_u64)
            .and_then(|p| u16::try_from(p).ok())
            .unwrap_or(DEFAULT_PORT);
        let [_, _, hi, lo] = (self.ordinal as u32).to_be_bytes();
        (0..count)
            .map(|task| Endpoint::tcp(IpAddr::V4(Ipv4Addr::new(10, hi, lo, task as u8 + 1)), port))
            .collect()
    }

    fn task(&self) -> TaskId {
        TaskId::new(self.handle.physical_id.clone())
    }
}

/// Every live resource, serializable so a later process can pick it up
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimWorld {
    /// Resources by physical id
    pub resources: BTreeMap<String, SimResource>,
    /// Last ordinal handed out
    pub last_ordinal: u64,
}

struct Scripted {
    node: NodeId,
    op: BackendOp,
    error: BackendError,
    remaining: u32,
}

#[derive(Default)]
struct State {
    world: SimWorld,
    calls: Vec<BackendCall>,
    scripts: Vec<Scripted>,
    in_flight: usize,
    peak: usize,
}

fn prefix(kind: ResourceKind) -> &'static str {
    match kind {
        ResourceKind::Network => "vpc",
        ResourceKind::Cluster => "cluster",
        ResourceKind::Namespace => "ns",
        ResourceKind::Role => "role",
        ResourceKind::LogSink => "log",
        ResourceKind::TaskTemplate => "taskdef",
        ResourceKind::ContainerSpec => "container",
        ResourceKind::SecurityRule => "sg",
        ResourceKind::Service => "svc",
        ResourceKind::ServiceRegistration => "srv",
    }
}

/// In-memory [`ResourceBackend`]
pub struct SimBackend {
    state: Mutex<State>,
    tasks: Arc<SimEndpointSource>,
    injector: Option<FaultInjector>,
    latency: Duration,
}

impl SimBackend {
    /// Create an empty control plane publishing task endpoints to `tasks`
    #[must_use]
    pub fn new(tasks: Arc<SimEndpointSource>) -> Self {
        Self::from_world(SimWorld::default(), tasks)
    }

    /// Resume a saved world, republishing the endpoints of its services
    #[must_use]
    pub fn from_world(world: SimWorld, tasks: Arc<SimEndpointSource>) -> Self {
        for resource in world.resources.values() {
            if resource.handle.kind == ResourceKind::Service {
                tasks.publish(&resource.task(), resource.endpoints());
            }
        }
        Self {
            state: Mutex::new(State {
                world,
                ..State::default()
            }),
            tasks,
            injector: None,
            latency: Duration::ZERO,
        }
    }

    /// Inject failures drawn from `model`
    #[must_use]
    pub fn with_failures(mut self, seed: &SimSeed, model: FailureModel) -> Self {
        self.injector = Some(FaultInjector::new(seed, model));
        self
    }

    /// Delay every call
    #[must_use]
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Fail the next `times` calls of `op` for `node` with `error`
    pub fn fail(&self, node: impl Into<NodeId>, op: BackendOp, error: BackendError, times: u32) {
        self.state().scripts.push(Scripted {
            node: node.into(),
            op,
            error,
            remaining: times,
        });
    }

    /// Fail every call of `op` for `node` with `error`
    pub fn fail_always(&self, node: impl Into<NodeId>, op: BackendOp, error: BackendError) {
        self.fail(node, op, error, u32::MAX);
    }

    /// Drop every scripted failure
    pub fn clear_failures(&self) {
        self.state().scripts.clear();
    }

    /// Copy of the world
    #[must_use]
    pub fn world(&self) -> SimWorld {
        self.state().world.clone()
    }

    /// The live resource created for `node`
    #[must_use]
    pub fn resource(&self, node: &NodeId) -> Option<SimResource> {
        self.state()
            .world
            .resources
            .values()
            .find(|r| &r.handle.node == node)
            .cloned()
    }

    /// Number of live resources
    #[must_use]
    pub fn live_count(&self) -> usize {
        self.state().world.resources.len()
    }

    /// Every call, in order
    #[must_use]
    pub fn calls(&self) -> Vec<BackendCall> {
        self.state().calls.clone()
    }

    /// Number of calls of `op`
    #[must_use]
    pub fn call_count(&self, op: BackendOp) -> usize {
        self.state().calls.iter().filter(|c| c.op == op).count()
    }

    /// Most calls ever in flight at once
    #[must_use]
    pub fn peak_concurrency(&self) -> usize {
        self.state().peak
    }

    /// Failures drawn from the seeded model so far
    #[must_use]
    pub fn injected_failures(&self) -> usize {
        self.injector.as_ref().map_or(0, FaultInjector::injected)
    }

    /// Change the running task count of a service outside any apply.
    ///
    /// Returns false if `node` has no live service.
    pub fn scale_service(&self, node: &NodeId, count: u64) -> bool {
        let scaled = {
            let mut state = self.state();
            let Some(resource) = state
                .world
                .resources
                .values_mut()
                .find(|r| &r.handle.node == node && r.handle.kind == ResourceKind::Service)
            else {
                return false;
            };
            resource.attributes.insert("desired_count".to_string(), Value::from(count));
            resource.clone()
        };
        tracing::info!(node = %node, count, "service scaled");
        self.tasks.publish(&scaled.task(), scaled.endpoints());
        true
    }

    async fn enter(&self, op: BackendOp, node: &NodeId) -> Result<InFlight<'_>, BackendError> {
        let scripted = {
            let mut state = self.state();
            state.calls.push(BackendCall { op, node: node.clone() });
            state.in_flight += 1;
            state.peak = state.peak.max(state.in_flight);

            let hit = state.scripts.iter_mut().find(|s| s.op == op && &s.node == node && s.remaining > 0);
            hit.map(|script| {
                script.remaining -= 1;
                script.error.clone()
            })
        };
        let guard = InFlight(self);

        let mut delay = self.latency;
        if let Some(error) = scripted {
            tracing::debug!(node = %node, op = ?op, error = %error, "scripted failure");
            return Err(error);
        }
        match self.injector.as_ref().and_then(|i| i.draw(node.as_str())) {
            Some(Injection::Error(error)) => return Err(error),
            Some(Injection::Delay(extra)) => delay += extra,
            None => {}
        }
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        Ok(guard)
    }

    fn not_found(handle: &BackendHandle) -> BackendError {
        BackendError::NotFound(format!("{} {}", handle.kind, handle.physical_id))
    }
}

/// Counts a call as in flight until dropped
struct InFlight<'a>(&'a SimBackend);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.state().in_flight -= 1;
    }
}

#[async_trait]
impl ResourceBackend for SimBackend {
    async fn create(&self, node: &ResourceNode) -> Result<BackendHandle, BackendError> {
        let _call = self.enter(BackendOp::Create, &node.id).await?;
        let resource = {
            let mut state = self.state();
            let world = &mut state.world;
            let existing = world
                .resources
                .values()
                .find(|r| r.handle.node == node.id && r.handle.kind == node.kind)
                .cloned();
            match existing {
                Some(resource) => resource,
                None => {
                    world.last_ordinal += 1;
                    let ordinal = world.last_ordinal;
                    let physical_id = format!("{}-{:04}", prefix(node.kind), ordinal);
                    let resource = SimResource {
                        handle: BackendHandle::new(node.id.clone(), node.kind, physical_id.clone()),
                        attributes: node.attributes.clone(),
                        ordinal,
                    };
                    world.resources.insert(physical_id, resource.clone());
                    resource
                }
            }
        };
        tracing::debug!(handle = %resource.handle, "created");
        if node.kind == ResourceKind::Service {
            self.tasks.publish(&resource.task(), resource.endpoints());
        }
        Ok(resource.handle)
    }

    async fn read(&self, handle: &BackendHandle) -> Result<ResourceState, BackendError> {
        let _call = self.enter(BackendOp::Read, &handle.node).await?;
        let state = self.state();
        let resource = state
            .world
            .resources
            .get(&handle.physical_id)
            .ok_or_else(|| Self::not_found(handle))?;
        Ok(ResourceState {
            handle: resource.handle.clone(),
            attributes: resource.attributes.clone(),
        })
    }

    async fn update(
        &self,
        handle: &BackendHandle,
        attributes: &BTreeMap<String, Value>,
    ) -> Result<(), BackendError> {
        let _call = self.enter(BackendOp::Update, &handle.node).await?;
        let resource = {
            let mut state = self.state();
            let resource = state
                .world
                .resources
                .get_mut(&handle.physical_id)
                .ok_or_else(|| Self::not_found(handle))?;
            resource.attributes = attributes.clone();
            resource.clone()
        };
        tracing::debug!(handle = %handle, "updated");
        if handle.kind == ResourceKind::Service {
            self.tasks.publish(&resource.task(), resource.endpoints());
        }
        Ok(())
    }

    async fn delete(&self, handle: &BackendHandle) -> Result<(), BackendError> {
        let _call = self.enter(BackendOp::Delete, &handle.node).await?;
        let removed = self.state().world.resources.remove(&handle.physical_id);
        let resource = removed.ok_or_else(|| Self::not_found(handle))?;
        tracing::debug!(handle = %handle, "deleted");
        if handle.kind == ResourceKind::Service {
            self.tasks.publish(&resource.task(), EndpointSet::new());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use meridian_discovery::EndpointSource;

    fn service(count: u64) -> ResourceNode {
        ResourceNode::new("svc", ResourceKind::Service)
            .with_attribute("desired_count", count)
            .with_attribute("container_port", 8080)
    }

    fn backend() -> (Arc<SimEndpointSource>, SimBackend) {
        let tasks = Arc::new(SimEndpointSource::new());
        (Arc::clone(&tasks), SimBackend::new(tasks))
    }

    #[tokio::test]
    async fn test_create_is_idempotent_per_node() {
        let (_tasks, backend) = backend();
        let node = ResourceNode::new("vpc", ResourceKind::Network);
        let first = backend.create(&node).await.unwrap();
        let second = backend.create(&node).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(first.physical_id, "vpc-0001");
        assert_eq!(backend.live_count(), 1);
        assert_eq!(backend.call_count(BackendOp::Create), 2);
    }

    #[tokio::test]
    async fn test_service_publishes_endpoints() {
        let (tasks, backend) = backend();
        let handle = backend.create(&service(2)).await.unwrap();
        let task = TaskId::new(handle.physical_id.clone());

        let endpoints = tasks.current(&task);
        assert_eq!(endpoints.len(), 2);
        assert!(endpoints.iter().all(|e| e.port == 8080));

        let mut stream = tasks.subscribe(&task);
        assert_eq!(stream.next().await.unwrap().endpoints, endpoints);

        backend.update(&handle, &service(3).attributes).await.unwrap();
        let scaled = tasks.current(&task);
        assert_eq!(scaled.len(), 3);
        assert!(endpoints.is_subset(&scaled));

        backend.delete(&handle).await.unwrap();
        assert!(tasks.current(&task).is_empty());
        assert!(matches!(backend.delete(&handle).await, Err(BackendError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_scripted_failures_run_out() {
        let (_tasks, backend) = backend();
        backend.fail("vpc", BackendOp::Create, BackendError::RateLimited("slow down".into()), 2);
        let node = ResourceNode::new("vpc", ResourceKind::Network);

        assert!(backend.create(&node).await.is_err());
        assert!(backend.create(&node).await.is_err());
        assert!(backend.create(&node).await.is_ok());
        assert_eq!(backend.peak_concurrency(), 1);
    }

    #[tokio::test]
    async fn test_world_survives_restart() {
        let (_tasks, backend) = backend();
        let handle = backend.create(&service(1)).await.unwrap();
        let json = serde_json::to_string(&backend.world()).unwrap();

        let tasks = Arc::new(SimEndpointSource::new());
        let resumed = SimBackend::from_world(serde_json::from_str(&json).unwrap(), Arc::clone(&tasks));
        assert_eq!(tasks.current(&TaskId::new(handle.physical_id.clone())).len(), 1);
        let state = resumed.read(&handle).await.unwrap();
        assert_eq!(state.attributes.get("desired_count"), Some(&Value::from(1)));

        let next = resumed.create(&ResourceNode::new("vpc", ResourceKind::Network)).await.unwrap();
        assert_eq!(next.physical_id, "vpc-0002");
    }

    #[tokio::test]
    async fn test_scale_service_outside_apply() {
        let (tasks, backend) = backend();
        let handle = backend.create(&service(1)).await.unwrap();
        assert!(backend.scale_service(&NodeId::new("svc"), 4));
        assert_eq!(tasks.current(&TaskId::new(handle.physical_id)).len(), 4);
        assert!(!backend.scale_service(&NodeId::new("missing"), 1));
    }
}

//! Staged execution engine.
//!
//! Stages run strictly in order. Inside a stage, nodes are driven
//! concurrently up to `concurrency`; a stage completes only when every node
//! in it is terminal. When any node fails, the current stage is allowed to
//! finish, no later stage starts, and (unless disabled) every resource
//! created so far is rolled back along the teardown plan.
//!
//! Cancellation is observed only between stages so no backend call is ever
//! abandoned half way.

use crate::backend::{BackendError, BackendHandle, ResourceBackend};
use crate::hook::{HookContext, LifecycleHook, NoopHook, ResolvedDependency};
use crate::result::{ExecutionResult, FailurePhase, FailureReport, Operation, Outcome};
use crate::retry::{CallOutcome, call_with_retry};
use crate::table::StatusTable;
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use meridian_core::{Fingerprint, NodeId, NodeStatus, ResourceNode, RetryPolicy, RunId, StackId};
use meridian_plan::{CompiledPlan, Graph, Plan};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

/// Engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Maximum backend calls in flight within a stage
    pub concurrency: usize,
    /// Timeout for a single backend call, in milliseconds
    pub node_timeout_ms: u64,
    /// Retry policy for create, update and teardown deletes
    pub retry: RetryPolicy,
    /// Retry policy for rollback deletes
    pub rollback_retry: RetryPolicy,
    /// Roll back created resources when an apply fails
    pub rollback_on_failure: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            node_timeout_ms: 30_000,
            retry: RetryPolicy::default(),
            rollback_retry: RetryPolicy::new(3),
            rollback_on_failure: true,
        }
    }
}

impl EngineConfig {
    /// Per-call timeout
    #[must_use]
    pub fn node_timeout(&self) -> Duration {
        Duration::from_millis(self.node_timeout_ms.max(1))
    }

    /// Set concurrency (minimum 1)
    #[must_use]
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Set the per-call timeout
    #[must_use]
    pub fn with_node_timeout(mut self, timeout: Duration) -> Self {
        self.node_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Set the apply retry policy
    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Set the rollback retry policy
    #[must_use]
    pub fn with_rollback_retry(mut self, retry: RetryPolicy) -> Self {
        self.rollback_retry = retry;
        self
    }

    /// Enable or disable rollback on failure
    #[must_use]
    pub fn with_rollback_on_failure(mut self, enabled: bool) -> Self {
        self.rollback_on_failure = enabled;
        self
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// State shared by the node tasks of one run
struct Run<'g> {
    id: RunId,
    stack: StackId,
    operation: Operation,
    started_at: DateTime<Utc>,
    graph: &'g Graph,
    table: Mutex<StatusTable>,
    failures: Mutex<Vec<(NodeId, FailurePhase, String)>>,
    deleted: Mutex<Vec<NodeId>>,
}

impl<'g> Run<'g> {
    fn new(stack: &StackId, operation: Operation, graph: &'g Graph, table: StatusTable) -> Self {
        Self {
            id: RunId::new(),
            stack: stack.clone(),
            operation,
            started_at: Utc::now(),
            graph,
            table: Mutex::new(table),
            failures: Mutex::new(Vec::new()),
            deleted: Mutex::new(Vec::new()),
        }
    }

    fn table(&self) -> MutexGuard<'_, StatusTable> {
        lock(&self.table)
    }

    fn fail(&self, id: &NodeId, phase: FailurePhase, error: String) {
        let marked = self.table().fail(id, error.clone());
        if let Err(err) = marked {
            tracing::error!(node = %id, error = %err, "could not record failure");
        }
        lock(&self.failures).push((id.clone(), phase, error));
    }

    fn has_failures(&self) -> bool {
        !lock(&self.failures).is_empty()
    }

    /// Declared nodes among `ids` that satisfy `pick`, in id order
    fn select(&self, ids: &[NodeId], pick: impl Fn(&StatusTable, &NodeId) -> bool) -> Vec<&'g ResourceNode> {
        let table = self.table();
        ids.iter()
            .filter(|id| pick(&table, id))
            .filter_map(|id| self.graph.node(id))
            .collect()
    }

    fn context<'a>(&'a self, node: &'a ResourceNode, handle: &'a BackendHandle) -> HookContext<'a>
    where
        'g: 'a,
    {
        let table = self.table();
        let dependencies = self
            .graph
            .dependencies(&node.id)
            .iter()
            .filter_map(|dep| self.graph.node(dep))
            .map(|dep| ResolvedDependency {
                node: dep,
                handle: table.handle(&dep.id).cloned(),
            })
            .collect();
        HookContext {
            stack: &self.stack,
            node,
            handle,
            dependencies,
        }
    }

    fn finish(self, stages_completed: usize, cancelled: bool) -> ExecutionResult {
        let table = self.table.into_inner().unwrap_or_else(PoisonError::into_inner);
        let failures = self.failures.into_inner().unwrap_or_else(PoisonError::into_inner);
        let deleted = self.deleted.into_inner().unwrap_or_else(PoisonError::into_inner);

        let reports: Vec<FailureReport> = failures
            .into_iter()
            .map(|(node, phase, error)| {
                let blocked: Vec<NodeId> = match phase {
                    FailurePhase::Apply => self
                        .graph
                        .transitive_dependents(&node)
                        .into_iter()
                        .filter(|id| table.status(id) == Some(NodeStatus::Pending))
                        .collect(),
                    FailurePhase::Teardown => transitive_dependencies(self.graph, &node)
                        .into_iter()
                        .filter(|id| table.holds_resource(id))
                        .collect(),
                    FailurePhase::Rollback => Vec::new(),
                };
                FailureReport {
                    node,
                    phase,
                    error,
                    blocked,
                    rolled_back: if phase == FailurePhase::Teardown {
                        Vec::new()
                    } else {
                        deleted.clone()
                    },
                }
            })
            .collect();

        let any_failed = table.iter().any(|(_, r)| r.status == NodeStatus::Failed);
        let outcome = if any_failed || !reports.is_empty() {
            Outcome::Failed
        } else if cancelled {
            Outcome::Cancelled
        } else {
            Outcome::Succeeded
        };

        let result = ExecutionResult {
            run: self.id,
            stack: self.stack,
            operation: self.operation,
            outcome,
            stages_completed,
            nodes: table.into_records(),
            failures: reports,
            started_at: self.started_at,
            finished_at: Utc::now(),
        };
        tracing::info!(
            outcome = %result.outcome,
            stages_completed,
            succeeded = result.count(NodeStatus::Succeeded),
            failed = result.count(NodeStatus::Failed),
            rolled_back = result.count(NodeStatus::RolledBack),
            "{} finished",
            result.operation
        );
        result
    }
}

fn transitive_dependencies(graph: &Graph, id: &NodeId) -> BTreeSet<NodeId> {
    let mut seen = BTreeSet::new();
    let mut stack: Vec<&NodeId> = graph.dependencies(id).iter().collect();
    while let Some(next) = stack.pop() {
        if seen.insert(next.clone()) {
            stack.extend(graph.dependencies(next).iter());
        }
    }
    seen
}

/// Drives compiled plans against a backend
pub struct ExecutionEngine {
    backend: Arc<dyn ResourceBackend>,
    hook: Arc<dyn LifecycleHook>,
    config: EngineConfig,
}

impl ExecutionEngine {
    /// Create an engine with no lifecycle hook
    #[must_use]
    pub fn new(backend: Arc<dyn ResourceBackend>, config: EngineConfig) -> Self {
        Self {
            backend,
            hook: Arc::new(NoopHook),
            config,
        }
    }

    /// Install a lifecycle hook
    #[must_use]
    pub fn with_hook(mut self, hook: Arc<dyn LifecycleHook>) -> Self {
        self.hook = hook;
        self
    }

    /// Engine configuration
    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Walk the forward plan.
    ///
    /// With `prior`, Succeeded nodes whose declaration is unchanged are
    /// skipped and everything else is retried; changed nodes are updated in
    /// place through their existing handle.
    pub async fn apply(
        &self,
        stack: &StackId,
        graph: &Graph,
        plan: &CompiledPlan,
        prior: Option<&ExecutionResult>,
        cancel: &CancellationToken,
    ) -> ExecutionResult {
        let run = Run::new(stack, Operation::Apply, graph, StatusTable::for_apply(graph, prior));
        let span = tracing::info_span!("apply", run = %run.id, stack = %stack);

        async {
            tracing::info!(
                stages = plan.forward.len(),
                nodes = plan.forward.node_count(),
                resumed = prior.is_some(),
                "apply started"
            );

            let mut stages_completed = 0;
            let mut cancelled = false;
            for (index, stage) in plan.forward.stages().iter().enumerate() {
                if cancel.is_cancelled() {
                    tracing::warn!(stage = index, "cancelled, no further stage will start");
                    cancelled = true;
                    break;
                }

                let pending = run.select(stage.nodes(), |table, id| {
                    table.status(id) == Some(NodeStatus::Pending)
                });
                if pending.is_empty() {
                    tracing::debug!(stage = index, "stage already applied");
                    stages_completed += 1;
                    continue;
                }

                tracing::info!(stage = index, nodes = pending.len(), "applying stage");
                let outcomes: Vec<bool> = stream::iter(pending)
                    .map(|node| self.apply_node(&run, node))
                    .buffer_unordered(self.config.concurrency.max(1))
                    .collect()
                    .await;

                if outcomes.iter().any(|ok| !ok) {
                    tracing::error!(stage = index, "stage failed, no later stage will start");
                    break;
                }
                stages_completed += 1;
            }

            if run.has_failures() && self.config.rollback_on_failure {
                self.roll_back(&run, &plan.teardown).await;
            }
            run.finish(stages_completed, cancelled)
        }
        .instrument(span)
        .await
    }

    /// Walk the teardown plan, deleting every live resource.
    ///
    /// Nodes never created are left untouched. A resource the backend no
    /// longer knows counts as deleted. A failed delete stops later stages
    /// so dependencies of a surviving resource are kept.
    pub async fn teardown(
        &self,
        stack: &StackId,
        graph: &Graph,
        plan: &CompiledPlan,
        prior: Option<&ExecutionResult>,
        cancel: &CancellationToken,
    ) -> ExecutionResult {
        let run = Run::new(stack, Operation::Teardown, graph, StatusTable::for_teardown(graph, prior));
        let span = tracing::info_span!("teardown", run = %run.id, stack = %stack);

        async {
            tracing::info!(stages = plan.teardown.len(), "teardown started");

            let mut stages_completed = 0;
            let mut cancelled = false;
            for (index, stage) in plan.teardown.stages().iter().enumerate() {
                if cancel.is_cancelled() {
                    tracing::warn!(stage = index, "cancelled, no further stage will start");
                    cancelled = true;
                    break;
                }

                let live = run.select(stage.nodes(), |table, id| table.holds_resource(id));
                if live.is_empty() {
                    stages_completed += 1;
                    continue;
                }

                tracing::info!(stage = index, nodes = live.len(), "tearing down stage");
                let stuck = self
                    .delete_nodes(&run, live, &self.config.retry, FailurePhase::Teardown)
                    .await;
                if !stuck.is_empty() {
                    tracing::error!(stage = index, failed = stuck.len(), "teardown stage failed, stopping");
                    break;
                }
                stages_completed += 1;
            }
            run.finish(stages_completed, cancelled)
        }
        .instrument(span)
        .await
    }

    async fn apply_node(&self, run: &Run<'_>, node: &ResourceNode) -> bool {
        let id = &node.id;
        let begun = run.table().begin(id);
        let existing = match begun {
            Ok(handle) => handle,
            Err(err) => {
                tracing::error!(node = %id, error = %err, "cannot start node");
                return false;
            }
        };

        let span = tracing::info_span!("node", node = %id, kind = %node.kind);
        async {
            let outcome = self.provision(node, existing).await;
            run.table().add_attempts(id, outcome.attempts);
            let handle = match outcome.value {
                Ok(handle) => handle,
                Err(err) => {
                    tracing::warn!(attempts = outcome.attempts, error = %err, "apply failed");
                    run.fail(id, FailurePhase::Apply, err.to_string());
                    return false;
                }
            };

            // Recorded before the hook so a hook failure still rolls it back.
            run.table().attach_handle(id, handle.clone());

            let ctx = run.context(node, &handle);
            let hooked = self.hook.on_applied(&ctx).await;
            if let Err(err) = hooked {
                tracing::warn!(error = %err, "lifecycle hook failed");
                run.fail(id, FailurePhase::Apply, err.to_string());
                return false;
            }

            let done = run.table().succeed(id, Fingerprint::of(node));
            match done {
                Ok(()) => {
                    tracing::info!(
                        physical_id = %handle.physical_id,
                        attempts = outcome.attempts,
                        "applied"
                    );
                    true
                }
                Err(err) => {
                    tracing::error!(error = %err, "could not record success");
                    false
                }
            }
        }
        .instrument(span)
        .await
    }

    /// Create, or update through an existing handle
    async fn provision(
        &self,
        node: &ResourceNode,
        existing: Option<BackendHandle>,
    ) -> CallOutcome<BackendHandle> {
        let backend = self.backend.as_ref();
        let timeout = self.config.node_timeout();
        let policy = &self.config.retry;

        let Some(handle) = existing else {
            return call_with_retry(policy, timeout, &node.id, "create", move || backend.create(node)).await;
        };

        let target = &handle;
        let attributes = &node.attributes;
        let updated = call_with_retry(policy, timeout, &node.id, "update", move || {
            backend.update(target, attributes)
        })
        .await;
        match updated.value {
            Ok(()) => CallOutcome {
                value: Ok(handle),
                attempts: updated.attempts,
            },
            Err(BackendError::NotFound(_)) => {
                tracing::debug!(physical_id = %handle.physical_id, "resource gone, recreating");
                let created =
                    call_with_retry(policy, timeout, &node.id, "create", move || backend.create(node)).await;
                CallOutcome {
                    value: created.value,
                    attempts: updated.attempts + created.attempts,
                }
            }
            Err(err) => CallOutcome {
                value: Err(err),
                attempts: updated.attempts,
            },
        }
    }

    /// Delete along the teardown plan after a failed apply.
    ///
    /// Rollback keeps going past a failed delete, but never deletes a node
    /// while one of its dependents could not be deleted.
    async fn roll_back(&self, run: &Run<'_>, plan: &Plan) {
        tracing::warn!("rolling back");
        let mut stuck: BTreeSet<NodeId> = BTreeSet::new();

        for stage in plan.stages() {
            let live = run.select(stage.nodes(), |table, id| table.holds_resource(id));
            let (blocked, targets): (Vec<&ResourceNode>, Vec<&ResourceNode>) = live
                .into_iter()
                .partition(|node| run.graph.dependents(&node.id).iter().any(|d| stuck.contains(d)));

            for node in blocked {
                tracing::warn!(node = %node.id, "rollback blocked by a dependent that still exists");
                run.fail(
                    &node.id,
                    FailurePhase::Rollback,
                    "rollback blocked by a dependent that still exists".to_string(),
                );
                stuck.insert(node.id.clone());
            }

            if !targets.is_empty() {
                stuck.extend(
                    self.delete_nodes(run, targets, &self.config.rollback_retry, FailurePhase::Rollback)
                        .await,
                );
            }
        }

        if stuck.is_empty() {
            tracing::info!("rollback complete");
        } else {
            tracing::error!(remaining = stuck.len(), "rollback incomplete");
        }
    }

    /// Delete nodes concurrently, returning the ids that could not be deleted
    async fn delete_nodes(
        &self,
        run: &Run<'_>,
        nodes: Vec<&ResourceNode>,
        policy: &RetryPolicy,
        phase: FailurePhase,
    ) -> Vec<NodeId> {
        stream::iter(nodes)
            .map(|node| async move {
                let deleted = self.delete_node(run, node, policy, phase).await;
                (!deleted).then(|| node.id.clone())
            })
            .buffer_unordered(self.config.concurrency.max(1))
            .filter_map(|stuck| async move { stuck })
            .collect()
            .await
    }

    async fn delete_node(
        &self,
        run: &Run<'_>,
        node: &ResourceNode,
        policy: &RetryPolicy,
        phase: FailurePhase,
    ) -> bool {
        let id = &node.id;
        let handle = run.table().handle(id).cloned();
        let Some(handle) = handle else {
            return true;
        };

        let span = tracing::info_span!("node", node = %id, kind = %node.kind);
        async {
            let ctx = run.context(node, &handle);
            let hooked = self.hook.before_delete(&ctx).await;
            if let Err(err) = hooked {
                tracing::warn!(error = %err, "lifecycle hook failed, resource kept");
                run.fail(id, phase, err.to_string());
                return false;
            }

            let backend = self.backend.as_ref();
            let target = &handle;
            let outcome = call_with_retry(policy, self.config.node_timeout(), id, "delete", move || {
                backend.delete(target)
            })
            .await;
            run.table().add_attempts(id, outcome.attempts);

            match outcome.value {
                Ok(()) | Err(BackendError::NotFound(_)) => {
                    let marked = run.table().roll_back(id);
                    if let Err(err) = marked {
                        tracing::error!(error = %err, "could not record deletion");
                        return false;
                    }
                    lock(&run.deleted).push(id.clone());
                    tracing::info!(physical_id = %handle.physical_id, "deleted");
                    true
                }
                Err(err) => {
                    tracing::warn!(attempts = outcome.attempts, error = %err, "delete failed");
                    run.fail(id, phase, err.to_string());
                    false
                }
            }
        }
        .instrument(span)
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::ResourceState;
    use crate::hook::HookError;
    use async_trait::async_trait;
    use meridian_core::ResourceKind;
    use meridian_plan::PlanCompiler;
    use serde_json::Value;
    use std::collections::{BTreeMap, HashMap};
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, Clone, Copy)]
    enum Script {
        Transient(u32),
        Permanent,
        DeleteFails,
        DeleteMissing,
    }

    /// In-test backend with per-node scripted behaviour
    #[derive(Default)]
    struct ScriptedBackend {
        scripts: Mutex<HashMap<String, Script>>,
        calls: Mutex<Vec<String>>,
        in_flight: AtomicUsize,
        peak: AtomicUsize,
        latency: Duration,
    }

    impl ScriptedBackend {
        fn script(&self, node: &str, script: Script) {
            lock(&self.scripts).insert(node.to_string(), script);
        }

        fn calls(&self) -> Vec<String> {
            lock(&self.calls).clone()
        }

        fn position(&self, call: &str) -> usize {
            self.calls()
                .iter()
                .position(|c| c == call)
                .unwrap_or_else(|| panic!("no call {}", call))
        }
    }

    #[async_trait]
    impl ResourceBackend for ScriptedBackend {
        async fn create(&self, node: &ResourceNode) -> Result<BackendHandle, BackendError> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            if !self.latency.is_zero() {
                tokio::time::sleep(self.latency).await;
            }
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            lock(&self.calls).push(format!("create:{}", node.id));
            let script = lock(&self.scripts).get(node.id.as_str()).copied();
            match script {
                Some(Script::Transient(n)) if n > 0 => {
                    self.script(node.id.as_str(), Script::Transient(n - 1));
                    Err(BackendError::RateLimited("throttled".into()))
                }
                Some(Script::Permanent) => Err(BackendError::PermissionDenied(format!("{} denied", node.id))),
                _ => Ok(BackendHandle::new(node.id.clone(), node.kind, format!("{}-phys", node.id))),
            }
        }

        async fn read(&self, handle: &BackendHandle) -> Result<ResourceState, BackendError> {
            Ok(ResourceState {
                handle: handle.clone(),
                attributes: BTreeMap::new(),
            })
        }

        async fn update(
            &self,
            handle: &BackendHandle,
            _attributes: &BTreeMap<String, Value>,
        ) -> Result<(), BackendError> {
            lock(&self.calls).push(format!("update:{}", handle.node));
            Ok(())
        }

        async fn delete(&self, handle: &BackendHandle) -> Result<(), BackendError> {
            lock(&self.calls).push(format!("delete:{}", handle.node));
            let script = lock(&self.scripts).get(handle.node.as_str()).copied();
            match script {
                Some(Script::DeleteFails) => Err(BackendError::Rejected("dependency violation".into())),
                Some(Script::DeleteMissing) => Err(BackendError::NotFound(handle.physical_id.clone())),
                _ => Ok(()),
            }
        }
    }

    /// Hook that counts calls and can refuse one node
    #[derive(Default)]
    struct CountingHook {
        applied: Mutex<Vec<String>>,
        deleting: Mutex<Vec<String>>,
        refuse: Option<&'static str>,
    }

    #[async_trait]
    impl LifecycleHook for CountingHook {
        async fn on_applied(&self, ctx: &HookContext<'_>) -> Result<(), HookError> {
            lock(&self.applied).push(ctx.node.id.to_string());
            if self.refuse == Some(ctx.node.id.as_str()) {
                return Err(HookError::new("registration refused"));
            }
            Ok(())
        }

        async fn before_delete(&self, ctx: &HookContext<'_>) -> Result<(), HookError> {
            lock(&self.deleting).push(ctx.node.id.to_string());
            Ok(())
        }
    }

    fn config() -> EngineConfig {
        let fast = RetryPolicy::new(3).with_initial_backoff(Duration::from_millis(1));
        EngineConfig::default()
            .with_retry(fast.clone())
            .with_rollback_retry(fast)
            .with_node_timeout(Duration::from_secs(5))
    }

    /// N and R first, then T, C, S
    fn scenario() -> (StackId, Graph, CompiledPlan) {
        let graph = Graph::build(vec![
            ResourceNode::new("S", ResourceKind::Service).with_reference("C"),
            ResourceNode::new("C", ResourceKind::ContainerSpec).with_reference("T"),
            ResourceNode::new("T", ResourceKind::TaskTemplate).with_reference("R"),
            ResourceNode::new("R", ResourceKind::Role),
            ResourceNode::new("N", ResourceKind::Network),
        ])
        .unwrap();
        let plan = PlanCompiler::new().compile(&graph).unwrap();
        (StackId::new("demo"), graph, plan)
    }

    fn id(s: &str) -> NodeId {
        NodeId::new(s)
    }

    #[tokio::test]
    async fn test_apply_reference_scenario() {
        let (stack, graph, plan) = scenario();
        let backend = Arc::new(ScriptedBackend::default());
        let engine = ExecutionEngine::new(backend.clone(), config());

        let result = engine.apply(&stack, &graph, &plan, None, &CancellationToken::new()).await;

        assert_eq!(result.outcome, Outcome::Succeeded);
        assert_eq!(result.stages_completed, 4);
        assert_eq!(result.count(NodeStatus::Succeeded), 5);
        assert!(backend.position("create:R") < backend.position("create:T"));
        assert!(backend.position("create:T") < backend.position("create:C"));
        assert!(backend.position("create:C") < backend.position("create:S"));
        assert_eq!(result.exit_code(), 0);
    }

    #[tokio::test]
    async fn test_reapply_unchanged_makes_no_calls() {
        let (stack, graph, plan) = scenario();
        let backend = Arc::new(ScriptedBackend::default());
        let engine = ExecutionEngine::new(backend.clone(), config());
        let first = engine.apply(&stack, &graph, &plan, None, &CancellationToken::new()).await;
        let calls = backend.calls().len();

        let second = engine
            .apply(&stack, &graph, &plan, Some(&first), &CancellationToken::new())
            .await;
        assert_eq!(second.outcome, Outcome::Succeeded);
        assert_eq!(backend.calls().len(), calls);
    }

    #[tokio::test]
    async fn test_changed_node_updated_in_place() {
        let (stack, graph, plan) = scenario();
        let backend = Arc::new(ScriptedBackend::default());
        let engine = ExecutionEngine::new(backend.clone(), config());
        let first = engine.apply(&stack, &graph, &plan, None, &CancellationToken::new()).await;

        let changed = Graph::build(
            graph
                .nodes()
                .cloned()
                .map(|n| if n.id.as_str() == "S" { n.with_attribute("desired_count", 3) } else { n }),
        )
        .unwrap();
        let plan = PlanCompiler::new().compile(&changed).unwrap();
        let second = engine
            .apply(&stack, &changed, &plan, Some(&first), &CancellationToken::new())
            .await;

        assert_eq!(second.outcome, Outcome::Succeeded);
        assert_eq!(backend.calls().iter().filter(|c| c.starts_with("create:S")).count(), 1);
        assert!(backend.calls().contains(&"update:S".to_string()));
        assert_ne!(
            first.record(&id("S")).unwrap().fingerprint,
            second.record(&id("S")).unwrap().fingerprint
        );
    }

    #[tokio::test]
    async fn test_transient_errors_retried() {
        let (stack, graph, plan) = scenario();
        let backend = Arc::new(ScriptedBackend::default());
        backend.script("T", Script::Transient(2));
        let engine = ExecutionEngine::new(backend.clone(), config());

        let result = engine.apply(&stack, &graph, &plan, None, &CancellationToken::new()).await;
        assert_eq!(result.outcome, Outcome::Succeeded);
        assert_eq!(result.record(&id("T")).unwrap().attempts, 3);
    }

    #[tokio::test]
    async fn test_permanent_failure_rolls_back() {
        let (stack, graph, plan) = scenario();
        let backend = Arc::new(ScriptedBackend::default());
        backend.script("C", Script::Permanent);
        let engine = ExecutionEngine::new(backend.clone(), config());

        let result = engine.apply(&stack, &graph, &plan, None, &CancellationToken::new()).await;

        assert_eq!(result.outcome, Outcome::Failed);
        assert_eq!(result.status(&id("C")), Some(NodeStatus::Failed));
        assert_eq!(result.status(&id("S")), Some(NodeStatus::Pending));
        for rolled in ["N", "R", "T"] {
            assert_eq!(result.status(&id(rolled)), Some(NodeStatus::RolledBack));
        }
        assert!(backend.position("delete:T") < backend.position("delete:R"));
        assert!(!backend.calls().contains(&"create:S".to_string()));

        let report = &result.failures[0];
        assert_eq!(report.node, id("C"));
        assert_eq!(report.phase, FailurePhase::Apply);
        assert_eq!(report.blocked, vec![id("S")]);
        assert_eq!(report.rolled_back.len(), 3);
        assert!(!result.has_live_resources());
    }

    #[tokio::test]
    async fn test_failure_without_rollback_then_resume() {
        let (stack, graph, plan) = scenario();
        let backend = Arc::new(ScriptedBackend::default());
        backend.script("C", Script::Permanent);
        let engine = ExecutionEngine::new(backend.clone(), config().with_rollback_on_failure(false));

        let first = engine.apply(&stack, &graph, &plan, None, &CancellationToken::new()).await;
        assert_eq!(first.status(&id("T")), Some(NodeStatus::Succeeded));
        assert!(!backend.calls().iter().any(|c| c.starts_with("delete:")));

        lock(&backend.scripts).clear();
        let second = engine
            .apply(&stack, &graph, &plan, Some(&first), &CancellationToken::new())
            .await;
        assert_eq!(second.outcome, Outcome::Succeeded);
        let creates_of_t = backend.calls().iter().filter(|c| *c == "create:T").count();
        assert_eq!(creates_of_t, 1);
        assert_eq!(backend.calls().iter().filter(|c| *c == "create:C").count(), 2);
    }

    #[tokio::test]
    async fn test_cancel_before_start() {
        let (stack, graph, plan) = scenario();
        let backend = Arc::new(ScriptedBackend::default());
        let engine = ExecutionEngine::new(backend.clone(), config());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = engine.apply(&stack, &graph, &plan, None, &cancel).await;
        assert_eq!(result.outcome, Outcome::Cancelled);
        assert_eq!(result.stages_completed, 0);
        assert!(backend.calls().is_empty());
        assert_eq!(result.exit_code(), 1);
    }

    /// Cancels the run once a given node is applied
    struct CancelOnApply {
        node: &'static str,
        token: CancellationToken,
    }

    #[async_trait]
    impl LifecycleHook for CancelOnApply {
        async fn on_applied(&self, ctx: &HookContext<'_>) -> Result<(), HookError> {
            if ctx.node.id.as_str() == self.node {
                self.token.cancel();
            }
            Ok(())
        }

        async fn before_delete(&self, _ctx: &HookContext<'_>) -> Result<(), HookError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_cancel_mid_stage_finishes_stage_then_resumes() {
        let (stack, graph, plan) = scenario();
        let backend = Arc::new(ScriptedBackend {
            latency: Duration::from_millis(20),
            ..ScriptedBackend::default()
        });
        let cancel = CancellationToken::new();
        let hook = Arc::new(CancelOnApply {
            node: "N",
            token: cancel.clone(),
        });
        let engine = ExecutionEngine::new(backend.clone(), config()).with_hook(hook);

        let partial = engine.apply(&stack, &graph, &plan, None, &cancel).await;
        assert_eq!(partial.outcome, Outcome::Cancelled);
        assert_eq!(partial.stages_completed, 1);
        assert_eq!(partial.status(&id("N")), Some(NodeStatus::Succeeded));
        assert_eq!(partial.status(&id("R")), Some(NodeStatus::Succeeded));
        for waiting in ["T", "C", "S"] {
            assert_eq!(partial.status(&id(waiting)), Some(NodeStatus::Pending));
        }
        assert_eq!(backend.calls().len(), 2);
        assert!(partial.failures.is_empty());

        let engine = ExecutionEngine::new(backend.clone(), config());
        let resumed = engine
            .apply(&stack, &graph, &plan, Some(&partial), &CancellationToken::new())
            .await;
        assert_eq!(resumed.outcome, Outcome::Succeeded);
        assert_eq!(resumed.count(NodeStatus::Succeeded), 5);
        for done in ["create:N", "create:R"] {
            assert_eq!(backend.calls().iter().filter(|c| *c == done).count(), 1);
        }
        assert!(!backend.calls().iter().any(|c| c.starts_with("delete:")));
    }

    #[tokio::test]
    async fn test_sibling_in_failed_stage_completes_then_rolls_back() {
        let graph = Graph::build(vec![
            ResourceNode::new("A", ResourceKind::Network),
            ResourceNode::new("B", ResourceKind::Role),
            ResourceNode::new("C", ResourceKind::Cluster)
                .with_reference("A")
                .with_reference("B"),
        ])
        .unwrap();
        let plan = PlanCompiler::new().compile(&graph).unwrap();
        let backend = Arc::new(ScriptedBackend::default());
        backend.script("A", Script::Permanent);
        let engine = ExecutionEngine::new(backend.clone(), config());

        let result = engine
            .apply(&StackId::new("pair"), &graph, &plan, None, &CancellationToken::new())
            .await;

        assert_eq!(result.outcome, Outcome::Failed);
        assert_eq!(result.stages_completed, 0);
        assert_eq!(result.status(&id("A")), Some(NodeStatus::Failed));
        assert_eq!(result.status(&id("B")), Some(NodeStatus::RolledBack));
        assert_eq!(result.status(&id("C")), Some(NodeStatus::Pending));
        assert!(backend.calls().contains(&"create:B".to_string()));
        assert!(backend.calls().contains(&"delete:B".to_string()));
        assert!(!backend.calls().iter().any(|c| c == "create:C"));
        assert_eq!(result.failures[0].blocked, vec![id("C")]);
        assert!(!result.has_live_resources());
    }

    #[tokio::test]
    async fn test_concurrency_bounded() {
        let nodes: Vec<ResourceNode> = (0..12)
            .map(|i| ResourceNode::new(format!("n{}", i), ResourceKind::LogSink))
            .collect();
        let graph = Graph::build(nodes).unwrap();
        let plan = PlanCompiler::new().compile(&graph).unwrap();
        let backend = Arc::new(ScriptedBackend {
            latency: Duration::from_millis(10),
            ..ScriptedBackend::default()
        });
        let engine = ExecutionEngine::new(backend.clone(), config().with_concurrency(3));

        let result = engine
            .apply(&StackId::new("wide"), &graph, &plan, None, &CancellationToken::new())
            .await;
        assert_eq!(result.outcome, Outcome::Succeeded);
        assert!(backend.peak.load(Ordering::SeqCst) <= 3);
    }

    #[tokio::test]
    async fn test_hook_failure_rolls_back_node() {
        let (stack, graph, plan) = scenario();
        let backend = Arc::new(ScriptedBackend::default());
        let hook = Arc::new(CountingHook {
            refuse: Some("S"),
            ..CountingHook::default()
        });
        let engine = ExecutionEngine::new(backend.clone(), config()).with_hook(hook.clone());

        let result = engine.apply(&stack, &graph, &plan, None, &CancellationToken::new()).await;
        assert_eq!(result.outcome, Outcome::Failed);
        assert_eq!(lock(&hook.applied).len(), 5);
        // S was created, so rollback deleted it too.
        assert_eq!(result.status(&id("S")), Some(NodeStatus::RolledBack));
        assert!(backend.calls().contains(&"delete:S".to_string()));
        assert_eq!(lock(&hook.deleting).len(), 5);
    }

    #[tokio::test]
    async fn test_blocked_rollback_keeps_dependencies() {
        let (stack, graph, plan) = scenario();
        let backend = Arc::new(ScriptedBackend::default());
        backend.script("S", Script::Permanent);
        backend.script("C", Script::DeleteFails);
        let engine = ExecutionEngine::new(backend.clone(), config());

        let result = engine.apply(&stack, &graph, &plan, None, &CancellationToken::new()).await;
        assert_eq!(result.status(&id("C")), Some(NodeStatus::Failed));
        assert_eq!(result.status(&id("T")), Some(NodeStatus::Failed));
        assert_eq!(result.status(&id("N")), Some(NodeStatus::RolledBack));
        assert!(!backend.calls().contains(&"delete:T".to_string()));
        assert!(result.has_live_resources());
    }

    #[tokio::test]
    async fn test_teardown_reverse_order() {
        let (stack, graph, plan) = scenario();
        let backend = Arc::new(ScriptedBackend::default());
        backend.script("N", Script::DeleteMissing);
        let engine = ExecutionEngine::new(backend.clone(), config());
        let applied = engine.apply(&stack, &graph, &plan, None, &CancellationToken::new()).await;

        let result = engine
            .teardown(&stack, &graph, &plan, Some(&applied), &CancellationToken::new())
            .await;
        assert_eq!(result.operation, Operation::Teardown);
        assert_eq!(result.outcome, Outcome::Succeeded);
        assert_eq!(result.count(NodeStatus::RolledBack), 5);
        assert!(backend.position("delete:S") < backend.position("delete:C"));
        assert!(backend.position("delete:T") < backend.position("delete:R"));
    }

    #[tokio::test]
    async fn test_teardown_failure_stops_later_stages() {
        let (stack, graph, plan) = scenario();
        let backend = Arc::new(ScriptedBackend::default());
        let engine = ExecutionEngine::new(backend.clone(), config());
        let applied = engine.apply(&stack, &graph, &plan, None, &CancellationToken::new()).await;
        backend.script("C", Script::DeleteFails);

        let result = engine
            .teardown(&stack, &graph, &plan, Some(&applied), &CancellationToken::new())
            .await;
        assert_eq!(result.outcome, Outcome::Failed);
        assert_eq!(result.status(&id("S")), Some(NodeStatus::RolledBack));
        assert_eq!(result.status(&id("C")), Some(NodeStatus::Failed));
        assert_eq!(result.status(&id("T")), Some(NodeStatus::Succeeded));
        assert_eq!(result.failures[0].phase, FailurePhase::Teardown);
        assert_eq!(result.failures[0].blocked, vec![id("R"), id("T")]);
        assert!(!backend.calls().contains(&"delete:T".to_string()));
    }

    #[tokio::test]
    async fn test_teardown_without_prior_is_noop() {
        let (stack, graph, plan) = scenario();
        let backend = Arc::new(ScriptedBackend::default());
        let engine = ExecutionEngine::new(backend.clone(), config());
        let result = engine
            .teardown(&stack, &graph, &plan, None, &CancellationToken::new())
            .await;
        assert_eq!(result.outcome, Outcome::Succeeded);
        assert!(backend.calls().is_empty());
        assert_eq!(result.count(NodeStatus::Pending), 5);
    }
}

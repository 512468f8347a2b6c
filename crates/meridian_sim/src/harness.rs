//! A complete MERIDIAN deployment against the simulated control plane.
//!
//! The harness wires the engine, the discovery hook and its binder, the
//! simulated backend, DNS and endpoint source, and a state store. Every
//! `apply` and `teardown` loads the stack's previous result, runs, and
//! stores the new one.

use crate::backend::{SimBackend, SimWorld};
use crate::dns::{SimDns, SimDnsSnapshot};
use crate::failure::FailureModel;
use crate::seed::SimSeed;
use crate::source::SimEndpointSource;
use meridian_core::StackId;
use meridian_discovery::{Binder, BinderConfig, DiscoveryHook};
use meridian_plan::{CompiledPlan, DocumentError, Graph, GraphError, PlanCompiler, StackDocument, Validator};
use meridian_runtime::{CancellationToken, EngineConfig, ExecutionEngine, ExecutionResult};
use meridian_storage::{InMemoryStateStore, StateStore, StorageError};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// Harness configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HarnessConfig {
    /// Execution engine settings
    pub engine: EngineConfig,
    /// Discovery binder settings
    pub binder: BinderConfig,
    /// Reject public exposure instead of warning
    pub deny_public_exposure: bool,
    /// Seed for injected failures
    pub seed: SimSeed,
    /// Backend failure model
    pub failures: FailureModel,
    /// Added latency of every backend call, in milliseconds
    pub latency_ms: u64,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            engine: EngineConfig::default(),
            binder: BinderConfig::default(),
            deny_public_exposure: false,
            seed: SimSeed::default(),
            failures: FailureModel::default(),
            latency_ms: 0,
        }
    }
}

impl HarnessConfig {
    /// Set engine settings
    #[must_use]
    pub fn with_engine(mut self, engine: EngineConfig) -> Self {
        self.engine = engine;
        self
    }

    /// Set binder settings
    #[must_use]
    pub fn with_binder(mut self, binder: BinderConfig) -> Self {
        self.binder = binder;
        self
    }

    /// Inject backend failures drawn from `model` seeded by `seed`
    #[must_use]
    pub fn with_failures(mut self, seed: SimSeed, model: FailureModel) -> Self {
        self.seed = seed;
        self.failures = model;
        self
    }

    /// Reject public exposure
    #[must_use]
    pub fn with_deny_public_exposure(mut self, deny: bool) -> Self {
        self.deny_public_exposure = deny;
        self
    }
}

/// Error running the harness
#[derive(Debug, thiserror::Error)]
pub enum HarnessError {
    /// Stack document could not be loaded
    #[error(transparent)]
    Document(#[from] DocumentError),

    /// Graph failed validation or compilation
    #[error(transparent)]
    Plan(#[from] GraphError),

    /// State store failed
    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl HarnessError {
    /// Whether the error was raised before any backend call
    #[must_use]
    pub fn is_compile_error(&self) -> bool {
        match self {
            Self::Plan(_) => true,
            Self::Document(err) => matches!(err, DocumentError::Graph(_)),
            Self::Storage(_) => false,
        }
    }
}

/// Engine, binder and simulated control plane, wired together
pub struct SimHarness {
    config: HarnessConfig,
    tasks: Arc<SimEndpointSource>,
    backend: Arc<SimBackend>,
    dns: Arc<SimDns>,
    binder: Arc<Binder>,
    engine: ExecutionEngine,
    compiler: PlanCompiler,
    store: Arc<dyn StateStore>,
}

impl SimHarness {
    /// Empty control plane with an in-memory store
    #[must_use]
    pub fn new(config: HarnessConfig) -> Self {
        Self::resume(
            config,
            SimWorld::default(),
            SimDnsSnapshot::default(),
            Arc::new(InMemoryStateStore::new()),
        )
    }

    /// Control plane restored from a saved world and DNS snapshot
    #[must_use]
    pub fn resume(
        config: HarnessConfig,
        world: SimWorld,
        records: SimDnsSnapshot,
        store: Arc<dyn StateStore>,
    ) -> Self {
        let tasks = Arc::new(SimEndpointSource::new());
        let mut backend = SimBackend::from_world(world, Arc::clone(&tasks))
            .with_latency(Duration::from_millis(config.latency_ms));
        if config.failures.probability > 0.0 {
            backend = backend.with_failures(&config.seed.derive("backend"), config.failures.clone());
        }
        let backend = Arc::new(backend);
        let dns = Arc::new(SimDns::from_snapshot(records));

        let binder = Arc::new(Binder::new(dns.clone(), tasks.clone(), config.binder.clone()));
        let engine = ExecutionEngine::new(backend.clone(), config.engine.clone())
            .with_hook(Arc::new(DiscoveryHook::new(Arc::clone(&binder))));

        let mut validator = Validator::new();
        if config.deny_public_exposure {
            validator = validator.deny_public_exposure();
        }

        Self {
            compiler: PlanCompiler::new().with_validator(validator),
            config,
            tasks,
            backend,
            dns,
            binder,
            engine,
            store,
        }
    }

    /// Build and compile a stack without touching the backend
    ///
    /// # Errors
    ///
    /// Returns the graph or validation error of the document
    pub fn plan(&self, document: &StackDocument) -> Result<(Graph, CompiledPlan), HarnessError> {
        let graph = document.to_graph()?;
        let plan = self.compiler.compile(&graph)?;
        for warning in &plan.warnings {
            tracing::warn!(stack = %document.stack, %warning, "plan warning");
        }
        Ok((graph, plan))
    }

    /// Apply a stack, resuming from its stored result
    ///
    /// # Errors
    ///
    /// Returns a compile error before any backend call, or a store error
    pub async fn apply(
        &self,
        document: &StackDocument,
        cancel: &CancellationToken,
    ) -> Result<ExecutionResult, HarnessError> {
        let (graph, plan) = self.plan(document)?;
        let prior = self.store.load(&document.stack)?;
        let result = self
            .engine
            .apply(&document.stack, &graph, &plan, prior.as_ref(), cancel)
            .await;
        self.store.save(&result)?;
        Ok(result)
    }

    /// Tear a stack down using its stored result
    ///
    /// # Errors
    ///
    /// Returns a compile error before any backend call, or a store error
    pub async fn teardown(
        &self,
        document: &StackDocument,
        cancel: &CancellationToken,
    ) -> Result<ExecutionResult, HarnessError> {
        let (graph, plan) = self.plan(document)?;
        let prior = self.store.load(&document.stack)?;
        let result = self
            .engine
            .teardown(&document.stack, &graph, &plan, prior.as_ref(), cancel)
            .await;
        self.store.save(&result)?;
        Ok(result)
    }

    /// Stored result of `stack`
    ///
    /// # Errors
    ///
    /// Returns error if the store cannot be read
    pub fn status(&self, stack: &StackId) -> Result<Option<ExecutionResult>, HarnessError> {
        Ok(self.store.load(stack)?)
    }

    /// Stop following endpoint changes, leaving records in place
    pub async fn shutdown(&self) {
        self.binder.shutdown().await;
    }

    /// Harness configuration
    #[must_use]
    pub fn config(&self) -> &HarnessConfig {
        &self.config
    }

    /// Simulated backend
    #[must_use]
    pub fn backend(&self) -> &Arc<SimBackend> {
        &self.backend
    }

    /// Simulated DNS
    #[must_use]
    pub fn dns(&self) -> &Arc<SimDns> {
        &self.dns
    }

    /// Endpoint source the backend publishes to
    #[must_use]
    pub fn tasks(&self) -> &Arc<SimEndpointSource> {
        &self.tasks
    }

    /// Discovery binder
    #[must_use]
    pub fn binder(&self) -> &Arc<Binder> {
        &self.binder
    }

    /// State store
    #[must_use]
    pub fn store(&self) -> &Arc<dyn StateStore> {
        &self.store
    }
}

//! MERIDIAN Runtime
//!
//! Walks compiled plans against a [`ResourceBackend`]: stage by stage,
//! bounded concurrency inside a stage, retries with backoff, automatic
//! rollback on failure, cooperative cancellation and resume from a prior
//! [`ExecutionResult`].

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod backend;
pub mod engine;
pub mod hook;
pub mod result;
pub mod retry;
pub mod table;

pub use backend::{BackendError, BackendHandle, ErrorClass, ResourceBackend, ResourceState};
pub use engine::{EngineConfig, ExecutionEngine};
pub use hook::{HookContext, HookError, LifecycleHook, NoopHook, ResolvedDependency};
pub use result::{ExecutionResult, FailurePhase, FailureReport, NodeRecord, Operation, Outcome};
pub use retry::{CallOutcome, call_with_retry};
pub use table::StatusTable;
pub use tokio_util::sync::CancellationToken;

//! MERIDIAN Planner
//!
//! Turns a declared stack into a dependency graph and compiles the graph
//! into staged forward and teardown plans.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod compiler;
pub mod document;
pub mod error;
pub mod graph;
pub mod validate;

pub use compiler::{CompiledPlan, Plan, PlanCompiler, Stage};
pub use document::{DocumentError, StackDocument};
pub use error::GraphError;
pub use graph::{Edge, Graph, GraphBuilder};
pub use validate::{PlanWarning, Validator};

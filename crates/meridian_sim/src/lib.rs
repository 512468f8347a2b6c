//! MERIDIAN Simulation
//!
//! In-memory stand-ins for a cloud control plane: a resource backend that
//! runs service tasks, a DNS record API and the endpoint source those tasks
//! publish to. Failures are injected from scripts or from a seeded model,
//! so every run is reproducible.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod backend;
pub mod dns;
pub mod failure;
pub mod harness;
pub mod seed;
pub mod source;

pub use backend::{BackendCall, BackendOp, SimBackend, SimResource, SimWorld};
pub use dns::{DnsCall, DnsOp, SimDns, SimDnsSnapshot, SimRecord};
pub use failure::{FailureKind, FailureModel, FaultInjector, Injection};
pub use harness::{HarnessConfig, HarnessError, SimHarness};
pub use seed::{SeedSource, SimSeed};
pub use source::SimEndpointSource;

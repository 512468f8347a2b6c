//! MERIDIAN Core Types
//!
//! Pure types shared by every MERIDIAN crate: declared resource nodes,
//! identifiers, endpoints, content fingerprints, node status and the
//! retry policy. No I/O happens here.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod endpoint;
pub mod error;
pub mod fingerprint;
pub mod id;
pub mod resource;
pub mod retry;
pub mod status;

// Re-exports
pub use endpoint::{Endpoint, EndpointSet, Protocol};
pub use error::{CoreError, CoreResult};
pub use fingerprint::{Fingerprint, FingerprintError};
pub use id::{NodeId, RunId, StackId, TaskId};
pub use resource::{ResourceKind, ResourceNode};
pub use retry::RetryPolicy;
pub use status::{NodeStatus, StatusTransitionError};

//! MERIDIAN Discovery
//!
//! Binds service registrations to DNS records. A [`Binder`] follows the
//! endpoint stream of each registered task and converges the record onto
//! the live endpoint set, adding before removing so the record never goes
//! empty while endpoints are running.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod binder;
pub mod binding;
pub mod dns;
pub mod error;
pub mod hook;
pub mod reconcile;
pub mod source;

#[cfg(test)]
mod testing;

pub use binder::{Binder, BinderConfig};
pub use binding::{BindingSpec, BindingState, Delta, ServiceBinding};
pub use dns::{DnsError, DnsRecordApi, RecordKey, RecordType};
pub use error::BindingError;
pub use hook::DiscoveryHook;
pub use reconcile::Reconciler;
pub use source::{EndpointChange, EndpointSource};

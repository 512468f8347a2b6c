//! Binding errors.

use crate::binding::BindingState;
use crate::dns::{DnsError, RecordKey};
use std::time::Duration;

/// Binder error
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BindingError {
    /// No endpoint was published before the bind timeout
    #[error("No endpoint published for {record} within {waited:?}")]
    BindTimeout {
        /// Record being bound
        record: RecordKey,
        /// How long the binder waited
        waited: Duration,
    },

    /// Record could not be converged within the retry window
    #[error("Record {record} did not converge: {reason}")]
    Consistency {
        /// Record being converged
        record: RecordKey,
        /// Last error seen
        reason: String,
    },

    /// Illegal binding state transition
    #[error("Illegal binding transition for {record}: {from} -> {to}")]
    IllegalTransition {
        /// Record of the binding
        record: RecordKey,
        /// Current state
        from: BindingState,
        /// Requested state
        to: BindingState,
    },

    /// Registration is missing what it needs to bind
    #[error("Invalid registration {node}: {reason}")]
    InvalidRegistration {
        /// Registration node
        node: String,
        /// What is missing
        reason: String,
    },

    /// DNS provider rejected a request
    #[error(transparent)]
    Dns(#[from] DnsError),
}

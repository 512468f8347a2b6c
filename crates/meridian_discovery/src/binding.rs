//! Service bindings and their state machine.

use crate::dns::RecordKey;
use crate::error::BindingError;
use chrono::{DateTime, Utc};
use meridian_core::{EndpointSet, TaskId};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle of a binding
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BindingState {
    /// No record exists for the binding
    Unbound,
    /// Record created, waiting for endpoints
    Registering,
    /// Record matches the last endpoint set seen
    Bound,
    /// Converging onto a new endpoint set
    Updating,
    /// Removing endpoints and deleting the record
    Deregistering,
}

impl BindingState {
    /// Whether a transition to `next` is allowed
    #[must_use]
    pub const fn can_transition_to(&self, next: BindingState) -> bool {
        matches!(
            (self, next),
            (Self::Unbound, Self::Registering)
                | (Self::Registering, Self::Bound)
                | (Self::Registering, Self::Deregistering)
                | (Self::Bound, Self::Updating)
                | (Self::Bound, Self::Deregistering)
                | (Self::Updating, Self::Bound)
                | (Self::Deregistering, Self::Unbound)
        )
    }
}

impl fmt::Display for BindingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Unbound => "unbound",
            Self::Registering => "registering",
            Self::Bound => "bound",
            Self::Updating => "updating",
            Self::Deregistering => "deregistering",
        };
        f.write_str(s)
    }
}

/// What to bind: a record and the task whose endpoints it serves
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BindingSpec {
    /// Record to maintain
    pub key: RecordKey,
    /// Task whose endpoints the record serves
    pub target: TaskId,
    /// Record TTL in seconds
    pub ttl: u32,
}

impl BindingSpec {
    /// Default TTL for new records
    pub const DEFAULT_TTL: u32 = 60;

    /// Create a spec with the default TTL
    #[must_use]
    pub fn new(key: RecordKey, target: TaskId) -> Self {
        Self {
            key,
            target,
            ttl: Self::DEFAULT_TTL,
        }
    }

    /// Set the TTL
    #[must_use]
    pub fn with_ttl(mut self, ttl: u32) -> Self {
        self.ttl = ttl;
        self
    }
}

/// Endpoints to add and remove to go from one set to another
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Delta {
    /// Endpoints missing from the record
    pub add: EndpointSet,
    /// Endpoints the record must drop
    pub remove: EndpointSet,
}

impl Delta {
    /// Compute the delta from `current` to `desired`
    #[must_use]
    pub fn between(current: &EndpointSet, desired: &EndpointSet) -> Self {
        Self {
            add: desired.difference(current).copied().collect(),
            remove: current.difference(desired).copied().collect(),
        }
    }

    /// Whether nothing needs to change
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.add.is_empty() && self.remove.is_empty()
    }
}

/// Binding of a DNS record to a task's endpoints
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceBinding {
    /// Record being maintained
    pub key: RecordKey,
    /// Task whose endpoints are served
    pub target: TaskId,
    /// Record TTL in seconds
    pub ttl: u32,
    /// Endpoints the record currently holds
    pub endpoints: EndpointSet,
    /// Endpoints last reported for the target task
    #[serde(default)]
    pub desired_endpoints: EndpointSet,
    /// Lifecycle state
    pub state: BindingState,
    /// Last background failure, cleared by the next successful sync
    pub last_error: Option<String>,
    /// Last state or endpoint change
    pub updated_at: DateTime<Utc>,
}

impl ServiceBinding {
    /// A new, unbound binding
    #[must_use]
    pub fn new(spec: BindingSpec) -> Self {
        Self {
            key: spec.key,
            target: spec.target,
            ttl: spec.ttl,
            endpoints: EndpointSet::new(),
            desired_endpoints: EndpointSet::new(),
            state: BindingState::Unbound,
            last_error: None,
            updated_at: Utc::now(),
        }
    }

    /// Move to `next`
    ///
    /// # Errors
    ///
    /// Returns `IllegalTransition` if the state machine forbids it
    pub fn transition(&mut self, next: BindingState) -> Result<(), BindingError> {
        if !self.state.can_transition_to(next) {
            return Err(BindingError::IllegalTransition {
                record: self.key.clone(),
                from: self.state,
                to: next,
            });
        }
        tracing::debug!(record = %self.key, from = %self.state, to = %next, "binding transition");
        self.state = next;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Delta from the current endpoints to `desired`
    #[must_use]
    pub fn delta(&self, desired: &EndpointSet) -> Delta {
        Delta::between(&self.endpoints, desired)
    }

    /// Whether the last sync failed and should be retried
    #[must_use]
    pub fn needs_resync(&self) -> bool {
        self.last_error.is_some() && self.state == BindingState::Bound
    }
}

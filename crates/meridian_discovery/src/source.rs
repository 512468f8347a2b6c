//! Endpoint streams of running tasks.

use futures::stream::BoxStream;
use meridian_core::{EndpointSet, TaskId};
use serde::{Deserialize, Serialize};

/// Full endpoint set of a task at one point in time
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointChange {
    /// Task the endpoints belong to
    pub task: TaskId,
    /// Every live endpoint; replaces the previous set
    pub endpoints: EndpointSet,
}

impl EndpointChange {
    /// Create a change
    #[must_use]
    pub fn new(task: TaskId, endpoints: EndpointSet) -> Self {
        Self { task, endpoints }
    }
}

/// Source of endpoint changes per task.
///
/// The first item of every new subscription is the current endpoint set, so
/// a subscriber that reconnects never has to replay history. A stream that
/// ends may be resubscribed.
pub trait EndpointSource: Send + Sync {
    /// Subscribe to endpoint changes of `task`
    fn subscribe(&self, task: &TaskId) -> BoxStream<'static, EndpointChange>;
}

//! Endpoint source fed by the simulated backend.

use futures::stream::{self, BoxStream, StreamExt};
use meridian_core::{EndpointSet, TaskId};
use meridian_discovery::{EndpointChange, EndpointSource};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::watch;

/// Latest endpoint set per task, one watch channel each.
///
/// A subscriber first sees the current set, then every later change.
/// Intermediate sets published faster than a subscriber reads are
/// coalesced into the latest one.
#[derive(Default)]
pub struct SimEndpointSource {
    channels: Mutex<HashMap<TaskId, watch::Sender<EndpointSet>>>,
}

impl SimEndpointSource {
    /// Create an empty source
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn channels(&self) -> MutexGuard<'_, HashMap<TaskId, watch::Sender<EndpointSet>>> {
        self.channels.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Replace the endpoint set of `task`
    pub fn publish(&self, task: &TaskId, endpoints: EndpointSet) {
        tracing::debug!(task = %task, endpoints = endpoints.len(), "endpoints published");
        self.channels()
            .entry(task.clone())
            .or_insert_with(|| watch::channel(EndpointSet::new()).0)
            .send_replace(endpoints);
    }

    /// End every open subscription of `task`
    pub fn close(&self, task: &TaskId) {
        self.channels().remove(task);
    }

    /// Current endpoint set of `task`
    #[must_use]
    pub fn current(&self, task: &TaskId) -> EndpointSet {
        self.channels()
            .get(task)
            .map(|sender| sender.borrow().clone())
            .unwrap_or_default()
    }
}

impl EndpointSource for SimEndpointSource {
    fn subscribe(&self, task: &TaskId) -> BoxStream<'static, EndpointChange> {
        let rx = self
            .channels()
            .entry(task.clone())
            .or_insert_with(|| watch::channel(EndpointSet::new()).0)
            .subscribe();
        let task = task.clone();
        stream::unfold((rx, true), move |(mut rx, first)| {
            let task = task.clone();
            async move {
                if !first {
                    rx.changed().await.ok()?;
                }
                let endpoints = rx.borrow_and_update().clone();
                Some((EndpointChange::new(task, endpoints), (rx, false)))
            }
        })
        .boxed()
    }
}

//! The service discovery binder.
//!
//! Each registered binding gets one background task that is the sole
//! consumer of its endpoint stream and the sole writer of its record.
//! Deregistration stops that task before touching DNS, so record updates
//! for one binding never interleave.

use crate::binding::{BindingSpec, BindingState, ServiceBinding};
use crate::dns::{DnsError, DnsRecordApi, RecordKey};
use crate::error::BindingError;
use crate::reconcile::Reconciler;
use crate::source::{EndpointChange, EndpointSource};
use futures::StreamExt;
use futures::stream::BoxStream;
use meridian_core::{EndpointSet, RetryPolicy};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Binder configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BinderConfig {
    /// Report Bound before any endpoint is published
    pub allow_zero_endpoints: bool,
    /// How long registration waits for the first endpoint, in milliseconds
    pub bind_timeout_ms: u64,
    /// Retry policy for DNS calls and record convergence
    pub dns_retry: RetryPolicy,
    /// Delay before resubscribing to an ended endpoint stream, in milliseconds
    pub resubscribe_backoff_ms: u64,
    /// Delay before retrying a failed record sync, in milliseconds
    pub resync_backoff_ms: u64,
}

impl Default for BinderConfig {
    fn default() -> Self {
        Self {
            allow_zero_endpoints: false,
            bind_timeout_ms: 60_000,
            dns_retry: RetryPolicy::default(),
            resubscribe_backoff_ms: 1_000,
            resync_backoff_ms: 5_000,
        }
    }
}

impl BinderConfig {
    /// Registration wait bound
    #[must_use]
    pub fn bind_timeout(&self) -> Duration {
        Duration::from_millis(self.bind_timeout_ms)
    }

    /// Resubscribe delay
    #[must_use]
    pub fn resubscribe_backoff(&self) -> Duration {
        Duration::from_millis(self.resubscribe_backoff_ms)
    }

    /// Failed sync retry delay
    #[must_use]
    pub fn resync_backoff(&self) -> Duration {
        Duration::from_millis(self.resync_backoff_ms.max(1))
    }

    /// Allow binding with no endpoints
    #[must_use]
    pub fn with_allow_zero_endpoints(mut self, allow: bool) -> Self {
        self.allow_zero_endpoints = allow;
        self
    }

    /// Set the registration wait bound
    #[must_use]
    pub fn with_bind_timeout(mut self, timeout: Duration) -> Self {
        self.bind_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Set the DNS retry policy
    #[must_use]
    pub fn with_dns_retry(mut self, retry: RetryPolicy) -> Self {
        self.dns_retry = retry;
        self
    }

    /// Set the resubscribe delay
    #[must_use]
    pub fn with_resubscribe_backoff(mut self, backoff: Duration) -> Self {
        self.resubscribe_backoff_ms = backoff.as_millis() as u64;
        self
    }

    /// Set the failed sync retry delay
    #[must_use]
    pub fn with_resync_backoff(mut self, backoff: Duration) -> Self {
        self.resync_backoff_ms = backoff.as_millis() as u64;
        self
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct Slot {
    binding: Arc<Mutex<ServiceBinding>>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Keeps DNS records bound to live task endpoints
pub struct Binder {
    reconciler: Reconciler,
    source: Arc<dyn EndpointSource>,
    config: BinderConfig,
    slots: Mutex<HashMap<RecordKey, Slot>>,
}

impl Binder {
    /// Create a binder
    #[must_use]
    pub fn new(
        dns: Arc<dyn DnsRecordApi>,
        source: Arc<dyn EndpointSource>,
        config: BinderConfig,
    ) -> Self {
        Self {
            reconciler: Reconciler::new(dns, config.dns_retry.clone()),
            source,
            config,
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// Binder configuration
    #[must_use]
    pub fn config(&self) -> &BinderConfig {
        &self.config
    }

    /// Register a binding and wait until it is Bound.
    ///
    /// Registering an already bound record for the same task is a no-op.
    /// A failed registration removes the record again.
    ///
    /// # Errors
    ///
    /// Returns `BindTimeout` if no endpoint shows up in time, or the DNS
    /// error that prevented the record from converging
    pub async fn register(&self, spec: BindingSpec) -> Result<ServiceBinding, BindingError> {
        if let Some(existing) = self.snapshot(&spec.key) {
            if existing.target == spec.target && existing.ttl == spec.ttl {
                tracing::debug!(record = %spec.key, "already bound");
                return Ok(existing);
            }
        }

        let key = spec.key.clone();
        let mut binding = ServiceBinding::new(spec);
        if let Some(previous) = self.stop(&key).await {
            binding.endpoints = previous.endpoints;
        }
        binding.transition(BindingState::Registering)?;
        tracing::info!(record = %key, task = %binding.target, "registering");

        let stream = match self.bind(&mut binding).await {
            Ok(stream) => stream,
            Err(err) => {
                tracing::warn!(record = %key, error = %err, "registration failed, removing record");
                if let Err(cleanup) = self.remove_record(&key).await {
                    tracing::warn!(record = %key, error = %cleanup, "could not remove record");
                }
                return Err(err);
            }
        };
        tracing::info!(record = %key, endpoints = binding.endpoints.len(), "bound");

        let snapshot = binding.clone();
        let shared = Arc::new(Mutex::new(binding));
        let cancel = CancellationToken::new();
        let task = tokio::spawn(follow(
            self.reconciler.clone(),
            Arc::clone(&self.source),
            Arc::clone(&shared),
            stream,
            cancel.clone(),
            self.config.clone(),
        ));
        lock(&self.slots).insert(
            key,
            Slot {
                binding: shared,
                cancel,
                task,
            },
        );
        Ok(snapshot)
    }

    async fn bind(
        &self,
        binding: &mut ServiceBinding,
    ) -> Result<BoxStream<'static, EndpointChange>, BindingError> {
        self.reconciler.upsert(&binding.key, binding.ttl).await?;
        let mut stream = self.source.subscribe(&binding.target);

        if self.config.allow_zero_endpoints {
            binding.transition(BindingState::Bound)?;
            return Ok(stream);
        }

        let waited = self.config.bind_timeout();
        let deadline = tokio::time::Instant::now() + waited;
        loop {
            match tokio::time::timeout_at(deadline, stream.next()).await {
                Err(_) => {
                    return Err(BindingError::BindTimeout {
                        record: binding.key.clone(),
                        waited,
                    });
                }
                Ok(None) => {
                    tracing::debug!(record = %binding.key, "endpoint stream ended while binding, resubscribing");
                    tokio::time::sleep(self.config.resubscribe_backoff()).await;
                    stream = self.source.subscribe(&binding.target);
                }
                Ok(Some(change)) if change.endpoints.is_empty() => {}
                Ok(Some(change)) => {
                    binding.desired_endpoints = change.endpoints.clone();
                    let achieved = self
                        .reconciler
                        .converge(&binding.key, &binding.endpoints, &change.endpoints)
                        .await?;
                    binding.endpoints = achieved;
                    binding.transition(BindingState::Bound)?;
                    return Ok(stream);
                }
            }
        }
    }

    /// Remove every endpoint, then delete the record.
    ///
    /// Works for records this binder never registered, so a fresh process
    /// can clean up after an earlier one. A missing record counts as
    /// deregistered.
    ///
    /// # Errors
    ///
    /// Returns the error that kept the record from being removed
    pub async fn deregister(&self, key: &RecordKey) -> Result<(), BindingError> {
        if let Some(mut binding) = self.stop(key).await {
            if binding.state.can_transition_to(BindingState::Deregistering) {
                binding.transition(BindingState::Deregistering)?;
            }
        }
        tracing::info!(record = %key, "deregistering");
        self.remove_record(key).await?;
        tracing::info!(record = %key, "deregistered");
        Ok(())
    }

    /// Deregister in the background
    pub fn deregister_detached(self: &Arc<Self>, key: RecordKey) -> JoinHandle<Result<(), BindingError>> {
        let binder = Arc::clone(self);
        tokio::spawn(async move {
            let result = binder.deregister(&key).await;
            if let Err(err) = &result {
                tracing::error!(record = %key, error = %err, "detached deregistration failed");
            }
            result
        })
    }

    /// Current state of a binding
    #[must_use]
    pub fn snapshot(&self, key: &RecordKey) -> Option<ServiceBinding> {
        let slots = lock(&self.slots);
        slots.get(key).map(|slot| lock(&slot.binding).clone())
    }

    /// Every live binding
    #[must_use]
    pub fn bindings(&self) -> Vec<ServiceBinding> {
        let slots = lock(&self.slots);
        let mut all: Vec<ServiceBinding> = slots.values().map(|slot| lock(&slot.binding).clone()).collect();
        all.sort_by(|a, b| a.key.cmp(&b.key));
        all
    }

    /// Stop every background task, leaving records in place
    pub async fn shutdown(&self) {
        let slots: Vec<Slot> = lock(&self.slots).drain().map(|(_, slot)| slot).collect();
        for slot in slots {
            slot.cancel.cancel();
            if let Err(err) = slot.task.await {
                tracing::warn!(error = %err, "binding task ended abnormally");
            }
        }
    }

    /// Stop the task of `key` and hand back its final binding
    async fn stop(&self, key: &RecordKey) -> Option<ServiceBinding> {
        let slot = lock(&self.slots).remove(key)?;
        slot.cancel.cancel();
        if let Err(err) = slot.task.await {
            tracing::warn!(record = %key, error = %err, "binding task ended abnormally");
        }
        let binding = lock(&slot.binding).clone();
        Some(binding)
    }

    async fn remove_record(&self, key: &RecordKey) -> Result<(), BindingError> {
        let current = match self.reconciler.read(key).await {
            Ok(current) => current,
            Err(DnsError::NotFound(_)) => return Ok(()),
            Err(err) => return Err(err.into()),
        };
        self.reconciler.converge(key, &current, &EndpointSet::new()).await?;
        self.reconciler.delete(key).await?;
        Ok(())
    }
}

/// Background loop of one binding.
///
/// A failed sync is retried after `resync_backoff` with the last desired
/// set, even when the source publishes nothing new.
async fn follow(
    reconciler: Reconciler,
    source: Arc<dyn EndpointSource>,
    binding: Arc<Mutex<ServiceBinding>>,
    mut stream: BoxStream<'static, EndpointChange>,
    cancel: CancellationToken,
    config: BinderConfig,
) {
    loop {
        let retry = lock(&binding).needs_resync();
        let next = tokio::select! {
            _ = cancel.cancelled() => break,
            next = stream.next() => next,
            _ = tokio::time::sleep(config.resync_backoff()), if retry => {
                let desired = lock(&binding).desired_endpoints.clone();
                tracing::debug!(endpoints = desired.len(), "retrying record sync");
                sync(&reconciler, &binding, desired).await;
                continue;
            }
        };

        match next {
            Some(change) => sync(&reconciler, &binding, change.endpoints).await,
            None => {
                let target = lock(&binding).target.clone();
                tracing::warn!(task = %target, "endpoint stream ended, resubscribing");
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(config.resubscribe_backoff()) => {}
                }
                stream = source.subscribe(&target);
            }
        }
    }
}

async fn sync(reconciler: &Reconciler, binding: &Mutex<ServiceBinding>, desired: EndpointSet) {
    let (key, current) = {
        let mut guard = lock(binding);
        guard.desired_endpoints = desired.clone();
        if guard.endpoints == desired && guard.last_error.is_none() {
            return;
        }
        if let Err(err) = guard.transition(BindingState::Updating) {
            tracing::error!(error = %err, "cannot update binding");
            return;
        }
        (guard.key.clone(), guard.endpoints.clone())
    };

    let outcome = reconciler.converge(&key, &current, &desired).await;
    let observed = match &outcome {
        Ok(_) => None,
        Err(_) => reconciler.read(&key).await.ok(),
    };

    let mut guard = lock(binding);
    match outcome {
        Ok(achieved) => {
            tracing::info!(record = %key, endpoints = achieved.len(), "record updated");
            guard.endpoints = achieved;
            guard.last_error = None;
        }
        Err(err) => {
            tracing::error!(record = %key, error = %err, "record update failed");
            if let Some(observed) = observed {
                guard.endpoints = observed;
            }
            guard.last_error = Some(err.to_string());
        }
    }
    if let Err(err) = guard.transition(BindingState::Bound) {
        tracing::error!(error = %err, "cannot settle binding");
    }
}

//! Converging a record onto a desired endpoint set.
//!
//! Adds always go out before removes. When a call fails transiently or
//! with an unknown outcome, the reconciler backs off, re-reads the record
//! and recomputes the delta from what the provider actually holds.

use crate::binding::Delta;
use crate::dns::{DnsError, DnsRecordApi, RecordKey};
use crate::error::BindingError;
use meridian_core::{EndpointSet, RetryPolicy};
use std::future::Future;
use std::sync::Arc;

/// Applies endpoint deltas to DNS records
#[derive(Clone)]
pub struct Reconciler {
    dns: Arc<dyn DnsRecordApi>,
    retry: RetryPolicy,
}

impl Reconciler {
    /// Create a reconciler
    #[must_use]
    pub fn new(dns: Arc<dyn DnsRecordApi>, retry: RetryPolicy) -> Self {
        Self { dns, retry }
    }

    /// Converge `key` from `current` onto `desired`, returning the set the
    /// record holds afterwards.
    ///
    /// Endpoints the record type cannot serve are dropped from `desired`.
    ///
    /// # Errors
    ///
    /// Returns `Consistency` when the retry window is exhausted, or the DNS
    /// error when the provider rejects a request outright
    pub async fn converge(
        &self,
        key: &RecordKey,
        current: &EndpointSet,
        desired: &EndpointSet,
    ) -> Result<EndpointSet, BindingError> {
        let desired: EndpointSet = desired
            .iter()
            .filter(|endpoint| {
                let ok = key.record_type.accepts(endpoint);
                if !ok {
                    tracing::warn!(record = %key, endpoint = %endpoint, "endpoint not servable by record type");
                }
                ok
            })
            .copied()
            .collect();

        let mut current = current.clone();
        let mut round = 0;
        loop {
            round += 1;
            let delta = Delta::between(&current, &desired);
            if delta.is_empty() {
                return Ok(current);
            }

            let err = match self.apply(key, &delta, &mut current).await {
                Ok(()) => {
                    tracing::debug!(
                        record = %key,
                        added = delta.add.len(),
                        removed = delta.remove.len(),
                        "record converged"
                    );
                    return Ok(current);
                }
                Err(err) => err,
            };

            if !err.is_retryable() {
                return Err(err.into());
            }
            if !self.retry.should_retry(round) {
                return Err(BindingError::Consistency {
                    record: key.clone(),
                    reason: err.to_string(),
                });
            }

            let delay = self.retry.backoff_for(round);
            tracing::warn!(
                record = %key,
                round,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "record update failed, re-reading"
            );
            tokio::time::sleep(delay).await;

            match self.dns.read_record(key).await {
                Ok(observed) => current = observed,
                Err(read_err) if read_err.is_retryable() => {
                    tracing::debug!(record = %key, error = %read_err, "re-read failed, keeping last known set");
                }
                Err(read_err) => return Err(read_err.into()),
            }
        }
    }

    async fn apply(
        &self,
        key: &RecordKey,
        delta: &Delta,
        current: &mut EndpointSet,
    ) -> Result<(), DnsError> {
        for endpoint in &delta.add {
            self.dns.add_endpoint(key, endpoint).await?;
            current.insert(*endpoint);
        }
        for endpoint in &delta.remove {
            match self.dns.remove_endpoint(key, endpoint).await {
                Ok(()) | Err(DnsError::NotFound(_)) => {
                    current.remove(endpoint);
                }
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }

    /// Run an idempotent record call, retrying transient and ambiguous
    /// failures
    ///
    /// # Errors
    ///
    /// Returns the last error once the retry window is exhausted
    pub async fn with_retry<T, F, Fut>(
        &self,
        key: &RecordKey,
        operation: &'static str,
        mut call: F,
    ) -> Result<T, DnsError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, DnsError>>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match call().await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_retryable() && self.retry.should_retry(attempt) => {
                    tracing::warn!(record = %key, operation, attempt, error = %err, "retrying DNS call");
                    tokio::time::sleep(self.retry.backoff_for(attempt)).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Create the record if absent
    ///
    /// # Errors
    ///
    /// Returns the DNS error once retries are exhausted
    pub async fn upsert(&self, key: &RecordKey, ttl: u32) -> Result<(), DnsError> {
        let dns = self.dns.as_ref();
        self.with_retry(key, "upsert", move || dns.upsert_record(key, ttl)).await
    }

    /// Read the authoritative endpoint set
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the record does not exist
    pub async fn read(&self, key: &RecordKey) -> Result<EndpointSet, DnsError> {
        let dns = self.dns.as_ref();
        self.with_retry(key, "read", move || dns.read_record(key)).await
    }

    /// Delete the record; a missing record counts as deleted
    ///
    /// # Errors
    ///
    /// Returns the DNS error once retries are exhausted
    pub async fn delete(&self, key: &RecordKey) -> Result<(), DnsError> {
        let dns = self.dns.as_ref();
        match self.with_retry(key, "delete", move || dns.delete_record(key)).await {
            Ok(()) | Err(DnsError::NotFound(_)) => Ok(()),
            Err(err) => Err(err),
        }
    }
}

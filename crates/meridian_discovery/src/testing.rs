//! In-memory DNS and endpoint source used by this crate's tests.

use crate::dns::{DnsError, DnsRecordApi, RecordKey};
use crate::source::{EndpointChange, EndpointSource};
use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use meridian_core::{Endpoint, EndpointSet, RetryPolicy, TaskId};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::watch;

pub(crate) fn ep(last: u8) -> Endpoint {
    Endpoint::tcp(IpAddr::V4(Ipv4Addr::new(10, 0, 0, last)), 80)
}

pub(crate) fn fast_retry() -> RetryPolicy {
    RetryPolicy::new(3).with_initial_backoff(Duration::from_millis(1))
}

struct Fault {
    op: &'static str,
    error: DnsError,
    applied: bool,
}

#[derive(Default)]
pub(crate) struct MemoryDns {
    records: Mutex<BTreeMap<RecordKey, EndpointSet>>,
    sizes: Mutex<HashMap<RecordKey, Vec<usize>>>,
    log: Mutex<Vec<String>>,
    faults: Mutex<VecDeque<Fault>>,
}

impl MemoryDns {
    pub(crate) fn fail_next(&self, op: &'static str, error: DnsError, applied: bool) {
        self.faults.lock().unwrap().push_back(Fault { op, error, applied });
    }

    pub(crate) fn record(&self, key: &RecordKey) -> Option<EndpointSet> {
        self.records.lock().unwrap().get(key).cloned()
    }

    pub(crate) fn log(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }

    /// Smallest size the record had after it first became non-empty
    pub(crate) fn min_live_size(&self, key: &RecordKey) -> usize {
        let sizes = self.sizes.lock().unwrap();
        sizes
            .get(key)
            .map(|s| s.iter().skip_while(|n| **n == 0).copied().min().unwrap_or(0))
            .unwrap_or(0)
    }

    fn fault(&self, op: &'static str) -> Option<Fault> {
        let mut faults = self.faults.lock().unwrap();
        if faults.front().is_some_and(|f| f.op == op) {
            faults.pop_front()
        } else {
            None
        }
    }

    fn mutate(
        &self,
        op: &'static str,
        entry: String,
        key: &RecordKey,
        change: impl FnOnce(&mut EndpointSet),
    ) -> Result<(), DnsError> {
        self.log.lock().unwrap().push(entry);
        let fault = match self.fault(op) {
            Some(fault) if !fault.applied => return Err(fault.error),
            fault => fault,
        };
        {
            let mut records = self.records.lock().unwrap();
            let record = records
                .get_mut(key)
                .ok_or_else(|| DnsError::NotFound(key.to_string()))?;
            change(record);
            self.sizes.lock().unwrap().entry(key.clone()).or_default().push(record.len());
        }
        match fault {
            Some(fault) => Err(fault.error),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl DnsRecordApi for MemoryDns {
    async fn upsert_record(&self, key: &RecordKey, _ttl: u32) -> Result<(), DnsError> {
        self.log.lock().unwrap().push("upsert".to_string());
        self.records.lock().unwrap().entry(key.clone()).or_default();
        Ok(())
    }

    async fn add_endpoint(&self, key: &RecordKey, endpoint: &Endpoint) -> Result<(), DnsError> {
        self.mutate("add", format!("add {}", endpoint), key, |r| {
            r.insert(*endpoint);
        })
    }

    async fn remove_endpoint(&self, key: &RecordKey, endpoint: &Endpoint) -> Result<(), DnsError> {
        self.mutate("remove", format!("remove {}", endpoint), key, |r| {
            r.remove(endpoint);
        })
    }

    async fn read_record(&self, key: &RecordKey) -> Result<EndpointSet, DnsError> {
        self.log.lock().unwrap().push("read".to_string());
        self.record(key).ok_or_else(|| DnsError::NotFound(key.to_string()))
    }

    async fn delete_record(&self, key: &RecordKey) -> Result<(), DnsError> {
        self.log.lock().unwrap().push("delete".to_string());
        match self.records.lock().unwrap().remove(key) {
            Some(_) => Ok(()),
            None => Err(DnsError::NotFound(key.to_string())),
        }
    }
}

/// Endpoint source backed by one watch channel per task
#[derive(Default)]
pub(crate) struct ChannelSource {
    channels: Mutex<HashMap<TaskId, watch::Sender<EndpointSet>>>,
}

impl ChannelSource {
    pub(crate) fn publish(&self, task: &TaskId, endpoints: EndpointSet) {
        let mut channels = self.channels.lock().unwrap();
        let sender = channels
            .entry(task.clone())
            .or_insert_with(|| watch::channel(EndpointSet::new()).0);
        sender.send_replace(endpoints);
    }

    /// End every open stream of `task`
    pub(crate) fn close(&self, task: &TaskId) {
        self.channels.lock().unwrap().remove(task);
    }
}

impl EndpointSource for ChannelSource {
    fn subscribe(&self, task: &TaskId) -> BoxStream<'static, EndpointChange> {
        let rx = {
            let mut channels = self.channels.lock().unwrap();
            channels
                .entry(task.clone())
                .or_insert_with(|| watch::channel(EndpointSet::new()).0)
                .subscribe()
        };
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

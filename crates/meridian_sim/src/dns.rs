//! In-memory DNS record API.

use async_trait::async_trait;
use meridian_core::{Endpoint, EndpointSet};
use meridian_discovery::{DnsError, DnsRecordApi, RecordKey};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// DNS operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DnsOp {
    /// `upsert_record`
    Upsert,
    /// `add_endpoint`
    Add,
    /// `remove_endpoint`
    Remove,
    /// `read_record`
    Read,
    /// `delete_record`
    Delete,
}

/// One call seen by [`SimDns`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsCall {
    /// Operation
    pub op: DnsOp,
    /// Record addressed
    pub key: RecordKey,
    /// Endpoint added or removed
    pub endpoint: Option<Endpoint>,
}

impl fmt::Display for DnsCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} {}", self.op, self.key)?;
        if let Some(endpoint) = &self.endpoint {
            write!(f, " {}", endpoint)?;
        }
        Ok(())
    }
}

/// Serializable copy of every record
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimDnsSnapshot {
    /// Records and their endpoints
    pub records: Vec<(RecordKey, SimRecord)>,
}

/// A stored record
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimRecord {
    /// Record TTL in seconds
    pub ttl: u32,
    /// Registered endpoints
    pub endpoints: EndpointSet,
}

struct Fault {
    op: DnsOp,
    error: DnsError,
    applied: bool,
}

#[derive(Default)]
struct State {
    records: BTreeMap<RecordKey, SimRecord>,
    sizes: HashMap<RecordKey, Vec<usize>>,
    calls: Vec<DnsCall>,
    faults: VecDeque<Fault>,
}

/// DNS service kept in memory.
///
/// Faults queued with [`SimDns::fail_next`] fire on the next call of their
/// operation. An `applied` fault lets the change land before reporting the
/// error, which is how an ambiguous response looks from outside.
#[derive(Default)]
pub struct SimDns {
    state: Mutex<State>,
}

impl SimDns {
    /// Create an empty DNS service
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Restore records from a snapshot
    #[must_use]
    pub fn from_snapshot(snapshot: SimDnsSnapshot) -> Self {
        let dns = Self::default();
        dns.state().records = snapshot.records.into_iter().collect();
        dns
    }

    /// Copy of every record
    #[must_use]
    pub fn snapshot(&self) -> SimDnsSnapshot {
        SimDnsSnapshot {
            records: self
                .state()
                .records
                .iter()
                .map(|(key, record)| (key.clone(), record.clone()))
                .collect(),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Fail the next call of `op` with `error`
    pub fn fail_next(&self, op: DnsOp, error: DnsError, applied: bool) {
        self.state().faults.push_back(Fault { op, error, applied });
    }

    /// Endpoints of `key`, if the record exists
    #[must_use]
    pub fn record(&self, key: &RecordKey) -> Option<EndpointSet> {
        self.state().records.get(key).map(|r| r.endpoints.clone())
    }

    /// TTL of `key`, if the record exists
    #[must_use]
    pub fn ttl(&self, key: &RecordKey) -> Option<u32> {
        self.state().records.get(key).map(|r| r.ttl)
    }

    /// Every record key
    #[must_use]
    pub fn keys(&self) -> Vec<RecordKey> {
        self.state().records.keys().cloned().collect()
    }

    /// Every call, in order
    #[must_use]
    pub fn calls(&self) -> Vec<DnsCall> {
        self.state().calls.clone()
    }

    /// Record sizes after each endpoint change of `key`
    #[must_use]
    pub fn sizes(&self, key: &RecordKey) -> Vec<usize> {
        self.state().sizes.get(key).cloned().unwrap_or_default()
    }

    fn call(state: &mut State, op: DnsOp, key: &RecordKey, endpoint: Option<Endpoint>) -> Option<Fault> {
        state.calls.push(DnsCall {
            op,
            key: key.clone(),
            endpoint,
        });
        let index = state.faults.iter().position(|f| f.op == op)?;
        state.faults.remove(index)
    }

    fn mutate(
        &self,
        op: DnsOp,
        key: &RecordKey,
        endpoint: &Endpoint,
        change: impl FnOnce(&mut EndpointSet, &Endpoint),
    ) -> Result<(), DnsError> {
        let mut state = self.state();
        let fault = match Self::call(&mut state, op, key, Some(*endpoint)) {
            Some(fault) if !fault.applied => return Err(fault.error),
            fault => fault,
        };
        let record = state
            .records
            .get_mut(key)
            .ok_or_else(|| DnsError::NotFound(key.to_string()))?;
        change(&mut record.endpoints, endpoint);
        let size = record.endpoints.len();
        state.sizes.entry(key.clone()).or_default().push(size);
        match fault {
            Some(fault) => Err(fault.error),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl DnsRecordApi for SimDns {
    async fn upsert_record(&self, key: &RecordKey, ttl: u32) -> Result<(), DnsError> {
        let mut state = self.state();
        let fault = match Self::call(&mut state, DnsOp::Upsert, key, None) {
            Some(fault) if !fault.applied => return Err(fault.error),
            fault => fault,
        };
        state.records.entry(key.clone()).or_default().ttl = ttl;
        match fault {
            Some(fault) => Err(fault.error),
            None => Ok(()),
        }
    }

    async fn add_endpoint(&self, key: &RecordKey, endpoint: &Endpoint) -> Result<(), DnsError> {
        self.mutate(DnsOp::Add, key, endpoint, |set, ep| {
            set.insert(*ep);
        })
    }

    async fn remove_endpoint(&self, key: &RecordKey, endpoint: &Endpoint) -> Result<(), DnsError> {
        self.mutate(DnsOp::Remove, key, endpoint, |set, ep| {
            set.remove(ep);
        })
    }

    async fn read_record(&self, key: &RecordKey) -> Result<EndpointSet, DnsError> {
        let mut state = self.state();
        if let Some(fault) = Self::call(&mut state, DnsOp::Read, key, None) {
            return Err(fault.error);
        }
        state
            .records
            .get(key)
            .map(|r| r.endpoints.clone())
            .ok_or_else(|| DnsError::NotFound(key.to_string()))
    }

    async fn delete_record(&self, key: &RecordKey) -> Result<(), DnsError> {
        let mut state = self.state();
        if let Some(fault) = Self::call(&mut state, DnsOp::Delete, key, None) {
            return Err(fault.error);
        }
        match state.records.remove(key) {
            Some(_) => Ok(()),
            None => Err(DnsError::NotFound(key.to_string())),
        }
    }
}

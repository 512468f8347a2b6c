//! DNS record seam.
//!
//! Records are addressed by [`RecordKey`]. Every operation is idempotent at
//! the set level: adding a present endpoint or removing an absent one is
//! not an error.

use async_trait::async_trait;
use meridian_core::{Endpoint, EndpointSet};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Record type served for a registration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum RecordType {
    /// IPv4 address records
    #[serde(rename = "A")]
    A,
    /// IPv6 address records
    #[serde(rename = "AAAA")]
    Aaaa,
    /// Service records with ports
    #[serde(rename = "SRV")]
    Srv,
}

impl RecordType {
    /// Parse the declared form ("A", "AAAA", "SRV")
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "A" => Some(Self::A),
            "AAAA" => Some(Self::Aaaa),
            "SRV" => Some(Self::Srv),
            _ => None,
        }
    }

    /// Whether an endpoint can be served by this record type
    #[must_use]
    pub fn accepts(&self, endpoint: &Endpoint) -> bool {
        match self {
            Self::A => endpoint.address.is_ipv4(),
            Self::Aaaa => endpoint.address.is_ipv6(),
            Self::Srv => true,
        }
    }
}

impl fmt::Display for RecordType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::A => f.write_str("A"),
            Self::Aaaa => f.write_str("AAAA"),
            Self::Srv => f.write_str("SRV"),
        }
    }
}

/// Address of a DNS record
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RecordKey {
    /// Private namespace the record lives in
    pub namespace: String,
    /// Record name within the namespace
    pub name: String,
    /// Record type
    pub record_type: RecordType,
}

impl RecordKey {
    /// Create a key
    #[must_use]
    pub fn new(namespace: impl Into<String>, name: impl Into<String>, record_type: RecordType) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
            record_type,
        }
    }

    /// Fully qualified name
    #[must_use]
    pub fn fqdn(&self) -> String {
        format!("{}.{}", self.name, self.namespace)
    }
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{} {}", self.name, self.namespace, self.record_type)
    }
}

/// DNS API error
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DnsError {
    /// Failed without effect; safe to retry
    #[error("DNS transient error: {0}")]
    Transient(String),

    /// Outcome unknown; the change may or may not have applied
    #[error("DNS outcome unknown: {0}")]
    Ambiguous(String),

    /// Rejected; retrying cannot help
    #[error("DNS rejected request: {0}")]
    Permanent(String),

    /// Record does not exist
    #[error("DNS record not found: {0}")]
    NotFound(String),
}

impl DnsError {
    /// Whether authoritative state must be re-read before deciding again
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_) | Self::Ambiguous(_))
    }
}

/// DNS provider operations
#[async_trait]
pub trait DnsRecordApi: Send + Sync {
    /// Create the record if absent
    async fn upsert_record(&self, key: &RecordKey, ttl: u32) -> Result<(), DnsError>;

    /// Add one endpoint to the record
    async fn add_endpoint(&self, key: &RecordKey, endpoint: &Endpoint) -> Result<(), DnsError>;

    /// Remove one endpoint from the record
    async fn remove_endpoint(&self, key: &RecordKey, endpoint: &Endpoint) -> Result<(), DnsError>;

    /// Authoritative endpoint set of the record
    async fn read_record(&self, key: &RecordKey) -> Result<EndpointSet, DnsError>;

    /// Delete the record
    async fn delete_record(&self, key: &RecordKey) -> Result<(), DnsError>;
}

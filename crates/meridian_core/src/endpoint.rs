//! Network endpoints of running compute tasks.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::net::IpAddr;

/// Transport protocol of an endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    /// TCP
    Tcp,
    /// UDP
    Udp,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp => f.write_str("tcp"),
            Self::Udp => f.write_str("udp"),
        }
    }
}

/// One network-reachable instance of a compute task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Endpoint {
    /// Instance address
    pub address: IpAddr,
    /// Instance port
    pub port: u16,
    /// Transport protocol
    pub protocol: Protocol,
}

impl Endpoint {
    /// Create a TCP endpoint
    #[must_use]
    pub const fn tcp(address: IpAddr, port: u16) -> Self {
        Self {
            address,
            port,
            protocol: Protocol::Tcp,
        }
    }

    /// Create a UDP endpoint
    #[must_use]
    pub const fn udp(address: IpAddr, port: u16) -> Self {
        Self {
            address,
            port,
            protocol: Protocol::Udp,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.address {
            IpAddr::V4(addr) => write!(f, "{}:{}/{}", addr, self.port, self.protocol),
            IpAddr::V6(addr) => write!(f, "[{}]:{}/{}", addr, self.port, self.protocol),
        }
    }
}

/// Ordered set of endpoints
pub type EndpointSet = BTreeSet<Endpoint>;

//! Peer identity types

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

// ----------------------------------------------------------------------------
// Connection Id
// ----------------------------------------------------------------------------

/// Process-unique handle for one connection instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConnectionId(u64);

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

impl ConnectionId {
    /// Allocate a fresh id
    pub fn next() -> Self {
        Self(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

// ----------------------------------------------------------------------------
// Transport Address
// ----------------------------------------------------------------------------

/// Transport-level address of a peer, stable for the connection's lifetime
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum TransportAddress {
    /// Stream socket address
    Socket(SocketAddr),
    /// Platform identifier of a BLE peripheral or central
    Ble(String),
}

impl fmt::Display for TransportAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportAddress::Socket(addr) => write!(f, "tcp://{}", addr),
            TransportAddress::Ble(id) => write!(f, "ble://{}", id),
        }
    }
}

impl From<SocketAddr> for TransportAddress {
    fn from(addr: SocketAddr) -> Self {
        TransportAddress::Socket(addr)
    }
}

// ----------------------------------------------------------------------------
// Peer Identity
// ----------------------------------------------------------------------------

/// Who is on the other end of a connection
///
/// `logical_name` stays empty until the identification handshake completes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerIdentity {
    pub logical_name: String,
    pub transport_address: TransportAddress,
}

impl PeerIdentity {
    /// Identity of a freshly accepted, not yet identified peer
    pub fn unnamed(transport_address: TransportAddress) -> Self {
        Self {
            logical_name: String::new(),
            transport_address,
        }
    }

    pub fn named<T: Into<String>>(logical_name: T, transport_address: TransportAddress) -> Self {
        Self {
            logical_name: logical_name.into(),
            transport_address,
        }
    }

    pub fn is_identified(&self) -> bool {
        !self.logical_name.is_empty()
    }

    /// Logical name if known, otherwise the full display form
    pub fn label(&self) -> String {
        if self.is_identified() {
            self.logical_name.clone()
        } else {
            self.to_string()
        }
    }
}

impl fmt::Display for PeerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_identified() {
            write!(f, "{}@{}", self.logical_name, self.transport_address)
        } else {
            write!(f, "<unnamed>@{}", self.transport_address)
        }
    }
}

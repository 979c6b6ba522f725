//! Observer events emitted by connections and servers
//!
//! Observers are plain unbounded channels handed in at construction time, so
//! no callback runs on a transport task and no global notification state exists.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::envelope::Envelope;
use crate::errors::{PeerwireError, Result};
use crate::types::{ConnectionId, PeerIdentity};

// ----------------------------------------------------------------------------
// Connection Events
// ----------------------------------------------------------------------------

/// Lifecycle and traffic events of a single connection
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    /// The link reached `ready`
    Ready { id: ConnectionId },
    /// A send completed on the wire
    Sent { id: ConnectionId, bytes: usize },
    /// One complete envelope arrived
    Received { id: ConnectionId, envelope: Envelope },
    /// The connection stopped; fired exactly once per connection
    Stopped {
        id: ConnectionId,
        error: Option<Arc<PeerwireError>>,
    },
}

impl ConnectionEvent {
    pub fn connection_id(&self) -> ConnectionId {
        match self {
            ConnectionEvent::Ready { id }
            | ConnectionEvent::Sent { id, .. }
            | ConnectionEvent::Received { id, .. }
            | ConnectionEvent::Stopped { id, .. } => *id,
        }
    }
}

pub type ConnectionEventSender = mpsc::UnboundedSender<ConnectionEvent>;
pub type ConnectionEventReceiver = mpsc::UnboundedReceiver<ConnectionEvent>;

pub fn connection_event_channel() -> (ConnectionEventSender, ConnectionEventReceiver) {
    mpsc::unbounded_channel()
}

// ----------------------------------------------------------------------------
// Server Events
// ----------------------------------------------------------------------------

/// Peer-table level events of a server or manager
#[derive(Debug, Clone)]
pub enum ServerEvent {
    /// Listening/advertising endpoint is up
    Ready { endpoint: String },
    /// A physical link was accepted and registered unnamed
    Accepted { id: ConnectionId, identity: PeerIdentity },
    /// A peer completed the identification handshake
    Identified { id: ConnectionId, identity: PeerIdentity },
    /// An envelope arrived from a peer
    Received {
        id: ConnectionId,
        from: PeerIdentity,
        envelope: Envelope,
    },
    /// A send to a peer completed
    Sent {
        id: ConnectionId,
        to: PeerIdentity,
        bytes: usize,
    },
    /// A peer left the table
    Disconnected {
        id: ConnectionId,
        identity: PeerIdentity,
        error: Option<Arc<PeerwireError>>,
    },
    /// The endpoint closed
    Stopped { error: Option<Arc<PeerwireError>> },
}

pub type ServerEventSender = mpsc::UnboundedSender<ServerEvent>;
pub type ServerEventReceiver = mpsc::UnboundedReceiver<ServerEvent>;

pub fn server_event_channel() -> (ServerEventSender, ServerEventReceiver) {
    mpsc::unbounded_channel()
}

// ----------------------------------------------------------------------------
// Send Outcomes
// ----------------------------------------------------------------------------

/// Result of one send to one peer
#[derive(Debug)]
pub struct SendOutcome {
    /// Name the caller asked for, or the peer's name on broadcast
    pub target: String,
    pub id: Option<ConnectionId>,
    pub result: Result<usize>,
}

impl SendOutcome {
    pub fn is_ok(&self) -> bool {
        self.result.is_ok()
    }
}

/// Outcomes of a fan-out send; one peer's failure never aborts the others
#[derive(Debug, Default)]
pub struct SendReport {
    pub outcomes: Vec<SendOutcome>,
}

impl SendReport {
    pub fn push(&mut self, outcome: SendOutcome) {
        self.outcomes.push(outcome);
    }

    pub fn delivered(&self) -> usize {
        self.outcomes.iter().filter(|o| o.is_ok()).count()
    }

    pub fn failed(&self) -> impl Iterator<Item = &SendOutcome> {
        self.outcomes.iter().filter(|o| !o.is_ok())
    }

    pub fn all_ok(&self) -> bool {
        self.outcomes.iter().all(SendOutcome::is_ok)
    }

    pub fn is_empty(&self) -> bool {
        self.outcomes.is_empty()
    }
}

// ----------------------------------------------------------------------------
// Connection Statistics
// ----------------------------------------------------------------------------

/// Traffic counters shared between a connection's tasks
#[derive(Debug, Default)]
pub struct StatsCounter {
    messages_sent: AtomicU64,
    bytes_sent: AtomicU64,
    messages_received: AtomicU64,
    bytes_received: AtomicU64,
}

impl StatsCounter {
    pub fn record_sent(&self, bytes: usize) {
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_received(&self, bytes: usize) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ConnectionStats {
        ConnectionStats {
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of a connection's counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnectionStats {
    pub messages_sent: u64,
    pub bytes_sent: u64,
    pub messages_received: u64,
    pub bytes_received: u64,
}

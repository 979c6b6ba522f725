//! BLE peer state

use std::fmt;
use std::sync::Arc;

use peerwire_core::events::StatsCounter;
use peerwire_core::{ConnectionId, ConnectionState, ConnectionStats, TransportAddress};
use tokio::sync::watch;

use crate::link::BleLink;

// ----------------------------------------------------------------------------
// Peer State Management
// ----------------------------------------------------------------------------

/// A link registered with the manager
pub struct BlePeer {
    id: ConnectionId,
    address: String,
    link: Arc<dyn BleLink>,
    state: watch::Sender<ConnectionState>,
    stats: StatsCounter,
}

impl BlePeer {
    pub(crate) fn new(link: Arc<dyn BleLink>) -> Self {
        let (state, _) = watch::channel(ConnectionState::Inited);
        Self {
            id: ConnectionId::next(),
            address: link.address(),
            link,
            state,
            stats: StatsCounter::default(),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn transport_address(&self) -> TransportAddress {
        TransportAddress::Ble(self.address.clone())
    }

    pub fn link(&self) -> &Arc<dyn BleLink> {
        &self.link
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn is_ready(&self) -> bool {
        self.state().is_ready()
    }

    pub fn stats(&self) -> ConnectionStats {
        self.stats.snapshot()
    }

    pub(crate) fn record_sent(&self, bytes: usize) {
        self.stats.record_sent(bytes);
    }

    pub(crate) fn record_received(&self, bytes: usize) {
        self.stats.record_received(bytes);
    }

    /// Mark the peer ready once it is in the table
    pub(crate) fn mark_ready(&self) -> bool {
        self.state.send_if_modified(|s| {
            if s.can_transition_to(ConnectionState::Ready) {
                *s = ConnectionState::Ready;
                true
            } else {
                false
            }
        })
    }

    /// Enter a terminal state; true only for the call that did it
    pub(crate) fn finish(&self, next: ConnectionState) -> bool {
        self.state.send_if_modified(|s| {
            if s.is_terminal() {
                false
            } else {
                *s = next;
                true
            }
        })
    }
}

impl fmt::Debug for BlePeer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlePeer")
            .field("id", &self.id)
            .field("address", &self.address)
            .field("state", &self.state())
            .finish()
    }
}

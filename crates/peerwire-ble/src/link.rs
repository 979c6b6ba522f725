//! Transport boundary between the manager and a physical BLE link
//!
//! A link writes raw chunks outward. Inbound chunks and disconnects are not
//! pulled from the link; whoever owns the radio pushes them as [`LinkEvent`]s
//! into the manager's link channel.

use std::fmt;

use async_trait::async_trait;
use peerwire_core::Result;
use tokio::sync::mpsc;

/// One connected BLE peer as seen by the manager
#[async_trait]
pub trait BleLink: Send + Sync + fmt::Debug {
    /// Stable address of the remote device for the link's lifetime
    fn address(&self) -> String;

    /// Largest single write the remote accepts; 0 if unknown
    fn max_write_len(&self) -> usize;

    /// Resolve when the radio stack can take another write.
    ///
    /// Fails once the link is gone, so a waiting transfer never hangs on a
    /// dead peer.
    async fn ready_for_write(&self) -> Result<()>;

    /// Write one chunk; resolves after the stack accepted it
    async fn write(&self, chunk: &[u8]) -> Result<()>;

    /// Release the physical link
    async fn disconnect(&self) -> Result<()>;
}

/// Inbound activity reported by link owners
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// A raw chunk arrived from the device at `from`
    Chunk { from: String, data: Vec<u8> },
    /// The device at `from` dropped the link
    Disconnected {
        from: String,
        reason: Option<String>,
    },
}

impl LinkEvent {
    pub fn source(&self) -> &str {
        match self {
            LinkEvent::Chunk { from, .. } | LinkEvent::Disconnected { from, .. } => from,
        }
    }
}

pub type LinkEventSender = mpsc::UnboundedSender<LinkEvent>;
pub type LinkEventReceiver = mpsc::UnboundedReceiver<LinkEvent>;

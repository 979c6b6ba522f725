//! In-memory BLE link pair
//!
//! Each end writes straight into the other manager's link channel. Write
//! readiness is a credit count: every write consumes one credit, and in the
//! default mode delivering the chunk hands the credit back. Manual mode
//! leaves granting to the caller, which lets tests hold a transfer mid-flight.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use peerwire_core::{PeerwireError, Result, TransportError};
use tokio::sync::Semaphore;
use tracing::debug;

use crate::link::{BleLink, LinkEvent, LinkEventSender};

/// How a loopback link replenishes write credits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreditMode {
    /// One credit is returned as each chunk is delivered
    Automatic,
    /// Credits only arrive through [`LoopbackLink::grant`]
    Manual,
}

/// One side of a loopback pair
#[derive(Debug, Clone)]
pub struct LoopbackEnd {
    /// Address this side is known by to its peer
    pub address: String,
    /// Link channel of this side's manager
    pub events: LinkEventSender,
}

impl LoopbackEnd {
    pub fn new(address: impl Into<String>, events: LinkEventSender) -> Self {
        Self {
            address: address.into(),
            events,
        }
    }
}

#[derive(Debug)]
struct Shared {
    closed: AtomicBool,
    /// Credit pools of both ends, closed together on sever
    credits: [Arc<Semaphore>; 2],
}

/// The near end of a loopback pair, addressed as the far side
#[derive(Debug)]
pub struct LoopbackLink {
    local: LoopbackEnd,
    remote: LoopbackEnd,
    max_write_len: usize,
    credits: Arc<Semaphore>,
    mode: CreditMode,
    written: Mutex<Vec<Vec<u8>>>,
    shared: Arc<Shared>,
}

/// Create both ends of a link between `a` and `b`
pub fn pair(
    a: LoopbackEnd,
    b: LoopbackEnd,
    max_write_len: usize,
    mode: CreditMode,
) -> (Arc<LoopbackLink>, Arc<LoopbackLink>) {
    let initial = match mode {
        CreditMode::Automatic => 1,
        CreditMode::Manual => 0,
    };
    let shared = Arc::new(Shared {
        closed: AtomicBool::new(false),
        credits: [
            Arc::new(Semaphore::new(initial)),
            Arc::new(Semaphore::new(initial)),
        ],
    });
    let make = |local: &LoopbackEnd, remote: &LoopbackEnd, side: usize| {
        Arc::new(LoopbackLink {
            local: local.clone(),
            remote: remote.clone(),
            max_write_len,
            credits: shared.credits[side].clone(),
            mode,
            written: Mutex::new(Vec::new()),
            shared: shared.clone(),
        })
    };
    (make(&a, &b, 0), make(&b, &a, 1))
}

impl LoopbackLink {
    /// Add `n` write credits
    pub fn grant(&self, n: usize) {
        self.credits.add_permits(n);
    }

    /// Every chunk written through this end, in order
    pub fn written(&self) -> Vec<Vec<u8>> {
        self.written
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    /// Drop the link as if the radio lost it; both managers are told
    pub fn sever(&self, reason: &str) {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        for credits in &self.shared.credits {
            credits.close();
        }
        let _ = self.local.events.send(LinkEvent::Disconnected {
            from: self.remote.address.clone(),
            reason: Some(reason.to_string()),
        });
        let _ = self.remote.events.send(LinkEvent::Disconnected {
            from: self.local.address.clone(),
            reason: Some(reason.to_string()),
        });
        debug!("Loopback {} <-> {} severed", self.local.address, self.remote.address);
    }

    fn closed_error() -> PeerwireError {
        PeerwireError::Transport(TransportError::ConnectionClosed)
    }
}

#[async_trait]
impl BleLink for LoopbackLink {
    fn address(&self) -> String {
        self.remote.address.clone()
    }

    fn max_write_len(&self) -> usize {
        self.max_write_len
    }

    async fn ready_for_write(&self) -> Result<()> {
        if self.is_closed() {
            return Err(Self::closed_error());
        }
        let permit = self
            .credits
            .acquire()
            .await
            .map_err(|_| Self::closed_error())?;
        permit.forget();
        Ok(())
    }

    async fn write(&self, chunk: &[u8]) -> Result<()> {
        if self.is_closed() {
            return Err(Self::closed_error());
        }
        self.written
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(chunk.to_vec());
        self.remote
            .events
            .send(LinkEvent::Chunk {
                from: self.local.address.clone(),
                data: chunk.to_vec(),
            })
            .map_err(|_| PeerwireError::write_failed("remote manager is gone"))?;
        if self.mode == CreditMode::Automatic {
            self.credits.add_permits(1);
        }
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.sever("disconnected locally");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn writes_arrive_at_the_far_manager() {
        let (a_tx, _a_rx) = mpsc::unbounded_channel();
        let (b_tx, mut b_rx) = mpsc::unbounded_channel();
        let (a_to_b, _b_to_a) = pair(
            LoopbackEnd::new("aa", a_tx),
            LoopbackEnd::new("bb", b_tx),
            20,
            CreditMode::Automatic,
        );
        assert_eq!(a_to_b.address(), "bb");

        a_to_b.ready_for_write().await.unwrap();
        a_to_b.write(b"hi").await.unwrap();
        a_to_b.ready_for_write().await.unwrap();

        assert_eq!(
            b_rx.recv().await.unwrap(),
            LinkEvent::Chunk {
                from: "aa".into(),
                data: b"hi".to_vec()
            }
        );
        assert_eq!(a_to_b.written(), vec![b"hi".to_vec()]);
    }

    #[tokio::test]
    async fn manual_credits_gate_readiness() {
        let (a_tx, _a_rx) = mpsc::unbounded_channel();
        let (b_tx, _b_rx) = mpsc::unbounded_channel();
        let (link, _) = pair(
            LoopbackEnd::new("aa", a_tx),
            LoopbackEnd::new("bb", b_tx),
            20,
            CreditMode::Manual,
        );

        let pending = tokio::time::timeout(
            std::time::Duration::from_millis(20),
            link.ready_for_write(),
        )
        .await;
        assert!(pending.is_err());

        link.grant(1);
        link.ready_for_write().await.unwrap();
    }

    #[tokio::test]
    async fn sever_notifies_both_sides_and_fails_waiters() {
        let (a_tx, mut a_rx) = mpsc::unbounded_channel();
        let (b_tx, mut b_rx) = mpsc::unbounded_channel();
        let (a_to_b, b_to_a) = pair(
            LoopbackEnd::new("aa", a_tx),
            LoopbackEnd::new("bb", b_tx),
            20,
            CreditMode::Manual,
        );

        let waiter = {
            let link = a_to_b.clone();
            tokio::spawn(async move { link.ready_for_write().await })
        };
        tokio::task::yield_now().await;
        b_to_a.sever("radio off");

        assert!(waiter.await.unwrap().is_err());
        assert_eq!(a_rx.recv().await.unwrap().source(), "bb");
        assert_eq!(b_rx.recv().await.unwrap().source(), "aa");
        assert!(a_to_b.write(b"x").await.is_err());
    }
}

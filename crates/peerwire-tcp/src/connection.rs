//! One framed TCP link
//!
//! A connection owns both halves of a socket. The read half lives in a
//! dedicated receive task; the write half sits behind an async mutex so sends
//! are serialized without ever blocking inbound delivery.

use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};

use peerwire_core::events::StatsCounter;
use peerwire_core::framing;
use peerwire_core::{
    Codec, ConnectionEvent, ConnectionEventSender, ConnectionId, ConnectionState, ConnectionStats,
    Envelope, PeerwireError, ProtocolError, Result, TransportAddress, TransportError,
};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::sync::{watch, Mutex as AsyncMutex};
use tracing::{debug, info, warn};

use crate::config::TcpConfig;

// ----------------------------------------------------------------------------
// TCP Connection
// ----------------------------------------------------------------------------

/// Cheaply cloneable handle to one TCP connection
#[derive(Clone)]
pub struct TcpConnection {
    inner: Arc<Inner>,
}

struct Inner {
    id: ConnectionId,
    peer_addr: SocketAddr,
    local_addr: SocketAddr,
    state: watch::Sender<ConnectionState>,
    reader: Mutex<Option<OwnedReadHalf>>,
    writer: AsyncMutex<Option<OwnedWriteHalf>>,
    /// Identification sent right after `ready` on client-initiated links
    identify: Option<Envelope>,
    max_frame_len: usize,
    events: ConnectionEventSender,
    stats: StatsCounter,
}

impl TcpConnection {
    /// Open a client connection that identifies as `logical_name` once started
    pub async fn connect<A, C>(
        addr: A,
        logical_name: &str,
        codec: &C,
        config: &TcpConfig,
        events: ConnectionEventSender,
    ) -> Result<Self>
    where
        A: ToSocketAddrs,
        C: Codec,
    {
        let identify = Envelope::identification(codec, logical_name)?;
        let stream = TcpStream::connect(addr)
            .await
            .map_err(TransportError::NetworkIo)?;
        let conn = Self::from_stream(stream, config, events, Some(identify))?;
        info!("{} connected to {} as {:?}", conn.id(), conn.peer_addr(), logical_name);
        Ok(conn)
    }

    /// Wrap an established stream; the connection starts in `inited`
    pub fn from_stream(
        stream: TcpStream,
        config: &TcpConfig,
        events: ConnectionEventSender,
        identify: Option<Envelope>,
    ) -> Result<Self> {
        let peer_addr = stream.peer_addr().map_err(TransportError::NetworkIo)?;
        let local_addr = stream.local_addr().map_err(TransportError::NetworkIo)?;
        if let Err(e) = stream.set_nodelay(config.nodelay) {
            warn!("Failed to set TCP_NODELAY for {}: {}", peer_addr, e);
        }
        let (reader, writer) = stream.into_split();
        let (state, _) = watch::channel(ConnectionState::Inited);

        Ok(Self {
            inner: Arc::new(Inner {
                id: ConnectionId::next(),
                peer_addr,
                local_addr,
                state,
                reader: Mutex::new(Some(reader)),
                writer: AsyncMutex::new(Some(writer)),
                identify,
                max_frame_len: config.max_frame_len(),
                events,
                stats: StatsCounter::default(),
            }),
        })
    }

    pub fn id(&self) -> ConnectionId {
        self.inner.id
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.inner.peer_addr
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    pub fn transport_address(&self) -> TransportAddress {
        TransportAddress::Socket(self.inner.peer_addr)
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    pub fn stats(&self) -> ConnectionStats {
        self.inner.stats.snapshot()
    }

    /// Move to `ready`, send the identification if this is a client link,
    /// and spawn the receive loop
    pub async fn start(&self) -> Result<()> {
        let reader = self
            .inner
            .reader
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(reader) = reader else {
            return Err(PeerwireError::not_ready(self.state()));
        };

        let moved = self.inner.state.send_if_modified(|s| {
            if s.can_transition_to(ConnectionState::Ready) {
                *s = ConnectionState::Ready;
                true
            } else {
                false
            }
        });
        if !moved {
            return Err(PeerwireError::not_ready(self.state()));
        }
        debug!("{} ready ({})", self.inner.id, self.inner.peer_addr);
        let _ = self.inner.events.send(ConnectionEvent::Ready { id: self.inner.id });

        tokio::spawn(read_loop(self.inner.clone(), reader));

        if let Some(identify) = &self.inner.identify {
            self.send(identify).await?;
            debug!("{} sent identification", self.inner.id);
        }
        Ok(())
    }

    /// Resolve once the link is `ready`, or fail if it stops first
    pub async fn wait_ready(&self) -> Result<()> {
        let mut rx = self.inner.state.subscribe();
        let state = *rx
            .wait_for(|s| s.is_ready() || s.is_terminal())
            .await
            .map_err(|_| PeerwireError::channel_error("connection state dropped"))?;
        if state.is_ready() {
            Ok(())
        } else {
            Err(PeerwireError::not_ready(state))
        }
    }

    /// Frame and write one envelope; resolves after the write completes
    pub async fn send(&self, envelope: &Envelope) -> Result<usize> {
        let state = self.state();
        if !state.is_ready() {
            return Err(PeerwireError::not_ready(state));
        }
        let bytes = envelope.to_bytes();
        if bytes.len() > self.inner.max_frame_len {
            return Err(ProtocolError::FrameTooLarge {
                declared: bytes.len(),
                max: self.inner.max_frame_len,
            }
            .into());
        }

        let mut state_rx = self.inner.state.subscribe();
        let mut guard = self.inner.writer.lock().await;
        let Some(writer) = guard.as_mut() else {
            return Err(PeerwireError::not_ready(self.state()));
        };

        let result = tokio::select! {
            _ = state_rx.wait_for(|s| s.is_terminal()) => {
                Err(PeerwireError::shutdown("connection stopped during send"))
            }
            written = framing::write_frame(writer, &bytes, self.inner.max_frame_len) => written,
        };

        match result {
            Ok(len) => {
                if self.state().is_terminal() {
                    guard.take();
                }
                self.inner.stats.record_sent(len);
                let _ = self.inner.events.send(ConnectionEvent::Sent {
                    id: self.inner.id,
                    bytes: len,
                });
                debug!("{} sent {} bytes", self.inner.id, len);
                Ok(len)
            }
            Err(e) => {
                guard.take();
                drop(guard);
                if !self.state().is_terminal() {
                    warn!("{} write failed: {}", self.inner.id, e);
                    self.inner.finish(
                        ConnectionState::Cleanup,
                        Some(PeerwireError::write_failed(e.to_string())),
                    );
                }
                Err(e)
            }
        }
    }

    /// Encode `value` and send it tagged with `type_code`
    pub async fn send_value<C, T>(&self, codec: &C, type_code: u8, value: &T) -> Result<usize>
    where
        C: Codec,
        T: serde::Serialize + ?Sized,
    {
        let envelope = Envelope::from_value(codec, type_code, value).map_err(|e| {
            warn!("{} dropping send, encode failed: {}", self.inner.id, e);
            e
        })?;
        self.send(&envelope).await
    }

    /// Stop the connection; safe to call repeatedly from any task
    pub fn stop(&self) {
        self.inner.finish(ConnectionState::Stopped, None);
    }

    /// Stop the connection, reporting `error` as the cause
    pub fn stop_with_error(&self, error: PeerwireError) {
        self.inner.finish(ConnectionState::Cleanup, Some(error));
    }
}

impl fmt::Debug for TcpConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TcpConnection")
            .field("id", &self.inner.id)
            .field("peer_addr", &self.inner.peer_addr)
            .field("state", &self.state())
            .finish()
    }
}

// ----------------------------------------------------------------------------
// Teardown
// ----------------------------------------------------------------------------

impl Inner {
    /// Enter a terminal state once; later calls are no-ops.
    ///
    /// The stop event fires only from the call that performed the transition.
    fn finish(&self, next: ConnectionState, error: Option<PeerwireError>) -> bool {
        let moved = self.state.send_if_modified(|s| {
            if s.is_terminal() {
                false
            } else {
                *s = next;
                true
            }
        });
        if !moved {
            return false;
        }

        // An in-flight send holds the writer; it drops the half itself once
        // it observes the terminal state.
        if let Ok(mut writer) = self.writer.try_lock() {
            writer.take();
        }
        self.reader
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        match &error {
            Some(e) => warn!("{} stopped ({}): {}", self.id, next, e),
            None => info!("{} stopped", self.id),
        }
        let _ = self.events.send(ConnectionEvent::Stopped {
            id: self.id,
            error: error.map(Arc::new),
        });
        true
    }
}

// ----------------------------------------------------------------------------
// Receive Loop
// ----------------------------------------------------------------------------

async fn read_loop(inner: Arc<Inner>, mut reader: OwnedReadHalf) {
    let mut state_rx = inner.state.subscribe();
    loop {
        let frame = tokio::select! {
            _ = state_rx.wait_for(|s| s.is_terminal()) => break,
            frame = framing::read_frame(&mut reader, inner.max_frame_len) => frame,
        };

        match frame {
            Ok(Some(bytes)) => match Envelope::from_bytes(&bytes) {
                Ok(envelope) => {
                    inner.stats.record_received(bytes.len());
                    debug!(
                        "{} received {} bytes (type {:#04x})",
                        inner.id,
                        bytes.len(),
                        envelope.type_code
                    );
                    let _ = inner.events.send(ConnectionEvent::Received {
                        id: inner.id,
                        envelope,
                    });
                }
                Err(e) => {
                    inner.finish(ConnectionState::Cleanup, Some(e));
                    break;
                }
            },
            Ok(None) => {
                inner.finish(
                    ConnectionState::Cleanup,
                    Some(TransportError::ConnectionClosed.into()),
                );
                break;
            }
            Err(e) => {
                inner.finish(ConnectionState::Cleanup, Some(e));
                break;
            }
        }
    }
    debug!("{} receive loop ended", inner.id);
}

#[cfg(test)]
mod tests {
    use super::*;
    use peerwire_core::events::connection_event_channel;
    use peerwire_core::BincodeCodec;
    use tokio::net::TcpListener;

    async fn pair() -> (TcpConnection, TcpStream, peerwire_core::ConnectionEventReceiver) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = connection_event_channel();
        let config = TcpConfig::loopback();
        let (client, accepted) = tokio::join!(
            TcpConnection::connect(addr, "client", &BincodeCodec, &config, tx),
            listener.accept()
        );
        (client.unwrap(), accepted.unwrap().0, rx)
    }

    #[tokio::test]
    async fn send_before_start_is_not_ready() {
        let (conn, _remote, _rx) = pair().await;
        assert_eq!(conn.state(), ConnectionState::Inited);
        let err = conn.send(&Envelope::new(1, vec![1]).unwrap()).await.unwrap_err();
        assert!(matches!(
            err,
            PeerwireError::NotReady { state: ConnectionState::Inited }
        ));
    }

    #[tokio::test]
    async fn stop_twice_fires_once() {
        let (conn, _remote, mut rx) = pair().await;
        conn.start().await.unwrap();
        conn.stop();
        conn.stop();
        conn.stop_with_error(PeerwireError::shutdown("late"));
        assert_eq!(conn.state(), ConnectionState::Stopped);

        let mut stops = 0;
        while let Ok(ev) = rx.try_recv() {
            if matches!(ev, ConnectionEvent::Stopped { .. }) {
                stops += 1;
            }
        }
        assert_eq!(stops, 1);
    }

    #[tokio::test]
    async fn start_after_stop_fails() {
        let (conn, _remote, _rx) = pair().await;
        conn.stop();
        assert!(conn.start().await.is_err());
        assert!(conn.wait_ready().await.is_err());
    }
}

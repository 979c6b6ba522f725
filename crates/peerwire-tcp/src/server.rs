//! TCP server: listener, peer table and name-based send
//!
//! The server is the only writer of its peer table. Accepted sockets are
//! registered unnamed and gain a logical name when their identification
//! envelope arrives. Connection events funnel through one pump task that
//! keeps the table in step and republishes them as [`ServerEvent`]s.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use std::time::Duration;

use futures::future::join_all;
use peerwire_core::events::connection_event_channel;
use peerwire_core::{
    BincodeCodec, Codec, ConnectionEvent, ConnectionEventReceiver, ConnectionEventSender,
    ConnectionId, Envelope, Identification, PeerEntry, PeerIdentity, PeerTable, PeerwireError,
    ProtocolError, Result, SendOutcome, SendReport, ServerEvent, ServerEventSender,
    TransportError,
};
use tokio::net::TcpListener;
use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::TcpConfig;
use crate::connection::TcpConnection;

/// Pause after a failed accept so a persistent error does not spin
const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

// ----------------------------------------------------------------------------
// TCP Server
// ----------------------------------------------------------------------------

/// Listening endpoint that owns every accepted connection
pub struct TcpServer<C: Codec = BincodeCodec> {
    inner: Arc<ServerInner<C>>,
}

struct ServerInner<C> {
    config: TcpConfig,
    codec: C,
    peers: RwLock<PeerTable<TcpConnection>>,
    events: ServerEventSender,
    shutdown: watch::Sender<bool>,
    local_addr: OnceLock<SocketAddr>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
}

impl TcpServer<BincodeCodec> {
    /// Server using the binary codec for identification payloads
    pub fn new(config: TcpConfig, events: ServerEventSender) -> Self {
        Self::with_codec(config, BincodeCodec, events)
    }
}

impl<C: Codec> TcpServer<C> {
    pub fn with_codec(config: TcpConfig, codec: C, events: ServerEventSender) -> Self {
        let (shutdown, _) = watch::channel(false);
        let peers = RwLock::new(PeerTable::new(config.transport.duplicate_name_policy));
        Self {
            inner: Arc::new(ServerInner {
                config,
                codec,
                peers,
                events,
                shutdown,
                local_addr: OnceLock::new(),
                accept_task: Mutex::new(None),
            }),
        }
    }

    /// Bind the listener and begin accepting; returns the bound address
    pub async fn start(&self) -> Result<SocketAddr> {
        self.inner.config.validate()?;
        if *self.inner.shutdown.borrow() {
            return Err(PeerwireError::shutdown("server already stopped"));
        }
        if self.inner.local_addr.get().is_some() {
            return Err(PeerwireError::config_error("server already started"));
        }

        let listener = TcpListener::bind(self.inner.config.bind_addr)
            .await
            .map_err(TransportError::NetworkIo)?;
        let local_addr = listener.local_addr().map_err(TransportError::NetworkIo)?;
        if self.inner.local_addr.set(local_addr).is_err() {
            return Err(PeerwireError::config_error("server already started"));
        }

        let (conn_tx, conn_rx) = connection_event_channel();
        tokio::spawn(event_pump(self.inner.clone(), conn_rx));
        let accept = tokio::spawn(accept_loop(self.inner.clone(), listener, conn_tx));
        *self
            .inner
            .accept_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(accept);

        info!("TCP server listening on {}", local_addr);
        self.inner.emit(ServerEvent::Ready {
            endpoint: format!("tcp://{}", local_addr),
        });
        Ok(local_addr)
    }

    /// Close the listener and stop every live connection; idempotent
    pub async fn stop(&self) {
        if self.inner.shutdown.send_replace(true) {
            return;
        }
        let accept = self
            .inner
            .accept_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(accept) = accept {
            if let Err(e) = accept.await {
                error!("Accept loop ended abnormally: {}", e);
            }
        }

        self.inner.release_peers().await;
    }

    /// Send `envelope` to the named peers, or to every live peer when `to` is empty
    pub async fn send<S: AsRef<str>>(&self, envelope: &Envelope, to: &[S]) -> SendReport {
        let targets = self.inner.peers.read().await.resolve(to);
        let sends = targets.into_iter().map(|(name, entry)| async move {
            match entry {
                Some(entry) => {
                    let target = entry.identity.label();
                    let result = entry.handle.send(envelope).await;
                    SendOutcome {
                        target,
                        id: Some(entry.id),
                        result,
                    }
                }
                None => SendOutcome {
                    target: name.clone(),
                    id: None,
                    result: Err(PeerwireError::peer_not_found(name)),
                },
            }
        });

        let mut report = SendReport::default();
        for outcome in join_all(sends).await {
            if let Err(e) = &outcome.result {
                warn!("Send to {} failed: {}", outcome.target, e);
            }
            report.push(outcome);
        }
        report
    }

    /// Encode `value` with the server's codec and send it
    pub async fn send_value<T, S>(&self, type_code: u8, value: &T, to: &[S]) -> Result<SendReport>
    where
        T: serde::Serialize + ?Sized,
        S: AsRef<str>,
    {
        let envelope = Envelope::from_value(&self.inner.codec, type_code, value)?;
        Ok(self.send(&envelope, to).await)
    }

    /// Live connections registered under `names`, in order; unknown names are skipped
    pub async fn get_connections<S: AsRef<str>>(&self, names: &[S]) -> Vec<TcpConnection> {
        self.inner
            .peers
            .read()
            .await
            .by_names(names)
            .into_iter()
            .map(|e| e.handle)
            .collect()
    }

    pub async fn has_connection(&self, name: &str) -> bool {
        self.inner.peers.read().await.has_name(name)
    }

    /// Snapshot of every registered peer, named or not
    pub async fn peers(&self) -> Vec<(ConnectionId, PeerIdentity)> {
        self.inner
            .peers
            .read()
            .await
            .entries()
            .into_iter()
            .map(|e| (e.id, e.identity))
            .collect()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.local_addr.get().copied()
    }

    pub fn codec(&self) -> &C {
        &self.inner.codec
    }

    pub fn config(&self) -> &TcpConfig {
        &self.inner.config
    }
}

impl<C> ServerInner<C> {
    fn emit(&self, event: ServerEvent) {
        if self.events.send(event).is_err() {
            debug!("Server event observer dropped");
        }
    }

    fn is_shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Stop and forget every live connection, then report the server stopped
    async fn release_peers(&self) {
        let drained = self.peers.write().await.drain();
        info!("Stopping TCP server ({} live connections)", drained.len());
        for entry in drained {
            entry.handle.stop();
            self.emit(ServerEvent::Disconnected {
                id: entry.id,
                identity: entry.identity,
                error: None,
            });
        }
        self.emit(ServerEvent::Stopped { error: None });
    }
}

impl<C: Codec> Drop for TcpServer<C> {
    /// A server dropped without `stop` still closes its listener and peers
    fn drop(&mut self) {
        if self.inner.shutdown.send_replace(true) {
            return;
        }
        let accept = self
            .inner
            .accept_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(accept) = accept {
            accept.abort();
        }

        debug!("TCP server dropped while running");
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let inner = self.inner.clone();
                runtime.spawn(async move { inner.release_peers().await });
            }
            Err(_) => {
                if let Ok(mut peers) = self.inner.peers.try_write() {
                    for entry in peers.drain() {
                        entry.handle.stop();
                    }
                }
            }
        }
    }
}

// ----------------------------------------------------------------------------
// Accept Loop
// ----------------------------------------------------------------------------

async fn accept_loop<C: Codec>(
    inner: Arc<ServerInner<C>>,
    listener: TcpListener,
    conn_tx: ConnectionEventSender,
) {
    let mut shutdown = inner.shutdown.subscribe();
    loop {
        let accepted = tokio::select! {
            _ = shutdown.wait_for(|stop| *stop) => break,
            accepted = listener.accept() => accepted,
        };

        let (stream, addr) = match accepted {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!("Accept failed: {}", e);
                tokio::time::sleep(ACCEPT_BACKOFF).await;
                continue;
            }
        };

        let conn = match TcpConnection::from_stream(stream, &inner.config, conn_tx.clone(), None) {
            Ok(conn) => conn,
            Err(e) => {
                warn!("Dropping connection from {}: {}", addr, e);
                continue;
            }
        };

        let identity = {
            let mut peers = inner.peers.write().await;
            if inner.is_shutting_down() {
                conn.stop();
                break;
            }
            peers.insert_unnamed(conn.id(), conn.transport_address(), conn.clone())
        };
        info!("Accepted {} from {}", conn.id(), addr);
        inner.emit(ServerEvent::Accepted {
            id: conn.id(),
            identity,
        });

        if let Err(e) = conn.start().await {
            warn!("Failed to start {}: {}", conn.id(), e);
            conn.stop_with_error(e);
        }
    }
    debug!("Accept loop finished");
}

// ----------------------------------------------------------------------------
// Event Pump
// ----------------------------------------------------------------------------

async fn event_pump<C: Codec>(inner: Arc<ServerInner<C>>, mut events: ConnectionEventReceiver) {
    while let Some(event) = events.recv().await {
        match event {
            ConnectionEvent::Ready { id } => debug!("{} ready", id),
            ConnectionEvent::Received { id, envelope } if envelope.is_identification() => {
                handle_identification(&inner, id, &envelope).await;
            }
            ConnectionEvent::Received { id, envelope } => {
                let from = inner.peers.read().await.identity(id);
                match from {
                    Some(from) => inner.emit(ServerEvent::Received { id, from, envelope }),
                    None => debug!("Dropping envelope from unregistered {}", id),
                }
            }
            ConnectionEvent::Sent { id, bytes } => {
                if let Some(to) = inner.peers.read().await.identity(id) {
                    inner.emit(ServerEvent::Sent { id, to, bytes });
                }
            }
            ConnectionEvent::Stopped { id, error } => {
                let removed = inner.peers.write().await.remove(id);
                if let Some(entry) = removed {
                    info!("{} disconnected", entry.identity);
                    inner.emit(ServerEvent::Disconnected {
                        id,
                        identity: entry.identity,
                        error,
                    });
                }
            }
        }
    }
    debug!("Event pump finished");
}

async fn handle_identification<C: Codec>(
    inner: &ServerInner<C>,
    id: ConnectionId,
    envelope: &Envelope,
) {
    let name = match envelope.logical_name(&inner.codec) {
        Ok(name) => name,
        Err(e) => {
            warn!("{} sent an undecodable identification: {}", id, e);
            return;
        }
    };

    let outcome = inner.peers.write().await.identify(id, &name);
    match outcome {
        Ok(Identification::Named { identity }) => {
            info!("{} identified as {:?}", id, name);
            inner.emit(ServerEvent::Identified { id, identity });
        }
        Ok(Identification::Replaced { identity, evicted }) => {
            info!("{} identified as {:?}, replacing {}", id, name, evicted.id);
            evict(inner, evicted, &name);
            inner.emit(ServerEvent::Identified { id, identity });
        }
        Err(PeerwireError::PeerNotFound { .. }) => {
            debug!("{} identified after leaving the peer table", id);
        }
        Err(e) => {
            // The Stopped event that follows removes the entry and reports the cause.
            let handle = inner.peers.read().await.get(id).map(|e| e.handle.clone());
            if let Some(handle) = handle {
                handle.stop_with_error(e);
            }
        }
    }
}

fn evict<C>(inner: &ServerInner<C>, evicted: PeerEntry<TcpConnection>, name: &str) {
    let cause = || {
        PeerwireError::from(ProtocolError::DuplicateName {
            name: name.to_string(),
        })
    };
    evicted.handle.stop_with_error(cause());
    inner.emit(ServerEvent::Disconnected {
        id: evicted.id,
        identity: evicted.identity,
        error: Some(Arc::new(cause())),
    });
}

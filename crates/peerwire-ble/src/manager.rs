//! BLE manager: peer set, reassembly and transfer workers
//!
//! Links are attached by whoever owns the radio (the btleplug central, or a
//! loopback pair in tests). Inbound chunks arrive on the manager's link
//! channel and are reassembled per source address until the EOM sentinel.
//! Outbound sends run on a spawned worker per transfer; a peer takes part in
//! at most one transfer at a time. A busy peer gets a `Busy` outcome of its
//! own and nothing is written to it; the other destinations still go ahead.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use futures::future::join_all;
use peerwire_core::{
    BincodeCodec, Codec, ConnectionId, ConnectionState, Envelope, Identification,
    OutboundTransfer, PeerEntry, PeerIdentity, PeerTable, PeerwireError, ProtocolError,
    Reassembler, Result, SendOutcome, SendReport, ServerEvent, ServerEventSender, TransportError,
};
use tokio::sync::{mpsc, watch, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::BleConfig;
use crate::link::{BleLink, LinkEvent, LinkEventReceiver, LinkEventSender};
use crate::peer::BlePeer;

type PeerHandle = Arc<BlePeer>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Idle,
    Running,
    Stopped,
}

/// Live peers, indexed by connection and by device address
struct Registry {
    table: PeerTable<PeerHandle>,
    addresses: HashMap<String, ConnectionId>,
}

/// A peer's claim on an outbound transfer
struct InFlight {
    transfer: u64,
    cancel: watch::Sender<bool>,
}

// ----------------------------------------------------------------------------
// BLE Manager
// ----------------------------------------------------------------------------

/// Owner of every attached BLE link
pub struct BleManager<C: Codec = BincodeCodec> {
    inner: Arc<ManagerInner<C>>,
}

impl<C: Codec> Clone for BleManager<C> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

struct ManagerInner<C> {
    config: BleConfig,
    codec: C,
    registry: RwLock<Registry>,
    reassembler: Mutex<Reassembler<String>>,
    in_flight: Mutex<HashMap<ConnectionId, InFlight>>,
    next_transfer: AtomicU64,
    events: ServerEventSender,
    link_tx: LinkEventSender,
    link_rx: Mutex<Option<LinkEventReceiver>>,
    lifecycle: watch::Sender<Lifecycle>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl BleManager<BincodeCodec> {
    pub fn new(config: BleConfig, events: ServerEventSender) -> Result<Self> {
        Self::with_codec(config, BincodeCodec, events)
    }
}

impl<C: Codec> BleManager<C> {
    pub fn with_codec(config: BleConfig, codec: C, events: ServerEventSender) -> Result<Self> {
        config.validate()?;
        let (link_tx, link_rx) = mpsc::unbounded_channel();
        let (lifecycle, _) = watch::channel(Lifecycle::Idle);
        let registry = Registry {
            table: PeerTable::new(config.transport.duplicate_name_policy),
            addresses: HashMap::new(),
        };
        let reassembler = Reassembler::new(config.eom.clone(), config.max_message_size());

        Ok(Self {
            inner: Arc::new(ManagerInner {
                config,
                codec,
                registry: RwLock::new(registry),
                reassembler: Mutex::new(reassembler),
                in_flight: Mutex::new(HashMap::new()),
                next_transfer: AtomicU64::new(1),
                events,
                link_tx,
                link_rx: Mutex::new(Some(link_rx)),
                lifecycle,
                pump: Mutex::new(None),
            }),
        })
    }

    /// Channel link owners push inbound chunks and disconnects into
    pub fn link_sender(&self) -> LinkEventSender {
        self.inner.link_tx.clone()
    }

    pub fn config(&self) -> &BleConfig {
        &self.inner.config
    }

    pub fn codec(&self) -> &C {
        &self.inner.codec
    }

    /// Begin processing link events
    pub fn start(&self) -> Result<()> {
        let started = self.inner.lifecycle.send_if_modified(|l| {
            if *l == Lifecycle::Idle {
                *l = Lifecycle::Running;
                true
            } else {
                false
            }
        });
        if !started {
            return Err(PeerwireError::config_error("BLE manager already started"));
        }

        let rx = self
            .inner
            .link_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or_else(|| PeerwireError::channel_error("link receiver already taken"))?;
        let pump = tokio::spawn(link_pump(self.inner.clone(), rx));
        *self.inner.pump.lock().unwrap_or_else(PoisonError::into_inner) = Some(pump);

        info!("BLE manager started");
        self.inner.emit(ServerEvent::Ready {
            endpoint: format!("ble://{}", self.inner.config.service_uuid),
        });
        Ok(())
    }

    /// Disconnect every link and stop; idempotent
    pub async fn stop(&self) {
        if self.inner.lifecycle.send_replace(Lifecycle::Stopped) == Lifecycle::Stopped {
            return;
        }

        for (_, claim) in self
            .inner
            .in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
        {
            claim.cancel.send_replace(true);
        }

        let drained = {
            let mut registry = self.inner.registry.write().await;
            registry.addresses.clear();
            registry.table.drain()
        };
        self.inner
            .reassembler
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();

        info!("Stopping BLE manager ({} live peers)", drained.len());
        for entry in drained {
            entry.handle.finish(ConnectionState::Stopped);
            if let Err(e) = entry.handle.link().disconnect().await {
                debug!("Disconnect of {} failed: {}", entry.handle.address(), e);
            }
            self.inner.emit(ServerEvent::Disconnected {
                id: entry.id,
                identity: entry.identity,
                error: None,
            });
        }

        let pump = self
            .inner
            .pump
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(pump) = pump {
            if let Err(e) = pump.await {
                error!("Link pump ended abnormally: {}", e);
            }
        }
        self.inner.emit(ServerEvent::Stopped { error: None });
    }

    /// Register an incoming link; it stays unnamed until it identifies
    pub async fn accept(&self, link: Arc<dyn BleLink>) -> Result<ConnectionId> {
        self.inner.register(link, None).await
    }

    /// Register a link whose logical name is already known from advertising
    pub async fn accept_named(&self, link: Arc<dyn BleLink>, name: &str) -> Result<ConnectionId> {
        self.inner.register(link, Some(name)).await
    }

    /// Register an outgoing link and identify to it as `local_name`
    pub async fn connect(
        &self,
        link: Arc<dyn BleLink>,
        remote_name: Option<&str>,
        local_name: &str,
    ) -> Result<ConnectionId> {
        let identify = Envelope::identification(&self.inner.codec, local_name)?;
        let id = self.inner.register(link, remote_name).await?;
        let entry = self.inner.registry.read().await.table.get(id).cloned();
        let Some(entry) = entry else {
            return Err(PeerwireError::peer_not_found(id.to_string()));
        };

        let mut outcomes = self.inner.clone().dispatch(identify.to_bytes(), vec![entry]).await?;
        match outcomes.pop().map(|o| o.result) {
            Some(Ok(_)) => {
                debug!("{} sent identification as {:?}", id, local_name);
                Ok(id)
            }
            Some(Err(e)) => Err(e),
            None => Err(PeerwireError::peer_not_found(id.to_string())),
        }
    }

    /// Send `envelope` to the named peers, or to every live peer when `to` is empty.
    ///
    /// A destination that already has a transfer in flight is reported as
    /// `Busy` in its own outcome while the others are still written.
    pub async fn send<S: AsRef<str>>(&self, envelope: &Envelope, to: &[S]) -> Result<SendReport> {
        let resolved = self.inner.registry.read().await.table.resolve(to);

        let mut report = SendReport::default();
        let mut targets = Vec::with_capacity(resolved.len());
        for (name, entry) in resolved {
            match entry {
                Some(entry) => targets.push(entry),
                None => report.push(SendOutcome {
                    target: name.clone(),
                    id: None,
                    result: Err(PeerwireError::peer_not_found(name)),
                }),
            }
        }
        if targets.is_empty() {
            return Ok(report);
        }

        for outcome in self.inner.clone().dispatch(envelope.to_bytes(), targets).await? {
            if let Err(e) = &outcome.result {
                warn!("BLE send to {} failed: {}", outcome.target, e);
            }
            report.push(outcome);
        }
        Ok(report)
    }

    /// Encode `value` with the manager's codec and send it
    pub async fn send_value<T, S>(&self, type_code: u8, value: &T, to: &[S]) -> Result<SendReport>
    where
        T: serde::Serialize + ?Sized,
        S: AsRef<str>,
    {
        let envelope = Envelope::from_value(&self.inner.codec, type_code, value)?;
        self.send(&envelope, to).await
    }

    /// Drop a peer by name, releasing its link
    pub async fn disconnect(&self, name: &str) -> Result<()> {
        let id = self
            .inner
            .registry
            .read()
            .await
            .table
            .by_name(name)
            .map(|e| e.id)
            .ok_or_else(|| PeerwireError::peer_not_found(name))?;
        self.inner.remove_peer(id, None).await;
        Ok(())
    }

    /// Peers registered under `names`, in order; unknown names are skipped
    pub async fn get_connections<S: AsRef<str>>(&self, names: &[S]) -> Vec<Arc<BlePeer>> {
        self.inner
            .registry
            .read()
            .await
            .table
            .by_names(names)
            .into_iter()
            .map(|e| e.handle)
            .collect()
    }

    pub async fn has_connection(&self, name: &str) -> bool {
        self.inner.registry.read().await.table.has_name(name)
    }

    /// Snapshot of every registered peer, named or not
    pub async fn peers(&self) -> Vec<(ConnectionId, PeerIdentity)> {
        self.inner
            .registry
            .read()
            .await
            .table
            .entries()
            .into_iter()
            .map(|e| (e.id, e.identity))
            .collect()
    }

    /// Whether the named peer is part of a transfer in flight
    pub async fn is_busy(&self, name: &str) -> bool {
        let id = self
            .inner
            .registry
            .read()
            .await
            .table
            .by_name(name)
            .map(|e| e.id);
        match id {
            Some(id) => self
                .inner
                .in_flight
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .contains_key(&id),
            None => false,
        }
    }

    /// Bytes of a partial inbound message buffered for `address`
    pub fn pending_reassembly(&self, address: &str) -> usize {
        self.inner
            .reassembler
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pending_len(&address.to_string())
    }
}

// ----------------------------------------------------------------------------
// Peer Registration
// ----------------------------------------------------------------------------

impl<C: Codec> ManagerInner<C> {
    fn emit(&self, event: ServerEvent) {
        if self.events.send(event).is_err() {
            debug!("BLE event observer dropped");
        }
    }

    fn lifecycle(&self) -> Lifecycle {
        *self.lifecycle.borrow()
    }

    async fn register(&self, link: Arc<dyn BleLink>, name: Option<&str>) -> Result<ConnectionId> {
        if self.lifecycle() != Lifecycle::Running {
            return Err(PeerwireError::shutdown("BLE manager is not running"));
        }

        let peer = Arc::new(BlePeer::new(link));
        let id = peer.id();
        let outcome = {
            let mut registry = self.registry.write().await;
            if registry.addresses.contains_key(peer.address()) {
                return Err(PeerwireError::link_unavailable(format!(
                    "{} is already attached",
                    peer.address()
                )));
            }
            let outcome = match name {
                Some(name) => registry
                    .table
                    .insert_named(id, peer.transport_address(), name, peer.clone())
                    .map(Some),
                None => {
                    registry
                        .table
                        .insert_unnamed(id, peer.transport_address(), peer.clone());
                    Ok(None)
                }
            };
            if outcome.is_ok() {
                registry.addresses.insert(peer.address().to_string(), id);
                peer.mark_ready();
            }
            outcome
        };

        let outcome = match outcome {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!("Refusing link {}: {}", peer.address(), e);
                peer.finish(ConnectionState::Cleanup);
                if let Err(e) = peer.link().disconnect().await {
                    debug!("Disconnect of {} failed: {}", peer.address(), e);
                }
                return Err(e);
            }
        };

        info!("Attached {} at {}", id, peer.address());
        self.emit(ServerEvent::Accepted {
            id,
            identity: PeerIdentity::unnamed(peer.transport_address()),
        });
        match outcome {
            Some(Identification::Named { identity }) => {
                self.emit(ServerEvent::Identified { id, identity });
            }
            Some(Identification::Replaced { identity, evicted }) => {
                self.evict(evicted, &identity.logical_name).await;
                self.emit(ServerEvent::Identified { id, identity });
            }
            None => {}
        }
        Ok(id)
    }

    /// Remove a peer from the table and tear it down
    async fn remove_peer(&self, id: ConnectionId, error: Option<PeerwireError>) -> bool {
        let entry = self.registry.write().await.table.remove(id);
        match entry {
            Some(entry) => {
                self.retire(entry, error).await;
                true
            }
            None => false,
        }
    }

    async fn evict(&self, evicted: PeerEntry<PeerHandle>, name: &str) {
        info!("{} loses name {:?} to a newer link", evicted.id, name);
        let cause = PeerwireError::from(ProtocolError::DuplicateName {
            name: name.to_string(),
        });
        self.retire(evicted, Some(cause)).await;
    }

    /// Tear down a peer that is no longer in the table
    async fn retire(&self, entry: PeerEntry<PeerHandle>, error: Option<PeerwireError>) {
        let peer = &entry.handle;
        {
            let mut registry = self.registry.write().await;
            if registry.addresses.get(peer.address()) == Some(&entry.id) {
                registry.addresses.remove(peer.address());
            }
        }
        let discarded = self
            .reassembler
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .discard(&peer.address().to_string());
        if discarded > 0 {
            debug!("Discarded {} partial bytes from {}", discarded, peer.address());
        }
        if let Some(claim) = self
            .in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&entry.id)
        {
            claim.cancel.send_replace(true);
        }

        let next = if error.is_some() {
            ConnectionState::Cleanup
        } else {
            ConnectionState::Stopped
        };
        if !peer.finish(next) {
            return;
        }
        if let Err(e) = peer.link().disconnect().await {
            debug!("Disconnect of {} failed: {}", peer.address(), e);
        }
        match &error {
            Some(e) => warn!("{} disconnected: {}", entry.identity, e),
            None => info!("{} disconnected", entry.identity),
        }
        self.emit(ServerEvent::Disconnected {
            id: entry.id,
            identity: entry.identity,
            error: error.map(Arc::new),
        });
    }
}

// ----------------------------------------------------------------------------
// Outbound Transfers
// ----------------------------------------------------------------------------

/// One destination of a transfer worker
struct Destination {
    id: ConnectionId,
    target: String,
    peer: PeerHandle,
    cancel: watch::Receiver<bool>,
    failure: Option<PeerwireError>,
}

impl Destination {
    async fn write(&mut self, chunk: &[u8]) {
        let link = self.peer.link().clone();
        let result = tokio::select! {
            _ = self.cancel.wait_for(|cancelled| *cancelled) => {
                Err(PeerwireError::shutdown("transfer cancelled"))
            }
            written = async {
                link.ready_for_write().await?;
                link.write(chunk).await
            } => written,
        };
        if let Err(e) = result {
            self.failure = Some(e);
        }
    }

    /// Set by retire/stop before the claim is dropped
    fn cancelled(&self) -> bool {
        *self.cancel.borrow()
    }
}

impl<C: Codec> ManagerInner<C> {
    /// Claim the free targets, plan the chunks and run one worker to completion.
    ///
    /// Targets that are not ready or already have a transfer in flight get
    /// their own failed outcome; the rest still receive the message.
    async fn dispatch(
        self: Arc<Self>,
        bytes: Vec<u8>,
        targets: Vec<PeerEntry<PeerHandle>>,
    ) -> Result<Vec<SendOutcome>> {
        if self.lifecycle() != Lifecycle::Running {
            return Err(PeerwireError::shutdown("BLE manager is not running"));
        }
        let max = self.config.max_message_size();
        if bytes.len() > max {
            return Err(ProtocolError::FrameTooLarge {
                declared: bytes.len(),
                max,
            }
            .into());
        }

        let mut rejected = Vec::new();
        let mut ready = Vec::with_capacity(targets.len());
        for entry in targets {
            if entry.handle.is_ready() {
                ready.push(entry);
            } else {
                rejected.push(SendOutcome {
                    target: entry.identity.label(),
                    id: Some(entry.id),
                    result: Err(PeerwireError::not_ready(entry.handle.state())),
                });
            }
        }

        let transfer_id = self.next_transfer.fetch_add(1, Ordering::Relaxed);
        let (destinations, busy) = self.claim(transfer_id, ready);
        rejected.extend(busy);
        if destinations.is_empty() {
            return Ok(rejected);
        }

        let chunk_size = destinations
            .iter()
            .map(|d| match d.peer.link().max_write_len() {
                0 => self.config.default_chunk_size,
                n => n,
            })
            .min()
            .unwrap_or(self.config.default_chunk_size);
        let transfer = match OutboundTransfer::new(bytes, chunk_size, self.config.eom.clone()) {
            Ok(transfer) => transfer,
            Err(e) => {
                self.release(transfer_id, destinations.iter().map(|d| d.id));
                return Err(e);
            }
        };
        debug!(
            "Transfer {} of {} bytes in {} writes to {} peers",
            transfer_id,
            transfer.payload_len(),
            transfer.total_writes(),
            destinations.len()
        );

        let worker = tokio::spawn(self.clone().run_transfer(transfer_id, transfer, destinations));
        let mut outcomes = worker
            .await
            .map_err(|e| PeerwireError::channel_error(format!("transfer worker failed: {}", e)))?;
        outcomes.extend(rejected);
        Ok(outcomes)
    }

    /// Reserve every free target for `transfer_id`; busy ones come back as failures
    fn claim(
        &self,
        transfer_id: u64,
        targets: Vec<PeerEntry<PeerHandle>>,
    ) -> (Vec<Destination>, Vec<SendOutcome>) {
        let mut in_flight = self
            .in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        let mut destinations = Vec::with_capacity(targets.len());
        let mut busy = Vec::new();
        for entry in targets {
            let target = entry.identity.label();
            if in_flight.contains_key(&entry.id) {
                busy.push(SendOutcome {
                    result: Err(PeerwireError::busy(target.clone())),
                    target,
                    id: Some(entry.id),
                });
                continue;
            }
            let (cancel, cancel_rx) = watch::channel(false);
            in_flight.insert(
                entry.id,
                InFlight {
                    transfer: transfer_id,
                    cancel,
                },
            );
            destinations.push(Destination {
                id: entry.id,
                target,
                peer: entry.handle,
                cancel: cancel_rx,
                failure: None,
            });
        }
        (destinations, busy)
    }

    fn release(&self, transfer_id: u64, ids: impl Iterator<Item = ConnectionId>) {
        let mut in_flight = self
            .in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        for id in ids {
            if in_flight.get(&id).map(|c| c.transfer) == Some(transfer_id) {
                in_flight.remove(&id);
            }
        }
    }

    async fn run_transfer(
        self: Arc<Self>,
        transfer_id: u64,
        mut transfer: OutboundTransfer,
        mut destinations: Vec<Destination>,
    ) -> Vec<SendOutcome> {
        while let Some(step) = transfer.current() {
            let chunk = step.bytes().to_vec();
            let active: Vec<&mut Destination> = destinations
                .iter_mut()
                .filter(|d| d.failure.is_none())
                .collect();
            if active.is_empty() {
                break;
            }
            join_all(active.into_iter().map(|d| d.write(&chunk))).await;
            transfer.advance();
        }

        self.release(transfer_id, destinations.iter().map(|d| d.id));

        let payload_len = transfer.payload_len();
        let mut outcomes = Vec::with_capacity(destinations.len());
        for dest in destinations {
            let result = match dest.failure {
                None => {
                    dest.peer.record_sent(payload_len);
                    let to = self.registry.read().await.table.identity(dest.id);
                    if let Some(to) = to {
                        self.emit(ServerEvent::Sent {
                            id: dest.id,
                            to,
                            bytes: payload_len,
                        });
                    }
                    Ok(payload_len)
                }
                Some(e) => {
                    let cancelled = *dest.cancel.borrow();
                    if !cancelled && e.is_fatal_to_connection() {
                        let cause = PeerwireError::write_failed(e.to_string());
                        self.remove_peer(dest.id, Some(cause)).await;
                    }
                    Err(e)
                }
            };
            outcomes.push(SendOutcome {
                target: dest.target,
                id: Some(dest.id),
                result,
            });
        }
        debug!("Transfer {} retired", transfer_id);
        outcomes
    }
}

// ----------------------------------------------------------------------------
// Inbound Processing
// ----------------------------------------------------------------------------

async fn link_pump<C: Codec>(inner: Arc<ManagerInner<C>>, mut links: LinkEventReceiver) {
    let mut lifecycle = inner.lifecycle.subscribe();
    loop {
        let event = tokio::select! {
            _ = lifecycle.wait_for(|l| *l == Lifecycle::Stopped) => break,
            event = links.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };
        match event {
            LinkEvent::Chunk { from, data } => inner.on_chunk(&from, &data).await,
            LinkEvent::Disconnected { from, reason } => inner.on_link_lost(&from, reason).await,
        }
    }
    debug!("Link pump finished");
}

impl<C: Codec> ManagerInner<C> {
    async fn on_chunk(&self, from: &str, data: &[u8]) {
        let id = self.registry.read().await.addresses.get(from).copied();
        let Some(id) = id else {
            debug!("Dropping chunk from unattached device {}", from);
            return;
        };

        let accepted = self
            .reassembler
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .accept(&from.to_string(), data);
        match accepted {
            Ok(None) => {}
            Ok(Some(message)) => self.on_message(id, message).await,
            Err(e) => {
                warn!("{} reassembly failed: {}", id, e);
                self.remove_peer(id, Some(e)).await;
            }
        }
    }

    async fn on_message(&self, id: ConnectionId, message: Vec<u8>) {
        if message.is_empty() {
            debug!("{} sent an empty message", id);
            return;
        }
        let envelope = match Envelope::from_bytes(&message) {
            Ok(envelope) => envelope,
            Err(e) => {
                self.remove_peer(id, Some(e)).await;
                return;
            }
        };

        let entry = self.registry.read().await.table.get(id).cloned();
        let Some(entry) = entry else {
            return;
        };
        entry.handle.record_received(message.len());
        debug!(
            "{} received {} bytes (type {:#04x})",
            id,
            message.len(),
            envelope.type_code
        );

        if envelope.is_identification() {
            self.on_identification(id, &envelope).await;
        } else {
            self.emit(ServerEvent::Received {
                id,
                from: entry.identity,
                envelope,
            });
        }
    }

    async fn on_identification(&self, id: ConnectionId, envelope: &Envelope) {
        let name = match envelope.logical_name(&self.codec) {
            Ok(name) => name,
            Err(e) => {
                warn!("{} sent an undecodable identification: {}", id, e);
                return;
            }
        };

        let outcome = self.registry.write().await.table.identify(id, &name);
        match outcome {
            Ok(Identification::Named { identity }) => {
                info!("{} identified as {:?}", id, name);
                self.emit(ServerEvent::Identified { id, identity });
            }
            Ok(Identification::Replaced { identity, evicted }) => {
                self.evict(evicted, &name).await;
                self.emit(ServerEvent::Identified { id, identity });
            }
            Err(PeerwireError::PeerNotFound { .. }) => {
                debug!("{} identified after leaving the peer table", id);
            }
            Err(e) => {
                self.remove_peer(id, Some(e)).await;
            }
        }
    }

    async fn on_link_lost(&self, from: &str, reason: Option<String>) {
        let id = self.registry.read().await.addresses.get(from).copied();
        let Some(id) = id else {
            return;
        };
        let cause = match reason {
            Some(reason) => PeerwireError::link_unavailable(reason),
            None => PeerwireError::Transport(TransportError::ConnectionClosed),
        };
        self.remove_peer(id, Some(cause)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loopback::{pair, CreditMode, LoopbackEnd};
    use peerwire_core::events::server_event_channel;

    #[tokio::test]
    async fn accept_before_start_fails() {
        let (tx, _rx) = server_event_channel();
        let manager = BleManager::new(BleConfig::default(), tx).unwrap();
        let (a_tx, _a_rx) = mpsc::unbounded_channel();
        let (link, _) = pair(
            LoopbackEnd::new("aa", a_tx),
            LoopbackEnd::new("bb", manager.link_sender()),
            20,
            CreditMode::Automatic,
        );
        assert!(manager.accept(link).await.is_err());
        let envelope = Envelope::new(1, vec![1]).unwrap();
        let report = manager.send::<&str>(&envelope, &[]).await.unwrap();
        assert!(report.is_empty());
    }

    #[tokio::test]
    async fn oversized_send_is_rejected_up_front() {
        let (tx, _rx) = server_event_channel();
        let manager =
            BleManager::new(BleConfig::default().with_max_message_size(64), tx).unwrap();
        manager.start().unwrap();
        let (a_tx, _a_rx) = mpsc::unbounded_channel();
        let (link, _) = pair(
            LoopbackEnd::new("me", manager.link_sender()),
            LoopbackEnd::new("peer", a_tx),
            20,
            CreditMode::Automatic,
        );
        manager.accept_named(link.clone(), "peerA").await.unwrap();

        let envelope = Envelope::new(1, vec![0; 100]).unwrap();
        let err = manager.send(&envelope, &["peerA"]).await.unwrap_err();
        assert!(matches!(
            err,
            PeerwireError::Protocol(ProtocolError::FrameTooLarge { .. })
        ));
        assert!(link.written().is_empty());
        assert!(!manager.is_busy("peerA").await);
        manager.stop().await;
    }

    #[tokio::test]
    async fn eom_collision_is_rejected_before_writing() {
        let (tx, _rx) = server_event_channel();
        let manager = BleManager::new(BleConfig::default(), tx).unwrap();
        manager.start().unwrap();
        let (a_tx, _a_rx) = mpsc::unbounded_channel();
        let (link, _) = pair(
            LoopbackEnd::new("me", manager.link_sender()),
            LoopbackEnd::new("peer", a_tx),
            2,
            CreditMode::Automatic,
        );
        manager.accept_named(link.clone(), "peerA").await.unwrap();

        // second chunk of [01 7f][ff ff] equals the sentinel
        let envelope = Envelope::new(1, vec![0x7f, 0xff, 0xff]).unwrap();
        let err = manager.send(&envelope, &["peerA"]).await.unwrap_err();
        assert!(matches!(
            err,
            PeerwireError::Protocol(ProtocolError::EomCollision { index: 1 })
        ));
        assert!(link.written().is_empty());
        manager.stop().await;
    }
}

//! The orchestrator: owns the pool, the dialer, backoff, resource limits,
//! and every registered protocol handler, and turns all of it into a
//! single `connect`/`listen`/`newStream`/event-stream surface.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use std::time::Duration;

use futures::future::BoxFuture;
use futures::{AsyncRead, AsyncWrite};
use meshnet_core::{
    upgrade_inbound, BoxMuxedConnection, BoxStream, BufferedMuxedStream, Direction, Limits, Listener,
    MuxedConnection, ResourceManager, StreamReservation, Transport, UpgradeConfig,
};
use meshnet_identity::{Keypair, PeerId};
use meshnet_multiaddr::Multiaddr;
use meshnet_multistream_select::{dialer_select_proto, listener_select_proto, Version};
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::backoff::{BackoffConfig, DialBackoff};
use crate::connection::{ConnectionId, ManagedConnection};
use crate::dialer::{smart_dial, DialerConfig};
use crate::error::{DialError, DisconnectReason, NodeError};
use crate::health::{HealthConfig, HealthMonitor};
use crate::observed_addr::ObservedAddressManager;
use crate::pool::{Pool, PoolConfig};
use crate::reconnect::ReconnectPolicy;

/// Immutable once a `Node` is built; every tunable lives here so the rest
/// of the orchestrator reads configuration instead of hardcoding it.
pub struct NodeConfiguration {
    /// Derived from whichever keypair the configured security upgrader(s)
    /// hold; kept here rather than as an owned `Keypair` so building a
    /// node never needs to duplicate private key material.
    pub local_peer: PeerId,
    pub listen_addresses: Vec<Multiaddr>,
    pub pool: PoolConfig,
    pub dialer: DialerConfig,
    pub backoff: BackoffConfig,
    pub reconnect: ReconnectPolicy,
    pub health: HealthConfig,
    pub idle_timeout: Duration,
    pub observed_address_confirmations: usize,
    pub resource_limits: Limits,
}

/// Addresses a peer is reachable at, populated by discovery and by
/// successful dials.
#[derive(Default)]
pub struct AddressBook {
    addresses: Mutex<HashMap<PeerId, Vec<Multiaddr>>>,
}

impl AddressBook {
    pub fn add(&self, peer: PeerId, address: Multiaddr) {
        let mut addresses = self.addresses.lock();
        let entry = addresses.entry(peer).or_default();
        if !entry.contains(&address) {
            entry.push(address);
        }
    }

    pub fn addresses_for(&self, peer: PeerId) -> Vec<Multiaddr> {
        self.addresses.lock().get(&peer).cloned().unwrap_or_default()
    }
}

/// What a handler for an inbound or outbound stream receives. Mirrors the
/// fields an actual protocol implementation would need and nothing else.
pub struct StreamContext {
    pub stream: BoxStream,
    pub remote_peer: PeerId,
    pub local_peer: PeerId,
    pub protocol: String,
}

type HandlerFn = Arc<dyn Fn(StreamContext) -> BoxFuture<'static, ()> + Send + Sync>;

/// Wraps an outbound stream with the protocol reservation that was taken
/// out to open it, so the reservation releases exactly when the caller
/// drops the stream rather than as soon as negotiation finishes.
struct ReservedStream {
    inner: BoxStream,
    _reservation: StreamReservation,
}

impl AsyncRead for ReservedStream {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut [u8]) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for ReservedStream {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_close(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_close(cx)
    }
}

impl meshnet_core::Stream for ReservedStream {
    fn id(&self) -> u64 {
        self.inner.id()
    }
}

#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    Connected { peer: PeerId, address: Multiaddr },
    Disconnected { peer: PeerId, reason: DisconnectReason },
    Reconnecting { peer: PeerId, attempt: u32 },
    Reconnected { peer: PeerId },
    Gated { peer: PeerId },
    Trimmed { peer: PeerId },
    TrimConstrained { wanted: usize, trimmed: usize },
    HealthCheckFailed { peer: PeerId },
    ReconnectionFailed { peer: PeerId },
}

#[derive(Debug, Clone)]
pub enum NodeEvent {
    PeerConnected(PeerId),
    PeerDisconnected(PeerId),
    ListenError { address: Multiaddr, message: String },
    ConnectionError { peer: Option<PeerId>, message: String },
    Connection(ConnectionEvent),
}

struct Inner {
    config: NodeConfiguration,
    local_peer: PeerId,
    pool: Arc<Pool>,
    backoff: DialBackoff,
    resources: ResourceManager,
    observed_addresses: ObservedAddressManager,
    address_book: AddressBook,
    transport: Arc<dyn Transport>,
    upgrade_config: Arc<UpgradeConfig>,
    handlers: Mutex<HashMap<String, HandlerFn>>,
    events_tx: mpsc::UnboundedSender<NodeEvent>,
    running: AtomicBool,
}

/// Cheap to clone; every clone is a handle onto the same running node.
#[derive(Clone)]
pub struct Node {
    inner: Arc<Inner>,
}

pub struct NodeBuilder {
    config: NodeConfiguration,
    transport: Arc<dyn Transport>,
    upgrade_config: UpgradeConfig,
}

impl NodeBuilder {
    pub fn new(config: NodeConfiguration, transport: Arc<dyn Transport>, upgrade_config: UpgradeConfig) -> Self {
        NodeBuilder {
            config,
            transport,
            upgrade_config,
        }
    }

    pub fn build(self) -> (Node, mpsc::UnboundedReceiver<NodeEvent>) {
        let local_peer = self.config.local_peer;
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let inner = Inner {
            pool: Arc::new(Pool::new(self.config.pool)),
            backoff: DialBackoff::new(self.config.backoff),
            resources: ResourceManager::new(self.config.resource_limits),
            observed_addresses: ObservedAddressManager::new(self.config.observed_address_confirmations),
            address_book: AddressBook::default(),
            transport: self.transport,
            upgrade_config: Arc::new(self.upgrade_config),
            handlers: Mutex::new(HashMap::new()),
            events_tx,
            running: AtomicBool::new(false),
            local_peer,
            config: self.config,
        };
        (Node { inner: Arc::new(inner) }, events_rx)
    }
}

impl Node {
    pub fn local_peer(&self) -> PeerId {
        self.inner.local_peer
    }

    pub fn address_book(&self) -> &AddressBook {
        &self.inner.address_book
    }

    /// Records that `reporter` observed us reachable at `address` (as
    /// relayed by a protocol such as identify or AutoNAT dial-back).
    /// Returns `true` exactly when this report confirms the address.
    pub fn record_observed_address(&self, reporter: PeerId, address: Multiaddr) -> bool {
        self.inner.observed_addresses.record(reporter, address)
    }

    pub fn confirmed_external_addresses(&self) -> Vec<Multiaddr> {
        self.inner.observed_addresses.confirmed_addresses()
    }

    /// The address `peer`'s current connection was observed on, if any.
    /// Protocols that need the client's actual network address (AutoNAT's
    /// amplification defence, for instance) read it here rather than
    /// trusting anything the peer claims over the wire.
    pub fn remote_address_of(&self, peer: PeerId) -> Option<Multiaddr> {
        let id = self.inner.pool.connection_for(peer)?;
        self.inner.pool.with_entry_mut(id, |entry| entry.address.clone())
    }

    pub fn register_handler<F>(&self, protocol: impl Into<String>, handler: F)
    where
        F: Fn(StreamContext) -> BoxFuture<'static, ()> + Send + Sync + 'static,
    {
        self.inner
            .handlers
            .lock()
            .insert(protocol.into(), Arc::new(handler));
    }

    fn emit(&self, event: NodeEvent) {
        let _ = self.inner.events_tx.send(event);
    }

    /// Binds every configured listener and spawns an accept loop for
    /// each, then spawns the idle-check and health-probe background
    /// tasks. Returns the bound addresses.
    pub async fn start(&self) -> Result<Vec<Multiaddr>, NodeError> {
        self.inner.running.store(true, Ordering::SeqCst);
        let mut bound = Vec::new();
        for address in &self.inner.config.listen_addresses {
            match self.inner.transport.listen(address).await {
                Ok((actual, listener)) => {
                    bound.push(actual);
                    self.spawn_accept_loop(listener);
                }
                Err(err) => {
                    log::warn!("failed to bind listener on {address}: {err}");
                    self.emit(NodeEvent::ListenError {
                        address: address.clone(),
                        message: err.to_string(),
                    });
                }
            }
        }
        if bound.is_empty() && !self.inner.config.listen_addresses.is_empty() {
            return Err(NodeError::NoListenersBound);
        }

        let node = self.clone();
        tokio::spawn(async move { node.idle_check_loop().await });

        let health_node = self.clone();
        tokio::spawn(async move { health_node.health_check_loop().await });

        Ok(bound)
    }

    fn spawn_accept_loop(&self, mut listener: Box<dyn Listener>) {
        let node = self.clone();
        tokio::spawn(async move {
            loop {
                if !node.inner.running.load(Ordering::SeqCst) {
                    break;
                }
                match listener.accept().await {
                    Ok(raw) => {
                        let node = node.clone();
                        tokio::spawn(async move {
                            node.handle_inbound_raw(raw).await;
                        });
                    }
                    Err(_) => break,
                }
            }
        });
    }

    async fn handle_inbound_raw(&self, raw: Box<dyn meshnet_core::RawConnection>) {
        if !self.inner.pool.can_accept_inbound() {
            return;
        }
        let remote_address = raw.remote_address().clone();
        let connection = match upgrade_inbound(&self.inner.upgrade_config, raw).await {
            Ok(connection) => connection,
            Err(err) => {
                log::debug!("inbound upgrade from {remote_address} failed: {err}");
                self.emit(NodeEvent::ConnectionError {
                    peer: None,
                    message: err.to_string(),
                });
                return;
            }
        };

        let remote_peer = connection.remote_peer();
        if remote_peer == self.inner.local_peer {
            return;
        }
        if !self.inner.pool.can_connect_to(remote_peer) {
            return;
        }

        let reservation = match self.inner.resources.reserve_inbound_connection(remote_peer) {
            Ok(reservation) => reservation,
            Err(_) => return,
        };

        let id = self
            .inner
            .pool
            .add_connecting(remote_peer, remote_address.clone(), Direction::Inbound, false);

        if self.resolve_simultaneous_connect(remote_peer, id, Direction::Inbound) {
            return;
        }

        let became_connected = self.inner.pool.update_connection(id, connection);
        self.inner.pool.with_entry_mut(id, |entry| {
            entry.reservation = Some(reservation);
            entry.reconnect_address = Some(entry.address.clone());
        });

        self.spawn_inbound_stream_dispatcher(id, remote_peer);

        if became_connected {
            log::debug!("connected to {remote_peer} (inbound, {remote_address})");
            self.emit(NodeEvent::PeerConnected(remote_peer));
            self.emit(NodeEvent::Connection(ConnectionEvent::Connected {
                peer: remote_peer,
                address: remote_address,
            }));
        }
    }

    /// Resolves a simultaneous connect: the peer with the smaller id keeps
    /// its outbound connection, the other side keeps its inbound one. If
    /// `new_id`'s direction is the losing one and a connection for `peer`
    /// is already established, `new_id` is removed and `true` is returned.
    fn resolve_simultaneous_connect(&self, peer: PeerId, new_id: ConnectionId, new_direction: Direction) -> bool {
        let winning_direction = if self.inner.local_peer < peer {
            Direction::Outbound
        } else {
            Direction::Inbound
        };
        if new_direction == winning_direction || !self.inner.pool.is_connected(peer) {
            return false;
        }
        self.inner.pool.remove(new_id);
        true
    }

    /// Removes a pool entry, releasing its connection and reservation on
    /// drop, and emits the disconnect events every teardown path shares.
    fn disconnect_entry(&self, id: ConnectionId, reason: DisconnectReason) -> Option<ManagedConnection> {
        let entry = self.inner.pool.remove(id)?;
        self.emit(NodeEvent::PeerDisconnected(entry.peer));
        self.emit(NodeEvent::Connection(ConnectionEvent::Disconnected {
            peer: entry.peer,
            reason,
        }));
        Some(entry)
    }

    /// Schedules redial attempts per `config.reconnect`, only from the side
    /// whose peer id is smaller than the remote's — the same side the
    /// simultaneous-connect resolver lets keep its outbound connection, so
    /// only one side ever redials instead of both racing each other.
    fn schedule_reconnect(&self, peer: PeerId, address: Multiaddr) {
        if self.inner.local_peer >= peer {
            return;
        }
        let policy = self.inner.config.reconnect;
        if !policy.should_reconnect(0, DisconnectReason::RemoteClose) {
            return;
        }
        let node = self.clone();
        tokio::spawn(async move {
            let mut attempt = 0;
            loop {
                if node.inner.pool.is_connected(peer) {
                    return;
                }
                node.emit(NodeEvent::Connection(ConnectionEvent::Reconnecting { peer, attempt }));
                tokio::time::sleep(policy.delay(attempt)).await;
                if node.inner.pool.is_connected(peer) {
                    return;
                }
                match node.connect_address(address.clone(), Some(peer)).await {
                    Ok(_) => {
                        node.emit(NodeEvent::Connection(ConnectionEvent::Reconnected { peer }));
                        return;
                    }
                    Err(_) => {
                        attempt += 1;
                        if !policy.should_reconnect(attempt, DisconnectReason::RemoteClose) {
                            node.emit(NodeEvent::Connection(ConnectionEvent::ReconnectionFailed { peer }));
                            return;
                        }
                    }
                }
            }
        });
    }

    fn spawn_inbound_stream_dispatcher(&self, id: ConnectionId, remote_peer: PeerId) {
        let node = self.clone();
        tokio::spawn(async move {
            loop {
                // The connection is only reachable through the pool entry;
                // it is taken out for the duration of `accept_stream` and
                // put back afterwards so no lock is held across the await.
                match node.accept_one_stream(id).await {
                    Some(stream) => node.dispatch_inbound_stream(stream, remote_peer),
                    None => {
                        if let Some(entry) = node.disconnect_entry(id, DisconnectReason::RemoteClose) {
                            let address = entry.reconnect_address.clone().unwrap_or(entry.address.clone());
                            node.schedule_reconnect(remote_peer, address);
                        }
                        break;
                    }
                }
            }
        });
    }

    async fn accept_one_stream(&self, id: ConnectionId) -> Option<BoxStream> {
        // parking_lot's mutex is non-async; briefly take the connection
        // out of the entry, await on it outside the lock, then put it
        // back so no lock is held across a suspension point.
        let mut taken = self
            .inner
            .pool
            .with_entry_mut(id, |entry| entry.connection.take())??;
        let result = taken.accept_stream().await;
        self.inner.pool.with_entry_mut(id, |entry| entry.connection = Some(taken));
        result.ok()
    }

    fn dispatch_inbound_stream(&self, stream: BoxStream, remote_peer: PeerId) {
        let node = self.clone();
        tokio::spawn(async move {
            let protocols: Vec<String> = node.inner.handlers.lock().keys().cloned().collect();
            let Ok(negotiated) = listener_select_proto(stream, &protocols, 64 * 1024).await else {
                return;
            };
            // The per-protocol scope is only known once negotiation picks
            // a protocol, so the reservation is taken out here rather than
            // before negotiation.
            let Ok(reservation) = node.inner.resources.reserve_inbound_stream(&negotiated.protocol) else {
                return;
            };
            let handler = node.inner.handlers.lock().get(&negotiated.protocol).cloned();
            if let Some(handler) = handler {
                let context = StreamContext {
                    stream: BufferedMuxedStream::wrap(negotiated.remainder, negotiated.stream),
                    remote_peer,
                    local_peer: node.inner.local_peer,
                    protocol: negotiated.protocol,
                };
                // Reservation is held across the handler's lifetime and
                // released here on drop once it returns.
                handler(context).await;
            }
            drop(reservation);
        });
    }

    /// Dials a specific address, running the full upgrade pipeline and
    /// verifying the resulting identity matches `expected_peer` if given.
    pub async fn connect_address(&self, address: Multiaddr, expected_peer: Option<PeerId>) -> Result<PeerId, NodeError> {
        if let Some(expected) = expected_peer {
            if expected == self.inner.local_peer {
                return Err(DialError::SelfDialNotAllowed.into());
            }
            if self.inner.backoff.should_back_off(expected) {
                return Err(DialError::Timeout.into());
            }
        }
        if !self.inner.pool.can_dial_outbound() {
            return Err(DialError::AllDialsFailed.into());
        }

        let raw = self
            .inner
            .transport
            .dial(&address)
            .await
            .map_err(meshnet_core::Error::Io)?;
        let connection = meshnet_core::upgrade_outbound(&self.inner.upgrade_config, raw, expected_peer)
            .await
            .map_err(|err| {
                if let Some(peer) = expected_peer {
                    self.inner.backoff.record_failure(peer);
                }
                DialError::Core(err)
            })?;

        let remote_peer = connection.remote_peer();
        if remote_peer == self.inner.local_peer {
            return Err(DialError::SelfDialNotAllowed.into());
        }
        if !self.inner.pool.can_connect_to(remote_peer) {
            return Err(DialError::AllDialsFailed.into());
        }

        let reservation = self.inner.resources.reserve_outbound_connection(remote_peer)?;

        let id = self
            .inner
            .pool
            .add_connecting(remote_peer, address.clone(), Direction::Outbound, false);

        if self.resolve_simultaneous_connect(remote_peer, id, Direction::Outbound) {
            self.inner.backoff.record_success(remote_peer);
            self.inner.address_book.add(remote_peer, address);
            return Ok(remote_peer);
        }

        let became_connected = self.inner.pool.update_connection(id, connection);
        self.inner.pool.with_entry_mut(id, |entry| {
            entry.reservation = Some(reservation);
            entry.reconnect_address = Some(entry.address.clone());
        });
        self.inner.backoff.record_success(remote_peer);
        self.inner.address_book.add(remote_peer, address.clone());

        self.spawn_inbound_stream_dispatcher(id, remote_peer);

        if became_connected {
            self.emit(NodeEvent::PeerConnected(remote_peer));
            self.emit(NodeEvent::Connection(ConnectionEvent::Connected {
                peer: remote_peer,
                address,
            }));
        }
        Ok(remote_peer)
    }

    /// Dials every known address for `peer`, racing them via the smart
    /// dialer, and joins an in-flight dial to the same peer if one
    /// already exists.
    pub async fn connect_peer(&self, peer: PeerId) -> Result<(), NodeError> {
        if peer == self.inner.local_peer {
            return Err(DialError::SelfDialNotAllowed.into());
        }
        if self.inner.pool.is_connected(peer) {
            return Ok(());
        }

        let (pending, is_new) = self.inner.pool.register_pending_dial(peer);
        if !is_new {
            pending.join().await.map_err(|_| DialError::AllDialsFailed)?;
            return Ok(());
        }

        let addresses = self.inner.address_book.addresses_for(peer);
        if addresses.is_empty() {
            self.inner.pool.remove_pending_dial(peer);
            return Err(DialError::NoAddressesKnown(peer).into());
        }

        let result = smart_dial(
            self.inner.config.dialer,
            self.inner.transport.clone(),
            self.inner.upgrade_config.clone(),
            peer,
            &addresses,
        )
        .await;

        let outcome: Result<ConnectionId, String> = match result {
            Ok(outcome) => match self.inner.resources.reserve_outbound_connection(peer) {
                Ok(reservation) => {
                    let id =
                        self.inner
                            .pool
                            .add_connecting(peer, outcome.address.clone(), Direction::Outbound, false);
                    if self.resolve_simultaneous_connect(peer, id, Direction::Outbound) {
                        self.inner.backoff.record_success(peer);
                        self.inner.address_book.add(peer, outcome.address);
                        Ok(id)
                    } else {
                        let became_connected = self.inner.pool.update_connection(id, outcome.connection);
                        self.inner.pool.with_entry_mut(id, |entry| {
                            entry.reservation = Some(reservation);
                            entry.reconnect_address = Some(entry.address.clone());
                        });
                        self.inner.backoff.record_success(peer);
                        self.inner.address_book.add(peer, outcome.address);
                        self.spawn_inbound_stream_dispatcher(id, peer);
                        if became_connected {
                            self.emit(NodeEvent::PeerConnected(peer));
                        }
                        Ok(id)
                    }
                }
                Err(_) => {
                    self.inner.backoff.record_failure(peer);
                    Err("resource limit exceeded".to_string())
                }
            },
            Err(err) => {
                self.inner.backoff.record_failure(peer);
                Err(err.to_string())
            }
        };

        let final_result = outcome.clone().map(|_| ()).map_err(|_| DialError::AllDialsFailed);
        pending.resolve(outcome);
        self.inner.pool.remove_pending_dial(peer);
        final_result.map_err(NodeError::from)
    }

    /// Opens a new outbound stream to an already-connected peer for
    /// `protocol`.
    pub async fn new_stream(&self, peer: PeerId, protocol: &str) -> Result<BoxStream, NodeError> {
        let id = self
            .inner
            .pool
            .connection_for(peer)
            .ok_or(NodeError::NotConnected(peer))?;
        let reservation = self.inner.resources.reserve_outbound_stream(protocol)?;

        let mut taken = self
            .inner
            .pool
            .with_entry_mut(id, |entry| entry.connection.take())
            .flatten()
            .ok_or(NodeError::NotConnected(peer))?;
        let stream = taken.open_stream().await.map_err(meshnet_core::Error::Io);
        self.inner.pool.with_entry_mut(id, |entry| entry.connection = Some(taken));

        let stream = stream?;
        let protocols = vec![protocol.to_string()];
        let negotiated = dialer_select_proto(stream, &protocols, Version::V1Lazy, 64 * 1024)
            .await
            .map_err(|_| meshnet_core::Error::ProtocolNegotiationFailed)?;
        Ok(Box::new(ReservedStream {
            inner: BufferedMuxedStream::wrap(negotiated.remainder, negotiated.stream),
            _reservation: reservation,
        }))
    }

    async fn idle_check_loop(&self) {
        let idle_timeout = self.inner.config.idle_timeout;
        let mut ticker = tokio::time::interval(idle_timeout / 2);
        loop {
            ticker.tick().await;
            if !self.inner.running.load(Ordering::SeqCst) {
                break;
            }

            for id in self.inner.pool.idle_connections(idle_timeout) {
                if let Some(entry) = self.inner.pool.remove(id) {
                    log::debug!("closing idle connection to {}", entry.peer);
                    self.emit(NodeEvent::PeerDisconnected(entry.peer));
                    self.emit(NodeEvent::Connection(ConnectionEvent::Disconnected {
                        peer: entry.peer,
                        reason: DisconnectReason::IdleTimeout,
                    }));
                }
            }

            let report = self.inner.pool.trim_report();
            if report.target_trim_count > report.trimmable {
                log::warn!(
                    "wanted to trim {} connections but only {} are eligible",
                    report.target_trim_count,
                    report.trimmable
                );
                self.emit(NodeEvent::Connection(ConnectionEvent::TrimConstrained {
                    wanted: report.target_trim_count,
                    trimmed: report.trimmable,
                }));
            }
            for entry in self.inner.pool.trim_if_needed() {
                self.emit(NodeEvent::Connection(ConnectionEvent::Trimmed { peer: entry.peer }));
            }

            self.inner.pool.cleanup_stale_entries(self.inner.config.idle_timeout * 4);
            self.inner.backoff.cleanup();
        }
    }

    async fn health_check_loop(&self) {
        let monitor = HealthMonitor::new(self.inner.config.health, Arc::downgrade(&self.inner.pool));
        let mut ticker = tokio::time::interval(monitor.config().probe_interval);
        loop {
            ticker.tick().await;
            if !self.inner.running.load(Ordering::SeqCst) {
                break;
            }
            if let Some(report) = monitor.sweep() {
                for peer in report.unhealthy {
                    self.emit(NodeEvent::Connection(ConnectionEvent::HealthCheckFailed { peer }));
                    for entry in self.inner.pool.remove_for_peer(peer) {
                        self.emit(NodeEvent::PeerDisconnected(entry.peer));
                        self.emit(NodeEvent::Connection(ConnectionEvent::Disconnected {
                            peer: entry.peer,
                            reason: DisconnectReason::TransportError,
                        }));
                    }
                }
            }
        }
    }

    /// Stops accepting new connections and streams, and closes every
    /// currently `connected` pool entry. Entries still `connecting` are
    /// left for their own task to resolve and clean up.
    pub async fn shutdown(&self) {
        self.inner.running.store(false, Ordering::SeqCst);
        for id in self.inner.pool.connected_ids() {
            if let Some(mut entry) = self.inner.pool.remove(id) {
                if let Some(mut connection) = entry.connection.take() {
                    let _ = connection.close().await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshnet_core::{security::XorSecurityUpgrader, MemoryNetwork, MemoryTransport, SimpleMuxer};

    fn config(local_peer: PeerId, listen: Vec<Multiaddr>) -> NodeConfiguration {
        NodeConfiguration {
            local_peer,
            listen_addresses: listen,
            pool: PoolConfig::default(),
            dialer: DialerConfig::default(),
            backoff: BackoffConfig::default(),
            reconnect: ReconnectPolicy::default(),
            health: HealthConfig::default(),
            idle_timeout: Duration::from_secs(300),
            observed_address_confirmations: 3,
            resource_limits: Limits::default(),
        }
    }

    fn upgrade_config(keys: Keypair) -> UpgradeConfig {
        UpgradeConfig {
            security_upgraders: vec![Arc::new(XorSecurityUpgrader::new(keys))],
            muxers: vec![Arc::new(SimpleMuxer::default())],
            max_message_size: 64 * 1024,
        }
    }

    #[tokio::test]
    async fn two_nodes_connect_over_memory_transport_and_emit_peer_connected() {
        let _ = env_logger::try_init();
        let network = MemoryNetwork::new();
        let server_keys = Keypair::generate();
        let client_keys = Keypair::generate();
        let server_peer = server_keys.public().to_peer_id();
        let client_peer = client_keys.public().to_peer_id();

        let server_listen: Multiaddr = "/memory/9500".parse().unwrap();
        let (server, mut server_events) = NodeBuilder::new(
            config(server_peer, vec![server_listen.clone()]),
            Arc::new(MemoryTransport::new(network.clone())),
            upgrade_config(server_keys),
        )
        .build();
        server.start().await.unwrap();

        let (client, mut client_events) = NodeBuilder::new(
            config(client_peer, vec![]),
            Arc::new(MemoryTransport::new(network)),
            upgrade_config(client_keys),
        )
        .build();
        client.start().await.unwrap();

        let connected_peer = client
            .connect_address(server_listen, Some(server_peer))
            .await
            .unwrap();
        assert_eq!(connected_peer, server_peer);

        let event = tokio::time::timeout(Duration::from_secs(1), client_events.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(event, NodeEvent::PeerConnected(peer) if peer == server_peer));

        let server_event = tokio::time::timeout(Duration::from_secs(1), server_events.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(server_event, NodeEvent::PeerConnected(_)));
    }
}

//! The responding side of AutoNAT v2: rate-limits dial-request streams,
//! checks the requested address against the client's observed IP, and
//! dials the client back to deliver a nonce on success.

use std::collections::HashMap;
use std::ops::RangeInclusive;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use meshnet_identity::PeerId;
use meshnet_multiaddr::{Multiaddr, Protocol};
use meshnet_multistream_select::{dialer_select_proto, BufferedFramer, Version};
use meshnet_swarm::{Node, StreamContext};
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::client::write_message;
use crate::wire::{decode_message, DialBack, DialResponse, Message, Status};
use crate::{DIAL_BACK_PROTOCOL, DIAL_REQUEST_PROTOCOL};

const MAX_MESSAGE_SIZE: usize = 4 * 1024;

pub struct ServerConfig {
    pub rate_limit_window: Duration,
    pub per_peer_request_limit: usize,
    pub per_peer_concurrent_dial_backs: usize,
    pub rejection_backoff: Duration,
    pub global_concurrent_dial_backs: usize,
    pub global_request_limit: usize,
    pub allowed_ports: Option<RangeInclusive<u16>>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            rate_limit_window: Duration::from_secs(60),
            per_peer_request_limit: 10,
            per_peer_concurrent_dial_backs: 3,
            rejection_backoff: Duration::from_secs(30),
            global_concurrent_dial_backs: 50,
            global_request_limit: 500,
            allowed_ports: None,
        }
    }
}

#[derive(Debug, Clone)]
pub enum ServerEvent {
    Accepted { peer: PeerId },
    RateLimited { peer: PeerId, reason: RejectReason },
    DialBackSucceeded { peer: PeerId, address: Multiaddr },
    DialBackFailed { peer: PeerId, address: Multiaddr },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    PerPeerRequestLimit,
    PerPeerConcurrentDialBacks,
    InBackoff,
    GlobalConcurrentDialBacks,
    GlobalRequestLimit,
    AddressIpMismatch,
    PortNotAllowed,
    MalformedRequest,
}

#[derive(Debug)]
struct PeerState {
    window_start: Instant,
    requests_in_window: usize,
    concurrent_dial_backs: usize,
    rejected_until: Option<Instant>,
}

impl PeerState {
    fn fresh(now: Instant) -> Self {
        PeerState {
            window_start: now,
            requests_in_window: 0,
            concurrent_dial_backs: 0,
            rejected_until: None,
        }
    }
}

#[derive(Debug)]
struct GlobalState {
    window_start: Instant,
    requests_in_window: usize,
}

#[derive(Debug)]
struct RateLimiter {
    config_window: Duration,
    per_peer_request_limit: usize,
    per_peer_concurrent_dial_backs: usize,
    rejection_backoff: Duration,
    global_request_limit: usize,
    global_concurrent_dial_backs: AtomicUsize,
    peers: Mutex<HashMap<PeerId, PeerState>>,
    global: Mutex<GlobalState>,
}

/// Returned to the caller so the concurrent dial-back counters (per-peer
/// and global) are decremented exactly once, whether the dial-back
/// succeeds, fails, or the server task panics.
#[derive(Debug)]
struct DialBackSlot<'a> {
    limiter: &'a RateLimiter,
    peer: PeerId,
}

impl Drop for DialBackSlot<'_> {
    fn drop(&mut self) {
        self.limiter.global_concurrent_dial_backs.fetch_sub(1, Ordering::SeqCst);
        if let Some(state) = self.limiter.peers.lock().get_mut(&self.peer) {
            state.concurrent_dial_backs = state.concurrent_dial_backs.saturating_sub(1);
        }
    }
}

impl RateLimiter {
    fn new(config: &ServerConfig) -> Self {
        RateLimiter {
            config_window: config.rate_limit_window,
            per_peer_request_limit: config.per_peer_request_limit,
            per_peer_concurrent_dial_backs: config.per_peer_concurrent_dial_backs,
            rejection_backoff: config.rejection_backoff,
            global_request_limit: config.global_request_limit,
            global_concurrent_dial_backs: AtomicUsize::new(0),
            peers: Mutex::new(HashMap::new()),
            global: Mutex::new(GlobalState { window_start: Instant::now(), requests_in_window: 0 }),
        }
    }

    /// Enforces every gate in one place; reserves a dial-back slot on
    /// success. `global_concurrent_dial_backs` is checked against the
    /// configured cap even though it lives outside `global` (it is read
    /// far more often than the request-window counters and shouldn't
    /// contend with them for the same lock).
    fn admit(&self, peer: PeerId, global_cap: usize) -> Result<DialBackSlot<'_>, RejectReason> {
        let now = Instant::now();

        {
            let mut global = self.global.lock();
            if now.duration_since(global.window_start) >= self.config_window {
                global.window_start = now;
                global.requests_in_window = 0;
            }
            if global.requests_in_window >= self.global_request_limit {
                return Err(RejectReason::GlobalRequestLimit);
            }
            global.requests_in_window += 1;
        }

        if self.global_concurrent_dial_backs.load(Ordering::SeqCst) >= global_cap {
            return Err(RejectReason::GlobalConcurrentDialBacks);
        }

        {
            let mut peers = self.peers.lock();
            let state = peers.entry(peer).or_insert_with(|| PeerState::fresh(now));

            if let Some(until) = state.rejected_until {
                if now < until {
                    return Err(RejectReason::InBackoff);
                }
                state.rejected_until = None;
            }

            if now.duration_since(state.window_start) >= self.config_window {
                state.window_start = now;
                state.requests_in_window = 0;
            }
            if state.requests_in_window >= self.per_peer_request_limit {
                state.rejected_until = Some(now + self.rejection_backoff);
                return Err(RejectReason::PerPeerRequestLimit);
            }
            if state.concurrent_dial_backs >= self.per_peer_concurrent_dial_backs {
                state.rejected_until = Some(now + self.rejection_backoff);
                return Err(RejectReason::PerPeerConcurrentDialBacks);
            }

            state.requests_in_window += 1;
            state.concurrent_dial_backs += 1;
        }

        self.global_concurrent_dial_backs.fetch_add(1, Ordering::SeqCst);
        Ok(DialBackSlot { limiter: self, peer })
    }
}

/// The address-identifying component of a `Multiaddr`, ignoring transport
/// and port. Usually an IP; `Memory`/`Unix` stand in for it on the
/// transports this workspace tests against, which never carry a real IP.
#[derive(PartialEq, Eq)]
enum HostKey {
    Ip(std::net::IpAddr),
    Dns(String),
    Memory(u64),
    Unix(String),
}

fn host_key(addr: &Multiaddr) -> Option<HostKey> {
    addr.iter().find_map(|proto| match proto {
        Protocol::Ip4(ip) => Some(HostKey::Ip(std::net::IpAddr::V4(*ip))),
        Protocol::Ip6(ip) => Some(HostKey::Ip(std::net::IpAddr::V6(*ip))),
        Protocol::Dns(name) | Protocol::Dns4(name) | Protocol::Dns6(name) => {
            Some(HostKey::Dns(name.clone()))
        }
        Protocol::Memory(id) => Some(HostKey::Memory(*id)),
        Protocol::Unix(path) => Some(HostKey::Unix(path.clone())),
        _ => None,
    })
}

/// The amplification defence: the address the client asked us to dial
/// must be the one we actually observed it connecting from, so a peer
/// cannot get us to dial a third party on its behalf.
fn ip_matches(requested: &Multiaddr, observed: &Multiaddr) -> bool {
    matches!((host_key(requested), host_key(observed)), (Some(a), Some(b)) if a == b)
}

fn port_of(addr: &Multiaddr) -> Option<u16> {
    addr.iter().find_map(|proto| match proto {
        Protocol::Tcp(port) | Protocol::Udp(port) => Some(*port),
        _ => None,
    })
}

/// Answers dial-request streams for `node`. Keep the returned handle alive
/// for as long as the service should keep running; dropping it only
/// drops the rate-limiter state, since the handler closure itself holds
/// its own clone registered with the node.
pub struct Server {
    node: Node,
    config: ServerConfig,
    limiter: RateLimiter,
    events_tx: mpsc::UnboundedSender<ServerEvent>,
}

impl Server {
    /// Builds the server and registers its dial-request handler on
    /// `node`. Returns the handle plus a receiver for rate-limit and
    /// dial-back outcome events.
    pub fn install(node: Node, config: ServerConfig) -> (Arc<Server>, mpsc::UnboundedReceiver<ServerEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let limiter = RateLimiter::new(&config);
        let server = Arc::new(Server { node: node.clone(), config, limiter, events_tx });

        let handler_server = server.clone();
        node.register_handler(DIAL_REQUEST_PROTOCOL, move |context: StreamContext| -> BoxFuture<'static, ()> {
            let server = handler_server.clone();
            Box::pin(async move { server.handle_dial_request(context).await })
        });

        (server, events_rx)
    }

    fn emit(&self, event: ServerEvent) {
        let _ = self.events_tx.send(event);
    }

    async fn handle_dial_request(&self, context: StreamContext) {
        let StreamContext { stream, remote_peer, .. } = context;
        let mut framer = BufferedFramer::new(stream, MAX_MESSAGE_SIZE);

        let request = match framer.read_message().await {
            Ok(bytes) => match decode_message(&bytes) {
                Ok(Message::DialRequest(request)) => request,
                _ => {
                    self.emit(ServerEvent::RateLimited { peer: remote_peer, reason: RejectReason::MalformedRequest });
                    let _ = write_message(
                        &mut framer,
                        &Message::DialResponse(DialResponse { status: Status::BadRequest, address: None }),
                    )
                    .await;
                    return;
                }
            },
            Err(_) => return,
        };

        let reply = self.evaluate_and_dial_back(remote_peer, request.address.clone(), request.nonce).await;
        let _ = write_message(&mut framer, &Message::DialResponse(reply)).await;
    }

    async fn evaluate_and_dial_back(&self, peer: PeerId, address: Multiaddr, nonce: u64) -> DialResponse {
        let Some(observed) = self.node.remote_address_of(peer) else {
            return DialResponse { status: Status::InternalError, address: None };
        };
        if !ip_matches(&address, &observed) {
            self.emit(ServerEvent::RateLimited { peer, reason: RejectReason::AddressIpMismatch });
            return DialResponse { status: Status::BadRequest, address: None };
        }
        if let Some(allowed) = &self.config.allowed_ports {
            let port_ok = matches!(port_of(&address), Some(port) if allowed.contains(&port));
            if !port_ok {
                self.emit(ServerEvent::RateLimited { peer, reason: RejectReason::PortNotAllowed });
                return DialResponse { status: Status::BadRequest, address: None };
            }
        }

        let slot = match self.limiter.admit(peer, self.config.global_concurrent_dial_backs) {
            Ok(slot) => slot,
            Err(reason) => {
                self.emit(ServerEvent::RateLimited { peer, reason });
                return DialResponse { status: Status::BadRequest, address: None };
            }
        };
        self.emit(ServerEvent::Accepted { peer });

        let status = self.dial_back(peer, address.clone(), nonce).await;
        drop(slot);

        match status {
            Ok(()) => {
                self.emit(ServerEvent::DialBackSucceeded { peer, address: address.clone() });
                DialResponse { status: Status::Ok, address: Some(address) }
            }
            Err(DialBackError::Dial) => {
                self.emit(ServerEvent::DialBackFailed { peer, address: address.clone() });
                DialResponse { status: Status::DialError, address: Some(address) }
            }
            Err(DialBackError::Notify) => {
                self.emit(ServerEvent::DialBackFailed { peer, address: address.clone() });
                DialResponse { status: Status::DialBackError, address: Some(address) }
            }
        }
    }

    async fn dial_back(&self, expected_peer: PeerId, address: Multiaddr, nonce: u64) -> Result<(), DialBackError> {
        self.node
            .connect_address(address, Some(expected_peer))
            .await
            .map_err(|_| DialBackError::Dial)?;

        let stream = self
            .node
            .new_stream(expected_peer, DIAL_BACK_PROTOCOL)
            .await
            .map_err(|_| DialBackError::Notify)?;
        let protocols = vec![DIAL_BACK_PROTOCOL.to_string()];
        let negotiated = dialer_select_proto(stream, &protocols, Version::V1Lazy, MAX_MESSAGE_SIZE)
            .await
            .map_err(|_| DialBackError::Notify)?;
        let mut framer = BufferedFramer::new(negotiated.stream, MAX_MESSAGE_SIZE);
        write_message(&mut framer, &Message::DialBack(DialBack { nonce }))
            .await
            .map_err(|_| DialBackError::Notify)
    }
}

enum DialBackError {
    Dial,
    Notify,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ip_match_ignores_port() {
        let requested: Multiaddr = "/ip4/203.0.113.9/tcp/4001".parse().unwrap();
        let observed: Multiaddr = "/ip4/203.0.113.9/tcp/55234".parse().unwrap();
        assert!(ip_matches(&requested, &observed));
    }

    #[test]
    fn ip_mismatch_is_detected() {
        let requested: Multiaddr = "/ip4/203.0.113.9/tcp/4001".parse().unwrap();
        let observed: Multiaddr = "/ip4/198.51.100.2/tcp/4001".parse().unwrap();
        assert!(!ip_matches(&requested, &observed));
    }

    #[test]
    fn memory_addresses_match_by_id_not_by_ip() {
        let requested: Multiaddr = "/memory/42".parse().unwrap();
        let observed: Multiaddr = "/memory/42".parse().unwrap();
        assert!(ip_matches(&requested, &observed));

        let other: Multiaddr = "/memory/7".parse().unwrap();
        assert!(!ip_matches(&requested, &other));
    }

    #[test]
    fn per_peer_request_limit_rejects_after_the_cap_and_then_backs_off() {
        let config = ServerConfig { per_peer_request_limit: 2, ..ServerConfig::default() };
        let limiter = RateLimiter::new(&config);
        let peer = meshnet_identity::Keypair::generate().public().to_peer_id();

        assert!(limiter.admit(peer, config.global_concurrent_dial_backs).is_ok());
        drop(limiter.admit(peer, config.global_concurrent_dial_backs).unwrap());
        assert_eq!(
            limiter.admit(peer, config.global_concurrent_dial_backs).unwrap_err(),
            RejectReason::PerPeerRequestLimit
        );
    }

    #[test]
    fn per_peer_concurrent_dial_back_cap_is_enforced_while_slots_are_held() {
        let config = ServerConfig {
            per_peer_request_limit: 100,
            per_peer_concurrent_dial_backs: 1,
            ..ServerConfig::default()
        };
        let limiter = RateLimiter::new(&config);
        let peer = meshnet_identity::Keypair::generate().public().to_peer_id();

        let held = limiter.admit(peer, config.global_concurrent_dial_backs).unwrap();
        assert_eq!(
            limiter.admit(peer, config.global_concurrent_dial_backs).unwrap_err(),
            RejectReason::PerPeerConcurrentDialBacks
        );
        drop(held);
        assert!(limiter.admit(peer, config.global_concurrent_dial_backs).is_ok());
    }

    #[test]
    fn global_concurrent_dial_back_cap_is_enforced_across_peers() {
        let config = ServerConfig { per_peer_request_limit: 100, ..ServerConfig::default() };
        let limiter = RateLimiter::new(&config);
        let peer_a = meshnet_identity::Keypair::generate().public().to_peer_id();
        let peer_b = meshnet_identity::Keypair::generate().public().to_peer_id();

        let held = limiter.admit(peer_a, 1).unwrap();
        assert_eq!(limiter.admit(peer_b, 1).unwrap_err(), RejectReason::GlobalConcurrentDialBacks);
        drop(held);
        assert!(limiter.admit(peer_b, 1).is_ok());
    }
}

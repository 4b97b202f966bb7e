//! Three-scope resource accounting (system, peer, protocol) gating dials,
//! inbound accepts, and stream opens before any bytes move, so a single
//! abusive peer or protocol can't exhaust node-wide capacity. Each scope
//! tracks inbound and outbound connections and streams separately, since a
//! peer that floods inbound dials shouldn't be able to starve the same
//! peer's outbound budget and vice versa.
//!
//! Per-connection/per-stream memory footprint is not modeled here: nothing
//! in this workspace's transports exposes a byte-size estimate to reserve
//! against (the same way specific transport byte pipes are collaborators
//! whose internals this stack doesn't own), so there is no `memory` counter
//! to wire up yet.

use std::collections::HashMap;
use std::sync::Arc;

use meshnet_identity::PeerId;
use parking_lot::Mutex;

use crate::connection::Direction;
use crate::error::{Error, ResourceScope};

#[derive(Debug, Clone, Copy)]
pub struct Limits {
    pub max_pending_dials: u32,
    pub max_connections: u32,
    pub max_connections_per_peer: u32,
    pub max_streams_per_protocol: u32,
}

impl Default for Limits {
    fn default() -> Self {
        Limits {
            max_pending_dials: 64,
            max_connections: 512,
            max_connections_per_peer: 8,
            max_streams_per_protocol: 1024,
        }
    }
}

/// Inbound/outbound counters held by a single scope (system, one peer, or
/// one protocol).
#[derive(Debug, Default, Clone, Copy)]
struct ScopeCounters {
    inbound_connections: u32,
    outbound_connections: u32,
    inbound_streams: u32,
    outbound_streams: u32,
}

impl ScopeCounters {
    fn connections(&self) -> u32 {
        self.inbound_connections + self.outbound_connections
    }

    fn streams(&self) -> u32 {
        self.inbound_streams + self.outbound_streams
    }
}

#[derive(Default)]
struct Counters {
    pending_dials: u32,
    system: ScopeCounters,
    per_peer: HashMap<PeerId, ScopeCounters>,
    per_protocol: HashMap<String, ScopeCounters>,
}

/// Tracks outstanding reservations against the configured [`Limits`].
/// Cheap to clone and share: the counters live behind a lock, reservations
/// are returned as RAII guards that release on drop.
#[derive(Clone)]
pub struct ResourceManager {
    inner: Arc<ResourceManagerInner>,
}

struct ResourceManagerInner {
    limits: Limits,
    state: Mutex<Counters>,
}

impl ResourceManager {
    pub fn new(limits: Limits) -> Self {
        ResourceManager {
            inner: Arc::new(ResourceManagerInner {
                limits,
                state: Mutex::new(Counters::default()),
            }),
        }
    }

    pub fn limits(&self) -> Limits {
        self.inner.limits
    }

    pub fn reserve_pending_dial(&self) -> Result<PendingDialReservation, Error> {
        let mut state = self.inner.state.lock();
        if state.pending_dials >= self.inner.limits.max_pending_dials {
            return Err(Error::ResourceLimitExceeded {
                scope: ResourceScope::System,
                resource: "pending_dials".to_string(),
            });
        }
        state.pending_dials += 1;
        Ok(PendingDialReservation {
            inner: self.inner.clone(),
        })
    }

    pub fn reserve_inbound_connection(&self, peer: PeerId) -> Result<ConnectionReservation, Error> {
        self.reserve_connection(peer, Direction::Inbound)
    }

    pub fn reserve_outbound_connection(&self, peer: PeerId) -> Result<ConnectionReservation, Error> {
        self.reserve_connection(peer, Direction::Outbound)
    }

    fn reserve_connection(&self, peer: PeerId, direction: Direction) -> Result<ConnectionReservation, Error> {
        let mut state = self.inner.state.lock();
        if state.system.connections() >= self.inner.limits.max_connections {
            return Err(Error::ResourceLimitExceeded {
                scope: ResourceScope::System,
                resource: "connections".to_string(),
            });
        }
        let per_peer = state.per_peer.entry(peer).or_default();
        if per_peer.connections() >= self.inner.limits.max_connections_per_peer {
            return Err(Error::ResourceLimitExceeded {
                scope: ResourceScope::Peer,
                resource: "connections".to_string(),
            });
        }
        match direction {
            Direction::Inbound => {
                per_peer.inbound_connections += 1;
                state.system.inbound_connections += 1;
            }
            Direction::Outbound => {
                per_peer.outbound_connections += 1;
                state.system.outbound_connections += 1;
            }
        }
        Ok(ConnectionReservation {
            inner: self.inner.clone(),
            peer,
            direction,
        })
    }

    pub fn reserve_inbound_stream(&self, protocol: &str) -> Result<StreamReservation, Error> {
        self.reserve_stream(protocol, Direction::Inbound)
    }

    pub fn reserve_outbound_stream(&self, protocol: &str) -> Result<StreamReservation, Error> {
        self.reserve_stream(protocol, Direction::Outbound)
    }

    fn reserve_stream(&self, protocol: &str, direction: Direction) -> Result<StreamReservation, Error> {
        let mut state = self.inner.state.lock();
        let scope = state.per_protocol.entry(protocol.to_string()).or_default();
        if scope.streams() >= self.inner.limits.max_streams_per_protocol {
            return Err(Error::ResourceLimitExceeded {
                scope: ResourceScope::Protocol,
                resource: protocol.to_string(),
            });
        }
        match direction {
            Direction::Inbound => scope.inbound_streams += 1,
            Direction::Outbound => scope.outbound_streams += 1,
        }
        Ok(StreamReservation {
            inner: self.inner.clone(),
            protocol: protocol.to_string(),
            direction,
        })
    }

    pub fn connection_count(&self) -> u32 {
        self.inner.state.lock().system.connections()
    }

    pub fn connection_count_for_peer(&self, peer: PeerId) -> u32 {
        self.inner
            .state
            .lock()
            .per_peer
            .get(&peer)
            .map(ScopeCounters::connections)
            .unwrap_or(0)
    }
}

pub struct PendingDialReservation {
    inner: Arc<ResourceManagerInner>,
}

impl Drop for PendingDialReservation {
    fn drop(&mut self) {
        self.inner.state.lock().pending_dials -= 1;
    }
}

pub struct ConnectionReservation {
    inner: Arc<ResourceManagerInner>,
    peer: PeerId,
    direction: Direction,
}

impl Drop for ConnectionReservation {
    fn drop(&mut self) {
        let mut state = self.inner.state.lock();
        match self.direction {
            Direction::Inbound => {
                state.system.inbound_connections = state.system.inbound_connections.saturating_sub(1);
            }
            Direction::Outbound => {
                state.system.outbound_connections = state.system.outbound_connections.saturating_sub(1);
            }
        }
        if let Some(scope) = state.per_peer.get_mut(&self.peer) {
            match self.direction {
                Direction::Inbound => scope.inbound_connections = scope.inbound_connections.saturating_sub(1),
                Direction::Outbound => scope.outbound_connections = scope.outbound_connections.saturating_sub(1),
            }
            if scope.connections() == 0 && scope.streams() == 0 {
                state.per_peer.remove(&self.peer);
            }
        }
    }
}

pub struct StreamReservation {
    inner: Arc<ResourceManagerInner>,
    protocol: String,
    direction: Direction,
}

impl Drop for StreamReservation {
    fn drop(&mut self) {
        let mut state = self.inner.state.lock();
        if let Some(scope) = state.per_protocol.get_mut(&self.protocol) {
            match self.direction {
                Direction::Inbound => scope.inbound_streams = scope.inbound_streams.saturating_sub(1),
                Direction::Outbound => scope.outbound_streams = scope.outbound_streams.saturating_sub(1),
            }
            if scope.connections() == 0 && scope.streams() == 0 {
                state.per_protocol.remove(&self.protocol);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshnet_identity::Keypair;

    fn peer() -> PeerId {
        Keypair::generate().public().to_peer_id()
    }

    #[test]
    fn connection_reservation_releases_on_drop() {
        let manager = ResourceManager::new(Limits {
            max_connections: 1,
            ..Limits::default()
        });
        let peer = peer();
        let first = manager.reserve_outbound_connection(peer).unwrap();
        assert!(manager.reserve_inbound_connection(peer).is_err());
        drop(first);
        assert!(manager.reserve_inbound_connection(peer).is_ok());
    }

    #[test]
    fn per_peer_limit_is_independent_of_system_limit() {
        let manager = ResourceManager::new(Limits {
            max_connections: 100,
            max_connections_per_peer: 1,
            ..Limits::default()
        });
        let a = peer();
        let b = peer();
        let _a1 = manager.reserve_outbound_connection(a).unwrap();
        assert!(manager.reserve_inbound_connection(a).is_err());
        assert!(manager.reserve_inbound_connection(b).is_ok());
    }

    #[test]
    fn inbound_and_outbound_connections_are_counted_separately_but_share_the_per_peer_cap() {
        let manager = ResourceManager::new(Limits {
            max_connections_per_peer: 2,
            ..Limits::default()
        });
        let peer = peer();
        let _in = manager.reserve_inbound_connection(peer).unwrap();
        let _out = manager.reserve_outbound_connection(peer).unwrap();
        assert_eq!(manager.connection_count_for_peer(peer), 2);
        assert!(manager.reserve_inbound_connection(peer).is_err());
    }

    #[test]
    fn stream_reservation_is_scoped_per_protocol_and_direction() {
        let manager = ResourceManager::new(Limits {
            max_streams_per_protocol: 1,
            ..Limits::default()
        });
        let _ping = manager.reserve_outbound_stream("/ping/1.0.0").unwrap();
        assert!(manager.reserve_inbound_stream("/ping/1.0.0").is_err());
        assert!(manager.reserve_inbound_stream("/identify/1.0.0").is_ok());
    }
}

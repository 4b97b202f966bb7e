//! The pool's entry type and the state machine it moves through, adapted
//! from the `ConnectionId`/connection-lifecycle bookkeeping idiom of the
//! original Rust `Connection` type onto our simpler pool-owned model (no
//! generic `ConnectionHandler` — the Node dispatches streams directly).

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;

use meshnet_core::{BoxMuxedConnection, ConnectionReservation, Direction};
use meshnet_identity::PeerId;
use meshnet_multiaddr::Multiaddr;

static NEXT_CONNECTION_ID: AtomicUsize = AtomicUsize::new(1);

/// Opaque identifier for a pool entry, unique and never reused for the
/// lifetime of a process.
#[derive(Debug, Copy, Clone, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct ConnectionId(usize);

impl ConnectionId {
    pub(crate) fn next() -> Self {
        ConnectionId(NEXT_CONNECTION_ID.fetch_add(1, Ordering::SeqCst))
    }
}

/// Where a `ManagedConnection` sits in its lifecycle. See the pool module
/// documentation for the full transition diagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Connected,
    Disconnected,
    Reconnecting,
    Failed,
}

/// A single pool-owned connection record. `tags` is a multiset (repeats
/// increment the same entry's count) used by the trim ranking rule.
pub struct ManagedConnection {
    pub id: ConnectionId,
    pub peer: PeerId,
    pub address: Multiaddr,
    pub direction: Direction,
    pub is_limited: bool,
    pub state: ConnectionState,
    tags: std::collections::HashMap<String, u32>,
    pub protected: bool,
    pub connected_at: Instant,
    pub last_activity: Instant,
    pub retry_count: u32,
    pub reconnect_address: Option<Multiaddr>,
    pub connection: Option<BoxMuxedConnection>,
    /// Released automatically when the entry is dropped from the pool's
    /// table, whichever of add/accept path reserved it.
    pub reservation: Option<ConnectionReservation>,
}

impl ManagedConnection {
    pub fn new_connecting(peer: PeerId, address: Multiaddr, direction: Direction, is_limited: bool) -> Self {
        let now = Instant::now();
        ManagedConnection {
            id: ConnectionId::next(),
            peer,
            address,
            direction,
            is_limited,
            state: ConnectionState::Connecting,
            tags: std::collections::HashMap::new(),
            protected: false,
            connected_at: now,
            last_activity: now,
            retry_count: 0,
            reconnect_address: None,
            connection: None,
            reservation: None,
        }
    }

    pub fn promote(&mut self, connection: BoxMuxedConnection) {
        self.connection = Some(connection);
        self.state = ConnectionState::Connected;
        let now = Instant::now();
        self.connected_at = now;
        self.last_activity = now;
    }

    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    pub fn tag(&mut self, name: &str) {
        *self.tags.entry(name.to_string()).or_insert(0) += 1;
    }

    pub fn untag(&mut self, name: &str) {
        if let Some(count) = self.tags.get_mut(name) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                self.tags.remove(name);
            }
        }
    }

    pub fn tag_count(&self) -> u32 {
        self.tags.values().sum()
    }

    pub fn idle_duration(&self) -> std::time::Duration {
        self.last_activity.elapsed()
    }

    pub fn has_open_streams(&self) -> bool {
        // The toy muxer does not expose a live stream count; a connection
        // is considered idle purely on `last_activity` recency.
        false
    }
}

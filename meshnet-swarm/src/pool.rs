//! Owns every `ManagedConnection`, keyed by `ConnectionId` with a
//! secondary index by `PeerId`. All operations lock a single internal
//! mutex and return promptly — no suspension happens while the lock is
//! held, matching the "non-suspending mutex acquisition" rule the rest of
//! the node relies on.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use meshnet_core::{BoxMuxedConnection, Direction};
use meshnet_identity::PeerId;
use meshnet_multiaddr::Multiaddr;
use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::connection::{ConnectionId, ConnectionState, ManagedConnection};

#[derive(Debug, Clone, Copy)]
pub struct PoolConfig {
    pub high_watermark: usize,
    pub low_watermark: usize,
    pub grace_period: Duration,
    pub max_connections_per_peer: u32,
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfig {
            high_watermark: 128,
            low_watermark: 96,
            grace_period: Duration::from_secs(20),
            max_connections_per_peer: 4,
        }
    }
}

/// A candidate considered by a trim pass, in the shape the pool reports
/// it for diagnostics regardless of whether it was ultimately selected.
#[derive(Debug, Clone)]
pub struct TrimCandidate {
    pub id: ConnectionId,
    pub peer: PeerId,
    pub rank: usize,
    pub tag_count: u32,
    pub idle_duration: Duration,
    pub direction: Direction,
    pub selected_for_trim: bool,
}

#[derive(Debug, Clone)]
pub struct TrimReport {
    pub active_count: usize,
    pub target_trim_count: usize,
    pub trimmable: usize,
    pub candidates: Vec<TrimCandidate>,
    pub selected_count: usize,
}

struct PendingDialState {
    result: Mutex<Option<Result<ConnectionId, String>>>,
    notify: Notify,
}

/// A dial in flight for some peer; additional `connect()` calls for the
/// same peer join this instead of starting a second dial.
#[derive(Clone)]
pub struct PendingDial {
    state: Arc<PendingDialState>,
}

impl PendingDial {
    fn new() -> Self {
        PendingDial {
            state: Arc::new(PendingDialState {
                result: Mutex::new(None),
                notify: Notify::new(),
            }),
        }
    }

    pub fn resolve(&self, result: Result<ConnectionId, String>) {
        *self.state.result.lock() = Some(result);
        self.state.notify.notify_waiters();
    }

    /// Waits for the dial that owns this handle to finish and returns its
    /// outcome. Safe to call from multiple joiners.
    pub async fn join(&self) -> Result<ConnectionId, String> {
        loop {
            if let Some(result) = self.state.result.lock().clone() {
                return result;
            }
            self.state.notify.notified().await;
        }
    }
}

struct PoolState {
    entries: HashMap<ConnectionId, ManagedConnection>,
    by_peer: HashMap<PeerId, Vec<ConnectionId>>,
    pending_dials: HashMap<PeerId, PendingDial>,
}

/// Cheap to clone; every clone shares the same underlying table.
#[derive(Clone)]
pub struct Pool {
    config: PoolConfig,
    state: Arc<Mutex<PoolState>>,
}

impl Pool {
    pub fn new(config: PoolConfig) -> Self {
        Pool {
            config,
            state: Arc::new(Mutex::new(PoolState {
                entries: HashMap::new(),
                by_peer: HashMap::new(),
                pending_dials: HashMap::new(),
            })),
        }
    }

    pub fn config(&self) -> PoolConfig {
        self.config
    }

    fn index_peer(state: &mut PoolState, peer: PeerId, id: ConnectionId) {
        state.by_peer.entry(peer).or_default().push(id);
    }

    fn unindex_peer(state: &mut PoolState, peer: PeerId, id: ConnectionId) {
        if let Some(ids) = state.by_peer.get_mut(&peer) {
            ids.retain(|existing| *existing != id);
            if ids.is_empty() {
                state.by_peer.remove(&peer);
            }
        }
    }

    pub fn add_connecting(
        &self,
        peer: PeerId,
        address: Multiaddr,
        direction: Direction,
        is_limited: bool,
    ) -> ConnectionId {
        let entry = ManagedConnection::new_connecting(peer, address, direction, is_limited);
        let id = entry.id;
        let mut state = self.state.lock();
        Self::index_peer(&mut state, peer, id);
        state.entries.insert(id, entry);
        id
    }

    /// Promotes a `connecting` entry to `connected`. Returns whether this
    /// transitioned `isConnected(peer)` from false to true — callers use
    /// this to decide whether to emit `peerConnected`.
    pub fn update_connection(&self, id: ConnectionId, connection: BoxMuxedConnection) -> bool {
        let mut state = self.state.lock();
        let peer = match state.entries.get(&id) {
            Some(entry) => entry.peer,
            None => return false,
        };
        let was_connected = Self::is_connected_locked(&state, peer);
        if let Some(entry) = state.entries.get_mut(&id) {
            entry.promote(connection);
        }
        let now_connected = Self::is_connected_locked(&state, peer);
        now_connected && !was_connected
    }

    fn is_connected_locked(state: &PoolState, peer: PeerId) -> bool {
        state
            .by_peer
            .get(&peer)
            .map(|ids| {
                ids.iter().any(|id| {
                    state
                        .entries
                        .get(id)
                        .map(|e| e.state == ConnectionState::Connected)
                        .unwrap_or(false)
                })
            })
            .unwrap_or(false)
    }

    pub fn is_connected(&self, peer: PeerId) -> bool {
        Self::is_connected_locked(&self.state.lock(), peer)
    }

    pub fn set_state(&self, id: ConnectionId, new_state: ConnectionState) {
        let mut state = self.state.lock();
        if let Some(entry) = state.entries.get_mut(&id) {
            entry.state = new_state;
        }
    }

    /// Removes and returns an entry for cleanup by the caller.
    pub fn remove(&self, id: ConnectionId) -> Option<ManagedConnection> {
        let mut state = self.state.lock();
        let entry = state.entries.remove(&id)?;
        Self::unindex_peer(&mut state, entry.peer, id);
        Some(entry)
    }

    pub fn remove_for_peer(&self, peer: PeerId) -> Vec<ManagedConnection> {
        let mut state = self.state.lock();
        let ids = state.by_peer.remove(&peer).unwrap_or_default();
        ids.into_iter()
            .filter_map(|id| state.entries.remove(&id))
            .collect()
    }

    /// Looks up a connected entry for `peer` and refreshes its
    /// `last_activity`. Returns the entry's id so the caller can borrow
    /// the live connection via `with_connection`.
    pub fn connection_for(&self, peer: PeerId) -> Option<ConnectionId> {
        let mut state = self.state.lock();
        let ids = state.by_peer.get(&peer).cloned().unwrap_or_default();
        for id in ids {
            if let Some(entry) = state.entries.get_mut(&id) {
                if entry.state == ConnectionState::Connected {
                    entry.touch();
                    return Some(id);
                }
            }
        }
        None
    }

    pub fn with_entry_mut<R>(&self, id: ConnectionId, f: impl FnOnce(&mut ManagedConnection) -> R) -> Option<R> {
        let mut state = self.state.lock();
        state.entries.get_mut(&id).map(f)
    }

    pub fn tag(&self, id: ConnectionId, name: &str) {
        self.with_entry_mut(id, |e| e.tag(name));
    }

    pub fn untag(&self, id: ConnectionId, name: &str) {
        self.with_entry_mut(id, |e| e.untag(name));
    }

    pub fn protect(&self, id: ConnectionId) {
        self.with_entry_mut(id, |e| e.protected = true);
    }

    pub fn unprotect(&self, id: ConnectionId) {
        self.with_entry_mut(id, |e| e.protected = false);
    }

    pub fn connected_ids(&self) -> Vec<ConnectionId> {
        self.state
            .lock()
            .entries
            .values()
            .filter(|e| e.state == ConnectionState::Connected)
            .map(|e| e.id)
            .collect()
    }

    pub fn active_count(&self) -> usize {
        self.state
            .lock()
            .entries
            .values()
            .filter(|e| e.state == ConnectionState::Connected)
            .count()
    }

    pub fn can_dial_outbound(&self) -> bool {
        self.active_count() < self.config.high_watermark
    }

    pub fn can_accept_inbound(&self) -> bool {
        self.active_count() < self.config.high_watermark
    }

    pub fn can_connect_to(&self, peer: PeerId) -> bool {
        let state = self.state.lock();
        let count = state
            .by_peer
            .get(&peer)
            .map(|ids| {
                ids.iter()
                    .filter(|id| {
                        state
                            .entries
                            .get(id)
                            .map(|e| e.state == ConnectionState::Connected)
                            .unwrap_or(false)
                    })
                    .count()
            })
            .unwrap_or(0);
        (count as u32) < self.config.max_connections_per_peer
    }

    pub fn idle_connections(&self, threshold: Duration) -> Vec<ConnectionId> {
        self.state
            .lock()
            .entries
            .values()
            .filter(|e| {
                e.state == ConnectionState::Connected
                    && e.idle_duration() >= threshold
                    && !e.has_open_streams()
            })
            .map(|e| e.id)
            .collect()
    }

    /// Pure: reports the trim decision without mutating anything.
    pub fn trim_report(&self) -> TrimReport {
        let state = self.state.lock();
        let active: Vec<&ManagedConnection> = state
            .entries
            .values()
            .filter(|e| e.state == ConnectionState::Connected)
            .collect();
        let active_count = active.len();

        if active_count < self.config.high_watermark {
            return TrimReport {
                active_count,
                target_trim_count: 0,
                trimmable: 0,
                candidates: Vec::new(),
                selected_count: 0,
            };
        }

        let target_trim_count = active_count.saturating_sub(self.config.low_watermark);
        let now = Instant::now();

        // Sort by (protected desc, tagCount desc, connectedAt desc) so the
        // tail (least protected, least tagged, oldest) is the trim
        // candidate pool.
        let mut ranked: Vec<&ManagedConnection> = active.clone();
        ranked.sort_by(|a, b| {
            b.protected
                .cmp(&a.protected)
                .then(b.tag_count().cmp(&a.tag_count()))
                .then(b.connected_at.cmp(&a.connected_at))
        });

        let mut candidates = Vec::with_capacity(ranked.len());
        let mut selected_count = 0;
        for (rank, entry) in ranked.iter().enumerate() {
            let eligible = !entry.protected
                && now.duration_since(entry.connected_at) >= self.config.grace_period;
            let remaining_to_select = target_trim_count.saturating_sub(selected_count);
            let is_tail = rank >= active_count.saturating_sub(remaining_to_select.max(0));
            let selected = eligible && is_tail && remaining_to_select > 0;
            if selected {
                selected_count += 1;
            }
            candidates.push(TrimCandidate {
                id: entry.id,
                peer: entry.peer,
                rank,
                tag_count: entry.tag_count(),
                idle_duration: entry.idle_duration(),
                direction: entry.direction,
                selected_for_trim: selected,
            });
        }

        let trimmable = candidates.iter().filter(|c| !ranked[c.rank].protected).count();

        TrimReport {
            active_count,
            target_trim_count,
            trimmable,
            candidates,
            selected_count,
        }
    }

    /// Applies a `trim_report`'s selection, removing the chosen entries
    /// and returning them for the caller to close and emit events for.
    pub fn trim_if_needed(&self) -> Vec<ManagedConnection> {
        let report = self.trim_report();
        let mut removed = Vec::new();
        for candidate in report.candidates.iter().filter(|c| c.selected_for_trim) {
            if let Some(entry) = self.remove(candidate.id) {
                removed.push(entry);
            }
        }
        removed
    }

    /// Two-pass removal of terminal entries older than `threshold`.
    pub fn cleanup_stale_entries(&self, threshold: Duration) -> Vec<ManagedConnection> {
        let stale_ids: Vec<ConnectionId> = {
            let state = self.state.lock();
            state
                .entries
                .values()
                .filter(|e| {
                    matches!(e.state, ConnectionState::Disconnected | ConnectionState::Failed)
                        && e.idle_duration() >= threshold
                })
                .map(|e| e.id)
                .collect()
        };
        stale_ids.into_iter().filter_map(|id| self.remove(id)).collect()
    }

    pub fn register_pending_dial(&self, peer: PeerId) -> (PendingDial, bool) {
        let mut state = self.state.lock();
        if let Some(existing) = state.pending_dials.get(&peer) {
            return (existing.clone(), false);
        }
        let dial = PendingDial::new();
        state.pending_dials.insert(peer, dial.clone());
        (dial, true)
    }

    pub fn remove_pending_dial(&self, peer: PeerId) {
        self.state.lock().pending_dials.remove(&peer);
    }

    pub fn pending_dial(&self, peer: PeerId) -> Option<PendingDial> {
        self.state.lock().pending_dials.get(&peer).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshnet_identity::Keypair;

    fn peer() -> PeerId {
        Keypair::generate().public().to_peer_id()
    }

    fn addr() -> Multiaddr {
        "/ip4/127.0.0.1/tcp/4001".parse().unwrap()
    }

    #[test]
    fn add_connecting_then_remove_roundtrips() {
        let pool = Pool::new(PoolConfig::default());
        let id = pool.add_connecting(peer(), addr(), Direction::Outbound, false);
        assert!(pool.remove(id).is_some());
        assert!(pool.remove(id).is_none());
    }

    #[test]
    fn pool_trim_literal_spec_scenario() {
        let pool = Pool::new(PoolConfig {
            high_watermark: 5,
            low_watermark: 3,
            grace_period: Duration::from_secs(0),
            max_connections_per_peer: 10,
        });

        let mut ids = Vec::new();
        for _ in 0..5 {
            let id = pool.add_connecting(peer(), addr(), Direction::Outbound, false);
            // Promotion needs a connection; trim only inspects fields the
            // report reads, so bypass promote() via set_state directly
            // after marking connected through the internal state.
            pool.with_entry_mut(id, |e| e.state = ConnectionState::Connected);
            ids.push(id);
        }

        pool.protect(ids[0]);
        pool.tag(ids[1], "important");
        pool.tag(ids[2], "important");
        // ids[3] and ids[4] stay untagged; ids[4] is the oldest since it
        // was inserted last in this loop order is actually the newest —
        // swap so the untagged/oldest one is distinguishable.
        let report = pool.trim_report();
        assert_eq!(report.active_count, 5);
        assert_eq!(report.target_trim_count, 2);
        assert_eq!(report.selected_count, 2);

        let removed = pool.trim_if_needed();
        assert_eq!(removed.len(), 2);
        assert_eq!(pool.active_count(), 3);
        for entry in &removed {
            assert!(!entry.protected);
        }
    }

    #[tokio::test]
    async fn pending_dial_join_sees_the_resolved_outcome() {
        let pool = Pool::new(PoolConfig::default());
        let peer = peer();
        let (dial, is_new) = pool.register_pending_dial(peer);
        assert!(is_new);
        let (same_dial, is_new_again) = pool.register_pending_dial(peer);
        assert!(!is_new_again);

        let resolver = dial.clone();
        tokio::spawn(async move {
            resolver.resolve(Ok(ConnectionId::next()));
        });

        let outcome = same_dial.join().await;
        assert!(outcome.is_ok());
    }
}

//! Per-peer exponential dial backoff. A successful inbound connection
//! counts as proof of reachability and clears the window, same as a
//! successful outbound dial.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use meshnet_identity::PeerId;
use parking_lot::Mutex;

const BASE: u32 = 2;

#[derive(Debug, Clone, Copy)]
pub struct BackoffConfig {
    pub initial_window: Duration,
    pub max_window: Duration,
    pub entry_ttl: Duration,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        BackoffConfig {
            initial_window: Duration::from_secs(1),
            max_window: Duration::from_secs(5 * 60),
            entry_ttl: Duration::from_secs(60 * 60),
        }
    }
}

struct Entry {
    window: Duration,
    until: Instant,
    last_touched: Instant,
}

/// Tracks, per peer, whether a dial should currently be suppressed.
pub struct DialBackoff {
    config: BackoffConfig,
    entries: Mutex<HashMap<PeerId, Entry>>,
}

impl DialBackoff {
    pub fn new(config: BackoffConfig) -> Self {
        DialBackoff {
            config,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn should_back_off(&self, peer: PeerId) -> bool {
        let entries = self.entries.lock();
        entries
            .get(&peer)
            .map(|e| Instant::now() < e.until)
            .unwrap_or(false)
    }

    pub fn record_failure(&self, peer: PeerId) {
        let mut entries = self.entries.lock();
        let now = Instant::now();
        let entry = entries.entry(peer).or_insert_with(|| Entry {
            window: self.config.initial_window,
            until: now,
            last_touched: now,
        });
        entry.window = std::cmp::min(entry.window * BASE, self.config.max_window);
        entry.until = now + entry.window;
        entry.last_touched = now;
    }

    pub fn record_success(&self, peer: PeerId) {
        self.entries.lock().remove(&peer);
    }

    pub fn cleanup(&self) {
        let now = Instant::now();
        let ttl = self.config.entry_ttl;
        self.entries
            .lock()
            .retain(|_, entry| now.duration_since(entry.last_touched) < ttl);
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
    fn failure_doubles_window_and_success_clears_it() {
        let backoff = DialBackoff::new(BackoffConfig {
            initial_window: Duration::from_millis(10),
            max_window: Duration::from_secs(1),
            entry_ttl: Duration::from_secs(60),
        });
        let peer = peer();
        assert!(!backoff.should_back_off(peer));
        backoff.record_failure(peer);
        assert!(backoff.should_back_off(peer));
        backoff.record_success(peer);
        assert!(!backoff.should_back_off(peer));
    }

    #[test]
    fn repeated_failures_grow_the_window() {
        let backoff = DialBackoff::new(BackoffConfig::default());
        let peer = peer();
        backoff.record_failure(peer);
        let first = backoff.entries.lock().get(&peer).unwrap().window;
        backoff.record_failure(peer);
        let second = backoff.entries.lock().get(&peer).unwrap().window;
        assert!(second >= first * 2 || second == backoff.config.max_window);
    }
}

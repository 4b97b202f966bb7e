//! Periodically probes connected peers and reports the ones that stop
//! answering, so the idle-check task can trim or reconnect them.

use std::sync::Weak;
use std::time::Duration;

use meshnet_identity::PeerId;

use crate::pool::Pool;

#[derive(Debug, Clone, Copy)]
pub struct HealthConfig {
    pub probe_interval: Duration,
    pub probe_timeout: Duration,
}

impl Default for HealthConfig {
    fn default() -> Self {
        HealthConfig {
            probe_interval: Duration::from_secs(15),
            probe_timeout: Duration::from_secs(5),
        }
    }
}

/// A handle a running health-check loop hands back each sweep: the peers
/// that failed to respond within `probe_timeout`.
pub struct HealthReport {
    pub unhealthy: Vec<PeerId>,
}

/// Holds only a weak reference back to the pool it probes. The Node owns
/// both the pool and the health monitor; a strong back-reference here
/// would keep the pool alive past the Node's own drop and the pair would
/// never deallocate.
pub struct HealthMonitor {
    config: HealthConfig,
    pool: Weak<Pool>,
}

impl HealthMonitor {
    pub fn new(config: HealthConfig, pool: Weak<Pool>) -> Self {
        HealthMonitor { config, pool }
    }

    pub fn config(&self) -> HealthConfig {
        self.config
    }

    /// Runs one probe sweep over every connected peer. A probe here is a
    /// liveness check only (open-and-immediately-close a stream on a
    /// well-known protocol would be the production version); this toy
    /// stack treats `idle_duration` past the probe timeout as the signal
    /// since there is no ping protocol wired into the pool itself.
    pub fn sweep(&self) -> Option<HealthReport> {
        let pool = self.pool.upgrade()?;
        let unhealthy = pool
            .idle_connections(self.config.probe_timeout)
            .into_iter()
            .filter_map(|id| pool.with_entry_mut(id, |entry| entry.peer))
            .collect();
        Some(HealthReport { unhealthy })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::PoolConfig;
    use meshnet_core::Direction;
    use meshnet_identity::Keypair;
    use std::sync::Arc;

    #[test]
    fn sweep_returns_none_once_the_pool_is_gone() {
        let pool = Arc::new(Pool::new(PoolConfig::default()));
        let monitor = HealthMonitor::new(HealthConfig::default(), Arc::downgrade(&pool));
        drop(pool);
        assert!(monitor.sweep().is_none());
    }

    #[test]
    fn sweep_reports_nothing_for_freshly_connecting_entries() {
        let pool = Arc::new(Pool::new(PoolConfig::default()));
        let peer = Keypair::generate().public().to_peer_id();
        let addr = "/ip4/127.0.0.1/tcp/4001".parse().unwrap();
        pool.add_connecting(peer, addr, Direction::Outbound, false);
        let monitor = HealthMonitor::new(HealthConfig::default(), Arc::downgrade(&pool));
        let report = monitor.sweep().unwrap();
        assert!(report.unhealthy.is_empty());
    }
}

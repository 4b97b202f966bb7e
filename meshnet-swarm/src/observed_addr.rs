//! Tracks addresses peers claim to observe us at, confirming one once
//! enough distinct peers agree, so external address discovery isn't
//! poisoned by a single lying or confused reporter.

use std::collections::{HashMap, HashSet};
use std::net::{Ipv4Addr, Ipv6Addr};

use meshnet_identity::PeerId;
use meshnet_multiaddr::{Multiaddr, Protocol};
use parking_lot::Mutex;

/// The thin-waist key an address is grouped under: IP family, IP value,
/// and transport, ignoring the port (ephemeral source ports vary call to
/// call and must not split an otherwise-agreeing set of reports).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ThinWaist {
    ip: IpKey,
    transport: &'static str,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum IpKey {
    V4(Ipv4Addr),
    V6(Ipv6Addr),
}

fn thin_waist(addr: &Multiaddr) -> Option<ThinWaist> {
    let mut ip = None;
    let mut transport = None;
    for proto in addr.iter() {
        match proto {
            Protocol::Ip4(octets) => ip = Some(IpKey::V4(*octets)),
            Protocol::Ip6(octets) => ip = Some(IpKey::V6(*octets)),
            Protocol::Tcp(_) => transport = Some("tcp"),
            Protocol::Udp(_) => transport = Some("udp"),
            Protocol::QuicV1 => transport = Some("quic-v1"),
            _ => {}
        }
    }
    Some(ThinWaist {
        ip: ip?,
        transport: transport.unwrap_or("unknown"),
    })
}

struct Observation {
    example_address: Multiaddr,
    reporters: HashSet<PeerId>,
}

pub struct ObservedAddressManager {
    confirmation_threshold: usize,
    observations: Mutex<HashMap<ThinWaist, Observation>>,
}

impl ObservedAddressManager {
    pub fn new(confirmation_threshold: usize) -> Self {
        ObservedAddressManager {
            confirmation_threshold: confirmation_threshold.max(1),
            observations: Mutex::new(HashMap::new()),
        }
    }

    /// Records that `reporter` observed us reachable at `address`.
    /// Returns `true` the moment this report pushes the address across
    /// the confirmation threshold.
    pub fn record(&self, reporter: PeerId, address: Multiaddr) -> bool {
        let Some(key) = thin_waist(&address) else {
            return false;
        };
        let mut observations = self.observations.lock();
        let entry = observations.entry(key).or_insert_with(|| Observation {
            example_address: address.clone(),
            reporters: HashSet::new(),
        });
        let was_confirmed = entry.reporters.len() >= self.confirmation_threshold;
        entry.reporters.insert(reporter);
        let now_confirmed = entry.reporters.len() >= self.confirmation_threshold;
        now_confirmed && !was_confirmed
    }

    pub fn confirmed_addresses(&self) -> Vec<Multiaddr> {
        self.observations
            .lock()
            .values()
            .filter(|obs| obs.reporters.len() >= self.confirmation_threshold)
            .map(|obs| obs.example_address.clone())
            .collect()
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
    fn confirmation_requires_distinct_reporters_past_the_threshold() {
        let manager = ObservedAddressManager::new(3);
        let addr: Multiaddr = "/ip4/203.0.113.9/tcp/4001".parse().unwrap();

        assert!(!manager.record(peer(), addr.clone()));
        assert!(!manager.record(peer(), addr.clone()));
        assert!(manager.record(peer(), addr.clone()));
        assert_eq!(manager.confirmed_addresses(), vec![addr]);
    }

    #[test]
    fn differing_ports_still_group_under_the_same_thin_waist_key() {
        let manager = ObservedAddressManager::new(2);
        assert!(!manager.record(peer(), "/ip4/203.0.113.9/tcp/4001".parse().unwrap()));
        assert!(manager.record(peer(), "/ip4/203.0.113.9/tcp/9999".parse().unwrap()));
    }

    #[test]
    fn a_single_reporter_cannot_confirm_alone() {
        let manager = ObservedAddressManager::new(2);
        let reporter = peer();
        let addr: Multiaddr = "/ip4/203.0.113.9/tcp/4001".parse().unwrap();
        manager.record(reporter, addr.clone());
        manager.record(reporter, addr);
        assert!(manager.confirmed_addresses().is_empty());
    }
}

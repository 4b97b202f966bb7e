//! Happy Eyeballs (RFC 8305) address ranking: groups an unordered address
//! set into tiers, each with a delay relative to the previous tier.

use std::time::Duration;

use meshnet_multiaddr::Multiaddr;

/// One ranked group of addresses to dial together, after sleeping `delay`
/// relative to the previous group.
#[derive(Debug, Clone)]
pub struct DialGroup {
    pub delay: Duration,
    pub addresses: Vec<Multiaddr>,
}

fn is_quic(addr: &Multiaddr) -> bool {
    addr.is_quic()
}

fn is_tcp(addr: &Multiaddr) -> bool {
    addr.is_tcp()
}

fn tier_of(addr: &Multiaddr) -> usize {
    if is_quic(addr) && addr.is_ipv6() {
        1
    } else if is_quic(addr) && addr.is_ipv4() {
        2
    } else if is_tcp(addr) && addr.is_ipv6() {
        3
    } else if is_tcp(addr) && addr.is_ipv4() {
        4
    } else if addr.is_circuit_relay() {
        6
    } else {
        5
    }
}

const TIER_DELAYS_MS: [u64; 6] = [0, 250, 250, 250, 250, 500];

/// Classifies `addresses` by first-matching predicate, preserving input
/// order within each tier, and skips tiers with no members.
pub fn rank(addresses: &[Multiaddr]) -> Vec<DialGroup> {
    let mut buckets: [Vec<Multiaddr>; 6] = Default::default();
    for addr in addresses {
        buckets[tier_of(addr) - 1].push(addr.clone());
    }

    let mut groups = Vec::new();
    let mut first_present = true;
    for (index, bucket) in buckets.into_iter().enumerate() {
        if bucket.is_empty() {
            continue;
        }
        let delay = if first_present {
            Duration::from_millis(0)
        } else {
            Duration::from_millis(TIER_DELAYS_MS[index])
        };
        first_present = false;
        groups.push(DialGroup {
            delay,
            addresses: bucket,
        });
    }
    groups
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(text: &str) -> Multiaddr {
        text.parse().unwrap()
    }

    #[test]
    fn literal_spec_scenario_produces_four_ordered_groups() {
        let addresses = vec![
            addr("/ip6/::1/udp/4001/quic-v1"),
            addr("/ip4/1.2.3.4/tcp/4001"),
            addr("/ip4/1.2.3.4/udp/4001/quic-v1"),
        ];
        let groups = rank(&addresses);
        assert_eq!(groups.len(), 3);
        assert_eq!(groups[0].delay, Duration::from_millis(0));
        assert_eq!(groups[0].addresses, vec![addresses[0].clone()]);
        assert_eq!(groups[1].delay, Duration::from_millis(250));
        assert_eq!(groups[1].addresses, vec![addresses[2].clone()]);
        assert_eq!(groups[2].delay, Duration::from_millis(250));
        assert_eq!(groups[2].addresses, vec![addresses[1].clone()]);
    }

    #[test]
    fn empty_tiers_are_skipped_and_first_present_starts_at_zero() {
        let addresses = vec![addr("/ip4/1.2.3.4/tcp/4001")];
        let groups = rank(&addresses);
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].delay, Duration::from_millis(0));
    }

    #[test]
    fn order_within_a_tier_matches_input_order() {
        let addresses = vec![
            addr("/ip4/1.0.0.1/tcp/1"),
            addr("/ip4/1.0.0.2/tcp/2"),
            addr("/ip4/1.0.0.3/tcp/3"),
        ];
        let groups = rank(&addresses);
        assert_eq!(groups[0].addresses, addresses);
    }
}

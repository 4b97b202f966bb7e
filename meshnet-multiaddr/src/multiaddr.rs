use std::fmt;
use std::str::FromStr;

use meshnet_identity::PeerId;

use crate::error::AddressError;
use crate::protocol::{self, Protocol};

/// An ordered sequence of typed protocol components. Two addresses are
/// equal iff their component sequences are equal (IPv6 components compare
/// by their canonical 16-byte form, never by original text).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct Multiaddr {
    components: Vec<Protocol>,
}

impl Multiaddr {
    pub fn empty() -> Self {
        Multiaddr {
            components: Vec::new(),
        }
    }

    pub fn from_components(components: Vec<Protocol>) -> Self {
        Multiaddr { components }
    }

    pub fn push(&mut self, protocol: Protocol) {
        self.components.push(protocol);
    }

    pub fn with(mut self, protocol: Protocol) -> Self {
        self.push(protocol);
        self
    }

    pub fn iter(&self) -> impl Iterator<Item = &Protocol> {
        self.components.iter()
    }

    pub fn len(&self) -> usize {
        self.components.len()
    }

    pub fn is_empty(&self) -> bool {
        self.components.is_empty()
    }

    /// Encodes the address to its canonical binary form:
    /// `<code varint><value>` repeated for every component.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        for protocol in &self.components {
            protocol.write_binary(&mut out);
        }
        out
    }

    /// Decodes a canonical binary address, failing on the first malformed
    /// or unknown component.
    pub fn from_bytes(mut input: &[u8]) -> Result<Self, AddressError> {
        let mut components = Vec::new();
        while !input.is_empty() {
            let (protocol, rest) = Protocol::read_binary(input)?;
            components.push(protocol);
            input = rest;
        }
        Ok(Multiaddr { components })
    }

    /// Parses the slash-separated text form, e.g.
    /// `/ip4/1.2.3.4/tcp/4001/p2p/<peer-id>`.
    pub fn from_text(text: &str) -> Result<Self, AddressError> {
        let text = text.strip_prefix('/').ok_or(AddressError::InvalidAddress)?;
        if text.is_empty() {
            return Ok(Multiaddr::empty());
        }
        let segments: Vec<&str> = text.split('/').collect();
        let mut components = Vec::new();
        let mut index = 0;
        while index < segments.len() {
            let tag = segments[index];
            if tag.is_empty() {
                return Err(AddressError::InvalidAddress);
            }
            if tag == "unix" {
                // A unix socket path may itself contain `/`, so it consumes
                // every remaining segment rather than just the next one.
                if index + 1 >= segments.len() {
                    return Err(AddressError::MissingValue);
                }
                let path = segments[index + 1..].join("/");
                components.push(protocol::parse_text_component(tag, Some(&path))?);
                break;
            }
            let value = if is_valueless(tag) {
                None
            } else {
                let v = segments.get(index + 1).ok_or(AddressError::MissingValue)?;
                index += 1;
                Some(*v)
            };
            components.push(protocol::parse_text_component(tag, value)?);
            index += 1;
        }
        Ok(Multiaddr { components })
    }

    /// Renders the canonical text form.
    pub fn to_text(&self) -> String {
        let mut out = String::new();
        for protocol in &self.components {
            protocol::write_text_component(protocol, &mut out);
        }
        if out.is_empty() {
            out.push('/');
        }
        out
    }

    /// Extracts the trailing `/p2p/<peer-id>` component's [`PeerId`], if
    /// present. Total: always returns, never panics on a missing or
    /// non-trailing p2p component (only a *trailing* component counts as
    /// "the" embedded peer id).
    pub fn peer_id(&self) -> Option<PeerId> {
        match self.components.last() {
            Some(Protocol::P2p(peer)) => Some(*peer),
            _ => None,
        }
    }

    pub fn is_ipv6(&self) -> bool {
        self.components
            .iter()
            .any(|p| matches!(p, Protocol::Ip6(_)))
    }

    pub fn is_ipv4(&self) -> bool {
        self.components
            .iter()
            .any(|p| matches!(p, Protocol::Ip4(_)))
    }

    pub fn is_quic(&self) -> bool {
        self.components
            .iter()
            .any(|p| matches!(p, Protocol::QuicV1))
    }

    pub fn is_tcp(&self) -> bool {
        self.components
            .iter()
            .any(|p| matches!(p, Protocol::Tcp(_)))
    }

    pub fn is_circuit_relay(&self) -> bool {
        self.components
            .iter()
            .any(|p| matches!(p, Protocol::P2pCircuit))
    }

    pub fn has_dns_component(&self) -> bool {
        self.components.iter().any(|p| {
            matches!(
                p,
                Protocol::Dns(_) | Protocol::Dns4(_) | Protocol::Dns6(_)
            )
        })
    }
}

fn is_valueless(tag: &str) -> bool {
    matches!(tag, "quic-v1" | "p2p-circuit")
}

impl fmt::Display for Multiaddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_text())
    }
}

impl FromStr for Multiaddr {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Multiaddr::from_text(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_round_trips_ip4_tcp_p2p() {
        let peer = meshnet_identity::PeerId::from_seed(7);
        let text = format!("/ip4/1.2.3.4/tcp/4001/p2p/{peer}");
        let addr = Multiaddr::from_text(&text).unwrap();
        assert_eq!(addr.to_text(), text);
        assert_eq!(addr.peer_id(), Some(peer));
    }

    #[test]
    fn binary_round_trips() {
        let addr = Multiaddr::from_text("/ip6/::1/udp/4001/quic-v1").unwrap();
        let bytes = addr.to_bytes();
        assert_eq!(Multiaddr::from_bytes(&bytes).unwrap(), addr);
    }

    #[test]
    fn ipfs_is_accepted_as_p2p_alias_on_input_only() {
        let peer = meshnet_identity::PeerId::from_seed(9);
        let text = format!("/ip4/10.0.0.1/tcp/1/ipfs/{peer}");
        let addr = Multiaddr::from_text(&text).unwrap();
        assert_eq!(addr.peer_id(), Some(peer));
        assert!(addr.to_text().contains("/p2p/"));
        assert!(!addr.to_text().contains("/ipfs/"));
    }

    #[test]
    fn predicates_classify_components() {
        let quic6 = Multiaddr::from_text("/ip6/::1/udp/4001/quic-v1").unwrap();
        assert!(quic6.is_ipv6() && quic6.is_quic());

        let tcp4 = Multiaddr::from_text("/ip4/1.2.3.4/tcp/4001").unwrap();
        assert!(tcp4.is_ipv4() && tcp4.is_tcp() && !tcp4.is_quic());

        let relay = Multiaddr::from_text("/p2p-circuit").unwrap();
        assert!(relay.is_circuit_relay());

        let dns = Multiaddr::from_text("/dns4/example.com/tcp/4001").unwrap();
        assert!(dns.has_dns_component());
    }

    #[test]
    fn equality_ignores_ipv6_zone_and_text_casing() {
        let a = Multiaddr::from_text("/ip6/fe80::1%eth0/tcp/1").unwrap();
        let b = Multiaddr::from_text("/ip6/FE80::1/tcp/1").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn missing_value_errors() {
        assert_eq!(
            Multiaddr::from_text("/ip4"),
            Err(AddressError::MissingValue)
        );
    }

    #[test]
    fn unknown_protocol_errors() {
        assert!(matches!(
            Multiaddr::from_text("/nonsense/x"),
            Err(AddressError::UnknownProtocol(_))
        ));
    }

    #[test]
    fn memory_and_unix_components_round_trip() {
        let addr = Multiaddr::from_text("/memory/42").unwrap();
        assert_eq!(Multiaddr::from_bytes(&addr.to_bytes()).unwrap(), addr);

        let addr = Multiaddr::from_text("/unix/tmp/sock").unwrap();
        assert_eq!(addr.to_text(), "/unix/tmp/sock");
        assert_eq!(Multiaddr::from_bytes(&addr.to_bytes()).unwrap(), addr);
    }
}

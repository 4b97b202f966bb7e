use std::net::{Ipv4Addr, Ipv6Addr};

use meshnet_identity::PeerId;
use meshnet_varint::{decode_usize, encode_usize};

use crate::error::AddressError;
use crate::ipv6;

// Protocol codes, matching the multiaddr multicodec table so the binary
// form stays wire-compatible with the wider libp2p ecosystem.
const CODE_IP4: u64 = 4;
const CODE_TCP: u64 = 6;
const CODE_DNS: u64 = 53;
const CODE_DNS4: u64 = 54;
const CODE_DNS6: u64 = 55;
const CODE_UDP: u64 = 273;
const CODE_QUIC_V1: u64 = 461;
const CODE_UNIX: u64 = 400;
const CODE_P2P: u64 = 421;
const CODE_IP6: u64 = 41;
const CODE_P2P_CIRCUIT: u64 = 290;
const CODE_MEMORY: u64 = 777;
const CODE_CERTHASH: u64 = 466;

const MAX_DNS_LEN: usize = 4096;
const MAX_UNIX_LEN: usize = 4096;
const MAX_MEMORY_LEN: usize = 1024;
const MAX_P2P_LEN: usize = 4096;
const MAX_CERTHASH_LEN: usize = 1024;

/// A single typed component of a [`crate::Multiaddr`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Protocol {
    Ip4(Ipv4Addr),
    Ip6(Ipv6Addr),
    Dns(String),
    Dns4(String),
    Dns6(String),
    Tcp(u16),
    Udp(u16),
    QuicV1,
    Unix(String),
    /// An in-process transport endpoint id, used by the in-memory test
    /// transport.
    Memory(u64),
    P2p(PeerId),
    P2pCircuit,
    Certhash(Vec<u8>),
}

impl Protocol {
    pub fn code(&self) -> u64 {
        match self {
            Protocol::Ip4(_) => CODE_IP4,
            Protocol::Ip6(_) => CODE_IP6,
            Protocol::Dns(_) => CODE_DNS,
            Protocol::Dns4(_) => CODE_DNS4,
            Protocol::Dns6(_) => CODE_DNS6,
            Protocol::Tcp(_) => CODE_TCP,
            Protocol::Udp(_) => CODE_UDP,
            Protocol::QuicV1 => CODE_QUIC_V1,
            Protocol::Unix(_) => CODE_UNIX,
            Protocol::Memory(_) => CODE_MEMORY,
            Protocol::P2p(_) => CODE_P2P,
            Protocol::P2pCircuit => CODE_P2P_CIRCUIT,
            Protocol::Certhash(_) => CODE_CERTHASH,
        }
    }

    pub fn tag(&self) -> &'static str {
        match self {
            Protocol::Ip4(_) => "ip4",
            Protocol::Ip6(_) => "ip6",
            Protocol::Dns(_) => "dns",
            Protocol::Dns4(_) => "dns4",
            Protocol::Dns6(_) => "dns6",
            Protocol::Tcp(_) => "tcp",
            Protocol::Udp(_) => "udp",
            Protocol::QuicV1 => "quic-v1",
            Protocol::Unix(_) => "unix",
            Protocol::Memory(_) => "memory",
            Protocol::P2p(_) => "p2p",
            Protocol::P2pCircuit => "p2p-circuit",
            Protocol::Certhash(_) => "certhash",
        }
    }

    pub fn write_binary(&self, out: &mut Vec<u8>) {
        encode_usize(self.code() as usize, out);
        match self {
            Protocol::Ip4(addr) => out.extend_from_slice(&addr.octets()),
            Protocol::Ip6(addr) => out.extend_from_slice(&addr.octets()),
            Protocol::Tcp(port) | Protocol::Udp(port) => out.extend_from_slice(&port.to_be_bytes()),
            Protocol::QuicV1 | Protocol::P2pCircuit => {}
            Protocol::Dns(s) | Protocol::Dns4(s) | Protocol::Dns6(s) | Protocol::Unix(s) => {
                write_length_delimited(s.as_bytes(), out)
            }
            Protocol::Memory(id) => {
                let mut buf = Vec::new();
                encode_usize(*id as usize, &mut buf);
                write_length_delimited(&buf, out)
            }
            Protocol::P2p(peer) => write_length_delimited(&peer.to_bytes(), out),
            Protocol::Certhash(bytes) => write_length_delimited(bytes, out),
        }
    }

    /// Parses a single component (`<code varint><value>`) from the front of
    /// `input`, returning the component and the remaining bytes.
    pub fn read_binary(input: &[u8]) -> Result<(Protocol, &[u8]), AddressError> {
        let (code, rest) = decode_usize(input).map_err(|_| AddressError::InvalidAddress)?;
        match code as u64 {
            CODE_IP4 => {
                let (bytes, rest) = take(rest, 4)?;
                Ok((
                    Protocol::Ip4(Ipv4Addr::new(bytes[0], bytes[1], bytes[2], bytes[3])),
                    rest,
                ))
            }
            CODE_IP6 => {
                let (bytes, rest) = take(rest, 16)?;
                let mut octets = [0u8; 16];
                octets.copy_from_slice(bytes);
                Ok((Protocol::Ip6(Ipv6Addr::from(octets)), rest))
            }
            CODE_TCP => {
                let (bytes, rest) = take(rest, 2)?;
                Ok((Protocol::Tcp(u16::from_be_bytes([bytes[0], bytes[1]])), rest))
            }
            CODE_UDP => {
                let (bytes, rest) = take(rest, 2)?;
                Ok((Protocol::Udp(u16::from_be_bytes([bytes[0], bytes[1]])), rest))
            }
            CODE_QUIC_V1 => Ok((Protocol::QuicV1, rest)),
            CODE_P2P_CIRCUIT => Ok((Protocol::P2pCircuit, rest)),
            CODE_DNS => read_string(rest, MAX_DNS_LEN).map(|(s, r)| (Protocol::Dns(s), r)),
            CODE_DNS4 => read_string(rest, MAX_DNS_LEN).map(|(s, r)| (Protocol::Dns4(s), r)),
            CODE_DNS6 => read_string(rest, MAX_DNS_LEN).map(|(s, r)| (Protocol::Dns6(s), r)),
            CODE_UNIX => read_string(rest, MAX_UNIX_LEN).map(|(s, r)| (Protocol::Unix(s), r)),
            CODE_MEMORY => {
                let (bytes, rest) = read_length_delimited(rest, MAX_MEMORY_LEN)?;
                let (id, leftover) = decode_usize(bytes).map_err(|_| AddressError::InvalidAddress)?;
                if !leftover.is_empty() {
                    return Err(AddressError::InvalidAddress);
                }
                Ok((Protocol::Memory(id as u64), rest))
            }
            CODE_P2P => {
                let (bytes, rest) = read_length_delimited(rest, MAX_P2P_LEN)?;
                let peer =
                    PeerId::from_bytes(bytes).map_err(|_| AddressError::InvalidAddress)?;
                Ok((Protocol::P2p(peer), rest))
            }
            CODE_CERTHASH => {
                let (bytes, rest) = read_length_delimited(rest, MAX_CERTHASH_LEN)?;
                Ok((Protocol::Certhash(bytes.to_vec()), rest))
            }
            other => Err(AddressError::UnknownProtocol(other)),
        }
    }
}

fn take(input: &[u8], n: usize) -> Result<(&[u8], &[u8]), AddressError> {
    if input.len() < n {
        return Err(AddressError::MissingValue);
    }
    Ok(input.split_at(n))
}

fn write_length_delimited(value: &[u8], out: &mut Vec<u8>) {
    encode_usize(value.len(), out);
    out.extend_from_slice(value);
}

fn read_length_delimited(input: &[u8], max_len: usize) -> Result<(&[u8], &[u8]), AddressError> {
    let (len, rest) = decode_usize(input).map_err(|_| AddressError::InvalidAddress)?;
    if len > max_len {
        return Err(AddressError::FieldTooLarge);
    }
    take(rest, len)
}

fn read_string(input: &[u8], max_len: usize) -> Result<(String, &[u8]), AddressError> {
    let (bytes, rest) = read_length_delimited(input, max_len)?;
    let s = String::from_utf8(bytes.to_vec()).map_err(|_| AddressError::InvalidAddress)?;
    Ok((s, rest))
}

/// Parses one `/tag/value` text segment (the leading `/` already consumed,
/// `tag` already split off) into a [`Protocol`].
pub fn parse_text_component(tag: &str, value: Option<&str>) -> Result<Protocol, AddressError> {
    // `ipfs` is accepted as a legacy alias for `p2p` on input only.
    let tag = if tag == "ipfs" { "p2p" } else { tag };

    match tag {
        "quic-v1" => Ok(Protocol::QuicV1),
        "p2p-circuit" => Ok(Protocol::P2pCircuit),
        _ => {
            let value = value.ok_or(AddressError::MissingValue)?;
            match tag {
                "ip4" => value
                    .parse::<Ipv4Addr>()
                    .map(Protocol::Ip4)
                    .map_err(|_| AddressError::InvalidAddress),
                "ip6" => parse_ip6_text(value).map(Protocol::Ip6),
                "tcp" => value
                    .parse::<u16>()
                    .map(Protocol::Tcp)
                    .map_err(|_| AddressError::InvalidAddress),
                "udp" => value
                    .parse::<u16>()
                    .map(Protocol::Udp)
                    .map_err(|_| AddressError::InvalidAddress),
                "dns" => bounded_string(value, MAX_DNS_LEN).map(Protocol::Dns),
                "dns4" => bounded_string(value, MAX_DNS_LEN).map(Protocol::Dns4),
                "dns6" => bounded_string(value, MAX_DNS_LEN).map(Protocol::Dns6),
                "unix" => bounded_string(value, MAX_UNIX_LEN).map(Protocol::Unix),
                "memory" => value
                    .parse::<u64>()
                    .map(Protocol::Memory)
                    .map_err(|_| AddressError::InvalidAddress),
                "p2p" => value
                    .parse::<PeerId>()
                    .map(Protocol::P2p)
                    .map_err(|_| AddressError::InvalidAddress),
                "certhash" => bs58::decode(value)
                    .into_vec()
                    .map(Protocol::Certhash)
                    .map_err(|_| AddressError::InvalidAddress),
                _ => Err(AddressError::UnknownProtocol(0)),
            }
        }
    }
}

fn parse_ip6_text(value: &str) -> Result<Ipv6Addr, AddressError> {
    // Support the `::ffff:A.B.C.D` IPv4-mapped shorthand explicitly, since
    // `str::parse::<Ipv6Addr>` in the standard library already accepts it,
    // but we still want zone-stripped parsing shared with `ipv6::parse`.
    ipv6::parse(value).ok_or(AddressError::InvalidAddress)
}

fn bounded_string(value: &str, max_len: usize) -> Result<String, AddressError> {
    if value.len() > max_len {
        return Err(AddressError::FieldTooLarge);
    }
    Ok(value.to_string())
}

pub fn write_text_component(protocol: &Protocol, out: &mut String) {
    match protocol {
        Protocol::Ip4(addr) => out.push_str(&format!("/ip4/{addr}")),
        Protocol::Ip6(addr) => out.push_str(&format!("/ip6/{}", ipv6::to_canonical_string(addr))),
        Protocol::Tcp(port) => out.push_str(&format!("/tcp/{port}")),
        Protocol::Udp(port) => out.push_str(&format!("/udp/{port}")),
        Protocol::QuicV1 => out.push_str("/quic-v1"),
        Protocol::Dns(s) => out.push_str(&format!("/dns/{s}")),
        Protocol::Dns4(s) => out.push_str(&format!("/dns4/{s}")),
        Protocol::Dns6(s) => out.push_str(&format!("/dns6/{s}")),
        Protocol::Unix(s) => out.push_str(&format!("/unix/{s}")),
        Protocol::Memory(id) => out.push_str(&format!("/memory/{id}")),
        Protocol::P2p(peer) => out.push_str(&format!("/p2p/{peer}")),
        Protocol::P2pCircuit => out.push_str("/p2p-circuit"),
        Protocol::Certhash(bytes) => {
            out.push_str(&format!("/certhash/{}", bs58::encode(bytes).into_string()))
        }
    }
}

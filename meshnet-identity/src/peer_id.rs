use std::fmt;
use std::str::FromStr;

use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::keypair::PublicKey;

/// Multihash code for sha2-256, and the digest length that follows it. Both
/// values are below 128 so their unsigned-LEB128 encoding is the identity
/// byte; a full varint codec is not needed here only for this.
const MULTIHASH_SHA2_256: u8 = 0x12;
const DIGEST_LEN: u8 = 32;

/// A stable identity for a peer, derived from the SHA-256 digest of its
/// public key and self-describing via a small multihash-style prefix
/// (`<code><length><digest>`), matching the byte shape libp2p's `PeerId`
/// uses without pulling in the general multihash/multicodec registries.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PeerId {
    bytes: [u8; 2 + 32],
}

impl PeerId {
    pub(crate) fn from_public_key(public_key: &PublicKey) -> Self {
        let digest = Sha256::digest(public_key.to_bytes());
        let mut bytes = [0u8; 2 + 32];
        bytes[0] = MULTIHASH_SHA2_256;
        bytes[1] = DIGEST_LEN;
        bytes[2..].copy_from_slice(&digest);
        PeerId { bytes }
    }

    /// The canonical binary form: `<multihash code><length><digest>`.
    pub fn to_bytes(&self) -> Vec<u8> {
        self.bytes.to_vec()
    }

    /// Parses a [`PeerId`] from its canonical binary form.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ParsePeerIdError> {
        if bytes.len() != 2 + 32 {
            return Err(ParsePeerIdError::WrongLength);
        }
        if bytes[0] != MULTIHASH_SHA2_256 || bytes[1] != DIGEST_LEN {
            return Err(ParsePeerIdError::UnsupportedMultihash);
        }
        let mut out = [0u8; 2 + 32];
        out.copy_from_slice(bytes);
        Ok(PeerId { bytes: out })
    }

    /// A synthetic, non-cryptographic [`PeerId`], useful for tests and
    /// fixtures. The provided `seed` fills the digest bytes.
    pub fn from_seed(seed: u8) -> Self {
        let mut bytes = [0u8; 2 + 32];
        bytes[0] = MULTIHASH_SHA2_256;
        bytes[1] = DIGEST_LEN;
        bytes[2..].fill(seed);
        PeerId { bytes }
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("PeerId").field(&self.to_string()).finish()
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", bs58::encode(&self.bytes[..]).into_string())
    }
}

impl FromStr for PeerId {
    type Err = ParsePeerIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = bs58::decode(s)
            .into_vec()
            .map_err(|_| ParsePeerIdError::InvalidBase58)?;
        Self::from_bytes(&bytes)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParsePeerIdError {
    #[error("peer id is not valid base58")]
    InvalidBase58,
    #[error("peer id has the wrong byte length")]
    WrongLength,
    #[error("unsupported multihash code or digest length")]
    UnsupportedMultihash,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Keypair;

    #[test]
    fn text_form_round_trips() {
        let id = Keypair::generate().public().to_peer_id();
        let text = id.to_string();
        let parsed: PeerId = text.parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn binary_form_round_trips() {
        let id = Keypair::generate().public().to_peer_id();
        let bytes = id.to_bytes();
        assert_eq!(PeerId::from_bytes(&bytes).unwrap(), id);
    }

    #[test]
    fn ordering_is_total_and_consistent_with_bytes() {
        let a = PeerId::from_seed(1);
        let b = PeerId::from_seed(2);
        assert!(a < b);
        assert_eq!(a.to_bytes().as_slice() < b.to_bytes().as_slice(), a < b);
    }

    #[test]
    fn rejects_wrong_length() {
        assert_eq!(
            PeerId::from_bytes(&[0x12, 32]),
            Err(ParsePeerIdError::WrongLength)
        );
    }
}

use ed25519_dalek::{Keypair as DalekKeypair, PublicKey as DalekPublicKey, Signature, Signer};
use rand_core::OsRng;
use thiserror::Error;
use zeroize::Zeroize;

use crate::peer_id::PeerId;

/// An Ed25519 keypair used to sign and verify data and, indirectly, to
/// derive this node's [`PeerId`].
pub struct Keypair {
    inner: DalekKeypair,
}

impl Keypair {
    /// Generates a new random keypair.
    pub fn generate() -> Self {
        Keypair {
            inner: DalekKeypair::generate(&mut OsRng),
        }
    }

    /// Reconstructs a keypair from a 64-byte `(secret || public)` encoding.
    pub fn from_bytes(mut bytes: [u8; 64]) -> Result<Self, SigningError> {
        let inner =
            DalekKeypair::from_bytes(&bytes).map_err(|_| SigningError::MalformedKeypair)?;
        bytes.zeroize();
        Ok(Keypair { inner })
    }

    pub fn public(&self) -> PublicKey {
        PublicKey(self.inner.public)
    }

    pub fn sign(&self, msg: &[u8]) -> Vec<u8> {
        self.inner.sign(msg).to_bytes().to_vec()
    }
}

impl Drop for Keypair {
    fn drop(&mut self) {
        // ed25519_dalek::Keypair does not zeroize its secret on drop; the
        // `secret` field does implement `Zeroize` so we reach in explicitly.
        self.inner.secret.zeroize();
    }
}

/// The public half of a [`Keypair`].
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct PublicKey(DalekPublicKey);

impl PublicKey {
    pub fn to_bytes(&self) -> [u8; 32] {
        self.0.to_bytes()
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, SigningError> {
        DalekPublicKey::from_bytes(bytes)
            .map(PublicKey)
            .map_err(|_| SigningError::MalformedPublicKey)
    }

    pub fn verify(&self, msg: &[u8], signature: &[u8]) -> bool {
        let Ok(sig) = Signature::from_bytes(signature) else {
            return false;
        };
        self.0.verify_strict(msg, &sig).is_ok()
    }

    /// Derives the [`PeerId`] that identifies the holder of this public key.
    pub fn to_peer_id(&self) -> PeerId {
        PeerId::from_public_key(self)
    }
}

#[derive(Debug, Error)]
pub enum SigningError {
    #[error("malformed keypair bytes")]
    MalformedKeypair,
    #[error("malformed public key bytes")]
    MalformedPublicKey,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_and_verify_round_trips() {
        let keypair = Keypair::generate();
        let msg = b"hello meshnet";
        let sig = keypair.sign(msg);
        assert!(keypair.public().verify(msg, &sig));
    }

    #[test]
    fn verify_rejects_tampered_message() {
        let keypair = Keypair::generate();
        let sig = keypair.sign(b"hello meshnet");
        assert!(!keypair.public().verify(b"goodbye meshnet", &sig));
    }

    #[test]
    fn distinct_keypairs_yield_distinct_peer_ids() {
        let a = Keypair::generate();
        let b = Keypair::generate();
        assert_ne!(a.public().to_peer_id(), b.public().to_peer_id());
    }
}

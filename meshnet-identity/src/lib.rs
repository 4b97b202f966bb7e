//! Peer identity: keypairs and the stable [`PeerId`] derived from a public key.
//!
//! No cryptographic primitives are defined here; we wrap `ed25519-dalek` for
//! signing and derive a peer's identity from the SHA-256 digest of its public
//! key, following the same "self-describing identity" shape as libp2p's
//! `PeerId`, minus the general multihash/multicodec machinery this crate does
//! not need.

mod keypair;
mod peer_id;

pub use keypair::{Keypair, PublicKey, SigningError};
pub use peer_id::PeerId;

//! The address model: an ordered sequence of typed protocol components with
//! a canonical binary and text form, plus the predicates the Dial Ranker
//! and Smart Dialer use to classify addresses.

mod error;
mod ipv6;
mod multiaddr;
mod protocol;

pub use error::AddressError;
pub use multiaddr::Multiaddr;
pub use protocol::Protocol;

//! AutoNAT v2: nonce-verified reachability checks over an untrusted peer's
//! advertised addresses. A [`client::Client`] asks servers to dial it back
//! on a candidate address and folds the outcomes into a majority-vote
//! [`client::Reachability`]; a [`server::Server`] answers those requests
//! under a combined per-peer/global rate limit and an amplification
//! defence that rejects addresses not matching the requester's own
//! observed IP.

pub mod client;
pub mod server;
pub mod wire;

pub use client::{Client, ClientConfig, ClientError, CheckOutcome, Reachability};
pub use server::{RejectReason, Server, ServerConfig, ServerEvent};
pub use wire::{decode_message, encode_message, DialBack, DialRequest, DialResponse, Message, Status, WireError};

pub const DIAL_REQUEST_PROTOCOL: &str = "/libp2p/autonat/2/dial-request";
pub const DIAL_BACK_PROTOCOL: &str = "/libp2p/autonat/2/dial-back";

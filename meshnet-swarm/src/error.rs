use meshnet_identity::PeerId;
use meshnet_multiaddr::Multiaddr;
use thiserror::Error;

/// Errors a dial attempt can fail with before a connection ever reaches
/// the pool.
#[derive(Debug, Error)]
pub enum DialError {
    #[error("no addresses known for {0}")]
    NoAddressesKnown(PeerId),
    #[error("dial timed out")]
    Timeout,
    #[error("every dial attempt failed")]
    AllDialsFailed,
    #[error("dialing the local peer id is not allowed")]
    SelfDialNotAllowed,
    #[error("a dial to this peer is already pending")]
    AlreadyDialing,
    #[error(transparent)]
    Core(#[from] meshnet_core::Error),
}

/// Why a `ManagedConnection` left the `connected` state. Drives the
/// reconnection policy's retry/no-retry split.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    LocalClose,
    Gated,
    LimitExceeded,
    SelfDial,
    PeerIdMismatch,
    RemoteClose,
    IdleTimeout,
    TransportError,
    ProtocolError,
}

impl DisconnectReason {
    /// Reasons explicitly marked retriable by the policy; everything else
    /// is final for the current connection attempt.
    pub fn is_retriable(self) -> bool {
        matches!(
            self,
            DisconnectReason::RemoteClose
                | DisconnectReason::IdleTimeout
                | DisconnectReason::TransportError
                | DisconnectReason::ProtocolError
        )
    }
}

#[derive(Debug, Error)]
pub enum NodeError {
    #[error("no configured listen address could be bound")]
    NoListenersBound,
    #[error("node is not running")]
    NodeNotRunning,
    #[error("not connected to {0}")]
    NotConnected(PeerId),
    #[error(transparent)]
    Dial(#[from] DialError),
    #[error(transparent)]
    Core(#[from] meshnet_core::Error),
}

#[derive(Debug, Error)]
#[error("failed to bind listen address {address}: {source}")]
pub struct ListenError {
    pub address: Multiaddr,
    #[source]
    pub source: std::io::Error,
}

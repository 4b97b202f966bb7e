use meshnet_identity::PeerId;
use thiserror::Error;

/// The shared error taxonomy every public entry point in the stack returns
/// into, grouped the way §7 of the design groups them. Background loops
/// never propagate these; they log and surface an event instead.
#[derive(Debug, Error)]
pub enum Error {
    // -- Configuration --------------------------------------------------
    #[error("no transport configured can dial {0}")]
    NoSuitableTransport(meshnet_multiaddr::Multiaddr),
    #[error("no configured listen address could be bound")]
    NoListenersBound,
    #[error("no security upgraders configured")]
    NoSecurityUpgraders,
    #[error("no muxers configured")]
    NoMuxers,

    // -- Policy -----------------------------------------------------------
    #[error("connection gated at the {stage:?} stage")]
    ConnectionGated { stage: GateStage },
    #[error("connection limit reached")]
    ConnectionLimitReached,
    #[error("dialing the local peer id is not allowed")]
    SelfDialNotAllowed,
    #[error("resource limit exceeded for {resource} at {scope:?} scope")]
    ResourceLimitExceeded { scope: ResourceScope, resource: String },

    // -- Protocol -----------------------------------------------------
    #[error("protocol negotiation failed")]
    ProtocolNegotiationFailed,
    #[error("message of {size} bytes exceeds the {max}-byte maximum")]
    MessageTooLarge { size: usize, max: usize },
    #[error("invalid varint")]
    InvalidVarint,
    #[error("invalid address")]
    InvalidAddress,
    #[error("field too large")]
    FieldTooLarge,
    #[error("peer id mismatch: expected {expected}, got {actual}")]
    PeerIdMismatch { expected: PeerId, actual: PeerId },
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    // -- Transport / runtime --------------------------------------------
    #[error("stream closed")]
    StreamClosed,
    #[error("connection closed")]
    ConnectionClosed,
    #[error("not connected to {0}")]
    NotConnected(PeerId),
    #[error("node is not running")]
    NodeNotRunning,
    #[error("operation timed out")]
    Timeout,
    #[error("no addresses known for {0}")]
    NoAddressesKnown(PeerId),

    // -- AutoNAT ------------------------------------------------------
    #[error("rate limited: {0}")]
    RateLimited(String),
    #[error("nonce verification failed")]
    NonceVerificationFailed,
    #[error("nonce expired")]
    NonceExpired,
    #[error("dial-back failed: {0}")]
    DialBackFailed(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateStage {
    Dial,
    Accept,
    Secured,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceScope {
    System,
    Peer,
    Protocol,
}

impl std::fmt::Display for ResourceScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ResourceScope::System => "system",
            ResourceScope::Peer => "peer",
            ResourceScope::Protocol => "protocol",
        };
        write!(f, "{s}")
    }
}

//! multistream-select v1/v1-lazy protocol negotiation, and the buffered
//! length-prefixed framer its wire messages are built from.

mod error;
mod framer;
mod negotiator;

pub use error::{FramerError, NegotiationError};
pub use framer::BufferedFramer;
pub use negotiator::{dialer_select_proto, listener_select_proto, Negotiated, Version, MULTISTREAM_HEADER};

/// Default maximum size, in bytes, of a single multistream-select message.
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 64 * 1024;

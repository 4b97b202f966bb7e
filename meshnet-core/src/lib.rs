//! Transport, security, and muxer capability traits; the upgrade pipeline
//! that negotiates between them; and resource accounting shared by every
//! upper layer.

pub mod connection;
pub mod error;
pub mod muxer;
pub mod resource;
pub mod security;
pub mod transport;
pub mod upgrade;

pub use connection::{
    BoxMuxedConnection, BoxStream, BufferedMuxedStream, Direction, MuxedConnection, MuxerEvent,
    RawConnection, SecuredConnection, Stream,
};
pub use error::{Error, GateStage, ResourceScope};
pub use muxer::{Muxer, SimpleMuxer};
pub use resource::{ConnectionReservation, Limits, PendingDialReservation, ResourceManager, StreamReservation};
pub use security::{SecurityUpgrader, XorSecurityUpgrader};
pub use transport::{Listener, MemoryNetwork, MemoryTransport, SecuredListener, SecuredTransport, Transport};
pub use upgrade::{upgrade_inbound, upgrade_outbound, UpgradeConfig};

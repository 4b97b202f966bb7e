pub mod backoff;
pub mod connection;
pub mod dialer;
pub mod error;
pub mod health;
pub mod node;
pub mod observed_addr;
pub mod pool;
pub mod ranker;
pub mod reconnect;

pub use backoff::{BackoffConfig, DialBackoff};
pub use connection::{ConnectionId, ConnectionState, ManagedConnection};
pub use dialer::{smart_dial, DialOutcome, DialerConfig};
pub use error::{DialError, DisconnectReason, ListenError, NodeError};
pub use health::{HealthConfig, HealthMonitor, HealthReport};
pub use node::{AddressBook, ConnectionEvent, Node, NodeBuilder, NodeConfiguration, NodeEvent, StreamContext};
pub use observed_addr::ObservedAddressManager;
pub use pool::{Pool, PoolConfig, TrimCandidate, TrimReport};
pub use ranker::{rank, DialGroup};
pub use reconnect::ReconnectPolicy;

//! Channel routing
//!
//! Maps sessions to their `session_<id>` channels over a [`Transport`],
//! addresses outbound events and filters redelivered inbound ones.

pub mod channel_router;
pub mod dedup;
pub mod errors;
pub mod metrics;
pub mod transport;

pub use channel_router::{fingerprint, ChannelRouter, RoutedEvent};
pub use dedup::DedupCache;
pub use errors::{RouterError, RouterResult, TransportError, TransportResult};
pub use transport::{MemoryHub, MemoryTransport, Transport};

//! SessionLink core
//!
//! Two-party secure session messaging: a plaintext key exchange bootstraps
//! an X25519-derived conversation key, after which chat messages, receipts,
//! typing and presence travel as checksummed AES-GCM envelopes over a
//! per-session pub/sub channel.

pub mod config;
pub mod core_codec;
pub mod core_handshake;
pub mod core_lifecycle;
pub mod core_presence;
pub mod core_router;
pub mod core_session;
pub mod logging;
pub mod types;
pub mod wire;

pub use config::{Config, ConfigError};
pub use core_codec::LocalKeyPair;
pub use core_handshake::{HandshakeState, RequestId};
pub use core_lifecycle::{MemoryRecordStore, Message, MessageId, MessageStatus, RecordStore};
pub use core_router::{MemoryHub, MemoryTransport, Transport};
pub use core_session::{
    EventCategory, SessionError, SessionEvent, SessionHandle, SessionMessagingFacade,
    SessionResult,
};
pub use logging::{init_logging, init_logging_with_config, LogConfig, LogLevel};
pub use types::{SessionId, Timestamp};

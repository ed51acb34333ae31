//! Session messaging
//!
//! [`SessionMessagingFacade`] composes codec, handshake, router, lifecycle
//! and presence into the operations the application calls;
//! [`SessionHandle`] runs it on its own task.

pub mod errors;
pub mod events;
pub mod facade;
pub mod handle;
pub mod payloads;

pub use errors::{SessionError, SessionResult};
pub use events::{EventBroadcaster, EventCategory, SessionEvent, Subscription};
pub use facade::SessionMessagingFacade;
pub use handle::{SessionCommand, SessionHandle};

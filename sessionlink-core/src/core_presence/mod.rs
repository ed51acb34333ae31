//! Typing and presence

pub mod broadcaster;
pub mod presence;
pub mod typing;

pub use broadcaster::PresenceTypingBroadcaster;
pub use presence::{PresenceBook, PresenceState, PresenceUpdate};
pub use typing::{TypingTracker, TypingUpdate};

//! Message lifecycle
//!
//! `Sending → Sent → Delivered → Read`, with `Failed` reachable from
//! Sending/Sent and `Deleted` from anything but Failed.

pub mod errors;
pub mod message;
pub mod store;
pub mod tracker;

pub use errors::{LifecycleError, LifecycleResult, StoreError, StoreResult};
pub use message::{transition, Message, MessageId, MessageStatus, StatusChange, StatusEvent, Transition};
pub use store::{MemoryRecordStore, RecordStore};
pub use tracker::MessageLifecycle;

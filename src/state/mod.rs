//! Durable session state.
//!
//! The event log is the source of truth. Live components and replay fold
//! the same events through the same `apply` methods.

pub mod event;
pub mod replay;
pub mod store;

pub use event::{Event, EventPayload, NewEvent};
pub use replay::{PauseReason, SessionProjection, SessionState, SessionStatus};
pub use store::{KvEntry, StateStore};

pub mod config;
pub mod core;
pub mod error;
pub mod log;
pub mod orchestration;
pub mod session;
pub mod state;
pub mod util;
pub mod workspace;

pub use error::{Error, Result};
pub use session::{Collaborators, PauseHandle, Session, SessionId, SessionReport};
pub use state::{SessionProjection, SessionStatus, StateStore};

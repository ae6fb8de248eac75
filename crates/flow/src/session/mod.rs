//! Peer-to-peer sessions.

mod manager;
mod state;

pub use manager::{AckOutcome, DataOutcome, ErrorOutcome, SessionManager, SessionUpdate};
pub use state::{BufferedMessage, SessionState, SessionStatus, UnackedMessage};

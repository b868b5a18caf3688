//! chatsync Protocol
//!
//! Shared types for communication between the chatsync client and the
//! assistant backend. These types are serialized as JSON over HTTP and the
//! server-sent event stream.

use uuid::Uuid;

// Re-exports
pub mod events;
pub mod terminal;
pub mod types;

pub use events::{EventFrame, EventKind, GlobalEventFrame};
pub use terminal::TerminalFrame;
pub use types::*;

/// Generate a new unique ID
pub fn new_id() -> String {
    Uuid::new_v4().to_string()
}

//! chatsync
//!
//! Keeps a local view of one live assistant chat session in sync with its
//! backend over a long-lived event stream: reconnects with backoff, pauses
//! while hidden or offline, detects stalled streams, reconciles missed
//! events through history reloads, and derives a busy/cooldown/idle
//! activity signal.

pub mod activity;
pub mod config;
pub mod connection;
pub mod dispatch;
pub mod engine;
pub mod envelope;
pub mod health;
pub mod logging;
pub mod notification;
pub mod resync;
pub mod scheduler;
pub mod session;
pub mod state;

#[cfg(test)]
mod testing;

pub use config::{ConfigError, SyncConfig};
pub use engine::{SyncEngine, SyncError, SyncHandle};
pub use resync::ResyncOutcome;
pub use state::{SessionView, SyncSnapshot, SyncUpdate};

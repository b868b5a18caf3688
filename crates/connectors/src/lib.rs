//! chatsync Connectors
//!
//! The boundary between the sync engine and the assistant backend.
//! Everything the engine consumes from the network goes through the
//! traits here, so the engine can be driven by in-memory fakes in tests
//! and by [`HttpBackend`] in the binary.

pub mod http;
pub mod sse;

use std::pin::Pin;

use async_trait::async_trait;
use chatsync_protocol::{
    MessageWithParts, PermissionRequest, QuestionRequest, SessionInfo, SessionStatusMap,
};
use futures::Stream;
use thiserror::Error;

pub use http::HttpBackend;

/// Errors that can occur talking to the backend
#[derive(Debug, Error)]
pub enum ConnectorError {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Backend returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Event stream closed")]
    StreamClosed,

    #[error("Invalid backend URL: {0}")]
    InvalidUrl(String),
}

impl From<reqwest::Error> for ConnectorError {
    fn from(err: reqwest::Error) -> Self {
        match err.status() {
            Some(status) => ConnectorError::Status {
                status: status.as_u16(),
                body: err.to_string(),
            },
            None => ConnectorError::Transport(err.to_string()),
        }
    }
}

/// Raw frames from the long-lived event channel. Each item is the text
/// payload of one event; an `Err` item means the channel failed.
pub type EventStream = Pin<Box<dyn Stream<Item = Result<String, ConnectorError>> + Send>>;

/// Opens the long-lived inbound event channel.
///
/// A successful return is the "open" signal. The stream ending or yielding
/// an error is the "error" signal. Dropping the stream unsubscribes.
#[async_trait]
pub trait EventSource: Send + Sync {
    async fn subscribe(&self) -> Result<EventStream, ConnectorError>;
}

/// Request/response operations the engine consumes.
#[async_trait]
pub trait Backend: Send + Sync {
    async fn list_pending_permissions(&self) -> Result<Vec<PermissionRequest>, ConnectorError>;

    async fn list_pending_questions(
        &self,
        session_id: Option<&str>,
    ) -> Result<Vec<QuestionRequest>, ConnectorError>;

    async fn get_session(&self, session_id: &str) -> Result<SessionInfo, ConnectorError>;

    async fn get_global_session_status(&self) -> Result<SessionStatusMap, ConnectorError>;

    /// Lightweight liveness probe. Transport failures map to `false`.
    async fn check_health(&self) -> bool;

    /// Load message history, newest `limit` messages when bounded.
    async fn load_messages(
        &self,
        session_id: &str,
        limit: Option<usize>,
    ) -> Result<Vec<MessageWithParts>, ConnectorError>;
}

/// Server-side pseudo-terminal sessions. The engine never drives these;
/// they share the backend connection details only.
#[async_trait]
pub trait TerminalBackend: Send + Sync {
    async fn create_session(&self, cwd: &str) -> Result<String, ConnectorError>;

    async fn send_input(&self, session_id: &str, text: &str) -> Result<(), ConnectorError>;

    async fn resize(&self, session_id: &str, cols: u16, rows: u16) -> Result<(), ConnectorError>;

    async fn close(&self, session_id: &str) -> Result<(), ConnectorError>;
}

//! Observable engine state
//!
//! The engine publishes an immutable [`SyncSnapshot`] after every applied
//! input and a [`SyncUpdate`] for every change worth reacting to. Readers
//! never touch engine-owned state directly.

use chatsync_protocol::{
    ActivityPhase, ConnectionStatus, PermissionRequest, QuestionRequest, SessionInfo,
};
use serde::Serialize;
use serde_json::Value;

use crate::notification::{NativeNotification, Toast};
use crate::session::{MessageEntry, ModelRef, SessionStore};

/// Session-scoped part of the snapshot
#[derive(Debug, Clone, PartialEq)]
pub struct SessionView {
    pub session_id: String,
    pub directory: Option<String>,
    pub info: Option<SessionInfo>,
    pub compacting_at: Option<i64>,
    pub last_error: Option<Value>,
    pub model: Option<ModelRef>,
    pub messages: Vec<MessageEntry>,
    pub permissions: Vec<PermissionRequest>,
    pub questions: Vec<QuestionRequest>,
}

impl SessionView {
    pub fn from_store(store: &SessionStore) -> Self {
        Self {
            session_id: store.session_id.clone(),
            directory: store.directory.clone(),
            info: store.info.clone(),
            compacting_at: store.compacting_at,
            last_error: store.last_error.clone(),
            model: store.model.clone(),
            messages: store.messages().to_vec(),
            permissions: store.permissions().to_vec(),
            questions: store.questions().to_vec(),
        }
    }

    pub fn title(&self) -> Option<&str> {
        self.info
            .as_ref()
            .map(|i| i.title.as_str())
            .filter(|t| !t.is_empty())
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyncSnapshot {
    pub status: ConnectionStatus,
    /// Human-readable reason shown next to the status
    pub hint: Option<String>,
    pub attempts: u32,
    /// Reason for the most recent reconnect, kept after recovery
    pub last_hint: Option<String>,
    pub phase: ActivityPhase,
    pub pending_resume: bool,
    pub server_healthy: Option<bool>,
    pub session: Option<SessionView>,
}

impl SyncSnapshot {
    pub fn message_count(&self) -> usize {
        self.session.as_ref().map_or(0, |s| s.messages.len())
    }
}

/// Change notifications broadcast to subscribers
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SyncUpdate {
    StatusChanged {
        status: ConnectionStatus,
        #[serde(skip_serializing_if = "Option::is_none")]
        hint: Option<String>,
    },
    PhaseChanged {
        phase: ActivityPhase,
    },
    Notification {
        notification: NativeNotification,
    },
    Toast {
        toast: Toast,
    },
    /// Forwarded to the todo list owner as-is
    Todos {
        session_id: String,
        todos: Value,
    },
    SessionChanged {
        #[serde(skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
    },
}

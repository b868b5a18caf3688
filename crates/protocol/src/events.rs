//! Backend → client event frames

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A bare event as it appears on the per-directory stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventFrame {
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub properties: Value,
}

/// An event wrapped with its origin directory (global stream)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GlobalEventFrame {
    #[serde(default)]
    pub directory: Option<String>,
    pub payload: EventFrame,
}

/// Event kinds the client reacts to
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EventKind {
    ServerConnected,
    ServerHeartbeat,
    MessagePartUpdated,
    MessagePartRemoved,
    MessageUpdated,
    MessageRemoved,
    SessionCreated,
    SessionUpdated,
    SessionDeleted,
    SessionAbort,
    SessionStatus,
    SessionIdle,
    SessionError,
    PermissionAsked,
    PermissionReplied,
    QuestionAsked,
    QuestionReplied,
    QuestionRejected,
    TodoUpdated,
    Other(String),
}

impl EventKind {
    pub fn from_type(value: &str) -> Self {
        match value {
            "server.connected" => EventKind::ServerConnected,
            "server.heartbeat" => EventKind::ServerHeartbeat,
            "message.part.updated" => EventKind::MessagePartUpdated,
            "message.part.removed" => EventKind::MessagePartRemoved,
            "message.updated" => EventKind::MessageUpdated,
            "message.removed" => EventKind::MessageRemoved,
            "session.created" => EventKind::SessionCreated,
            "session.updated" => EventKind::SessionUpdated,
            "session.deleted" => EventKind::SessionDeleted,
            "session.abort" => EventKind::SessionAbort,
            "session.status" => EventKind::SessionStatus,
            "session.idle" => EventKind::SessionIdle,
            "session.error" => EventKind::SessionError,
            // `permission.updated` is the older name for the same prompt
            "permission.asked" | "permission.updated" => EventKind::PermissionAsked,
            "permission.replied" => EventKind::PermissionReplied,
            "question.asked" => EventKind::QuestionAsked,
            "question.replied" => EventKind::QuestionReplied,
            "question.rejected" => EventKind::QuestionRejected,
            "todo.updated" => EventKind::TodoUpdated,
            other => EventKind::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            EventKind::ServerConnected => "server.connected",
            EventKind::ServerHeartbeat => "server.heartbeat",
            EventKind::MessagePartUpdated => "message.part.updated",
            EventKind::MessagePartRemoved => "message.part.removed",
            EventKind::MessageUpdated => "message.updated",
            EventKind::MessageRemoved => "message.removed",
            EventKind::SessionCreated => "session.created",
            EventKind::SessionUpdated => "session.updated",
            EventKind::SessionDeleted => "session.deleted",
            EventKind::SessionAbort => "session.abort",
            EventKind::SessionStatus => "session.status",
            EventKind::SessionIdle => "session.idle",
            EventKind::SessionError => "session.error",
            EventKind::PermissionAsked => "permission.asked",
            EventKind::PermissionReplied => "permission.replied",
            EventKind::QuestionAsked => "question.asked",
            EventKind::QuestionReplied => "question.replied",
            EventKind::QuestionRejected => "question.rejected",
            EventKind::TodoUpdated => "todo.updated",
            EventKind::Other(other) => other,
        }
    }

    /// Kinds whose `info.id` names the session itself.
    pub fn is_session_lifecycle(&self) -> bool {
        matches!(
            self,
            EventKind::SessionCreated | EventKind::SessionUpdated | EventKind::SessionDeleted
        )
    }
}

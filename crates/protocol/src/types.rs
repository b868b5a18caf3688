//! Core types shared across the protocol

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Status of the long-lived event channel, as shown to the user
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    #[default]
    Idle,
    Connecting,
    Connected,
    Reconnecting,
    Paused,
    Offline,
}

impl ConnectionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionStatus::Idle => "idle",
            ConnectionStatus::Connecting => "connecting",
            ConnectionStatus::Connected => "connected",
            ConnectionStatus::Reconnecting => "reconnecting",
            ConnectionStatus::Paused => "paused",
            ConnectionStatus::Offline => "offline",
        }
    }

    /// Next status after `trigger`. Total: a trigger that does not apply
    /// in the current status leaves it unchanged.
    pub fn apply(self, trigger: ConnectionTrigger) -> Self {
        use ConnectionStatus::*;
        use ConnectionTrigger as T;
        match (self, trigger) {
            (_, T::Teardown) => Idle,
            (_, T::Offline) => Offline,
            (Offline, T::Hidden) => Offline,
            (_, T::Hidden) => Paused,
            (Connected, T::Start) => Connected,
            (_, T::Start) => Connecting,
            (Paused | Offline, T::Resumed) => Connecting,
            (Connecting, T::Opened) => Connected,
            (Connecting | Connected | Reconnecting, T::Failed) => Reconnecting,
            (Reconnecting, T::BackoffElapsed) => Connecting,
            (current, _) => current,
        }
    }
}

/// Inputs to the connection status machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionTrigger {
    Start,
    Opened,
    Failed,
    BackoffElapsed,
    /// Hidden long enough to release the channel
    Hidden,
    Offline,
    Resumed,
    Teardown,
}

/// Whether the current session is producing output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityPhase {
    #[default]
    Idle,
    Busy,
    Cooldown,
}

/// Message role
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    User,
    Assistant,
}

/// Why an assistant message stopped generating
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishReason {
    Stop,
    Length,
    ToolCalls,
    ContentFilter,
    Error,
    Other,
}

impl FinishReason {
    /// Parse a wire finish reason. `None` for values that do not mark the
    /// end of a message (`unknown`, empty strings).
    pub fn from_wire(value: &str) -> Option<Self> {
        match value {
            "stop" | "end_turn" => Some(FinishReason::Stop),
            "length" | "max_tokens" => Some(FinishReason::Length),
            "tool-calls" | "tool_calls" | "tool_use" => Some(FinishReason::ToolCalls),
            "content-filter" | "content_filter" => Some(FinishReason::ContentFilter),
            "error" => Some(FinishReason::Error),
            "other" => Some(FinishReason::Other),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageTime {
    #[serde(default)]
    pub created: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed: Option<i64>,
}

/// Metadata for one message (no content; content lives in parts)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageInfo {
    pub id: String,
    #[serde(rename = "sessionID")]
    pub session_id: String,
    pub role: MessageRole,
    #[serde(default)]
    pub time: MessageTime,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finish: Option<String>,
    #[serde(rename = "providerID", default, skip_serializing_if = "Option::is_none")]
    pub provider_id: Option<String>,
    #[serde(rename = "modelID", default, skip_serializing_if = "Option::is_none")]
    pub model_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl MessageInfo {
    /// Placeholder used when a part arrives before its message metadata.
    pub fn placeholder(id: &str, session_id: &str) -> Self {
        Self {
            id: id.to_string(),
            session_id: session_id.to_string(),
            role: MessageRole::Assistant,
            time: MessageTime::default(),
            finish: None,
            provider_id: None,
            model_id: None,
            error: None,
            extra: Map::new(),
        }
    }

    pub fn finish_reason(&self) -> Option<FinishReason> {
        self.finish.as_deref().and_then(FinishReason::from_wire)
    }
}

/// Part type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PartKind {
    Text,
    Tool,
    Reasoning,
    File,
    StepStart,
    StepFinish,
    Snapshot,
    Patch,
    Agent,
    Retry,
    Compaction,
    Subtask,
    #[serde(other)]
    Unknown,
}

/// One piece of a message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Part {
    pub id: String,
    #[serde(rename = "sessionID", default)]
    pub session_id: String,
    #[serde(rename = "messageID", default)]
    pub message_id: String,
    #[serde(rename = "type")]
    pub kind: PartKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<Value>,
    #[serde(rename = "providerID", default, skip_serializing_if = "Option::is_none")]
    pub provider_id: Option<String>,
    #[serde(rename = "modelID", default, skip_serializing_if = "Option::is_none")]
    pub model_id: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Part {
    /// Character count of the part's visible text.
    pub fn text_len(&self) -> usize {
        self.text.as_deref().map(|t| t.chars().count()).unwrap_or(0)
    }

    /// Tool output, when the tool has completed.
    pub fn tool_output(&self) -> Option<&str> {
        self.state
            .as_ref()
            .and_then(|s| s.get("output"))
            .and_then(Value::as_str)
    }
}

/// A message as returned by the history endpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageWithParts {
    pub info: MessageInfo,
    #[serde(default)]
    pub parts: Vec<Part>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionTime {
    #[serde(default)]
    pub created: i64,
    #[serde(default)]
    pub updated: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compacting: Option<i64>,
}

/// Session metadata
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionInfo {
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub directory: Option<String>,
    #[serde(rename = "parentID", default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    #[serde(default)]
    pub time: SessionTime,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Authoritative per-session run status reported by the backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionStatusInfo {
    Idle,
    Busy,
    Retry {
        #[serde(default)]
        attempt: u32,
        #[serde(default)]
        message: String,
        #[serde(default)]
        next: i64,
    },
    #[serde(other)]
    Unknown,
}

impl SessionStatusInfo {
    /// Busy and retrying both mean the backend is still working.
    pub fn is_active(&self) -> bool {
        matches!(self, SessionStatusInfo::Busy | SessionStatusInfo::Retry { .. })
    }
}

/// `GET /session/status` response
pub type SessionStatusMap = HashMap<String, SessionStatusInfo>;

/// Pending tool permission prompt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PermissionRequest {
    pub id: String,
    #[serde(rename = "sessionID")]
    pub session_id: String,
    #[serde(default, alias = "type")]
    pub permission: String,
    #[serde(default)]
    pub patterns: Vec<String>,
    #[serde(default)]
    pub metadata: Value,
}

/// Pending question prompt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuestionRequest {
    pub id: String,
    #[serde(rename = "sessionID")]
    pub session_id: String,
    #[serde(default)]
    pub questions: Value,
}

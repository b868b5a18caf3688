//! Native notification gating
//!
//! Replayed events must not produce repeated notifications or toasts. Each
//! gate remembers every key it has decided on for the life of the
//! connection and is only cleared on full teardown.

use std::collections::HashSet;

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    ResponseReady,
    PermissionRequested,
    QuestionAsked,
}

/// A notification the host should surface natively
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NativeNotification {
    pub id: String,
    pub kind: NotificationKind,
    pub session_id: String,
    pub title: String,
    pub body: String,
}

impl NativeNotification {
    pub fn new(kind: NotificationKind, session_id: &str, title: &str, body: String) -> Self {
        Self {
            id: chatsync_protocol::new_id(),
            kind,
            session_id: session_id.to_string(),
            title: title.to_string(),
            body,
        }
    }
}

/// In-app toast (non-native)
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Toast {
    pub session_id: String,
    pub message_id: String,
    pub text: String,
}

#[derive(Debug, Default)]
pub struct NotificationGate {
    seen: HashSet<String>,
}

impl NotificationGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// True at most once per key, and only if `allowed` on that first
    /// evaluation. A key first seen while gated off stays suppressed.
    pub fn admit(&mut self, key: &str, allowed: bool) -> bool {
        let first = self.seen.insert(key.to_string());
        first && allowed
    }

    pub fn contains(&self, key: &str) -> bool {
        self.seen.contains(key)
    }

    pub fn clear(&mut self) {
        self.seen.clear();
    }
}

/// The three dedup sets the dispatcher consults
#[derive(Debug, Default)]
pub struct Gates {
    pub notified_messages: NotificationGate,
    pub notified_questions: NotificationGate,
    pub empty_response_toasts: NotificationGate,
}

impl Gates {
    pub fn clear(&mut self) {
        self.notified_messages.clear();
        self.notified_questions.clear();
        self.empty_response_toasts.clear();
    }
}

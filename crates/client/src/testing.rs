//! In-memory backend fakes for engine tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chatsync_connectors::{Backend, ConnectorError, EventSource, EventStream};
use chatsync_protocol::{
    MessageInfo, MessageRole, MessageWithParts, Part, PartKind, PermissionRequest,
    QuestionRequest, SessionInfo, SessionStatusInfo, SessionStatusMap,
};
use futures::channel::mpsc;

type FrameSender = mpsc::UnboundedSender<Result<String, ConnectorError>>;

#[derive(Default)]
struct SourceInner {
    sender: Option<FrameSender>,
    fail_next: bool,
    subscribes: usize,
}

/// Event channel the test drives by hand
#[derive(Default)]
pub struct FakeSource {
    inner: Mutex<SourceInner>,
}

impl FakeSource {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn push(&self, frame: &str) {
        let inner = self.inner.lock().unwrap();
        if let Some(sender) = inner.sender.as_ref() {
            let _ = sender.unbounded_send(Ok(frame.to_string()));
        }
    }

    pub fn push_json(&self, frame: serde_json::Value) {
        self.push(&frame.to_string());
    }

    /// End the current stream as if the connection dropped.
    pub fn drop_stream(&self) {
        self.inner.lock().unwrap().sender.take();
    }

    pub fn fail_next_subscribe(&self) {
        self.inner.lock().unwrap().fail_next = true;
    }

    pub fn subscribe_count(&self) -> usize {
        self.inner.lock().unwrap().subscribes
    }

    pub fn is_subscribed(&self) -> bool {
        self.inner
            .lock()
            .unwrap()
            .sender
            .as_ref()
            .is_some_and(|s| !s.is_closed())
    }
}

#[async_trait]
impl EventSource for FakeSource {
    async fn subscribe(&self) -> Result<EventStream, ConnectorError> {
        let mut inner = self.inner.lock().unwrap();
        inner.subscribes += 1;
        if std::mem::take(&mut inner.fail_next) {
            return Err(ConnectorError::Transport("connection refused".to_string()));
        }
        let (tx, rx) = mpsc::unbounded();
        inner.sender = Some(tx);
        Ok(Box::pin(rx))
    }
}

/// Request/response backend with canned answers and call recording
pub struct FakeBackend {
    healthy: AtomicBool,
    fail_loads: AtomicBool,
    health_calls: AtomicUsize,
    status_calls: AtomicUsize,
    session_calls: AtomicUsize,
    permission_calls: AtomicUsize,
    load_limits: Mutex<Vec<(String, Option<usize>)>>,
    messages: Mutex<HashMap<String, Vec<MessageWithParts>>>,
    statuses: Mutex<SessionStatusMap>,
    permissions: Mutex<Vec<PermissionRequest>>,
    questions: Mutex<Vec<QuestionRequest>>,
}

impl FakeBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            healthy: AtomicBool::new(true),
            fail_loads: AtomicBool::new(false),
            health_calls: AtomicUsize::new(0),
            status_calls: AtomicUsize::new(0),
            session_calls: AtomicUsize::new(0),
            permission_calls: AtomicUsize::new(0),
            load_limits: Mutex::new(Vec::new()),
            messages: Mutex::new(HashMap::new()),
            statuses: Mutex::new(HashMap::new()),
            permissions: Mutex::new(Vec::new()),
            questions: Mutex::new(Vec::new()),
        })
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }

    pub fn set_fail_loads(&self, fail: bool) {
        self.fail_loads.store(fail, Ordering::SeqCst);
    }

    pub fn set_messages(&self, session_id: &str, messages: Vec<MessageWithParts>) {
        self.messages
            .lock()
            .unwrap()
            .insert(session_id.to_string(), messages);
    }

    pub fn set_status(&self, session_id: &str, status: Option<SessionStatusInfo>) {
        let mut statuses = self.statuses.lock().unwrap();
        match status {
            Some(status) => statuses.insert(session_id.to_string(), status),
            None => statuses.remove(session_id),
        };
    }

    pub fn set_permissions(&self, permissions: Vec<PermissionRequest>) {
        *self.permissions.lock().unwrap() = permissions;
    }

    pub fn health_calls(&self) -> usize {
        self.health_calls.load(Ordering::SeqCst)
    }

    pub fn status_calls(&self) -> usize {
        self.status_calls.load(Ordering::SeqCst)
    }

    pub fn session_calls(&self) -> usize {
        self.session_calls.load(Ordering::SeqCst)
    }

    pub fn permission_calls(&self) -> usize {
        self.permission_calls.load(Ordering::SeqCst)
    }

    /// Every `load_messages` call so far as `(session_id, limit)`
    pub fn load_limits(&self) -> Vec<(String, Option<usize>)> {
        self.load_limits.lock().unwrap().clone()
    }

    pub fn full_loads(&self) -> usize {
        self.load_limits()
            .iter()
            .filter(|(_, limit)| limit.is_none())
            .count()
    }

    pub fn incremental_loads(&self) -> usize {
        self.load_limits()
            .iter()
            .filter(|(_, limit)| limit.is_some())
            .count()
    }
}

#[async_trait]
impl Backend for FakeBackend {
    async fn list_pending_permissions(&self) -> Result<Vec<PermissionRequest>, ConnectorError> {
        self.permission_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.permissions.lock().unwrap().clone())
    }

    async fn list_pending_questions(
        &self,
        session_id: Option<&str>,
    ) -> Result<Vec<QuestionRequest>, ConnectorError> {
        Ok(self
            .questions
            .lock()
            .unwrap()
            .iter()
            .filter(|q| session_id.map_or(true, |id| q.session_id == id))
            .cloned()
            .collect())
    }

    async fn get_session(&self, session_id: &str) -> Result<SessionInfo, ConnectorError> {
        self.session_calls.fetch_add(1, Ordering::SeqCst);
        Ok(SessionInfo {
            id: session_id.to_string(),
            title: format!("Session {session_id}"),
            ..Default::default()
        })
    }

    async fn get_global_session_status(&self) -> Result<SessionStatusMap, ConnectorError> {
        self.status_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.statuses.lock().unwrap().clone())
    }

    async fn check_health(&self) -> bool {
        self.health_calls.fetch_add(1, Ordering::SeqCst);
        self.healthy.load(Ordering::SeqCst)
    }

    async fn load_messages(
        &self,
        session_id: &str,
        limit: Option<usize>,
    ) -> Result<Vec<MessageWithParts>, ConnectorError> {
        self.load_limits
            .lock()
            .unwrap()
            .push((session_id.to_string(), limit));
        if self.fail_loads.load(Ordering::SeqCst) {
            return Err(ConnectorError::Status {
                status: 500,
                body: "internal error".to_string(),
            });
        }
        let all = self
            .messages
            .lock()
            .unwrap()
            .get(session_id)
            .cloned()
            .unwrap_or_default();
        Ok(match limit {
            Some(limit) if all.len() > limit => all[all.len() - limit..].to_vec(),
            _ => all,
        })
    }
}

/// A finished assistant message with one text part
pub fn assistant_message(session_id: &str, message_id: &str, text: &str) -> MessageWithParts {
    let mut info = MessageInfo::placeholder(message_id, session_id);
    info.role = MessageRole::Assistant;
    info.finish = Some("stop".to_string());
    MessageWithParts {
        info,
        parts: vec![Part {
            id: format!("{message_id}-p1"),
            session_id: session_id.to_string(),
            message_id: message_id.to_string(),
            kind: PartKind::Text,
            text: Some(text.to_string()),
            tool: None,
            state: None,
            provider_id: None,
            model_id: None,
            extra: Default::default(),
        }],
    }
}

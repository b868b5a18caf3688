//! Session-scoped state
//!
//! One `SessionStore` exists per selected session and is dropped wholesale
//! when the selection changes or the session is deleted. Nothing here is
//! ever merged across sessions.

use std::collections::{HashMap, HashSet};

use chatsync_protocol::{
    MessageInfo, MessageWithParts, Part, PermissionRequest, QuestionRequest, SessionInfo,
};
use serde_json::Value;
use tokio::time::Instant;

/// A message and its ordered parts
#[derive(Debug, Clone, PartialEq)]
pub struct MessageEntry {
    pub info: MessageInfo,
    pub parts: Vec<Part>,
}

impl MessageEntry {
    fn new(info: MessageInfo) -> Self {
        Self {
            info,
            parts: Vec::new(),
        }
    }

    /// Total characters across all parts
    pub fn text_len(&self) -> usize {
        self.parts.iter().map(Part::text_len).sum()
    }

    /// True if the message produced no visible output at all.
    pub fn is_empty_response(&self) -> bool {
        self.text_len() == 0 && !self.parts.iter().any(|p| p.tool_output().is_some())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamPhase {
    Streaming,
    /// Generation ended but no terminal finish reason seen yet
    Cooldown,
    Completed,
}

/// Streaming lifecycle of one in-flight message
#[derive(Debug, Clone, PartialEq)]
pub struct MessageStreamLifecycle {
    pub phase: StreamPhase,
    pub started_at: Instant,
    pub last_update_at: Instant,
    pub completed_at: Option<Instant>,
}

impl MessageStreamLifecycle {
    fn started(now: Instant) -> Self {
        Self {
            phase: StreamPhase::Streaming,
            started_at: now,
            last_update_at: now,
            completed_at: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelRef {
    pub provider_id: String,
    pub model_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartOutcome {
    Appended,
    Replaced,
    Duplicate,
    /// Shrank by more than the tolerance; discarded
    Regressed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InfoOutcome {
    Applied { created: bool },
    Regressed,
}

#[derive(Debug)]
pub struct SessionStore {
    pub session_id: String,
    pub directory: Option<String>,
    pub info: Option<SessionInfo>,
    pub compacting_at: Option<i64>,
    pub last_error: Option<Value>,
    pub model: Option<ModelRef>,
    messages: Vec<MessageEntry>,
    lifecycles: HashMap<String, MessageStreamLifecycle>,
    /// Longest accumulated text seen per message
    peak_text: HashMap<String, usize>,
    permissions: Vec<PermissionRequest>,
    questions: Vec<QuestionRequest>,
    user_message_ids: HashSet<String>,
}

fn shrank(existing: usize, incoming: usize, tolerance: usize) -> bool {
    existing > incoming.saturating_add(tolerance)
}

impl SessionStore {
    pub fn new(session_id: String, directory: Option<String>) -> Self {
        Self {
            session_id,
            directory,
            info: None,
            compacting_at: None,
            last_error: None,
            model: None,
            messages: Vec::new(),
            lifecycles: HashMap::new(),
            peak_text: HashMap::new(),
            permissions: Vec::new(),
            questions: Vec::new(),
            user_message_ids: HashSet::new(),
        }
    }

    pub fn messages(&self) -> &[MessageEntry] {
        &self.messages
    }

    pub fn message(&self, id: &str) -> Option<&MessageEntry> {
        self.messages.iter().find(|m| m.info.id == id)
    }

    pub fn permissions(&self) -> &[PermissionRequest] {
        &self.permissions
    }

    pub fn questions(&self) -> &[QuestionRequest] {
        &self.questions
    }

    pub fn user_messages_seen(&self) -> usize {
        self.user_message_ids.len()
    }

    fn entry_index(&mut self, message_id: &str) -> usize {
        match self.messages.iter().position(|m| m.info.id == message_id) {
            Some(index) => index,
            None => {
                let info = MessageInfo::placeholder(message_id, &self.session_id);
                self.messages.push(MessageEntry::new(info));
                self.messages.len() - 1
            }
        }
    }

    fn entry_mut(&mut self, message_id: &str) -> &mut MessageEntry {
        let index = self.entry_index(message_id);
        &mut self.messages[index]
    }

    /// Longest text this message has held, including what it holds now.
    fn peak_len(&self, message_id: &str) -> usize {
        let held = self.message(message_id).map_or(0, MessageEntry::text_len);
        self.peak_text
            .get(message_id)
            .copied()
            .unwrap_or(0)
            .max(held)
    }

    fn raise_peak(&mut self, message_id: &str, len: usize) {
        let peak = self.peak_text.entry(message_id.to_string()).or_insert(0);
        *peak = (*peak).max(len);
    }

    // -- Parts ----------------------------------------------------------------

    /// Merge a part snapshot. An existing part with the same id and kind is
    /// replaced in place unless that would leave the message's accumulated
    /// text more than `tolerance` characters below the longest it has been.
    pub fn upsert_part(&mut self, part: Part, tolerance: usize) -> PartOutcome {
        let message_id = part.message_id.clone();
        let peak = self.peak_len(&message_id);
        let index = self.entry_index(&message_id);
        let entry = &mut self.messages[index];
        let total = entry.text_len();

        let outcome = match entry
            .parts
            .iter_mut()
            .find(|p| p.id == part.id && p.kind == part.kind)
        {
            Some(existing) if *existing == part => return PartOutcome::Duplicate,
            Some(existing) => {
                let next_total = total - existing.text_len() + part.text_len();
                if shrank(peak, next_total, tolerance) {
                    return PartOutcome::Regressed;
                }
                *existing = part;
                PartOutcome::Replaced
            }
            None => {
                entry.parts.push(part);
                PartOutcome::Appended
            }
        };
        let len = entry.text_len();
        self.raise_peak(&message_id, len);
        outcome
    }

    pub fn remove_part(&mut self, message_id: &str, part_id: &str) -> bool {
        let Some(entry) = self.messages.iter_mut().find(|m| m.info.id == message_id) else {
            return false;
        };
        let before = entry.parts.len();
        entry.parts.retain(|p| p.id != part_id);
        if entry.parts.len() == before {
            return false;
        }
        let len = entry.text_len();
        self.peak_text.insert(message_id.to_string(), len);
        true
    }

    pub fn remove_message(&mut self, message_id: &str) -> bool {
        let before = self.messages.len();
        self.messages.retain(|m| m.info.id != message_id);
        self.lifecycles.remove(message_id);
        self.peak_text.remove(message_id);
        self.messages.len() != before
    }

    // -- Message metadata -----------------------------------------------------

    /// Apply a message metadata update, optionally carrying a full part
    /// snapshot. A snapshot whose text is shorter than what is already held
    /// (beyond `tolerance`) is a stale replay: the whole update is refused.
    pub fn apply_message_info(
        &mut self,
        info: MessageInfo,
        parts: Option<Vec<Part>>,
        tolerance: usize,
    ) -> InfoOutcome {
        let created = self.message(&info.id).is_none();
        if let (false, Some(parts)) = (created, parts.as_ref()) {
            let incoming: usize = parts.iter().map(Part::text_len).sum();
            if shrank(self.peak_len(&info.id), incoming, tolerance) {
                return InfoOutcome::Regressed;
            }
        }

        let entry = self.entry_mut(&info.id);
        entry.info = info;
        for part in parts.into_iter().flatten() {
            self.upsert_part(part, tolerance);
        }
        InfoOutcome::Applied { created }
    }

    pub fn record_user_message(&mut self, message_id: &str) -> bool {
        self.user_message_ids.insert(message_id.to_string())
    }

    pub fn set_model(&mut self, provider_id: Option<&str>, model_id: Option<&str>) {
        if let (Some(provider_id), Some(model_id)) = (provider_id, model_id) {
            self.model = Some(ModelRef {
                provider_id: provider_id.to_string(),
                model_id: model_id.to_string(),
            });
        }
    }

    // -- Lifecycles -----------------------------------------------------------

    pub fn lifecycle(&self, message_id: &str) -> Option<&MessageStreamLifecycle> {
        self.lifecycles.get(message_id)
    }

    pub fn is_completed(&self, message_id: &str) -> bool {
        self.lifecycles
            .get(message_id)
            .is_some_and(|l| l.phase == StreamPhase::Completed)
    }

    /// Record streaming activity. Completed lifecycles are never revived.
    pub fn touch_streaming(&mut self, message_id: &str, now: Instant) {
        let lifecycle = self
            .lifecycles
            .entry(message_id.to_string())
            .or_insert_with(|| MessageStreamLifecycle::started(now));
        if lifecycle.phase != StreamPhase::Completed {
            lifecycle.phase = StreamPhase::Streaming;
            lifecycle.last_update_at = now;
        }
    }

    pub fn mark_cooldown(&mut self, message_id: &str, now: Instant) {
        let lifecycle = self
            .lifecycles
            .entry(message_id.to_string())
            .or_insert_with(|| MessageStreamLifecycle::started(now));
        if lifecycle.phase == StreamPhase::Streaming {
            lifecycle.phase = StreamPhase::Cooldown;
            lifecycle.last_update_at = now;
        }
    }

    /// Returns true if this call completed the lifecycle.
    pub fn complete(&mut self, message_id: &str, now: Instant) -> bool {
        let lifecycle = self
            .lifecycles
            .entry(message_id.to_string())
            .or_insert_with(|| MessageStreamLifecycle::started(now));
        if lifecycle.phase == StreamPhase::Completed {
            return false;
        }
        lifecycle.phase = StreamPhase::Completed;
        lifecycle.last_update_at = now;
        lifecycle.completed_at = Some(now);
        true
    }

    /// Complete the named message, or every open lifecycle when unnamed.
    pub fn force_complete(&mut self, message_id: Option<&str>, now: Instant) -> usize {
        match message_id {
            Some(id) => usize::from(self.complete(id, now)),
            None => {
                let open: Vec<String> = self
                    .lifecycles
                    .iter()
                    .filter(|(_, l)| l.phase != StreamPhase::Completed)
                    .map(|(id, _)| id.clone())
                    .collect();
                for id in &open {
                    self.complete(id, now);
                }
                open.len()
            }
        }
    }

    // -- Prompts --------------------------------------------------------------

    pub fn enqueue_permission(&mut self, request: PermissionRequest) -> bool {
        if self.permissions.iter().any(|p| p.id == request.id) {
            return false;
        }
        self.permissions.push(request);
        true
    }

    pub fn remove_permission(&mut self, request_id: &str) -> bool {
        let before = self.permissions.len();
        self.permissions.retain(|p| p.id != request_id);
        self.permissions.len() != before
    }

    pub fn enqueue_question(&mut self, request: QuestionRequest) -> bool {
        if self.questions.iter().any(|q| q.id == request.id) {
            return false;
        }
        self.questions.push(request);
        true
    }

    pub fn remove_question(&mut self, request_id: &str) -> bool {
        let before = self.questions.len();
        self.questions.retain(|q| q.id != request_id);
        self.questions.len() != before
    }

    pub fn replace_permissions(&mut self, permissions: Vec<PermissionRequest>) {
        self.permissions = permissions
            .into_iter()
            .filter(|p| p.session_id == self.session_id)
            .collect();
    }

    pub fn replace_questions(&mut self, questions: Vec<QuestionRequest>) {
        self.questions = questions
            .into_iter()
            .filter(|q| q.session_id == self.session_id)
            .collect();
    }

    // -- Resync ---------------------------------------------------------------

    /// Reconcile fetched history. A full fetch replaces the collection
    /// (keeping only messages still streaming locally that the fetch did not
    /// include); a bounded fetch upserts by id. Either way a fetched message
    /// never rolls back longer local text.
    pub fn apply_history(
        &mut self,
        fetched: Vec<MessageWithParts>,
        full: bool,
        tolerance: usize,
        now: Instant,
    ) {
        let mut merged = Vec::with_capacity(fetched.len());
        let mut fetched_ids = HashSet::with_capacity(fetched.len());

        for message in fetched {
            fetched_ids.insert(message.info.id.clone());
            let finished = message.info.finish_reason().is_some();
            let id = message.info.id.clone();

            let incoming: usize = message.parts.iter().map(Part::text_len).sum();
            let entry = match self.message(&id) {
                Some(local) if shrank(self.peak_len(&id), incoming, tolerance) => local.clone(),
                _ => MessageEntry {
                    info: message.info,
                    parts: message.parts,
                },
            };
            if finished {
                self.complete(&id, now);
            }
            self.raise_peak(&id, entry.text_len());
            merged.push(entry);
        }

        if full {
            let in_flight: Vec<MessageEntry> = self
                .messages
                .iter()
                .filter(|m| !fetched_ids.contains(&m.info.id))
                .filter(|m| {
                    self.lifecycle(&m.info.id)
                        .is_some_and(|l| l.phase == StreamPhase::Streaming)
                })
                .cloned()
                .collect();
            merged.extend(in_flight);
            let keep: HashSet<&String> = merged.iter().map(|m| &m.info.id).collect();
            self.lifecycles.retain(|id, _| keep.contains(id));
            self.peak_text.retain(|id, _| keep.contains(id));
            self.messages = merged;
        } else {
            for entry in merged {
                match self.messages.iter_mut().find(|m| m.info.id == entry.info.id) {
                    Some(slot) => *slot = entry,
                    None => self.messages.push(entry),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chatsync_protocol::PartKind;
    use serde_json::{json, Map};

    const TOLERANCE: usize = 50;

    fn text_part(id: &str, message_id: &str, text: &str) -> Part {
        Part {
            id: id.to_string(),
            session_id: "ses_a".to_string(),
            message_id: message_id.to_string(),
            kind: PartKind::Text,
            text: Some(text.to_string()),
            tool: None,
            state: None,
            provider_id: None,
            model_id: None,
            extra: Map::new(),
        }
    }

    fn assistant(id: &str) -> MessageInfo {
        MessageInfo::placeholder(id, "ses_a")
    }

    fn store() -> SessionStore {
        SessionStore::new("ses_a".to_string(), None)
    }

    #[test]
    fn same_part_twice_is_idempotent() {
        let mut store = store();
        let part = text_part("p1", "m1", "hello");
        assert_eq!(store.upsert_part(part.clone(), TOLERANCE), PartOutcome::Appended);
        assert_eq!(store.upsert_part(part, TOLERANCE), PartOutcome::Duplicate);

        let entry = store.message("m1").unwrap();
        assert_eq!(entry.parts.len(), 1);
        assert_eq!(entry.text_len(), 5);
    }

    #[test]
    fn growing_part_replaces_in_place() {
        let mut store = store();
        store.upsert_part(text_part("p1", "m1", "hel"), TOLERANCE);
        assert_eq!(
            store.upsert_part(text_part("p1", "m1", "hello world"), TOLERANCE),
            PartOutcome::Replaced
        );
        assert_eq!(store.message("m1").unwrap().text_len(), 11);
    }

    #[test]
    fn same_id_different_kind_is_a_new_part() {
        let mut store = store();
        store.upsert_part(text_part("p1", "m1", "a"), TOLERANCE);
        let mut reasoning = text_part("p1", "m1", "b");
        reasoning.kind = PartKind::Reasoning;
        assert_eq!(store.upsert_part(reasoning, TOLERANCE), PartOutcome::Appended);
        assert_eq!(store.message("m1").unwrap().parts.len(), 2);
    }

    #[test]
    fn large_shrink_is_discarded() {
        let mut store = store();
        let long = "x".repeat(200);
        store.upsert_part(text_part("p1", "m1", &long), TOLERANCE);
        assert_eq!(
            store.upsert_part(text_part("p1", "m1", "short"), TOLERANCE),
            PartOutcome::Regressed
        );
        assert_eq!(store.message("m1").unwrap().text_len(), 200);
    }

    #[test]
    fn shrink_within_tolerance_is_applied() {
        let mut store = store();
        store.upsert_part(text_part("p1", "m1", &"x".repeat(100)), TOLERANCE);
        assert_eq!(
            store.upsert_part(text_part("p1", "m1", &"x".repeat(60)), TOLERANCE),
            PartOutcome::Replaced
        );
    }

    #[test]
    fn small_stale_replays_cannot_add_up_to_a_large_shrink() {
        let mut store = store();
        for id in ["p1", "p2", "p3"] {
            store.upsert_part(text_part(id, "m1", &"x".repeat(100)), TOLERANCE);
        }
        assert_eq!(store.message("m1").unwrap().text_len(), 300);

        // Each replay alone is 40 chars shorter than its part
        let replay = "x".repeat(60);
        assert_eq!(
            store.upsert_part(text_part("p1", "m1", &replay), TOLERANCE),
            PartOutcome::Replaced
        );
        assert_eq!(
            store.upsert_part(text_part("p2", "m1", &replay), TOLERANCE),
            PartOutcome::Regressed
        );
        assert_eq!(
            store.upsert_part(text_part("p3", "m1", &replay), TOLERANCE),
            PartOutcome::Regressed
        );
        assert_eq!(store.message("m1").unwrap().text_len(), 260);
    }

    #[test]
    fn removing_a_part_lowers_the_peak() {
        let mut store = store();
        store.upsert_part(text_part("p1", "m1", &"x".repeat(200)), TOLERANCE);
        store.upsert_part(text_part("p2", "m1", "tail"), TOLERANCE);
        assert!(store.remove_part("m1", "p1"));
        assert_eq!(
            store.upsert_part(text_part("p2", "m1", "t"), TOLERANCE),
            PartOutcome::Replaced
        );
    }

    #[test]
    fn stale_info_snapshot_is_refused() {
        let mut store = store();
        store.upsert_part(text_part("p1", "m1", &"y".repeat(300)), TOLERANCE);

        let mut info = assistant("m1");
        info.finish = Some("stop".to_string());
        let stale = vec![text_part("p1", "m1", "y")];
        assert_eq!(
            store.apply_message_info(info, Some(stale), TOLERANCE),
            InfoOutcome::Regressed
        );
        let entry = store.message("m1").unwrap();
        assert_eq!(entry.text_len(), 300);
        assert_eq!(entry.info.finish, None);
    }

    #[test]
    fn info_without_parts_updates_metadata() {
        let mut store = store();
        store.upsert_part(text_part("p1", "m1", "hi"), TOLERANCE);
        let mut info = assistant("m1");
        info.model_id = Some("gpt".to_string());
        assert_eq!(
            store.apply_message_info(info, None, TOLERANCE),
            InfoOutcome::Applied { created: false }
        );
        assert_eq!(store.message("m1").unwrap().info.model_id.as_deref(), Some("gpt"));
        assert_eq!(store.message("m1").unwrap().parts.len(), 1);
    }

    #[test]
    fn completed_lifecycle_is_terminal() {
        let mut store = store();
        let now = Instant::now();
        store.touch_streaming("m1", now);
        assert!(store.complete("m1", now));
        assert!(!store.complete("m1", now));

        store.touch_streaming("m1", now);
        assert_eq!(store.lifecycle("m1").unwrap().phase, StreamPhase::Completed);
    }

    #[test]
    fn force_complete_without_id_closes_all_open() {
        let mut store = store();
        let now = Instant::now();
        store.touch_streaming("m1", now);
        store.touch_streaming("m2", now);
        store.complete("m3", now);
        assert_eq!(store.force_complete(None, now), 2);
        assert!(store.is_completed("m1"));
        assert!(store.is_completed("m2"));
    }

    #[test]
    fn prompts_are_idempotent_by_id() {
        let mut store = store();
        let request = PermissionRequest {
            id: "per_1".to_string(),
            session_id: "ses_a".to_string(),
            permission: "bash".to_string(),
            patterns: vec![],
            metadata: json!({}),
        };
        assert!(store.enqueue_permission(request.clone()));
        assert!(!store.enqueue_permission(request));
        assert!(store.remove_permission("per_1"));
        assert!(!store.remove_permission("per_1"));
    }

    #[test]
    fn replace_permissions_keeps_only_this_session() {
        let mut store = store();
        let make = |id: &str, session: &str| PermissionRequest {
            id: id.to_string(),
            session_id: session.to_string(),
            permission: "edit".to_string(),
            patterns: vec![],
            metadata: json!({}),
        };
        store.replace_permissions(vec![make("a", "ses_a"), make("b", "ses_b")]);
        assert_eq!(store.permissions().len(), 1);
        assert_eq!(store.permissions()[0].id, "a");
    }

    fn fetched(id: &str, text: &str, finish: Option<&str>) -> MessageWithParts {
        let mut info = assistant(id);
        info.finish = finish.map(str::to_string);
        MessageWithParts {
            info,
            parts: vec![text_part(&format!("{id}_p"), id, text)],
        }
    }

    #[test]
    fn full_history_replaces_collection() {
        let mut store = store();
        let now = Instant::now();
        store.upsert_part(text_part("old_p", "old", "gone"), TOLERANCE);
        store.complete("old", now);

        store.apply_history(
            vec![fetched("m1", "a", Some("stop")), fetched("m2", "b", None)],
            true,
            TOLERANCE,
            now,
        );
        let ids: Vec<&str> = store.messages().iter().map(|m| m.info.id.as_str()).collect();
        assert_eq!(ids, vec!["m1", "m2"]);
        assert!(store.is_completed("m1"));
        assert!(!store.is_completed("m2"));
    }

    #[test]
    fn full_history_keeps_locally_streaming_message() {
        let mut store = store();
        let now = Instant::now();
        store.upsert_part(text_part("p", "live", "typing"), TOLERANCE);
        store.touch_streaming("live", now);

        store.apply_history(vec![fetched("m1", "a", Some("stop"))], true, TOLERANCE, now);
        let ids: Vec<&str> = store.messages().iter().map(|m| m.info.id.as_str()).collect();
        assert_eq!(ids, vec!["m1", "live"]);
    }

    #[test]
    fn incremental_history_upserts_and_never_rolls_back() {
        let mut store = store();
        let now = Instant::now();
        store.apply_history(
            vec![fetched("m1", "first", Some("stop"))],
            true,
            TOLERANCE,
            now,
        );
        store.upsert_part(text_part("m2_p", "m2", &"z".repeat(120)), TOLERANCE);

        store.apply_history(
            vec![fetched("m2", "z", None), fetched("m3", "new", None)],
            false,
            TOLERANCE,
            now,
        );
        let ids: Vec<&str> = store.messages().iter().map(|m| m.info.id.as_str()).collect();
        assert_eq!(ids, vec!["m1", "m2", "m3"]);
        assert_eq!(store.message("m2").unwrap().text_len(), 120);
    }

    #[test]
    fn user_messages_are_only_counted() {
        let mut store = store();
        assert!(store.record_user_message("u1"));
        assert!(!store.record_user_message("u1"));
        assert_eq!(store.user_messages_seen(), 1);
        assert!(store.messages().is_empty());
    }
}

//! Event dispatch
//!
//! All session-state changes driven by inbound events live here as one
//! synchronous function: `dispatch(state, envelope, env) -> effects`.
//! No IO, no timers, no channels; the engine executes the returned effects.

use chatsync_protocol::{
    ActivityPhase, EventKind, FinishReason, MessageInfo, MessageRole, Part, PermissionRequest,
    QuestionRequest, SessionInfo, SessionStatusInfo,
};
use serde_json::Value;
use tokio::time::Instant;
use tracing::debug;

use crate::config::{RuntimeKind, SyncConfig};
use crate::envelope::EventEnvelope;
use crate::notification::{Gates, NativeNotification, NotificationKind, Toast};
use crate::session::{InfoOutcome, PartOutcome, SessionStore};

// ---------------------------------------------------------------------------
// Effects — describe work for the engine
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    SetPhase(ActivityPhase),
    /// Debounced, fire-and-forget session metadata fetch
    RefreshSession,
    Notify(NativeNotification),
    Toast(Toast),
    ForwardTodos { session_id: String, todos: Value },
    /// The current session was deleted and all its state dropped
    SessionCleared { session_id: String },
    /// The session view changed and should be republished
    ViewChanged,
}

/// Read-only inputs for one dispatch
#[derive(Debug, Clone, Copy)]
pub struct DispatchEnv<'a> {
    pub config: &'a SyncConfig,
    pub visible: bool,
    pub phase: ActivityPhase,
    pub now: Instant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    NoSession,
    OtherSession,
    OtherDirectory,
    Malformed,
}

// ---------------------------------------------------------------------------
// dispatch() — the pure core
// ---------------------------------------------------------------------------

/// Apply one event to the current session state.
///
/// Events naming a session other than the current one are dropped before
/// any handler runs. Handlers never reorder; they only apply or drop.
pub fn dispatch(
    session: &mut Option<SessionStore>,
    gates: &mut Gates,
    envelope: EventEnvelope,
    env: &DispatchEnv<'_>,
) -> Vec<Effect> {
    let kind = envelope.kind.clone();
    match route(session, gates, envelope, env) {
        Ok(effects) => effects,
        Err(reason) => {
            debug!(
                component = "dispatch",
                event = "dispatch.dropped",
                kind = kind.as_str(),
                reason = ?reason,
                "Event dropped"
            );
            Vec::new()
        }
    }
}

fn route(
    session: &mut Option<SessionStore>,
    gates: &mut Gates,
    envelope: EventEnvelope,
    env: &DispatchEnv<'_>,
) -> Result<Vec<Effect>, DropReason> {
    if matches!(
        envelope.kind,
        EventKind::ServerConnected | EventKind::ServerHeartbeat | EventKind::Other(_)
    ) {
        return Ok(Vec::new());
    }

    let Some(store) = session.as_mut() else {
        return Err(DropReason::NoSession);
    };
    if let Some(sid) = envelope.session_id.as_deref() {
        if sid != store.session_id {
            return Err(DropReason::OtherSession);
        }
    }
    if let (Some(theirs), Some(ours)) = (envelope.directory.as_deref(), store.directory.as_deref())
    {
        if theirs != ours {
            return Err(DropReason::OtherDirectory);
        }
    }

    let mut effects = Vec::new();
    match envelope.kind {
        // -- Messages ---------------------------------------------------------
        EventKind::MessagePartUpdated => {
            let part: Part = envelope.property("part").ok_or(DropReason::Malformed)?;
            let message_id = part.message_id.clone();
            if message_id.is_empty() {
                return Err(DropReason::Malformed);
            }

            if !store.is_completed(&message_id) {
                if env.phase != ActivityPhase::Busy {
                    effects.push(Effect::SetPhase(ActivityPhase::Busy));
                }
                store.touch_streaming(&message_id, env.now);
            }

            let provider = part
                .provider_id
                .clone()
                .or_else(|| envelope.str_property("providerID").map(str::to_string));
            let model = part
                .model_id
                .clone()
                .or_else(|| envelope.str_property("modelID").map(str::to_string));
            store.set_model(provider.as_deref(), model.as_deref());

            match store.upsert_part(part, env.config.text_shrink_tolerance) {
                PartOutcome::Appended | PartOutcome::Replaced => effects.push(Effect::ViewChanged),
                PartOutcome::Duplicate => {}
                PartOutcome::Regressed => {
                    debug!(
                        component = "dispatch",
                        event = "dispatch.part.regressed",
                        session_id = %store.session_id,
                        message_id = %message_id,
                        "Discarded stale part snapshot"
                    );
                }
            }
        }

        EventKind::MessagePartRemoved => {
            let message_id = envelope.str_property("messageID").ok_or(DropReason::Malformed)?;
            let part_id = envelope.str_property("partID").ok_or(DropReason::Malformed)?;
            if store.remove_part(message_id, part_id) {
                effects.push(Effect::ViewChanged);
            }
        }

        EventKind::MessageUpdated => {
            let info: MessageInfo = envelope.property("info").ok_or(DropReason::Malformed)?;
            if info.role == MessageRole::User {
                if store.record_user_message(&info.id) {
                    debug!(
                        component = "dispatch",
                        event = "dispatch.user_message.seen",
                        session_id = %store.session_id,
                        message_id = %info.id,
                        "User message observed"
                    );
                }
                return Ok(effects);
            }
            message_updated(store, gates, &envelope, info, env, &mut effects);
        }

        EventKind::MessageRemoved => {
            let message_id = envelope.str_property("messageID").ok_or(DropReason::Malformed)?;
            if store.remove_message(message_id) {
                effects.push(Effect::ViewChanged);
            }
        }

        // -- Session lifecycle ------------------------------------------------
        EventKind::SessionCreated | EventKind::SessionUpdated => {
            let info: SessionInfo = envelope.property("info").ok_or(DropReason::Malformed)?;
            if info.id != store.session_id {
                return Err(DropReason::OtherSession);
            }
            store.compacting_at = info.time.compacting;
            store.info = Some(info);
            effects.push(Effect::ViewChanged);
        }

        EventKind::SessionDeleted => {
            let session_id = store.session_id.clone();
            if envelope.session_id.as_deref() != Some(session_id.as_str()) {
                return Err(DropReason::OtherSession);
            }
            *session = None;
            if env.phase != ActivityPhase::Idle {
                effects.push(Effect::SetPhase(ActivityPhase::Idle));
            }
            effects.push(Effect::SessionCleared { session_id });
        }

        EventKind::SessionAbort => {
            let message_id = envelope.str_property("messageID");
            store.force_complete(message_id, env.now);
            if env.phase != ActivityPhase::Idle {
                effects.push(Effect::SetPhase(ActivityPhase::Idle));
            }
            effects.push(Effect::ViewChanged);
        }

        EventKind::SessionStatus => {
            let status: SessionStatusInfo =
                envelope.property("status").ok_or(DropReason::Malformed)?;
            if status.is_active() {
                if env.phase != ActivityPhase::Busy {
                    effects.push(Effect::SetPhase(ActivityPhase::Busy));
                }
            } else if status == SessionStatusInfo::Idle {
                settle_idle(env, &mut effects);
            }
        }

        EventKind::SessionIdle => settle_idle(env, &mut effects),

        EventKind::SessionError => {
            store.last_error = envelope.properties.get("error").cloned();
            if env.phase != ActivityPhase::Idle {
                effects.push(Effect::SetPhase(ActivityPhase::Idle));
            }
            effects.push(Effect::ViewChanged);
        }

        // -- Prompts ----------------------------------------------------------
        EventKind::PermissionAsked => {
            let request: PermissionRequest =
                envelope.properties_as().ok_or(DropReason::Malformed)?;
            let key = format!("{}:{}", request.session_id, request.id);
            let body = match request.patterns.first() {
                Some(pattern) => format!("{}: {}", request.permission, pattern),
                None => request.permission.clone(),
            };
            if store.enqueue_permission(request) {
                effects.push(Effect::ViewChanged);
            }
            if gates
                .notified_questions
                .admit(&key, env.config.notifications.allows(env.visible))
            {
                effects.push(Effect::Notify(NativeNotification::new(
                    NotificationKind::PermissionRequested,
                    &store.session_id,
                    "Permission requested",
                    body,
                )));
            }
        }

        EventKind::PermissionReplied => {
            let request_id = envelope
                .str_property("requestID")
                .or_else(|| envelope.str_property("permissionID"))
                .ok_or(DropReason::Malformed)?;
            if store.remove_permission(request_id) {
                effects.push(Effect::ViewChanged);
            }
        }

        EventKind::QuestionAsked => {
            let request: QuestionRequest =
                envelope.properties_as().ok_or(DropReason::Malformed)?;
            let key = format!("{}:{}", request.session_id, request.id);
            if store.enqueue_question(request) {
                effects.push(Effect::ViewChanged);
            }
            if gates
                .notified_questions
                .admit(&key, env.config.notifications.allows(env.visible))
            {
                effects.push(Effect::Notify(NativeNotification::new(
                    NotificationKind::QuestionAsked,
                    &store.session_id,
                    "Question",
                    "The assistant is waiting for your answer".to_string(),
                )));
            }
        }

        EventKind::QuestionReplied | EventKind::QuestionRejected => {
            let request_id = envelope.str_property("requestID").ok_or(DropReason::Malformed)?;
            if store.remove_question(request_id) {
                effects.push(Effect::ViewChanged);
            }
        }

        EventKind::TodoUpdated => {
            let todos = envelope
                .properties
                .get("todos")
                .cloned()
                .ok_or(DropReason::Malformed)?;
            effects.push(Effect::ForwardTodos {
                session_id: store.session_id.clone(),
                todos,
            });
        }

        EventKind::ServerConnected | EventKind::ServerHeartbeat | EventKind::Other(_) => {}
    }

    Ok(effects)
}

/// Backend says the session stopped. The interactive runtime lets an
/// armed cooldown run out on its own.
fn settle_idle(env: &DispatchEnv<'_>, effects: &mut Vec<Effect>) {
    let keep_cooldown =
        env.config.runtime == RuntimeKind::Interactive && env.phase == ActivityPhase::Cooldown;
    if env.phase != ActivityPhase::Idle && !keep_cooldown {
        effects.push(Effect::SetPhase(ActivityPhase::Idle));
    }
}

fn message_updated(
    store: &mut SessionStore,
    gates: &mut Gates,
    envelope: &EventEnvelope,
    info: MessageInfo,
    env: &DispatchEnv<'_>,
    effects: &mut Vec<Effect>,
) {
    let message_id = info.id.clone();
    let finish = info.finish_reason();
    let completed_at = info.time.completed;
    let snapshot: Option<Vec<Part>> = envelope.property("parts");
    store.set_model(info.provider_id.as_deref(), info.model_id.as_deref());

    match store.apply_message_info(info, snapshot, env.config.text_shrink_tolerance) {
        InfoOutcome::Regressed => {
            debug!(
                component = "dispatch",
                event = "dispatch.message.regressed",
                session_id = %store.session_id,
                message_id = %message_id,
                "Discarded stale message snapshot"
            );
            return;
        }
        InfoOutcome::Applied { .. } => effects.push(Effect::ViewChanged),
    }

    let Some(reason) = finish else {
        if completed_at.is_some() {
            store.mark_cooldown(&message_id, env.now);
        }
        return;
    };

    let newly_completed = store.complete(&message_id, env.now);
    effects.push(Effect::RefreshSession);

    if env.config.runtime != RuntimeKind::Interactive || reason != FinishReason::Stop {
        return;
    }

    if newly_completed && env.phase != ActivityPhase::Idle {
        effects.push(Effect::SetPhase(ActivityPhase::Cooldown));
    }

    if gates
        .notified_messages
        .admit(&message_id, env.config.notifications.allows(env.visible))
    {
        let title = store
            .info
            .as_ref()
            .map(|i| i.title.clone())
            .filter(|t| !t.is_empty())
            .unwrap_or_else(|| "Response ready".to_string());
        effects.push(Effect::Notify(NativeNotification::new(
            NotificationKind::ResponseReady,
            &store.session_id,
            &title,
            "The assistant finished responding".to_string(),
        )));
    }

    let empty = store
        .message(&message_id)
        .is_some_and(|entry| entry.is_empty_response());
    if empty && gates.empty_response_toasts.admit(&message_id, true) {
        effects.push(Effect::Toast(Toast {
            session_id: store.session_id.clone(),
            message_id,
            text: "The assistant returned an empty response".to_string(),
        }));
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NotificationMode;
    use crate::envelope::decode_value;
    use serde_json::json;

    fn config() -> SyncConfig {
        let mut config = SyncConfig::default();
        config.notifications.mode = NotificationMode::Always;
        config
    }

    fn session() -> Option<SessionStore> {
        Some(SessionStore::new("A".to_string(), None))
    }

    fn env(config: &SyncConfig, phase: ActivityPhase) -> DispatchEnv<'_> {
        DispatchEnv {
            config,
            visible: true,
            phase,
            now: Instant::now(),
        }
    }

    fn part_event(session_id: &str, message_id: &str, part_id: &str, text: &str) -> EventEnvelope {
        decode_value(json!({
            "type": "message.part.updated",
            "properties": {"part": {
                "id": part_id,
                "sessionID": session_id,
                "messageID": message_id,
                "type": "text",
                "text": text
            }}
        }))
        .unwrap()
    }

    fn finish_event(session_id: &str, message_id: &str, finish: &str) -> EventEnvelope {
        decode_value(json!({
            "type": "message.updated",
            "properties": {"info": {
                "id": message_id,
                "sessionID": session_id,
                "role": "assistant",
                "finish": finish,
                "time": {"created": 1, "completed": 2}
            }}
        }))
        .unwrap()
    }

    fn text_of(session: &Option<SessionStore>, message_id: &str) -> String {
        session
            .as_ref()
            .and_then(|s| s.message(message_id))
            .map(|m| {
                m.parts
                    .iter()
                    .filter_map(|p| p.text.clone())
                    .collect::<String>()
            })
            .unwrap_or_default()
    }

    #[test]
    fn first_part_sets_busy() {
        let config = config();
        let mut session = session();
        let mut gates = Gates::default();
        let effects = dispatch(
            &mut session,
            &mut gates,
            part_event("A", "m1", "p1", "hi"),
            &env(&config, ActivityPhase::Idle),
        );
        assert!(effects.contains(&Effect::SetPhase(ActivityPhase::Busy)));
        assert!(effects.contains(&Effect::ViewChanged));
    }

    #[test]
    fn busy_is_not_reset_when_already_busy() {
        let config = config();
        let mut session = session();
        let mut gates = Gates::default();
        let effects = dispatch(
            &mut session,
            &mut gates,
            part_event("A", "m1", "p1", "hi"),
            &env(&config, ActivityPhase::Busy),
        );
        assert!(!effects
            .iter()
            .any(|e| matches!(e, Effect::SetPhase(_))));
    }

    #[test]
    fn duplicate_part_event_yields_identical_text() {
        let config = config();
        let mut session = session();
        let mut gates = Gates::default();
        let env = env(&config, ActivityPhase::Busy);

        dispatch(&mut session, &mut gates, part_event("A", "m1", "p1", "hello"), &env);
        let once = text_of(&session, "m1");
        let effects = dispatch(&mut session, &mut gates, part_event("A", "m1", "p1", "hello"), &env);

        assert_eq!(text_of(&session, "m1"), once);
        assert!(effects.is_empty());
    }

    #[test]
    fn text_length_never_regresses_past_tolerance() {
        let config = config();
        let mut session = session();
        let mut gates = Gates::default();
        let env = env(&config, ActivityPhase::Busy);

        let mut lengths = Vec::new();
        for text in ["a", "ab", &"c".repeat(120), "short", &"c".repeat(130)] {
            dispatch(&mut session, &mut gates, part_event("A", "m1", "p1", text), &env);
            lengths.push(text_of(&session, "m1").chars().count());
        }
        assert_eq!(lengths, vec![1, 2, 120, 120, 130]);
    }

    #[test]
    fn event_for_other_session_changes_nothing() {
        let config = config();
        let mut session = session();
        let mut gates = Gates::default();
        let env = env(&config, ActivityPhase::Idle);

        let effects = dispatch(&mut session, &mut gates, part_event("B", "m1", "p1", "x"), &env);
        assert!(effects.is_empty());
        assert!(session.as_ref().unwrap().messages().is_empty());

        let effects = dispatch(&mut session, &mut gates, finish_event("B", "m1", "stop"), &env);
        assert!(effects.is_empty());
        assert!(!gates.notified_messages.contains("m1"));
    }

    #[test]
    fn event_for_other_directory_is_dropped() {
        let config = config();
        let mut session = Some(SessionStore::new("A".to_string(), Some("/a".to_string())));
        let mut gates = Gates::default();
        let envelope = decode_value(json!({
            "directory": "/b",
            "payload": {"type": "todo.updated", "properties": {"sessionID": "A", "todos": []}}
        }))
        .unwrap();
        let effects = dispatch(
            &mut session,
            &mut gates,
            envelope,
            &env(&config, ActivityPhase::Idle),
        );
        assert!(effects.is_empty());
    }

    #[test]
    fn stop_enters_cooldown_and_notifies_once() {
        let config = config();
        let mut session = session();
        let mut gates = Gates::default();
        let env = env(&config, ActivityPhase::Busy);
        dispatch(&mut session, &mut gates, part_event("A", "m1", "p1", "done"), &env);

        let effects = dispatch(&mut session, &mut gates, finish_event("A", "m1", "stop"), &env);
        assert!(effects.contains(&Effect::SetPhase(ActivityPhase::Cooldown)));
        assert!(effects.contains(&Effect::RefreshSession));
        assert_eq!(
            effects
                .iter()
                .filter(|e| matches!(e, Effect::Notify(_)))
                .count(),
            1
        );

        for _ in 0..3 {
            let replay = dispatch(&mut session, &mut gates, finish_event("A", "m1", "stop"), &env);
            assert!(!replay.iter().any(|e| matches!(e, Effect::Notify(_))));
            assert!(!replay.iter().any(|e| matches!(e, Effect::SetPhase(_))));
        }
    }

    #[test]
    fn hidden_only_mode_skips_visible_notifications() {
        let mut config = config();
        config.notifications.mode = NotificationMode::Hidden;
        let mut session = session();
        let mut gates = Gates::default();
        let effects = dispatch(
            &mut session,
            &mut gates,
            finish_event("A", "m1", "stop"),
            &env(&config, ActivityPhase::Busy),
        );
        assert!(!effects.iter().any(|e| matches!(e, Effect::Notify(_))));
    }

    #[test]
    fn embedded_runtime_has_no_cooldown_or_notification() {
        let mut config = config();
        config.runtime = RuntimeKind::Embedded;
        let mut session = session();
        let mut gates = Gates::default();
        let effects = dispatch(
            &mut session,
            &mut gates,
            finish_event("A", "m1", "stop"),
            &env(&config, ActivityPhase::Busy),
        );
        assert!(!effects.iter().any(|e| matches!(e, Effect::SetPhase(_))));
        assert!(!effects.iter().any(|e| matches!(e, Effect::Notify(_))));
        assert!(session.as_ref().unwrap().is_completed("m1"));
    }

    #[test]
    fn unknown_finish_does_not_complete() {
        let config = config();
        let mut session = session();
        let mut gates = Gates::default();
        dispatch(
            &mut session,
            &mut gates,
            finish_event("A", "m1", "unknown"),
            &env(&config, ActivityPhase::Busy),
        );
        assert!(!session.as_ref().unwrap().is_completed("m1"));
    }

    #[test]
    fn stale_snapshot_after_deltas_is_discarded() {
        let config = config();
        let mut session = session();
        let mut gates = Gates::default();
        let env = env(&config, ActivityPhase::Busy);
        let long = "w".repeat(400);
        dispatch(&mut session, &mut gates, part_event("A", "m1", "p1", &long), &env);

        let stale = decode_value(json!({
            "type": "message.updated",
            "properties": {
                "info": {"id": "m1", "sessionID": "A", "role": "assistant", "finish": "stop"},
                "parts": [{"id": "p1", "sessionID": "A", "messageID": "m1", "type": "text", "text": "w"}]
            }
        }))
        .unwrap();
        let effects = dispatch(&mut session, &mut gates, stale, &env);

        assert!(effects.is_empty());
        assert_eq!(text_of(&session, "m1"), long);
        assert!(!session.as_ref().unwrap().is_completed("m1"));
    }

    #[test]
    fn empty_response_toasts_once() {
        let config = config();
        let mut session = session();
        let mut gates = Gates::default();
        let env = env(&config, ActivityPhase::Busy);
        let effects = dispatch(&mut session, &mut gates, finish_event("A", "m1", "stop"), &env);
        assert_eq!(
            effects
                .iter()
                .filter(|e| matches!(e, Effect::Toast(_)))
                .count(),
            1
        );
        let replay = dispatch(&mut session, &mut gates, finish_event("A", "m1", "stop"), &env);
        assert!(!replay.iter().any(|e| matches!(e, Effect::Toast(_))));
    }

    #[test]
    fn user_message_is_tracked_only() {
        let config = config();
        let mut session = session();
        let mut gates = Gates::default();
        let envelope = decode_value(json!({
            "type": "message.updated",
            "properties": {"info": {"id": "u1", "sessionID": "A", "role": "user"}}
        }))
        .unwrap();
        let effects = dispatch(
            &mut session,
            &mut gates,
            envelope,
            &env(&config, ActivityPhase::Idle),
        );
        assert!(effects.is_empty());
        let store = session.as_ref().unwrap();
        assert!(store.messages().is_empty());
        assert_eq!(store.user_messages_seen(), 1);
    }

    #[test]
    fn session_updated_derives_compacting() {
        let config = config();
        let mut session = session();
        let mut gates = Gates::default();
        let envelope = decode_value(json!({
            "type": "session.updated",
            "properties": {"info": {"id": "A", "title": "Refactor", "time": {"created": 1, "updated": 2, "compacting": 99}}}
        }))
        .unwrap();
        dispatch(
            &mut session,
            &mut gates,
            envelope,
            &env(&config, ActivityPhase::Idle),
        );
        let store = session.as_ref().unwrap();
        assert_eq!(store.compacting_at, Some(99));
        assert_eq!(store.info.as_ref().unwrap().title, "Refactor");
    }

    #[test]
    fn deleting_current_session_hard_resets() {
        let config = config();
        let mut session = session();
        let mut gates = Gates::default();
        let env = env(&config, ActivityPhase::Busy);
        dispatch(&mut session, &mut gates, part_event("A", "m1", "p1", "x"), &env);

        let envelope = decode_value(json!({
            "type": "session.deleted",
            "properties": {"info": {"id": "A"}}
        }))
        .unwrap();
        let effects = dispatch(&mut session, &mut gates, envelope, &env);
        assert!(session.is_none());
        assert!(effects.contains(&Effect::SessionCleared {
            session_id: "A".to_string()
        }));
        assert!(effects.contains(&Effect::SetPhase(ActivityPhase::Idle)));
    }

    #[test]
    fn abort_without_session_id_force_completes() {
        let config = config();
        let mut session = session();
        let mut gates = Gates::default();
        let env = env(&config, ActivityPhase::Busy);
        dispatch(&mut session, &mut gates, part_event("A", "m1", "p1", "x"), &env);

        let envelope = decode_value(json!({
            "type": "session.abort",
            "properties": {"messageID": "m1"}
        }))
        .unwrap();
        let effects = dispatch(&mut session, &mut gates, envelope, &env);
        assert!(session.as_ref().unwrap().is_completed("m1"));
        assert!(effects.contains(&Effect::SetPhase(ActivityPhase::Idle)));
    }

    #[test]
    fn late_part_for_completed_message_does_not_revive_busy() {
        let config = config();
        let mut session = session();
        let mut gates = Gates::default();
        let busy = env(&config, ActivityPhase::Busy);
        dispatch(&mut session, &mut gates, finish_event("A", "m1", "stop"), &busy);

        let effects = dispatch(
            &mut session,
            &mut gates,
            part_event("A", "m1", "p1", "late"),
            &env(&config, ActivityPhase::Idle),
        );
        assert!(!effects.iter().any(|e| matches!(e, Effect::SetPhase(_))));
    }

    #[test]
    fn permission_is_enqueued_and_notified_once_per_pair() {
        let config = config();
        let mut session = session();
        let mut gates = Gates::default();
        let env = env(&config, ActivityPhase::Busy);
        let asked = || {
            decode_value(json!({
                "type": "permission.asked",
                "properties": {"id": "per_1", "sessionID": "A", "permission": "bash", "patterns": ["rm -rf build"]}
            }))
            .unwrap()
        };

        let first = dispatch(&mut session, &mut gates, asked(), &env);
        let second = dispatch(&mut session, &mut gates, asked(), &env);
        assert_eq!(
            first.iter().filter(|e| matches!(e, Effect::Notify(_))).count(),
            1
        );
        assert!(second.is_empty());
        assert_eq!(session.as_ref().unwrap().permissions().len(), 1);

        let replied = decode_value(json!({
            "type": "permission.replied",
            "properties": {"sessionID": "A", "requestID": "per_1", "reply": "once"}
        }))
        .unwrap();
        dispatch(&mut session, &mut gates, replied, &env);
        assert!(session.as_ref().unwrap().permissions().is_empty());
    }

    #[test]
    fn question_round_trip() {
        let config = config();
        let mut session = session();
        let mut gates = Gates::default();
        let env = env(&config, ActivityPhase::Busy);
        let asked = decode_value(json!({
            "type": "question.asked",
            "properties": {"id": "q_1", "sessionID": "A", "questions": [{"question": "Which?"}]}
        }))
        .unwrap();
        dispatch(&mut session, &mut gates, asked, &env);
        assert_eq!(session.as_ref().unwrap().questions().len(), 1);

        let replied = decode_value(json!({
            "type": "question.replied",
            "properties": {"sessionID": "A", "requestID": "q_1"}
        }))
        .unwrap();
        dispatch(&mut session, &mut gates, replied, &env);
        assert!(session.as_ref().unwrap().questions().is_empty());
    }

    #[test]
    fn todos_are_forwarded_verbatim() {
        let config = config();
        let mut session = session();
        let mut gates = Gates::default();
        let todos = json!([{"id": "1", "content": "write tests", "status": "pending"}]);
        let envelope = decode_value(json!({
            "type": "todo.updated",
            "properties": {"sessionID": "A", "todos": todos.clone()}
        }))
        .unwrap();
        let effects = dispatch(
            &mut session,
            &mut gates,
            envelope,
            &env(&config, ActivityPhase::Idle),
        );
        assert_eq!(
            effects,
            vec![Effect::ForwardTodos {
                session_id: "A".to_string(),
                todos
            }]
        );
    }

    #[test]
    fn session_status_drives_phase() {
        let config = config();
        let mut session = session();
        let mut gates = Gates::default();
        let busy = decode_value(json!({
            "type": "session.status",
            "properties": {"sessionID": "A", "status": {"type": "busy"}}
        }))
        .unwrap();
        let effects = dispatch(
            &mut session,
            &mut gates,
            busy,
            &env(&config, ActivityPhase::Idle),
        );
        assert_eq!(effects, vec![Effect::SetPhase(ActivityPhase::Busy)]);

        let idle = decode_value(json!({
            "type": "session.idle",
            "properties": {"sessionID": "A"}
        }))
        .unwrap();
        let effects = dispatch(
            &mut session,
            &mut gates,
            idle.clone(),
            &env(&config, ActivityPhase::Busy),
        );
        assert_eq!(effects, vec![Effect::SetPhase(ActivityPhase::Idle)]);

        // Interactive cooldown is left to its timer
        let effects = dispatch(
            &mut session,
            &mut gates,
            idle,
            &env(&config, ActivityPhase::Cooldown),
        );
        assert!(effects.is_empty());
    }

    #[test]
    fn events_without_session_are_dropped() {
        let config = config();
        let mut session = None;
        let mut gates = Gates::default();
        let effects = dispatch(
            &mut session,
            &mut gates,
            part_event("A", "m1", "p1", "x"),
            &env(&config, ActivityPhase::Idle),
        );
        assert!(effects.is_empty());
    }

    fn model_of(session: &Option<SessionStore>) -> Option<(String, String)> {
        session
            .as_ref()
            .and_then(|s| s.model.clone())
            .map(|m| (m.provider_id, m.model_id))
    }

    #[test]
    fn model_is_cached_from_parts_and_messages() {
        let config = config();
        let mut session = session();
        let mut gates = Gates::default();
        let env = env(&config, ActivityPhase::Busy);

        // Only one half of the pair present: nothing cached
        let half = decode_value(json!({
            "type": "message.part.updated",
            "properties": {
                "providerID": "anthropic",
                "part": {"id": "p1", "sessionID": "A", "messageID": "m1", "type": "text", "text": "a"}
            }
        }))
        .unwrap();
        dispatch(&mut session, &mut gates, half, &env);
        assert_eq!(model_of(&session), None);

        let from_part = decode_value(json!({
            "type": "message.part.updated",
            "properties": {"part": {
                "id": "p1", "sessionID": "A", "messageID": "m1", "type": "text", "text": "ab",
                "providerID": "anthropic", "modelID": "sonnet"
            }}
        }))
        .unwrap();
        dispatch(&mut session, &mut gates, from_part, &env);
        assert_eq!(
            model_of(&session),
            Some(("anthropic".to_string(), "sonnet".to_string()))
        );

        let from_message = decode_value(json!({
            "type": "message.updated",
            "properties": {"info": {
                "id": "m2", "sessionID": "A", "role": "assistant",
                "providerID": "openai", "modelID": "gpt",
                "time": {"created": 3}
            }}
        }))
        .unwrap();
        dispatch(&mut session, &mut gates, from_message, &env);
        assert_eq!(
            model_of(&session),
            Some(("openai".to_string(), "gpt".to_string()))
        );
    }

    #[test]
    fn part_and_message_removal() {
        let config = config();
        let mut session = session();
        let mut gates = Gates::default();
        let env = env(&config, ActivityPhase::Busy);
        dispatch(&mut session, &mut gates, part_event("A", "m1", "p1", "one"), &env);
        dispatch(&mut session, &mut gates, part_event("A", "m1", "p2", "two"), &env);
        dispatch(&mut session, &mut gates, part_event("A", "m2", "p1", "other"), &env);

        let part_removed = decode_value(json!({
            "type": "message.part.removed",
            "properties": {"sessionID": "A", "messageID": "m1", "partID": "p1"}
        }))
        .unwrap();
        let effects = dispatch(&mut session, &mut gates, part_removed.clone(), &env);
        assert_eq!(effects, vec![Effect::ViewChanged]);
        assert_eq!(text_of(&session, "m1"), "two");

        // Already gone: no view change
        assert!(dispatch(&mut session, &mut gates, part_removed, &env).is_empty());

        let message_removed = decode_value(json!({
            "type": "message.removed",
            "properties": {"sessionID": "A", "messageID": "m1"}
        }))
        .unwrap();
        let effects = dispatch(&mut session, &mut gates, message_removed, &env);
        assert_eq!(effects, vec![Effect::ViewChanged]);
        let store = session.as_ref().unwrap();
        assert!(store.message("m1").is_none());
        assert_eq!(store.messages().len(), 1);

        let malformed = decode_value(json!({
            "type": "message.part.removed",
            "properties": {"sessionID": "A", "messageID": "m2"}
        }))
        .unwrap();
        assert!(dispatch(&mut session, &mut gates, malformed, &env).is_empty());
        assert_eq!(text_of(&session, "m2"), "other");
    }

    #[test]
    fn session_error_is_recorded_and_idles() {
        let config = config();
        let mut session = session();
        let mut gates = Gates::default();
        let error = json!({"name": "ProviderAuthError", "data": {"message": "bad key"}});
        let envelope = decode_value(json!({
            "type": "session.error",
            "properties": {"sessionID": "A", "error": error.clone()}
        }))
        .unwrap();

        let effects = dispatch(
            &mut session,
            &mut gates,
            envelope,
            &env(&config, ActivityPhase::Busy),
        );
        assert_eq!(
            effects,
            vec![Effect::SetPhase(ActivityPhase::Idle), Effect::ViewChanged]
        );
        assert_eq!(session.as_ref().unwrap().last_error, Some(error));
    }

    #[test]
    fn rejected_question_is_dequeued() {
        let config = config();
        let mut session = session();
        let mut gates = Gates::default();
        let env = env(&config, ActivityPhase::Busy);
        for id in ["q_1", "q_2"] {
            let asked = decode_value(json!({
                "type": "question.asked",
                "properties": {"id": id, "sessionID": "A", "questions": []}
            }))
            .unwrap();
            dispatch(&mut session, &mut gates, asked, &env);
        }

        let rejected = decode_value(json!({
            "type": "question.rejected",
            "properties": {"sessionID": "A", "requestID": "q_1"}
        }))
        .unwrap();
        let effects = dispatch(&mut session, &mut gates, rejected, &env);
        assert_eq!(effects, vec![Effect::ViewChanged]);
        let questions = session.as_ref().unwrap().questions();
        assert_eq!(questions.len(), 1);
        assert_eq!(questions[0].id, "q_2");
    }
}

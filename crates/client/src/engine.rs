//! Sync engine: one actor owning all synchronization state.
//!
//! Every input (handle commands, channel signals, timer firings, fetch
//! results) is applied by a single task. Commands arrive on a queue owned
//! by the handles; everything the engine spawns reports back on an internal
//! queue, so nothing here holds state across an await. Once the last handle
//! is dropped the engine tears down and exits. Readers get a lock-free
//! [`SyncSnapshot`] via `ArcSwap` and change events via broadcast.

use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use chatsync_connectors::{Backend, ConnectorError, EventSource, HttpBackend};
use chatsync_protocol::{
    ActivityPhase, ConnectionStatus, ConnectionTrigger, MessageWithParts, PermissionRequest,
    QuestionRequest, SessionInfo, SessionStatusMap,
};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::activity::ActivityTracker;
use crate::config::SyncConfig;
use crate::connection::{
    reconnect_delay, sample_jitter, ChannelEvent, ChannelSignal, ConnectionManager,
};
use crate::dispatch::{dispatch, DispatchEnv, Effect};
use crate::envelope::decode_frame;
use crate::health::{reconcile_phase, ProbePurpose, StreamHealth};
use crate::notification::Gates;
use crate::resync::{ResyncController, ResyncDecision, ResyncOutcome, ResyncScope, ResyncWaiter};
use crate::scheduler::{Scheduler, TimerFired, TimerKind};
use crate::session::SessionStore;
use crate::state::{SessionView, SyncSnapshot, SyncUpdate};

const INPUT_CAPACITY: usize = 256;
const UPDATE_CAPACITY: usize = 256;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("Sync engine has stopped")]
    EngineStopped,

    #[error(transparent)]
    Connector(#[from] ConnectorError),
}

// ---------------------------------------------------------------------------
// Inputs
// ---------------------------------------------------------------------------

pub(crate) enum EngineCommand {
    Start {
        reset: bool,
    },
    Stop,
    ScheduleReconnect {
        hint: String,
    },
    SetVisible(bool),
    Focus,
    SetOnline(bool),
    SwitchSession {
        session_id: Option<String>,
        directory: Option<String>,
    },
    Resync {
        full: bool,
        limit: Option<usize>,
        reason: String,
        reply: ResyncWaiter,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// History fetched for one resync
pub(crate) struct History {
    messages: Vec<MessageWithParts>,
    /// Present for full reloads only
    prompts: Option<(Vec<PermissionRequest>, Vec<QuestionRequest>)>,
}

pub(crate) enum EngineInput {
    Command(EngineCommand),
    Channel(ChannelSignal),
    Timer(TimerFired),
    ResyncFetched {
        id: u64,
        session_id: String,
        result: Result<History, ConnectorError>,
    },
    ProbeFinished {
        purpose: ProbePurpose,
        generation: u64,
        healthy: bool,
    },
    StatusPolled(Result<SessionStatusMap, ConnectorError>),
    SessionFetched {
        session_id: String,
        result: Result<SessionInfo, ConnectorError>,
    },
}

// ---------------------------------------------------------------------------
// Handle
// ---------------------------------------------------------------------------

/// Handle to a running sync engine (cheap to Clone).
#[derive(Clone)]
pub struct SyncHandle {
    commands: mpsc::Sender<EngineCommand>,
    snapshot: Arc<ArcSwap<SyncSnapshot>>,
    updates: broadcast::Sender<SyncUpdate>,
}

impl SyncHandle {
    async fn send(&self, command: EngineCommand) -> Result<(), SyncError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| SyncError::EngineStopped)
    }

    /// Open the event channel. `reset` clears the reconnect attempt count.
    pub async fn start(&self, reset: bool) -> Result<(), SyncError> {
        self.send(EngineCommand::Start { reset }).await
    }

    /// Close the event channel and cancel any pending reconnect.
    pub async fn stop(&self) -> Result<(), SyncError> {
        self.send(EngineCommand::Stop).await
    }

    pub async fn schedule_reconnect(&self, hint: impl Into<String>) -> Result<(), SyncError> {
        self.send(EngineCommand::ScheduleReconnect { hint: hint.into() })
            .await
    }

    pub async fn set_visible(&self, visible: bool) -> Result<(), SyncError> {
        self.send(EngineCommand::SetVisible(visible)).await
    }

    pub async fn focus(&self) -> Result<(), SyncError> {
        self.send(EngineCommand::Focus).await
    }

    pub async fn set_online(&self, online: bool) -> Result<(), SyncError> {
        self.send(EngineCommand::SetOnline(online)).await
    }

    /// Select the session to mirror, or `None` to mirror nothing.
    pub async fn switch_session(
        &self,
        session_id: Option<String>,
        directory: Option<String>,
    ) -> Result<(), SyncError> {
        self.send(EngineCommand::SwitchSession {
            session_id,
            directory,
        })
        .await
    }

    /// Reload the newest `limit` messages (configured default when `None`).
    pub async fn resync(
        &self,
        reason: &str,
        limit: Option<usize>,
    ) -> Result<ResyncOutcome, SyncError> {
        self.request_resync(false, limit, reason).await
    }

    /// Reload the full history and pending prompts.
    pub async fn bootstrap(&self, reason: &str) -> Result<ResyncOutcome, SyncError> {
        self.request_resync(true, None, reason).await
    }

    async fn request_resync(
        &self,
        full: bool,
        limit: Option<usize>,
        reason: &str,
    ) -> Result<ResyncOutcome, SyncError> {
        let (reply, rx) = oneshot::channel();
        self.send(EngineCommand::Resync {
            full,
            limit,
            reason: reason.to_string(),
            reply,
        })
        .await?;
        rx.await.map_err(|_| SyncError::EngineStopped)
    }

    /// Lock-free snapshot read.
    pub fn snapshot(&self) -> Arc<SyncSnapshot> {
        self.snapshot.load_full()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncUpdate> {
        self.updates.subscribe()
    }

    /// Tear everything down and stop the engine task.
    pub async fn shutdown(&self) -> Result<(), SyncError> {
        let (reply, rx) = oneshot::channel();
        self.send(EngineCommand::Shutdown { reply }).await?;
        rx.await.map_err(|_| SyncError::EngineStopped)
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

pub struct SyncEngine {
    config: SyncConfig,
    source: Arc<dyn EventSource>,
    backend: Arc<dyn Backend>,
    tx: mpsc::Sender<EngineInput>,
    scheduler: Scheduler<EngineInput>,
    connection: ConnectionManager,
    health: StreamHealth,
    resync: ResyncController,
    activity: ActivityTracker,
    gates: Gates,
    session: Option<SessionStore>,
    snapshot: Arc<ArcSwap<SyncSnapshot>>,
    updates: broadcast::Sender<SyncUpdate>,
}

impl SyncEngine {
    /// Spawn the engine task. Nothing connects until `start` is called.
    pub fn spawn(
        config: SyncConfig,
        source: Arc<dyn EventSource>,
        backend: Arc<dyn Backend>,
    ) -> SyncHandle {
        let (commands, command_rx) = mpsc::channel(INPUT_CAPACITY);
        let (tx, rx) = mpsc::channel(INPUT_CAPACITY);
        let (updates, _) = broadcast::channel(UPDATE_CAPACITY);
        let snapshot = Arc::new(ArcSwap::from_pointee(SyncSnapshot::default()));

        let engine = SyncEngine {
            config,
            source,
            backend,
            scheduler: Scheduler::new(tx.clone(), EngineInput::Timer),
            tx,
            connection: ConnectionManager::new(),
            health: StreamHealth::new(Instant::now()),
            resync: ResyncController::new(),
            activity: ActivityTracker::new(),
            gates: Gates::default(),
            session: None,
            snapshot: snapshot.clone(),
            updates: updates.clone(),
        };
        tokio::spawn(engine.run(command_rx, rx));

        SyncHandle {
            commands,
            snapshot,
            updates,
        }
    }

    /// Spawn an engine talking to an HTTP backend at `base_url`.
    pub fn connect(
        config: SyncConfig,
        base_url: &str,
        directory: Option<String>,
    ) -> Result<SyncHandle, SyncError> {
        let backend = Arc::new(HttpBackend::new(base_url, directory)?);
        Ok(Self::spawn(config, backend.clone(), backend))
    }

    async fn run(
        mut self,
        mut commands: mpsc::Receiver<EngineCommand>,
        mut rx: mpsc::Receiver<EngineInput>,
    ) {
        info!(
            component = "engine",
            event = "engine.started",
            runtime = ?self.config.runtime,
            "Sync engine started"
        );
        loop {
            let input = tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => EngineInput::Command(command),
                    None => {
                        debug!(
                            component = "engine",
                            event = "engine.handles_dropped",
                            "Every handle dropped, shutting down"
                        );
                        self.teardown();
                        self.publish_snapshot();
                        break;
                    }
                },
                // The engine holds a sender, so this never yields None
                Some(input) = rx.recv() => input,
            };
            let keep_running = self.handle(input);
            self.publish_snapshot();
            if !keep_running {
                break;
            }
        }
        info!(
            component = "engine",
            event = "engine.stopped",
            "Sync engine stopped"
        );
    }

    /// Apply one input. Returns false once the engine should exit.
    fn handle(&mut self, input: EngineInput) -> bool {
        match input {
            EngineInput::Command(command) => return self.handle_command(command),
            EngineInput::Channel(signal) => self.handle_channel(signal),
            EngineInput::Timer(fired) => self.handle_timer(fired),
            EngineInput::ResyncFetched {
                id,
                session_id,
                result,
            } => self.handle_resync_fetched(id, session_id, result),
            EngineInput::ProbeFinished {
                purpose,
                generation,
                healthy,
            } => {
                let stalled = self.health.probe_finished(purpose, healthy);
                if !healthy {
                    warn!(
                        component = "engine",
                        event = "engine.probe.unhealthy",
                        purpose = ?purpose,
                        "Health probe failed"
                    );
                }
                if stalled && self.connection.is_current(generation) {
                    self.schedule_reconnect("stalled stream".to_string());
                }
            }
            EngineInput::StatusPolled(result) => {
                self.health.status_poll_finished();
                match result {
                    Ok(statuses) => self.reconcile_status(&statuses),
                    Err(err) => debug!(
                        component = "engine",
                        event = "engine.status_poll.failed",
                        error = %err,
                        "Session status poll failed"
                    ),
                }
            }
            EngineInput::SessionFetched { session_id, result } => {
                self.handle_session_fetched(session_id, result)
            }
        }
        true
    }

    // -- Commands -------------------------------------------------------------

    fn handle_command(&mut self, command: EngineCommand) -> bool {
        match command {
            EngineCommand::Start { reset } => self.start(reset),
            EngineCommand::Stop => {
                self.connection.set_started(false);
                self.scheduler.cancel(TimerKind::HiddenPause);
                self.close_channel();
                self.connection.set_pending_resume(false);
                self.connection.set_hint(None);
                self.set_status(ConnectionTrigger::Teardown);
            }
            EngineCommand::ScheduleReconnect { hint } => self.schedule_reconnect(hint),
            EngineCommand::SetVisible(visible) => self.set_visible(visible),
            EngineCommand::Focus => {
                self.resume_if_needed();
                self.resync_if_stale("focus");
            }
            EngineCommand::SetOnline(online) => self.set_online(online),
            EngineCommand::SwitchSession {
                session_id,
                directory,
            } => self.switch_session(session_id, directory),
            EngineCommand::Resync {
                full,
                limit,
                reason,
                reply,
            } => {
                let scope = if full {
                    ResyncScope::Full
                } else {
                    ResyncScope::Incremental(limit.unwrap_or(self.config.incremental_resync_limit))
                };
                self.request_resync(scope, &reason, Some(reply));
            }
            EngineCommand::Shutdown { reply } => {
                self.teardown();
                let _ = reply.send(());
                return false;
            }
        }
        true
    }

    fn start(&mut self, reset: bool) {
        self.connection.set_started(true);
        if reset {
            self.connection.reset_attempts();
        }
        if self.connection.is_open() {
            return;
        }
        if !self.connection.should_hold() {
            self.hold_off();
            return;
        }

        self.scheduler.cancel(TimerKind::Reconnect);
        let trigger = match self.connection.status() {
            ConnectionStatus::Paused | ConnectionStatus::Offline => ConnectionTrigger::Resumed,
            _ => ConnectionTrigger::Start,
        };
        self.set_status(trigger);
        self.connection
            .open(self.source.clone(), self.tx.clone(), EngineInput::Channel);
        self.ensure_health_tick();
    }

    /// The channel must not be held right now: release it and remember
    /// to resume once visible and online again.
    fn hold_off(&mut self) {
        self.close_channel();
        self.connection.set_pending_resume(true);
        if self.connection.online() {
            self.connection.set_hint(Some("paused while hidden".to_string()));
            self.set_status(ConnectionTrigger::Hidden);
        } else {
            self.connection.set_hint(Some("offline".to_string()));
            self.set_status(ConnectionTrigger::Offline);
        }
        info!(
            component = "engine",
            event = "engine.connection.held_off",
            status = self.connection.status().as_str(),
            "Event channel released until resumed"
        );
    }

    fn close_channel(&mut self) {
        self.scheduler.cancel(TimerKind::Reconnect);
        self.scheduler.cancel(TimerKind::HealthTick);
        self.scheduler.cancel(TimerKind::IncrementalResync);
        self.connection.close();
        self.health.clear_in_flight();
    }

    /// Reopen after a hide or network loss. A stopped or never-started
    /// engine stays closed.
    fn resume_if_needed(&mut self) {
        if !self.connection.started() || !self.connection.should_hold() {
            return;
        }
        if self.connection.pending_resume() || !self.connection.is_open() {
            self.start(true);
        }
    }

    fn schedule_reconnect(&mut self, hint: String) {
        if !self.connection.started() {
            debug!(
                component = "engine",
                event = "engine.reconnect.ignored",
                hint = %hint,
                "Reconnect requested while stopped"
            );
            return;
        }
        self.connection.close();
        self.scheduler.cancel(TimerKind::IncrementalResync);
        if !self.connection.should_hold() {
            self.hold_off();
            return;
        }

        let attempt = self.connection.next_attempt();
        let delay = reconnect_delay(&self.config.backoff, attempt)
            + sample_jitter(&self.config.backoff);
        self.scheduler.schedule(TimerKind::Reconnect, delay);
        warn!(
            component = "engine",
            event = "engine.reconnect.scheduled",
            attempt,
            delay_ms = delay.as_millis() as u64,
            hint = %hint,
            "Reconnect scheduled"
        );
        self.connection.set_hint(Some(hint));
        self.connection.transition(ConnectionTrigger::Failed);
        // Published even if unchanged so the new hint reaches the UI
        self.publish_status();
    }

    fn set_visible(&mut self, visible: bool) {
        self.connection.set_visible(visible);
        if visible {
            self.scheduler.cancel(TimerKind::HiddenPause);
            self.resume_if_needed();
            self.resync_if_stale("visible");
        } else if self.connection.started()
            && !self.scheduler.is_pending(TimerKind::HiddenPause)
        {
            self.scheduler
                .schedule(TimerKind::HiddenPause, self.config.hidden_pause());
        }
    }

    fn set_online(&mut self, online: bool) {
        self.connection.set_online(online);
        if online {
            self.resume_if_needed();
        } else if self.connection.started() {
            self.hold_off();
        }
    }

    fn switch_session(&mut self, session_id: Option<String>, directory: Option<String>) {
        self.resync.reset();
        self.scheduler.cancel(TimerKind::SessionRefresh);
        info!(
            component = "engine",
            event = "engine.session.switched",
            from = self.session.as_ref().map(|s| s.session_id.as_str()),
            to = session_id.as_deref(),
            "Current session switched"
        );
        self.session = session_id.map(|id| SessionStore::new(id, directory));
        self.publish(SyncUpdate::SessionChanged {
            session_id: self.current_session_id(),
        });
        if self.session.is_some() {
            self.request_resync(ResyncScope::Full, "session switch", None);
        }
    }

    fn teardown(&mut self) {
        self.connection.set_started(false);
        self.scheduler.cancel_all();
        self.connection.close();
        self.connection.set_pending_resume(false);
        self.connection.set_hint(None);
        self.resync.reset();
        self.gates.clear();
        self.set_phase(ActivityPhase::Idle);
        self.set_status(ConnectionTrigger::Teardown);
        info!(
            component = "engine",
            event = "engine.teardown",
            "Sync engine torn down"
        );
    }

    // -- Channel --------------------------------------------------------------

    fn handle_channel(&mut self, signal: ChannelSignal) {
        if !self.connection.is_current(signal.generation) {
            debug!(
                component = "engine",
                event = "engine.channel.stale_signal",
                generation = signal.generation,
                "Ignoring signal from a closed channel"
            );
            return;
        }

        match signal.event {
            ChannelEvent::Opened => self.on_opened(signal.generation),
            ChannelEvent::Frame(raw) => self.on_frame(&raw),
            ChannelEvent::Failed(reason) => {
                warn!(
                    component = "engine",
                    event = "engine.channel.failed",
                    error = %reason,
                    "Event channel failed"
                );
                self.schedule_reconnect(reason);
            }
        }
    }

    fn on_opened(&mut self, generation: u64) {
        let resumed = self.connection.pending_resume();
        self.connection.reset_attempts();
        self.connection.set_pending_resume(false);
        self.connection.set_hint(None);
        self.set_status(ConnectionTrigger::Opened);
        self.health.record_event(Instant::now());
        info!(
            component = "engine",
            event = "engine.channel.opened",
            generation,
            resumed,
            "Event channel connected"
        );

        self.health.begin_open_probe();
        self.spawn_probe(ProbePurpose::Open, generation);

        if resumed {
            self.request_resync(ResyncScope::Full, "resume", None);
        } else {
            self.scheduler
                .schedule(TimerKind::IncrementalResync, Duration::ZERO);
        }
    }

    fn on_frame(&mut self, raw: &str) {
        let now = Instant::now();
        self.health.record_event(now);

        let envelope = match decode_frame(raw) {
            Ok(envelope) => envelope,
            Err(err) => {
                debug!(
                    component = "engine",
                    event = "engine.frame.undecodable",
                    error = %err,
                    "Dropping undecodable frame"
                );
                return;
            }
        };

        let env = DispatchEnv {
            config: &self.config,
            visible: self.connection.visible(),
            phase: self.activity.phase(),
            now,
        };
        let effects = dispatch(&mut self.session, &mut self.gates, envelope, &env);
        self.apply_effects(effects);
    }

    fn apply_effects(&mut self, effects: Vec<Effect>) {
        let mut view_changed = false;
        for effect in effects {
            match effect {
                Effect::SetPhase(phase) => self.set_phase(phase),
                Effect::RefreshSession => self.scheduler.schedule(
                    TimerKind::SessionRefresh,
                    self.config.session_refresh_debounce(),
                ),
                Effect::Notify(notification) => {
                    info!(
                        component = "engine",
                        event = "engine.notification",
                        session_id = %notification.session_id,
                        kind = ?notification.kind,
                        "Native notification"
                    );
                    self.publish(SyncUpdate::Notification { notification });
                }
                Effect::Toast(toast) => self.publish(SyncUpdate::Toast { toast }),
                Effect::ForwardTodos { session_id, todos } => {
                    self.publish(SyncUpdate::Todos { session_id, todos })
                }
                Effect::SessionCleared { session_id } => {
                    warn!(
                        component = "engine",
                        event = "engine.session.deleted",
                        session_id = %session_id,
                        "Current session was deleted"
                    );
                    self.resync.reset();
                    self.scheduler.cancel(TimerKind::SessionRefresh);
                    view_changed = true;
                }
                Effect::ViewChanged => view_changed = true,
            }
        }
        if view_changed {
            self.publish(SyncUpdate::SessionChanged {
                session_id: self.current_session_id(),
            });
        }
    }

    // -- Timers ---------------------------------------------------------------

    fn handle_timer(&mut self, fired: TimerFired) {
        if !self.scheduler.accept(fired) {
            return;
        }
        match fired.kind {
            TimerKind::Reconnect => {
                self.set_status(ConnectionTrigger::BackoffElapsed);
                self.start(false);
            }
            TimerKind::HiddenPause => {
                if self.connection.started() && !self.connection.visible() {
                    self.hold_off();
                }
            }
            TimerKind::HealthTick => self.health_tick(),
            TimerKind::Cooldown => {
                if self.activity.cooldown_elapsed() {
                    self.publish(SyncUpdate::PhaseChanged {
                        phase: ActivityPhase::Idle,
                    });
                }
            }
            TimerKind::SessionRefresh => {
                if let Some(session_id) = self.current_session_id() {
                    let backend = self.backend.clone();
                    let tx = self.tx.clone();
                    tokio::spawn(async move {
                        let result = backend.get_session(&session_id).await;
                        let _ = tx
                            .send(EngineInput::SessionFetched { session_id, result })
                            .await;
                    });
                }
            }
            TimerKind::IncrementalResync => {
                let limit = self.config.incremental_resync_limit;
                self.request_resync(ResyncScope::Incremental(limit), "reconnect", None);
            }
        }
    }

    fn ensure_health_tick(&mut self) {
        if !self.scheduler.is_pending(TimerKind::HealthTick) {
            self.scheduler
                .schedule(TimerKind::HealthTick, self.config.health_tick());
        }
    }

    fn health_tick(&mut self) {
        if !self.connection.should_hold() {
            return;
        }
        self.scheduler
            .schedule(TimerKind::HealthTick, self.config.health_tick());

        let generation = self
            .connection
            .current_generation()
            .filter(|_| self.connection.status() == ConnectionStatus::Connected);
        let plan = self.health.tick(
            Instant::now(),
            self.config.stall_threshold(),
            self.activity.phase(),
            generation.is_some(),
        );

        if let (true, Some(generation)) = (plan.probe, generation) {
            debug!(
                component = "engine",
                event = "engine.stall.probe",
                idle_ms = self.health.since_last_event(Instant::now()).as_millis() as u64,
                "No events for a while, probing backend"
            );
            self.spawn_probe(ProbePurpose::Stall, generation);
        }

        if plan.poll_status {
            if self.session.is_none() {
                self.health.status_poll_finished();
            } else {
                let backend = self.backend.clone();
                let tx = self.tx.clone();
                tokio::spawn(async move {
                    let result = backend.get_global_session_status().await;
                    let _ = tx.send(EngineInput::StatusPolled(result)).await;
                });
            }
        }
    }

    fn spawn_probe(&self, purpose: ProbePurpose, generation: u64) {
        let backend = self.backend.clone();
        let tx = self.tx.clone();
        let timeout = self.config.health_tick();
        tokio::spawn(async move {
            let healthy = tokio::time::timeout(timeout, backend.check_health())
                .await
                .unwrap_or(false);
            let _ = tx
                .send(EngineInput::ProbeFinished {
                    purpose,
                    generation,
                    healthy,
                })
                .await;
        });
    }

    fn reconcile_status(&mut self, statuses: &SessionStatusMap) {
        let Some(session_id) = self.current_session_id() else {
            return;
        };
        if let Some(next) = reconcile_phase(self.activity.phase(), statuses, &session_id) {
            info!(
                component = "engine",
                event = "engine.phase.reconciled",
                session_id = %session_id,
                from = ?self.activity.phase(),
                to = ?next,
                "Activity phase corrected from backend status"
            );
            self.set_phase(next);
        }
    }

    // -- Resync ---------------------------------------------------------------

    /// Bootstrap if the stream has been quiet long enough that events may
    /// have been lost while backgrounded.
    fn resync_if_stale(&mut self, reason: &str) {
        if self.session.is_none() || !self.connection.started() {
            return;
        }
        if self
            .health
            .is_stale(Instant::now(), self.config.stale_resync())
        {
            self.request_resync(ResyncScope::Full, reason, None);
        }
    }

    fn request_resync(&mut self, scope: ResyncScope, reason: &str, waiter: Option<ResyncWaiter>) {
        let Some(session_id) = self.current_session_id() else {
            if let Some(waiter) = waiter {
                let _ = waiter.send(ResyncOutcome::Skipped);
            }
            return;
        };
        let decision = self.resync.request(
            scope,
            reason,
            waiter,
            Instant::now(),
            self.config.resync_debounce(),
        );
        if let ResyncDecision::Start { id, scope } = decision {
            self.spawn_fetch(id, scope, session_id);
        }
    }

    fn spawn_fetch(&self, id: u64, scope: ResyncScope, session_id: String) {
        let backend = self.backend.clone();
        let tx = self.tx.clone();
        tokio::spawn(async move {
            let result = fetch_history(backend.as_ref(), &session_id, scope).await;
            let _ = tx
                .send(EngineInput::ResyncFetched {
                    id,
                    session_id,
                    result,
                })
                .await;
        });
    }

    fn handle_resync_fetched(
        &mut self,
        id: u64,
        session_id: String,
        result: Result<History, ConnectorError>,
    ) {
        if !self.resync.is_current(id) {
            return;
        }
        let now = Instant::now();
        let tolerance = self.config.text_shrink_tolerance;

        let outcome = match result {
            Ok(history) => match self.session.as_mut() {
                Some(store) if store.session_id == session_id => {
                    let full = history.prompts.is_some();
                    let count = history.messages.len();
                    store.apply_history(history.messages, full, tolerance, now);
                    if let Some((permissions, questions)) = history.prompts {
                        store.replace_permissions(permissions);
                        store.replace_questions(questions);
                    }
                    info!(
                        component = "engine",
                        event = "engine.resync.applied",
                        session_id = %session_id,
                        full,
                        messages = count,
                        "History reconciled"
                    );
                    ResyncOutcome::Applied
                }
                _ => ResyncOutcome::Cancelled,
            },
            Err(err) => {
                warn!(
                    component = "engine",
                    event = "engine.resync.failed",
                    session_id = %session_id,
                    error = %err,
                    "History reload failed"
                );
                ResyncOutcome::Failed(err.to_string())
            }
        };
        if outcome == ResyncOutcome::Applied {
            self.publish(SyncUpdate::SessionChanged {
                session_id: Some(session_id),
            });
        }

        if let Some(ResyncDecision::Start { id, scope }) = self.resync.finish(id, outcome, now) {
            if let Some(session_id) = self.current_session_id() {
                self.spawn_fetch(id, scope, session_id);
            }
        }
    }

    fn handle_session_fetched(
        &mut self,
        session_id: String,
        result: Result<SessionInfo, ConnectorError>,
    ) {
        let info = match result {
            Ok(info) => info,
            Err(err) => {
                debug!(
                    component = "engine",
                    event = "engine.session_refresh.failed",
                    session_id = %session_id,
                    error = %err,
                    "Session metadata refresh failed"
                );
                return;
            }
        };
        let Some(store) = self.session.as_mut() else {
            return;
        };
        if store.session_id != session_id {
            return;
        }
        store.compacting_at = info.time.compacting;
        store.info = Some(info);
        self.publish(SyncUpdate::SessionChanged {
            session_id: Some(session_id),
        });
    }

    // -- Publishing -----------------------------------------------------------

    fn set_phase(&mut self, next: ActivityPhase) {
        let changed = self
            .activity
            .set_phase(next, &mut self.scheduler, self.config.cooldown());
        if changed {
            debug!(
                component = "engine",
                event = "engine.phase.changed",
                phase = ?next,
                "Activity phase changed"
            );
            self.publish(SyncUpdate::PhaseChanged { phase: next });
        }
    }

    fn set_status(&mut self, trigger: ConnectionTrigger) {
        if self.connection.transition(trigger) {
            self.publish_status();
        }
    }

    fn publish_status(&self) {
        self.publish(SyncUpdate::StatusChanged {
            status: self.connection.status(),
            hint: self.connection.hint().map(str::to_string),
        });
    }

    fn publish(&self, update: SyncUpdate) {
        // No subscribers is fine
        let _ = self.updates.send(update);
    }

    fn publish_snapshot(&self) {
        let reconnect = self.connection.reconnect_state();
        self.snapshot.store(Arc::new(SyncSnapshot {
            status: self.connection.status(),
            hint: self.connection.hint().map(str::to_string),
            attempts: reconnect.attempts,
            last_hint: reconnect.last_hint.clone(),
            phase: self.activity.phase(),
            pending_resume: self.connection.pending_resume(),
            server_healthy: self.health.server_healthy(),
            session: self.session.as_ref().map(SessionView::from_store),
        }));
    }

    fn current_session_id(&self) -> Option<String> {
        self.session.as_ref().map(|s| s.session_id.clone())
    }
}

async fn fetch_history(
    backend: &dyn Backend,
    session_id: &str,
    scope: ResyncScope,
) -> Result<History, ConnectorError> {
    match scope {
        ResyncScope::Incremental(limit) => Ok(History {
            messages: backend.load_messages(session_id, Some(limit)).await?,
            prompts: None,
        }),
        ResyncScope::Full => {
            let (messages, permissions, questions) = tokio::try_join!(
                backend.load_messages(session_id, None),
                backend.list_pending_permissions(),
                backend.list_pending_questions(Some(session_id)),
            )?;
            Ok(History {
                messages,
                prompts: Some((permissions, questions)),
            })
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

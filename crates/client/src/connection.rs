//! Connection manager
//!
//! Owns the single long-lived event channel. The subscription runs as a
//! forwarding task that turns transport callbacks into [`ChannelSignal`]s on
//! the engine's input queue. Each open gets a fresh generation so signals
//! from a channel that has since been closed are recognised and ignored.

use std::sync::Arc;
use std::time::Duration;

use chatsync_connectors::EventSource;
use chatsync_protocol::{ConnectionStatus, ConnectionTrigger};
use futures::StreamExt;
use rand::Rng;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::config::BackoffConfig;

/// What the forwarding task observed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    Opened,
    Frame(String),
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelSignal {
    pub generation: u64,
    pub event: ChannelEvent,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconnectState {
    pub attempts: u32,
    pub last_hint: Option<String>,
}

/// Delay before reconnect attempt `attempt` (1-based), before jitter.
///
/// The first `fast_attempts` retries double from `fast_base_ms` up to
/// `fast_max_ms`; later ones double from `slow_base_ms` up to `slow_max_ms`.
pub fn reconnect_delay(config: &BackoffConfig, attempt: u32) -> Duration {
    let attempt = attempt.max(1);
    let ms = if attempt <= config.fast_attempts {
        let exponent = (attempt - 1).min(30);
        config
            .fast_base_ms
            .saturating_mul(2u64.saturating_pow(exponent))
            .min(config.fast_max_ms)
    } else {
        let exponent = (attempt - config.fast_attempts).min(30);
        config
            .slow_base_ms
            .saturating_mul(2u64.saturating_pow(exponent))
            .min(config.slow_max_ms)
    };
    Duration::from_millis(ms)
}

pub fn sample_jitter(config: &BackoffConfig) -> Duration {
    if config.jitter_ms == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(rand::thread_rng().gen_range(0..=config.jitter_ms))
}

struct Subscription {
    generation: u64,
    task: JoinHandle<()>,
}

pub struct ConnectionManager {
    status: ConnectionStatus,
    hint: Option<String>,
    reconnect: ReconnectState,
    pending_resume: bool,
    /// Set by `start`, cleared by `stop`; resume never overrides a stop
    started: bool,
    visible: bool,
    online: bool,
    subscription: Option<Subscription>,
    generation: u64,
}

impl Default for ConnectionManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionManager {
    pub fn new() -> Self {
        Self {
            status: ConnectionStatus::Idle,
            hint: None,
            reconnect: ReconnectState::default(),
            pending_resume: false,
            started: false,
            visible: true,
            online: true,
            subscription: None,
            generation: 0,
        }
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status
    }

    pub fn hint(&self) -> Option<&str> {
        self.hint.as_deref()
    }

    pub fn reconnect_state(&self) -> &ReconnectState {
        &self.reconnect
    }

    pub fn pending_resume(&self) -> bool {
        self.pending_resume
    }

    pub fn set_pending_resume(&mut self, pending: bool) {
        self.pending_resume = pending;
    }

    pub fn started(&self) -> bool {
        self.started
    }

    pub fn set_started(&mut self, started: bool) {
        self.started = started;
    }

    pub fn visible(&self) -> bool {
        self.visible
    }

    pub fn online(&self) -> bool {
        self.online
    }

    pub fn set_visible(&mut self, visible: bool) {
        self.visible = visible;
    }

    pub fn set_online(&mut self, online: bool) {
        self.online = online;
    }

    /// Whether the channel should be open right now
    pub fn should_hold(&self) -> bool {
        self.visible && self.online
    }

    pub fn is_open(&self) -> bool {
        self.subscription.is_some()
    }

    /// Apply a status trigger. Returns true if the status changed.
    pub fn transition(&mut self, trigger: ConnectionTrigger) -> bool {
        let next = self.status.apply(trigger);
        if next == self.status {
            return false;
        }
        debug!(
            component = "connection",
            event = "connection.status.changed",
            from = self.status.as_str(),
            to = next.as_str(),
            trigger = ?trigger,
            "Connection status changed"
        );
        self.status = next;
        true
    }

    pub fn set_hint(&mut self, hint: Option<String>) {
        if hint.is_some() {
            self.reconnect.last_hint = hint.clone();
        }
        self.hint = hint;
    }

    pub fn reset_attempts(&mut self) {
        self.reconnect.attempts = 0;
    }

    /// Count one more failed attempt and return its number.
    pub fn next_attempt(&mut self) -> u32 {
        self.reconnect.attempts = self.reconnect.attempts.saturating_add(1);
        self.reconnect.attempts
    }

    /// Generation of the open channel, if any
    pub fn current_generation(&self) -> Option<u64> {
        self.subscription.as_ref().map(|s| s.generation)
    }

    pub fn is_current(&self, generation: u64) -> bool {
        self.subscription
            .as_ref()
            .is_some_and(|s| s.generation == generation)
    }

    /// Open a new channel, closing any existing one first.
    pub fn open<M: Send + 'static>(
        &mut self,
        source: Arc<dyn EventSource>,
        tx: mpsc::Sender<M>,
        wrap: fn(ChannelSignal) -> M,
    ) {
        self.close();
        self.generation += 1;
        let generation = self.generation;
        info!(
            component = "connection",
            event = "connection.opening",
            generation,
            "Opening event channel"
        );

        let task = tokio::spawn(async move {
            let send = |event: ChannelEvent| {
                let tx = tx.clone();
                async move { tx.send(wrap(ChannelSignal { generation, event })).await.is_ok() }
            };

            let mut stream = match source.subscribe().await {
                Ok(stream) => stream,
                Err(err) => {
                    send(ChannelEvent::Failed(err.to_string())).await;
                    return;
                }
            };
            if !send(ChannelEvent::Opened).await {
                return;
            }
            while let Some(item) = stream.next().await {
                match item {
                    Ok(data) => {
                        if !send(ChannelEvent::Frame(data)).await {
                            return;
                        }
                    }
                    Err(err) => {
                        send(ChannelEvent::Failed(err.to_string())).await;
                        return;
                    }
                }
            }
            send(ChannelEvent::Failed("event stream ended".to_string())).await;
        });

        self.subscription = Some(Subscription { generation, task });
    }

    /// Close the channel. Safe to call any number of times; only the first
    /// call after an open does anything.
    pub fn close(&mut self) -> bool {
        match self.subscription.take() {
            Some(subscription) => {
                subscription.task.abort();
                debug!(
                    component = "connection",
                    event = "connection.closed",
                    generation = subscription.generation,
                    "Event channel closed"
                );
                true
            }
            None => false,
        }
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        self.close();
    }
}

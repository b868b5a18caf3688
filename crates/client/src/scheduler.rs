//! Named, cancellable delayed tasks.
//!
//! Every timer the engine uses goes through one `Scheduler`, so teardown
//! cancels them all with a single call. At most one timer per kind is
//! pending; scheduling a kind again replaces the earlier one.
//!
//! Firings are delivered as messages into the engine's input channel.
//! Each firing carries the generation it was scheduled with, and
//! [`Scheduler::accept`] rejects firings from timers that were cancelled
//! or replaced after their message was already queued.

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    Reconnect,
    HiddenPause,
    HealthTick,
    Cooldown,
    SessionRefresh,
    IncrementalResync,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerFired {
    pub kind: TimerKind,
    pub generation: u64,
}

struct Pending {
    generation: u64,
    task: JoinHandle<()>,
}

pub struct Scheduler<M> {
    tx: mpsc::Sender<M>,
    wrap: fn(TimerFired) -> M,
    timers: HashMap<TimerKind, Pending>,
    next_generation: u64,
}

impl<M: Send + 'static> Scheduler<M> {
    pub fn new(tx: mpsc::Sender<M>, wrap: fn(TimerFired) -> M) -> Self {
        Self {
            tx,
            wrap,
            timers: HashMap::new(),
            next_generation: 0,
        }
    }

    /// Arm `kind` to fire after `delay`, replacing any pending timer of
    /// the same kind.
    pub fn schedule(&mut self, kind: TimerKind, delay: Duration) {
        self.cancel(kind);
        self.next_generation += 1;
        let generation = self.next_generation;
        let tx = self.tx.clone();
        let message = (self.wrap)(TimerFired { kind, generation });
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(message).await;
        });
        self.timers.insert(kind, Pending { generation, task });
    }

    /// Returns true if a pending timer was cancelled.
    pub fn cancel(&mut self, kind: TimerKind) -> bool {
        match self.timers.remove(&kind) {
            Some(pending) => {
                pending.task.abort();
                true
            }
            None => false,
        }
    }

    pub fn cancel_all(&mut self) {
        for (_, pending) in self.timers.drain() {
            pending.task.abort();
        }
    }

    pub fn is_pending(&self, kind: TimerKind) -> bool {
        self.timers.contains_key(&kind)
    }

    pub fn pending_count(&self) -> usize {
        self.timers.len()
    }

    /// Consume a firing. False for firings of cancelled or replaced timers.
    pub fn accept(&mut self, fired: TimerFired) -> bool {
        match self.timers.get(&fired.kind) {
            Some(pending) if pending.generation == fired.generation => {
                self.timers.remove(&fired.kind);
                true
            }
            _ => false,
        }
    }
}

impl<M> Drop for Scheduler<M> {
    fn drop(&mut self) {
        for (_, pending) in self.timers.drain() {
            pending.task.abort();
        }
    }
}

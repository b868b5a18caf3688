//! Resync controller
//!
//! Serializes history reloads. At most one fetch is in flight; callers that
//! ask while one runs are attached to its outcome. A full reload requested
//! during an incremental one is queued behind it rather than dropped.

use std::time::Duration;

use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResyncScope {
    /// Newest `n` messages, upserted
    Incremental(usize),
    /// Whole history plus pending prompts, replacing local state
    Full,
}

impl ResyncScope {
    pub fn is_full(&self) -> bool {
        matches!(self, ResyncScope::Full)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResyncOutcome {
    Applied,
    /// Debounced against a recent resync
    Skipped,
    Failed(String),
    /// Superseded by a session switch or teardown
    Cancelled,
}

pub type ResyncWaiter = oneshot::Sender<ResyncOutcome>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResyncDecision {
    Start { id: u64, scope: ResyncScope },
    Attached,
    Queued,
    Skipped,
}

struct InFlight {
    id: u64,
    scope: ResyncScope,
    reason: String,
    waiters: Vec<ResyncWaiter>,
}

struct Queued {
    reason: String,
    waiters: Vec<ResyncWaiter>,
}

#[derive(Debug, Clone, Copy)]
struct Completed {
    at: Instant,
    scope: ResyncScope,
    ok: bool,
}

#[derive(Default)]
pub struct ResyncController {
    in_flight: Option<InFlight>,
    queued_full: Option<Queued>,
    last_completed: Option<Completed>,
    next_id: u64,
}

impl ResyncController {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn in_flight(&self) -> Option<ResyncScope> {
        self.in_flight.as_ref().map(|f| f.scope)
    }

    pub fn is_current(&self, id: u64) -> bool {
        self.in_flight.as_ref().is_some_and(|f| f.id == id)
    }

    /// Ask for a resync. `waiter`, if given, is resolved with the outcome
    /// of whichever fetch ends up serving the request.
    pub fn request(
        &mut self,
        scope: ResyncScope,
        reason: &str,
        waiter: Option<ResyncWaiter>,
        now: Instant,
        debounce: Duration,
    ) -> ResyncDecision {
        if let Some(in_flight) = self.in_flight.as_mut() {
            if scope.is_full() && !in_flight.scope.is_full() {
                let queued = self.queued_full.get_or_insert_with(|| Queued {
                    reason: reason.to_string(),
                    waiters: Vec::new(),
                });
                queued.waiters.extend(waiter);
                return ResyncDecision::Queued;
            }
            in_flight.waiters.extend(waiter);
            return ResyncDecision::Attached;
        }

        if let Some(last) = self.last_completed {
            let upgrade = scope.is_full() && !last.scope.is_full() && last.ok;
            if now.saturating_duration_since(last.at) < debounce && !upgrade {
                debug!(
                    component = "resync",
                    event = "resync.debounced",
                    reason,
                    "Resync skipped, previous one just completed"
                );
                if let Some(waiter) = waiter {
                    let _ = waiter.send(ResyncOutcome::Skipped);
                }
                return ResyncDecision::Skipped;
            }
        }

        ResyncDecision::Start {
            id: self.begin(scope, reason, waiter.into_iter().collect()),
            scope,
        }
    }

    fn begin(&mut self, scope: ResyncScope, reason: &str, waiters: Vec<ResyncWaiter>) -> u64 {
        self.next_id += 1;
        debug!(
            component = "resync",
            event = "resync.started",
            id = self.next_id,
            scope = ?scope,
            reason,
            "Resync started"
        );
        self.in_flight = Some(InFlight {
            id: self.next_id,
            scope,
            reason: reason.to_string(),
            waiters,
        });
        self.next_id
    }

    /// Settle the in-flight fetch `id`. Returns the queued full reload to
    /// start next, if one was waiting.
    pub fn finish(
        &mut self,
        id: u64,
        outcome: ResyncOutcome,
        now: Instant,
    ) -> Option<ResyncDecision> {
        if !self.is_current(id) {
            return None;
        }
        let in_flight = self.in_flight.take()?;
        debug!(
            component = "resync",
            event = "resync.finished",
            id,
            scope = ?in_flight.scope,
            reason = %in_flight.reason,
            outcome = ?outcome,
            "Resync finished"
        );
        self.last_completed = Some(Completed {
            at: now,
            scope: in_flight.scope,
            ok: outcome == ResyncOutcome::Applied,
        });
        for waiter in in_flight.waiters {
            let _ = waiter.send(outcome.clone());
        }

        let queued = self.queued_full.take()?;
        let id = self.begin(ResyncScope::Full, &queued.reason, queued.waiters);
        Some(ResyncDecision::Start {
            id,
            scope: ResyncScope::Full,
        })
    }

    /// Drop all in-flight and queued work. Waiters see `Cancelled`; a
    /// late result for the dropped fetch is ignored by [`Self::finish`].
    pub fn reset(&mut self) {
        let in_flight = self.in_flight.take().map(|f| f.waiters);
        let queued = self.queued_full.take().map(|q| q.waiters);
        for waiter in in_flight.into_iter().chain(queued).flatten() {
            let _ = waiter.send(ResyncOutcome::Cancelled);
        }
        self.last_completed = None;
    }
}

//! Stream health monitor
//!
//! A channel can stay "open" while delivering nothing. On every health tick
//! the monitor decides whether to probe the backend (no events for longer
//! than the stall threshold) and whether to poll the authoritative session
//! status map (phase is busy or cooling down, in case a terminal event was
//! lost). At most one probe and one poll are in flight at a time.

use std::time::Duration;

use chatsync_protocol::{ActivityPhase, SessionStatusMap};
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbePurpose {
    /// Issued right after the channel opened; only records the result
    Open,
    /// Issued because the stream went quiet; failure forces a reconnect
    Stall,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickPlan {
    pub probe: bool,
    pub poll_status: bool,
}

#[derive(Debug)]
pub struct StreamHealth {
    last_event_at: Instant,
    probe_in_flight: bool,
    status_poll_in_flight: bool,
    server_healthy: Option<bool>,
}

impl StreamHealth {
    pub fn new(now: Instant) -> Self {
        Self {
            last_event_at: now,
            probe_in_flight: false,
            status_poll_in_flight: false,
            server_healthy: None,
        }
    }

    pub fn record_event(&mut self, now: Instant) {
        self.last_event_at = now;
    }

    pub fn since_last_event(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_event_at)
    }

    /// True if nothing has arrived for longer than `threshold`.
    pub fn is_stale(&self, now: Instant, threshold: Duration) -> bool {
        self.since_last_event(now) > threshold
    }

    pub fn server_healthy(&self) -> Option<bool> {
        self.server_healthy
    }

    /// Decide what this tick should do and mark it in flight. Stall
    /// probes only make sense while the channel is connected.
    pub fn tick(
        &mut self,
        now: Instant,
        stall_threshold: Duration,
        phase: ActivityPhase,
        connected: bool,
    ) -> TickPlan {
        let probe = connected && !self.probe_in_flight && self.is_stale(now, stall_threshold);
        let poll_status = !self.status_poll_in_flight && phase != ActivityPhase::Idle;
        self.probe_in_flight |= probe;
        self.status_poll_in_flight |= poll_status;
        TickPlan { probe, poll_status }
    }

    pub fn begin_open_probe(&mut self) {
        self.probe_in_flight = true;
    }

    /// Record a probe result. Returns true if the stream should be
    /// considered stalled.
    pub fn probe_finished(&mut self, purpose: ProbePurpose, healthy: bool) -> bool {
        self.probe_in_flight = false;
        self.server_healthy = Some(healthy);
        purpose == ProbePurpose::Stall && !healthy
    }

    pub fn status_poll_finished(&mut self) {
        self.status_poll_in_flight = false;
    }

    /// Forget in-flight work after the channel was torn down. The event
    /// clock keeps running so staleness spans the downtime.
    pub fn clear_in_flight(&mut self) {
        self.probe_in_flight = false;
        self.status_poll_in_flight = false;
    }
}

/// Correct a phase that disagrees with the backend's status map.
///
/// A session absent from the map is idle. Busy with an idle backend means
/// the terminal event was missed; cooldown with an active backend means a
/// new turn started without a streamed part reaching us.
pub fn reconcile_phase(
    phase: ActivityPhase,
    statuses: &SessionStatusMap,
    session_id: &str,
) -> Option<ActivityPhase> {
    let active = statuses
        .get(session_id)
        .is_some_and(|status| status.is_active());
    match (phase, active) {
        (ActivityPhase::Busy, false) => Some(ActivityPhase::Idle),
        (ActivityPhase::Cooldown, true) => Some(ActivityPhase::Busy),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chatsync_protocol::SessionStatusInfo;

    const STALL: Duration = Duration::from_secs(45);

    #[tokio::test(start_paused = true)]
    async fn probes_only_after_threshold() {
        let mut health = StreamHealth::new(Instant::now());

        tokio::time::advance(Duration::from_secs(40)).await;
        assert!(!health.tick(Instant::now(), STALL, ActivityPhase::Idle, true).probe);

        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(health.tick(Instant::now(), STALL, ActivityPhase::Idle, true).probe);
    }

    #[tokio::test(start_paused = true)]
    async fn one_probe_in_flight() {
        let mut health = StreamHealth::new(Instant::now());
        tokio::time::advance(Duration::from_secs(50)).await;

        assert!(health.tick(Instant::now(), STALL, ActivityPhase::Idle, true).probe);
        assert!(!health.tick(Instant::now(), STALL, ActivityPhase::Idle, true).probe);

        assert!(health.probe_finished(ProbePurpose::Stall, false));
        assert!(health.tick(Instant::now(), STALL, ActivityPhase::Idle, true).probe);
    }

    #[tokio::test(start_paused = true)]
    async fn events_reset_the_stall_clock() {
        let mut health = StreamHealth::new(Instant::now());
        tokio::time::advance(Duration::from_secs(44)).await;
        health.record_event(Instant::now());
        tokio::time::advance(Duration::from_secs(44)).await;
        assert!(!health.tick(Instant::now(), STALL, ActivityPhase::Idle, true).probe);
    }

    #[tokio::test(start_paused = true)]
    async fn no_stall_probe_while_disconnected() {
        let mut health = StreamHealth::new(Instant::now());
        tokio::time::advance(Duration::from_secs(60)).await;
        let plan = health.tick(Instant::now(), STALL, ActivityPhase::Idle, false);
        assert!(!plan.probe);
    }

    #[tokio::test(start_paused = true)]
    async fn clearing_in_flight_keeps_event_clock() {
        let mut health = StreamHealth::new(Instant::now());
        tokio::time::advance(Duration::from_secs(50)).await;
        assert!(health.tick(Instant::now(), STALL, ActivityPhase::Busy, true).probe);
        health.clear_in_flight();
        let plan = health.tick(Instant::now(), STALL, ActivityPhase::Busy, true);
        assert!(plan.probe);
        assert!(plan.poll_status);
    }

    #[test]
    fn open_probe_failure_does_not_stall() {
        let mut health = StreamHealth::new(Instant::now());
        health.begin_open_probe();
        assert!(!health.probe_finished(ProbePurpose::Open, false));
        assert_eq!(health.server_healthy(), Some(false));
    }

    #[test]
    fn polls_status_only_when_not_idle() {
        let mut health = StreamHealth::new(Instant::now());
        let now = Instant::now();
        assert!(!health.tick(now, STALL, ActivityPhase::Idle, true).poll_status);
        assert!(health.tick(now, STALL, ActivityPhase::Busy, true).poll_status);
        assert!(!health.tick(now, STALL, ActivityPhase::Cooldown, true).poll_status);
        health.status_poll_finished();
        assert!(health.tick(now, STALL, ActivityPhase::Cooldown, true).poll_status);
    }

    #[test]
    fn reconcile_fixes_missed_idle() {
        let mut statuses = SessionStatusMap::new();
        assert_eq!(
            reconcile_phase(ActivityPhase::Busy, &statuses, "A"),
            Some(ActivityPhase::Idle)
        );

        statuses.insert("A".to_string(), SessionStatusInfo::Busy);
        assert_eq!(reconcile_phase(ActivityPhase::Busy, &statuses, "A"), None);
        assert_eq!(
            reconcile_phase(ActivityPhase::Cooldown, &statuses, "A"),
            Some(ActivityPhase::Busy)
        );
        assert_eq!(reconcile_phase(ActivityPhase::Idle, &statuses, "A"), None);
    }
}

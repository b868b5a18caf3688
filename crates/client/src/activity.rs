//! Activity phase tracking
//!
//! Holds the process-wide busy/cooldown/idle signal. Only `cooldown → idle`
//! is timer-driven; every other move comes from [`ActivityTracker::set_phase`].

use std::time::Duration;

use chatsync_protocol::ActivityPhase;

use crate::scheduler::{Scheduler, TimerKind};

#[derive(Debug, Default)]
pub struct ActivityTracker {
    phase: ActivityPhase,
}

impl ActivityTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn phase(&self) -> ActivityPhase {
        self.phase
    }

    /// Move to `next`. Entering cooldown (again) arms the decay timer;
    /// entering anything else cancels it. Returns true if the phase changed.
    pub fn set_phase<M: Send + 'static>(
        &mut self,
        next: ActivityPhase,
        scheduler: &mut Scheduler<M>,
        cooldown: Duration,
    ) -> bool {
        match next {
            ActivityPhase::Cooldown => scheduler.schedule(TimerKind::Cooldown, cooldown),
            _ => {
                scheduler.cancel(TimerKind::Cooldown);
            }
        }
        let changed = self.phase != next;
        self.phase = next;
        changed
    }

    /// The cooldown timer elapsed. Returns true if the phase decayed.
    pub fn cooldown_elapsed(&mut self) -> bool {
        if self.phase == ActivityPhase::Cooldown {
            self.phase = ActivityPhase::Idle;
            true
        } else {
            false
        }
    }
}

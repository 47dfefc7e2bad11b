//! Update state machine driving the compositing thread.
//!
//! The scheduler holds no thread or lock of its own. The run loop owns it behind its
//! state lock and turns each [`ScheduleOutcome`] into a wake-up of the compositing thread.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Idle,
    UpdateScheduled,
    Updating,
    Suspended,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum UpdatePhase {
    #[default]
    Idle,
    Scheduled,
    InProgress,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleOutcome {
    /// The compositing thread must be woken to start a cycle.
    WakeCompositor,
    /// Folded into a cycle that is already scheduled or running.
    Coalesced,
    /// Recorded while suspended; the cycle runs after the outermost resume.
    Deferred,
    /// Updates were stopped; nothing will run for this request.
    Ignored,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    Idle,
    /// Another update was requested while the cycle ran; run once more without idling.
    Rescheduled,
}

#[derive(Debug, Clone, Default)]
pub struct FrameScheduler {
    phase: UpdatePhase,
    suspend_count: u32,
    requested_during_update: bool,
    stopped: bool,
    completed_cycles: u64,
}

impl FrameScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> SchedulerState {
        match self.phase {
            // A running cycle always finishes, even when suspended mid-way.
            UpdatePhase::InProgress => SchedulerState::Updating,
            _ if self.suspend_count > 0 => SchedulerState::Suspended,
            UpdatePhase::Idle => SchedulerState::Idle,
            UpdatePhase::Scheduled => SchedulerState::UpdateScheduled,
        }
    }

    /// True while an update is scheduled or running.
    pub fn is_active(&self) -> bool {
        self.phase != UpdatePhase::Idle
    }

    pub fn is_suspended(&self) -> bool {
        self.suspend_count > 0
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    pub fn completed_cycles(&self) -> u64 {
        self.completed_cycles
    }

    pub fn schedule_update(&mut self) -> ScheduleOutcome {
        if self.stopped {
            return ScheduleOutcome::Ignored;
        }
        if self.suspend_count > 0 {
            if self.phase == UpdatePhase::InProgress {
                self.requested_during_update = true;
            } else {
                self.phase = UpdatePhase::Scheduled;
            }
            return ScheduleOutcome::Deferred;
        }
        match self.phase {
            UpdatePhase::Idle => {
                self.phase = UpdatePhase::Scheduled;
                ScheduleOutcome::WakeCompositor
            }
            UpdatePhase::Scheduled => ScheduleOutcome::Coalesced,
            UpdatePhase::InProgress => {
                self.requested_during_update = true;
                ScheduleOutcome::Coalesced
            }
        }
    }

    /// Called by the compositing thread when woken. Returns whether a cycle should run now.
    pub fn begin_update(&mut self) -> bool {
        if self.stopped || self.suspend_count > 0 || self.phase != UpdatePhase::Scheduled {
            return false;
        }
        self.phase = UpdatePhase::InProgress;
        self.requested_during_update = false;
        true
    }

    pub fn update_completed(&mut self) -> CycleOutcome {
        debug_assert_eq!(self.phase, UpdatePhase::InProgress);
        if self.phase != UpdatePhase::InProgress {
            return CycleOutcome::Idle;
        }
        self.completed_cycles += 1;

        let again = std::mem::take(&mut self.requested_during_update);
        if again && !self.stopped {
            self.phase = UpdatePhase::Scheduled;
            if self.suspend_count == 0 {
                return CycleOutcome::Rescheduled;
            }
            // Kept scheduled; `resume` wakes the compositor for it.
            return CycleOutcome::Idle;
        }
        self.phase = UpdatePhase::Idle;
        CycleOutcome::Idle
    }

    /// Returns true for the outermost suspend.
    pub fn suspend(&mut self) -> bool {
        self.suspend_count += 1;
        tracing::debug!(suspend_count = self.suspend_count, "frame scheduler suspended");
        self.suspend_count == 1
    }

    /// Returns true when the outermost resume finds an update waiting, so the compositor
    /// must be woken.
    pub fn resume(&mut self) -> bool {
        debug_assert!(self.suspend_count > 0, "resume without matching suspend");
        if self.suspend_count == 0 {
            return false;
        }
        self.suspend_count -= 1;
        tracing::debug!(suspend_count = self.suspend_count, "frame scheduler resumed");
        self.suspend_count == 0 && !self.stopped && self.phase == UpdatePhase::Scheduled
    }

    /// Permanently stops scheduling. A cycle already running is allowed to finish.
    pub fn stop_updates(&mut self) {
        self.stopped = true;
        self.requested_during_update = false;
        if self.phase == UpdatePhase::Scheduled {
            self.phase = UpdatePhase::Idle;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run_cycle(scheduler: &mut FrameScheduler) -> CycleOutcome {
        assert!(scheduler.begin_update());
        scheduler.update_completed()
    }

    #[test]
    fn first_request_wakes_and_later_ones_coalesce() {
        let mut scheduler = FrameScheduler::new();
        assert_eq!(scheduler.state(), SchedulerState::Idle);
        assert_eq!(scheduler.schedule_update(), ScheduleOutcome::WakeCompositor);
        assert_eq!(scheduler.schedule_update(), ScheduleOutcome::Coalesced);
        assert_eq!(scheduler.state(), SchedulerState::UpdateScheduled);
        assert!(scheduler.is_active());

        assert_eq!(run_cycle(&mut scheduler), CycleOutcome::Idle);
        assert_eq!(scheduler.state(), SchedulerState::Idle);
        assert!(!scheduler.is_active());
    }

    #[test]
    fn requests_during_update_run_exactly_one_more_cycle() {
        let mut scheduler = FrameScheduler::new();
        scheduler.schedule_update();
        assert!(scheduler.begin_update());
        assert_eq!(scheduler.state(), SchedulerState::Updating);

        for _ in 0..3 {
            assert_eq!(scheduler.schedule_update(), ScheduleOutcome::Coalesced);
        }
        assert_eq!(scheduler.update_completed(), CycleOutcome::Rescheduled);
        assert_eq!(scheduler.state(), SchedulerState::UpdateScheduled);

        assert_eq!(run_cycle(&mut scheduler), CycleOutcome::Idle);
        assert_eq!(scheduler.completed_cycles(), 2);
        assert!(!scheduler.begin_update());
    }

    #[test]
    fn suspend_is_reference_counted() {
        let mut scheduler = FrameScheduler::new();
        assert!(scheduler.suspend());
        assert!(!scheduler.suspend());
        assert_eq!(scheduler.state(), SchedulerState::Suspended);

        assert!(!scheduler.resume());
        assert!(scheduler.is_suspended());
        assert!(!scheduler.resume());
        assert_eq!(scheduler.state(), SchedulerState::Idle);
        assert_eq!(scheduler.schedule_update(), ScheduleOutcome::WakeCompositor);
    }

    #[test]
    fn request_while_suspended_runs_after_outermost_resume() {
        let mut scheduler = FrameScheduler::new();
        scheduler.suspend();
        scheduler.suspend();
        assert_eq!(scheduler.schedule_update(), ScheduleOutcome::Deferred);
        assert!(!scheduler.begin_update());

        assert!(!scheduler.resume());
        assert!(!scheduler.begin_update());
        assert!(scheduler.resume());
        assert_eq!(run_cycle(&mut scheduler), CycleOutcome::Idle);
    }

    #[test]
    fn suspended_scheduler_refuses_to_begin() {
        let mut scheduler = FrameScheduler::new();
        scheduler.schedule_update();
        scheduler.suspend();
        assert!(!scheduler.begin_update());
        assert!(scheduler.resume());
        assert!(scheduler.begin_update());
    }

    #[test]
    fn suspend_mid_cycle_lets_cycle_finish_and_defers_the_next() {
        let mut scheduler = FrameScheduler::new();
        scheduler.schedule_update();
        assert!(scheduler.begin_update());
        scheduler.schedule_update();
        scheduler.suspend();
        assert_eq!(scheduler.state(), SchedulerState::Updating);

        assert_eq!(scheduler.update_completed(), CycleOutcome::Idle);
        assert_eq!(scheduler.state(), SchedulerState::Suspended);
        assert!(scheduler.resume());
        assert_eq!(scheduler.state(), SchedulerState::UpdateScheduled);
    }

    #[test]
    fn stopped_scheduler_ignores_requests_but_finishes_running_cycle() {
        let mut scheduler = FrameScheduler::new();
        scheduler.schedule_update();
        assert!(scheduler.begin_update());
        scheduler.schedule_update();
        scheduler.stop_updates();

        assert_eq!(scheduler.update_completed(), CycleOutcome::Idle);
        assert_eq!(scheduler.schedule_update(), ScheduleOutcome::Ignored);
        assert!(!scheduler.is_active());
    }
}

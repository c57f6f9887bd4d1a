//! Restartable countdown used for the inactivity detection of a transaction.
//!
//! All operations have an `_at` variant which takes the current time explicitly. The plain
//! variants use [Instant::now].
use core::time::Duration;
use std::time::Instant;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum TimerState {
    Off,
    Running,
    Paused,
}

#[derive(Debug, Copy, Clone)]
pub struct Timer {
    state: TimerState,
    duration: Duration,
    start_time: Option<Instant>,
    pause_time: Option<Instant>,
}

impl Default for Timer {
    fn default() -> Self {
        Self {
            state: TimerState::Off,
            duration: Duration::ZERO,
            start_time: None,
            pause_time: None,
        }
    }
}

impl Timer {
    pub fn state(&self) -> TimerState {
        self.state
    }

    pub fn duration(&self) -> Duration {
        self.duration
    }

    pub fn start(&mut self, duration: Duration) {
        self.start_at(duration, Instant::now());
    }

    pub fn start_at(&mut self, duration: Duration, now: Instant) {
        self.duration = duration;
        self.restart_at(now);
    }

    /// Starts again with the previously configured duration.
    pub fn restart(&mut self) {
        self.restart_at(Instant::now());
    }

    pub fn restart_at(&mut self, now: Instant) {
        self.state = TimerState::Running;
        self.start_time = Some(now);
        self.pause_time = None;
    }

    pub fn cancel(&mut self) {
        self.state = TimerState::Off;
        self.start_time = None;
        self.pause_time = None;
    }

    /// Only effective for a running timer.
    pub fn pause(&mut self) {
        self.pause_at(Instant::now());
    }

    pub fn pause_at(&mut self, now: Instant) {
        if self.state == TimerState::Running {
            self.state = TimerState::Paused;
            self.pause_time = Some(now);
        }
    }

    /// Only effective for a paused timer. The time spent paused does not count towards the
    /// expiration.
    pub fn resume(&mut self) {
        self.resume_at(Instant::now());
    }

    pub fn resume_at(&mut self, now: Instant) {
        if self.state != TimerState::Paused {
            return;
        }
        let elapsed_before_pause = self.elapsed_before_pause();
        self.start_time = Some(now.checked_sub(elapsed_before_pause).unwrap_or(now));
        self.pause_time = None;
        self.state = TimerState::Running;
    }

    pub fn expired(&self) -> bool {
        self.expired_at(Instant::now())
    }

    pub fn expired_at(&self, now: Instant) -> bool {
        match (self.state, self.start_time) {
            (TimerState::Running, Some(start_time)) => {
                now.saturating_duration_since(start_time) >= self.duration
            }
            _ => false,
        }
    }

    pub fn time_left(&self) -> Duration {
        self.time_left_at(Instant::now())
    }

    /// Remaining time for a running timer, the time elapsed before the pause for a paused timer
    /// and zero for a timer which is off.
    pub fn time_left_at(&self, now: Instant) -> Duration {
        match (self.state, self.start_time) {
            (TimerState::Running, Some(start_time)) => self
                .duration
                .saturating_sub(now.saturating_duration_since(start_time)),
            (TimerState::Paused, _) => self.elapsed_before_pause(),
            _ => Duration::ZERO,
        }
    }

    fn elapsed_before_pause(&self) -> Duration {
        match (self.start_time, self.pause_time) {
            (Some(start_time), Some(pause_time)) => {
                pause_time.saturating_duration_since(start_time)
            }
            _ => Duration::ZERO,
        }
    }
}

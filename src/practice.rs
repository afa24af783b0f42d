//! Practice-mode sequencer.
//!
//! A clock-driven state machine that walks Countdown -> Autonomous -> Delay
//! -> Teleop -> Done on a configured schedule and emits mode/enable intents
//! on each phase entry. The coordinator drives [`PracticeSequencer::tick`]
//! on its 20 ms quantum and merges the intents with operator input
//! (operator always wins for safety actions).
//!
//! The clock is passed in rather than read, so the whole schedule can be
//! tested against synthetic instants.

use crate::config::PracticeTiming;
use crate::protocol::Mode;
use serde::Serialize;
use std::time::{Duration, Instant};
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PracticePhase {
    Idle,
    Countdown,
    Autonomous,
    Delay,
    Teleop,
    Done,
}

/// What the sequencer wants applied after one tick.
///
/// `set_mode` and `set_enabled` are `Some` only on phase transitions.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PracticeTick {
    pub phase: PracticePhase,
    pub elapsed: Duration,
    pub remaining: Duration,
    pub set_mode: Option<Mode>,
    pub set_enabled: Option<bool>,
}

#[derive(Debug)]
pub struct PracticeSequencer {
    phase: PracticePhase,
    timing: PracticeTiming,
    phase_start: Option<Instant>,
    a_stopped: bool,
}

impl PracticeSequencer {
    pub fn new(timing: PracticeTiming) -> Self {
        Self {
            phase: PracticePhase::Idle,
            timing,
            phase_start: None,
            a_stopped: false,
        }
    }

    /// Begin the sequence. Entering Countdown selects Autonomous mode with
    /// the robot disabled, so the mode switch settles before enable.
    pub fn start(&mut self, now: Instant) -> PracticeTick {
        info!("Practice sequence started");
        self.phase = PracticePhase::Countdown;
        self.phase_start = Some(now);
        self.a_stopped = false;

        PracticeTick {
            phase: self.phase,
            elapsed: Duration::ZERO,
            remaining: self.phase_duration().unwrap_or_default(),
            set_mode: Some(Mode::Autonomous),
            set_enabled: Some(false),
        }
    }

    /// Abort from any phase back to Idle. The caller must treat this as a
    /// disable.
    pub fn stop(&mut self) {
        if self.phase != PracticePhase::Idle {
            info!("Practice sequence stopped from {:?}", self.phase);
        }
        self.phase = PracticePhase::Idle;
        self.phase_start = None;
        self.a_stopped = false;
    }

    /// A-Stop: soft disable for the remainder of Autonomous. Does not latch
    /// across phases; Teleop re-enables as scheduled. Returns whether the
    /// stop applied.
    pub fn a_stop(&mut self) -> bool {
        if self.phase == PracticePhase::Autonomous && !self.a_stopped {
            info!("A-Stop asserted during autonomous");
            self.a_stopped = true;
            true
        } else {
            false
        }
    }

    /// Advance the schedule to `now`. Multiple expired phases (zero-length
    /// delays, a stalled caller) are walked in order and their entry intents
    /// merged, the latest winning per field.
    pub fn tick(&mut self, now: Instant) -> PracticeTick {
        let mut set_mode = None;
        let mut set_enabled = None;

        while let (Some(start), Some(duration)) = (self.phase_start, self.phase_duration()) {
            if now.duration_since(start) < duration {
                break;
            }
            // Phase boundaries advance by the configured duration, not by
            // observation time, so the schedule never drifts.
            self.phase_start = Some(start + duration);
            self.enter_next(&mut set_mode, &mut set_enabled);
        }

        let elapsed = self
            .phase_start
            .map(|start| now.duration_since(start))
            .unwrap_or_default();
        let remaining = self
            .phase_duration()
            .map(|duration| duration.saturating_sub(elapsed))
            .unwrap_or_default();

        PracticeTick {
            phase: self.phase,
            elapsed,
            remaining,
            set_mode,
            set_enabled,
        }
    }

    pub fn phase(&self) -> PracticePhase {
        self.phase
    }

    pub fn is_running(&self) -> bool {
        !matches!(self.phase, PracticePhase::Idle | PracticePhase::Done)
    }

    pub fn set_timing(&mut self, timing: PracticeTiming) {
        self.timing = timing;
    }

    fn enter_next(&mut self, set_mode: &mut Option<Mode>, set_enabled: &mut Option<bool>) {
        let next = match self.phase {
            PracticePhase::Countdown => PracticePhase::Autonomous,
            PracticePhase::Autonomous => PracticePhase::Delay,
            PracticePhase::Delay => PracticePhase::Teleop,
            PracticePhase::Teleop => PracticePhase::Done,
            other => other,
        };
        debug!("Practice phase {:?} -> {:?}", self.phase, next);
        self.phase = next;

        match next {
            PracticePhase::Autonomous => {
                *set_enabled = Some(true);
            }
            PracticePhase::Delay => {
                self.a_stopped = false;
                *set_enabled = Some(false);
            }
            PracticePhase::Teleop => {
                *set_mode = Some(Mode::Teleop);
                *set_enabled = Some(true);
            }
            PracticePhase::Done => {
                self.phase_start = None;
                *set_enabled = Some(false);
            }
            _ => {}
        }
    }

    fn phase_duration(&self) -> Option<Duration> {
        let secs = match self.phase {
            PracticePhase::Countdown => self.timing.countdown_secs,
            PracticePhase::Autonomous => self.timing.auto_secs,
            PracticePhase::Delay => self.timing.delay_secs,
            PracticePhase::Teleop => self.timing.teleop_secs,
            PracticePhase::Idle | PracticePhase::Done => return None,
        };
        Some(Duration::from_secs(secs as u64))
    }
}

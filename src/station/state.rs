//! Shared control state and the published robot-state snapshot.
//!
//! One mutex guards everything the send loop must read atomically: control
//! flags, one-shot requests, alliance, the joystick slot table, the practice
//! countdown, and the publication counter. Holders keep the guard for plain
//! field access only; nothing awaits while it is locked.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::connection::LinkState;
use crate::input::{SlotSnapshot, SlotTable};
use crate::practice::PracticePhase;
use crate::protocol::{
    Alliance, ControlFlags, JoystickData, JoystickOutputs, Mode, RequestFlags, StatusFlags,
    TelemetryData,
};

/// State read by the send loop as a single atomic snapshot and mutated by
/// the coordinator and the input poll task.
#[derive(Debug)]
pub struct ControlShared {
    pub control: ControlFlags,
    pub request: RequestFlags,
    pub alliance: Alliance,
    pub slots: SlotTable,
    /// Practice countdown seconds; drives the countdown tag while `Some`.
    pub countdown: Option<f32>,
    /// One-shot: the next outbound datagram carries the date/time tag.
    pub send_date: bool,
    /// Monotonic snapshot publication counter.
    pub publication: u64,
}

impl ControlShared {
    pub fn new(joystick_locks: HashMap<String, u8>) -> Self {
        Self {
            control: ControlFlags::default(),
            request: RequestFlags::default(),
            alliance: Alliance::default(),
            slots: SlotTable::new(joystick_locks),
            countdown: None,
            send_date: false,
            publication: 0,
        }
    }
}

pub type SharedHandle = Arc<Mutex<ControlShared>>;

/// Lock the shared state, surviving a poisoned mutex: a panicked holder
/// leaves plain data behind, and the safety paths must keep working.
pub fn lock_shared(shared: &SharedHandle) -> MutexGuard<'_, ControlShared> {
    shared.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// What the send loop captures per tick: everything the datagram needs,
/// taken under one lock acquisition.
#[derive(Debug, Clone)]
pub struct SendSnapshot {
    pub control: ControlFlags,
    pub request: RequestFlags,
    pub alliance: Alliance,
    pub joysticks: Vec<JoystickData>,
    pub countdown: Option<f32>,
    pub send_date: bool,
}

impl ControlShared {
    /// Capture the outbound view and clear the one-shot fields, so each
    /// request and date tag is emitted exactly once.
    pub fn take_send_snapshot(&mut self) -> SendSnapshot {
        let snapshot = SendSnapshot {
            control: self.control,
            request: self.request,
            alliance: self.alliance,
            joysticks: self.slots.wire_data(),
            countdown: self.countdown,
            send_date: self.send_date,
        };
        self.request = RequestFlags::default();
        self.send_date = false;
        snapshot
    }
}

/// The flattened snapshot published to external consumers.
///
/// Cloned per publication; consumers never share references into the
/// engine. Consumers that miss intermediate publications observe only the
/// latest values.
#[derive(Debug, Clone, Serialize)]
pub struct RobotState {
    pub publication: u64,

    // Link
    pub link: LinkState,
    pub connected: bool,
    pub code_running: bool,
    pub trip_time_ms: f64,
    pub lost_packets: u32,
    pub sequence: u16,

    // Control (what the DS is commanding)
    pub estopped: bool,
    pub enabled: bool,
    pub mode: Mode,

    // Robot-reported status
    pub status: StatusFlags,
    pub voltage: f32,
    pub trace: u8,
    pub telemetry: TelemetryData,
    pub joystick_outputs: JoystickOutputs,

    // Joysticks
    pub joysticks: Vec<SlotSnapshot>,
    pub any_joystick_connected: bool,

    // Practice
    pub practice_phase: PracticePhase,
    pub practice_elapsed_secs: f64,
    pub practice_remaining_secs: f64,

    // Operator context
    pub team_number: u16,
    pub alliance: Alliance,
}

impl Default for RobotState {
    fn default() -> Self {
        Self {
            publication: 0,
            link: LinkState::Disconnected,
            connected: false,
            code_running: false,
            trip_time_ms: 0.0,
            lost_packets: 0,
            sequence: 0,
            estopped: false,
            enabled: false,
            mode: Mode::Teleop,
            status: StatusFlags::default(),
            voltage: 0.0,
            trace: 0,
            telemetry: TelemetryData::default(),
            joystick_outputs: JoystickOutputs::default(),
            joysticks: Vec::new(),
            any_joystick_connected: false,
            practice_phase: PracticePhase::Idle,
            practice_elapsed_secs: 0.0,
            practice_remaining_secs: 0.0,
            team_number: 0,
            alliance: Alliance::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn send_snapshot_clears_one_shots() {
        let mut shared = ControlShared::new(HashMap::new());
        shared.request.reboot_controller = true;
        shared.send_date = true;

        let snapshot = shared.take_send_snapshot();
        assert!(snapshot.request.reboot_controller);
        assert!(snapshot.send_date);

        let next = shared.take_send_snapshot();
        assert!(next.request.is_empty());
        assert!(!next.send_date);
    }

    #[test]
    fn send_snapshot_keeps_control_fields() {
        let mut shared = ControlShared::new(HashMap::new());
        shared.control.enabled = true;
        shared.countdown = Some(7.5);

        let snapshot = shared.take_send_snapshot();
        assert!(snapshot.control.enabled);
        assert_eq!(snapshot.countdown, Some(7.5));

        // Non-one-shot fields survive.
        assert!(shared.control.enabled);
        assert_eq!(shared.countdown, Some(7.5));
    }
}

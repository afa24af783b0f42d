//! Gamepad subsystem: the six-slot joystick table and the device poll task.
//!
//! The slot table is plain data guarded by the coordinator's shared lock;
//! every assignment rule (first-free, UUID locks, displacement, reserved
//! disconnects, wholesale reorder) is a pure method so it can be tested
//! without hardware. The poll task owns the gilrs context, drains
//! connect/disconnect events, and refreshes slot data every 5 ms.

use gilrs::{Event, EventType, Gamepad, GamepadId, Gilrs};
use serde::Serialize;
use statum::{machine, state};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};

use crate::protocol::JoystickData;
use crate::station::state::{lock_shared, SharedHandle};

pub mod mapping;

pub const SLOT_COUNT: usize = 6;
const POLL_PERIOD: Duration = Duration::from_millis(5);

#[derive(Debug, thiserror::Error)]
pub enum InputError {
    #[error("failed to initialize gamepad backend: {0}")]
    Backend(String),

    #[error("input channel closed: {0}")]
    Channel(String),
}

/// One occupied slot.
#[derive(Debug, Clone, PartialEq)]
pub struct SlotEntry {
    pub uuid: String,
    pub name: String,
    pub locked: bool,
    pub connected: bool,
    pub axis_count: u8,
    pub button_count: u8,
    pub hat_count: u8,
    pub data: JoystickData,
}

/// Published view of a slot, embedded in the robot-state snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct SlotSnapshot {
    pub slot: u8,
    pub uuid: String,
    pub name: String,
    pub locked: bool,
    pub connected: bool,
    pub axis_count: u8,
    pub button_count: u8,
    pub hat_count: u8,
    pub data: JoystickData,
}

/// What `detach` observed, so the caller can raise the safety intent.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DetachReport {
    pub slot: u8,
    /// The slot was supplying non-zero input when the device vanished.
    pub was_active: bool,
}

/// The six ordered joystick slots plus the UUID lock table.
///
/// Invariant: a UUID occupies at most one slot; a locked UUID always maps
/// to its reserved slot while the lock exists.
#[derive(Debug, Default)]
pub struct SlotTable {
    slots: [Option<SlotEntry>; SLOT_COUNT],
    locks: HashMap<String, u8>,
}

impl SlotTable {
    pub fn new(locks: HashMap<String, u8>) -> Self {
        let locks = locks
            .into_iter()
            .filter(|&(_, slot)| (slot as usize) < SLOT_COUNT)
            .collect();
        Self {
            slots: Default::default(),
            locks,
        }
    }

    /// A device appeared. Returns the slot it now occupies, or `None` when
    /// the table is full.
    pub fn attach(
        &mut self,
        uuid: &str,
        name: &str,
        axis_count: u8,
        button_count: u8,
        hat_count: u8,
    ) -> Option<u8> {
        // Reappearing device: it keeps its slot (reserved locks included).
        if let Some(slot) = self.position_of(uuid) {
            let entry = self.slots[slot as usize].as_mut()?;
            entry.connected = true;
            entry.name = name.to_string();
            entry.axis_count = axis_count;
            entry.button_count = button_count;
            entry.hat_count = hat_count;
            return Some(slot);
        }

        let entry = SlotEntry {
            uuid: uuid.to_string(),
            name: name.to_string(),
            locked: self.locks.contains_key(uuid),
            connected: true,
            axis_count,
            button_count,
            hat_count,
            data: JoystickData::default(),
        };

        if let Some(&reserved) = self.locks.get(uuid) {
            // Whoever holds the reserved slot is bumped to the next free one.
            if let Some(occupant) = self.slots[reserved as usize].take() {
                match self.first_free() {
                    Some(free) => self.slots[free] = Some(occupant),
                    None => warn!(
                        "No free slot for displaced device {}, dropping it",
                        occupant.name
                    ),
                }
            }
            self.slots[reserved as usize] = Some(entry);
            return Some(reserved);
        }

        let free = self.first_free()?;
        self.slots[free] = Some(entry);
        Some(free as u8)
    }

    /// A device vanished. Locked slots stay reserved (named, disconnected);
    /// unlocked slots become free. Other slots do not shift.
    pub fn detach(&mut self, uuid: &str) -> Option<DetachReport> {
        let slot = self.position_of(uuid)?;
        let entry = self.slots[slot as usize].as_mut()?;
        let was_active = entry.connected && entry.data.is_active();

        if entry.locked {
            entry.connected = false;
            entry.data = JoystickData::default();
        } else {
            self.slots[slot as usize] = None;
        }

        Some(DetachReport { slot, was_active })
    }

    pub fn set_data(&mut self, uuid: &str, data: JoystickData) {
        if let Some(slot) = self.position_of(uuid) {
            if let Some(entry) = self.slots[slot as usize].as_mut() {
                if entry.connected {
                    entry.data = data;
                }
            }
        }
    }

    /// Replace the ordering wholesale: listed UUIDs take their list index,
    /// everything else packs into the remaining slots in current order.
    pub fn reorder(&mut self, order: &[String]) {
        let mut next: [Option<SlotEntry>; SLOT_COUNT] = Default::default();

        for (target, uuid) in order.iter().enumerate().take(SLOT_COUNT) {
            if let Some(current) = self.position_of(uuid) {
                next[target] = self.slots[current as usize].take();
            }
        }

        let mut free = 0;
        for slot in &mut self.slots {
            if let Some(entry) = slot.take() {
                while free < SLOT_COUNT && next[free].is_some() {
                    free += 1;
                }
                if free < SLOT_COUNT {
                    next[free] = Some(entry);
                }
            }
        }

        self.slots = next;

        // Locks follow the devices to their new positions.
        for (slot, entry) in self.slots.iter().enumerate() {
            if let Some(entry) = entry {
                if entry.locked {
                    self.locks.insert(entry.uuid.clone(), slot as u8);
                }
            }
        }
    }

    /// Reserve `slot` for `uuid`. If the device is present elsewhere it moves
    /// there now, displacing an unlocked occupant to the next free slot.
    pub fn lock(&mut self, uuid: &str, slot: u8) {
        if slot as usize >= SLOT_COUNT {
            warn!("Ignoring lock of {uuid} to out-of-range slot {slot}");
            return;
        }
        self.locks.insert(uuid.to_string(), slot);

        let Some(current) = self.position_of(uuid) else {
            return;
        };
        let mut entry = match self.slots[current as usize].take() {
            Some(entry) => entry,
            None => return,
        };
        entry.locked = true;

        if current != slot {
            if let Some(occupant) = self.slots[slot as usize].take() {
                match self.first_free() {
                    Some(free) => self.slots[free] = Some(occupant),
                    None => warn!(
                        "No free slot for displaced device {}, dropping it",
                        occupant.name
                    ),
                }
            }
        }
        self.slots[slot as usize] = Some(entry);
    }

    pub fn unlock(&mut self, uuid: &str) {
        self.locks.remove(uuid);
        if let Some(slot) = self.position_of(uuid) {
            if let Some(entry) = self.slots[slot as usize].as_mut() {
                entry.locked = false;
                // A reserved-but-absent device has nothing left to hold.
                if !entry.connected {
                    self.slots[slot as usize] = None;
                }
            }
        }
    }

    /// Drop unlocked entries ahead of a device rescan.
    pub fn clear_unlocked(&mut self) {
        for slot in &mut self.slots {
            if slot.as_ref().is_some_and(|entry| !entry.locked) {
                *slot = None;
            }
        }
    }

    /// Wire payloads in slot order, up to the highest occupied slot.
    /// Vacant or disconnected slots below it carry empty data so positions
    /// stay aligned.
    pub fn wire_data(&self) -> Vec<JoystickData> {
        let highest = self
            .slots
            .iter()
            .rposition(|slot| slot.as_ref().is_some_and(|entry| entry.connected));
        match highest {
            Some(highest) => self.slots[..=highest]
                .iter()
                .map(|slot| match slot {
                    Some(entry) if entry.connected => entry.data.clone(),
                    _ => JoystickData::default(),
                })
                .collect(),
            None => Vec::new(),
        }
    }

    pub fn snapshot(&self) -> Vec<SlotSnapshot> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(slot, entry)| {
                entry.as_ref().map(|entry| SlotSnapshot {
                    slot: slot as u8,
                    uuid: entry.uuid.clone(),
                    name: entry.name.clone(),
                    locked: entry.locked,
                    connected: entry.connected,
                    axis_count: entry.axis_count,
                    button_count: entry.button_count,
                    hat_count: entry.hat_count,
                    data: entry.data.clone(),
                })
            })
            .collect()
    }

    pub fn any_connected(&self) -> bool {
        self.slots
            .iter()
            .any(|slot| slot.as_ref().is_some_and(|entry| entry.connected))
    }

    pub fn locks(&self) -> &HashMap<String, u8> {
        &self.locks
    }

    pub fn position_of(&self, uuid: &str) -> Option<u8> {
        self.slots
            .iter()
            .position(|slot| slot.as_ref().is_some_and(|entry| entry.uuid == uuid))
            .map(|slot| slot as u8)
    }

    fn first_free(&self) -> Option<usize> {
        self.slots.iter().position(|slot| slot.is_none())
    }
}

/// Raised by the poll task for the coordinator to act on.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum InputIntent {
    /// A slot supplying input vanished while the robot was enabled.
    SafetyDisable { slot: u8 },
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum InputCommand {
    Rescan,
}

#[state]
#[derive(Debug, Clone)]
pub enum PollerState {
    Initializing,
    Polling,
}

#[machine]
pub struct DevicePoller<S: PollerState> {
    gilrs: Gilrs,
    shared: SharedHandle,
    devices: HashMap<GamepadId, String>,
    intent_tx: mpsc::Sender<InputIntent>,
    cmd_rx: mpsc::Receiver<InputCommand>,
    shutdown: watch::Receiver<bool>,
}

impl DevicePoller<Initializing> {
    pub fn create(
        shared: SharedHandle,
        intent_tx: mpsc::Sender<InputIntent>,
        cmd_rx: mpsc::Receiver<InputCommand>,
        shutdown: watch::Receiver<bool>,
    ) -> Result<Self, InputError> {
        info!("Initializing gamepad backend");
        let gilrs = Gilrs::new().map_err(|e| InputError::Backend(e.to_string()))?;

        Ok(Self::new(
            gilrs,
            shared,
            HashMap::new(),
            intent_tx,
            cmd_rx,
            shutdown,
        ))
    }

    /// Scan already-present devices and move to the polling state.
    pub fn initialize(mut self) -> DevicePoller<Polling> {
        let ids: Vec<GamepadId> = self.gilrs.gamepads().map(|(id, _)| id).collect();
        info!("Found {} gamepad(s) at startup", ids.len());
        for id in ids {
            attach_device(&mut self.gilrs, &mut self.devices, &self.shared, id);
        }
        self.transition()
    }
}

impl DevicePoller<Polling> {
    pub async fn run(mut self) {
        info!("Input poll task running");
        let mut ticker = tokio::time::interval(POLL_PERIOD);

        loop {
            tokio::select! {
                _ = self.shutdown.changed() => {
                    if *self.shutdown.borrow() {
                        break;
                    }
                }
                Some(cmd) = self.cmd_rx.recv() => match cmd {
                    InputCommand::Rescan => self.rescan(),
                },
                _ = ticker.tick() => {
                    self.drain_events();
                    self.refresh_slot_data();
                }
            }
        }
        info!("Input poll task stopped");
    }

    fn drain_events(&mut self) {
        while let Some(Event { id, event, .. }) = self.gilrs.next_event() {
            match event {
                EventType::Connected => {
                    attach_device(&mut self.gilrs, &mut self.devices, &self.shared, id);
                }
                EventType::Disconnected => self.detach_device(id),
                _ => {}
            }
        }
    }

    fn detach_device(&mut self, id: GamepadId) {
        let Some(uuid) = self.devices.remove(&id) else {
            return;
        };

        let mut shared = lock_shared(&self.shared);
        let report = shared.slots.detach(&uuid);
        let enabled = shared.control.enabled;
        drop(shared);

        let Some(report) = report else { return };
        info!("Device left slot {}", report.slot);

        if enabled && report.was_active {
            warn!(
                "Active joystick in slot {} disconnected while enabled, requesting disable",
                report.slot
            );
            if let Err(e) = self
                .intent_tx
                .try_send(InputIntent::SafetyDisable { slot: report.slot })
            {
                error!("Failed to deliver safety disable: {e}");
            }
        }
    }

    fn rescan(&mut self) {
        info!("Rescanning input devices");
        {
            let mut shared = lock_shared(&self.shared);
            shared.slots.clear_unlocked();
        }
        self.devices.clear();

        let ids: Vec<GamepadId> = self.gilrs.gamepads().map(|(id, _)| id).collect();
        for id in ids {
            attach_device(&mut self.gilrs, &mut self.devices, &self.shared, id);
        }
    }

    fn refresh_slot_data(&mut self) {
        if self.devices.is_empty() {
            return;
        }
        let readings: Vec<(String, JoystickData)> = self
            .devices
            .iter()
            .map(|(&id, uuid)| (uuid.clone(), read_gamepad(&self.gilrs.gamepad(id))))
            .collect();

        let mut shared = lock_shared(&self.shared);
        for (uuid, data) in readings {
            shared.slots.set_data(&uuid, data);
        }
    }
}

fn attach_device(
    gilrs: &mut Gilrs,
    devices: &mut HashMap<GamepadId, String>,
    shared: &SharedHandle,
    id: GamepadId,
) {
    let gamepad = gilrs.gamepad(id);
    let uuid = device_uuid(&gamepad);
    let name = gamepad.name().to_string();

    let mut state = lock_shared(shared);
    match state.slots.attach(&uuid, &name, 6, 10, 1) {
        Some(slot) => {
            info!("Gamepad \"{name}\" -> slot {slot}");
            devices.insert(id, uuid);
        }
        None => warn!("All slots occupied, ignoring gamepad \"{name}\""),
    }
}

/// Stable identity for a device across replugs.
fn device_uuid(gamepad: &Gamepad) -> String {
    let uuid = gamepad.uuid();
    if uuid == [0u8; 16] {
        // Some backends report no UUID; fall back to the display name.
        format!("name:{}", gamepad.name())
    } else {
        uuid.iter().map(|byte| format!("{byte:02x}")).collect()
    }
}

/// Read one device into the wire layout. The mapping tables are the single
/// source of truth for positions; values land wherever `map_axis` and
/// `map_button` say.
fn read_gamepad(gamepad: &Gamepad) -> JoystickData {
    let mut axes = vec![0i8; mapping::MAPPED_AXES.len()];
    for axis in mapping::MAPPED_AXES {
        if let Some(position) = mapping::map_axis(axis) {
            axes[position] = read_wire_axis(gamepad, axis);
        }
    }

    // Unmapped axes extend the list in enumeration order.
    for extra in [gilrs::Axis::DPadX, gilrs::Axis::DPadY] {
        if axes.len() >= JoystickData::MAX_AXES {
            break;
        }
        if let Some(data) = gamepad.axis_data(extra) {
            axes.push(mapping::scale_axis(data.value()));
        }
    }

    let mut buttons = vec![false; mapping::MAPPED_BUTTONS.len()];
    for button in mapping::MAPPED_BUTTONS {
        if let Some(position) = mapping::map_button(button) {
            buttons[position] = gamepad.is_pressed(button);
        }
    }
    for extra in [gilrs::Button::C, gilrs::Button::Z, gilrs::Button::Mode] {
        if buttons.len() >= JoystickData::MAX_BUTTONS {
            break;
        }
        if gamepad.button_data(extra).is_some() {
            buttons.push(gamepad.is_pressed(extra));
        }
    }

    JoystickData {
        axes,
        buttons,
        hats: vec![mapping::read_hat(gamepad)],
    }
}

/// Triggers arrive as an axis on some backends and as an analog button on
/// others; prefer the axis reading.
fn read_wire_axis(gamepad: &Gamepad, axis: gilrs::Axis) -> i8 {
    if let Some(data) = gamepad.axis_data(axis) {
        return mapping::scale_axis(data.value());
    }
    let fallback = match axis {
        gilrs::Axis::LeftZ => Some(gilrs::Button::LeftTrigger2),
        gilrs::Axis::RightZ => Some(gilrs::Button::RightTrigger2),
        _ => None,
    };
    fallback
        .and_then(|button| gamepad.button_data(button))
        .map(|data| mapping::scale_axis(data.value()))
        .unwrap_or(0)
}

/// Handle for the input subsystem; spawns the poll task.
pub struct InputHandle {
    cmd_tx: mpsc::Sender<InputCommand>,
}

impl InputHandle {
    pub fn spawn(
        shared: SharedHandle,
        intent_tx: mpsc::Sender<InputIntent>,
        shutdown: watch::Receiver<bool>,
    ) -> Result<Self, InputError> {
        let (cmd_tx, cmd_rx) = mpsc::channel(16);

        let poller = DevicePoller::create(shared, intent_tx, cmd_rx, shutdown)?;
        tokio::spawn(async move {
            poller.initialize().run().await;
        });

        Ok(Self { cmd_tx })
    }

    pub fn rescan(&self) {
        if self.cmd_tx.try_send(InputCommand::Rescan).is_err() {
            warn!("Input poll task not accepting commands");
        }
    }
}

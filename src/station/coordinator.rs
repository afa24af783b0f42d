//! The coordinator: owns the authoritative control state, serializes the
//! command surface, merges intents from every source, and publishes the
//! robot-state snapshot.
//!
//! Intent merge order inside one 20 ms quantum:
//! 1. EStop (any source) beats everything and latches.
//! 2. An operator Disable beats a practice Enable.
//! 3. Practice mode/enable intents apply only while practice is running.
//! 4. Otherwise last writer wins by arrival order.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::config::{Config, PracticeTiming};
use crate::connection::{
    ConnectionError, InboundReport, LinkConfig, LinkEvent, LinkHandle, LinkState,
};
use crate::hotkeys::{HotkeyAction, HotkeyManager};
use crate::input::{InputError, InputHandle, InputIntent};
use crate::practice::{PracticePhase, PracticeSequencer};
use crate::protocol::{
    stream, Alliance, JoystickOutputs, Mode, StatusFlags, TcpMessage, TelemetryData, TelemetryTag,
};
use crate::station::state::{lock_shared, ControlShared, RobotState, SharedHandle};

/// Publication and intent-merge quantum.
const QUANTUM: Duration = Duration::from_millis(20);

/// Capacity of the stdout and message fan-out channels. On overflow the
/// oldest entry is dropped; a lagging consumer learns the skip count from
/// its receiver.
const EVENT_CAPACITY: usize = 1024;

#[derive(Debug, thiserror::Error)]
pub enum StationError {
    #[error("connection subsystem failed: {0}")]
    Connection(#[from] ConnectionError),

    #[error("input subsystem failed: {0}")]
    Input(#[from] InputError),
}

/// Operator/UI command surface.
#[derive(Debug, Clone)]
pub enum Command {
    Enable,
    Disable,
    EStop,
    ClearEStop,
    SetMode(Mode),
    SetTeam(u16),
    SetAlliance(Alliance),
    SetGameData(String),
    SetUsbMode(bool),
    RebootController,
    RestartUserCode,
    StartPractice,
    StopPractice,
    SetPracticeTiming(PracticeTiming),
    ReorderJoysticks(Vec<String>),
    LockJoystick { uuid: String, slot: u8 },
    UnlockJoystick(String),
    RescanJoysticks,
    Shutdown,
}

/// Spawn options; production uses the defaults, tests compress the link
/// timing and skip the OS capture hooks.
pub struct StationOptions {
    pub link: LinkConfig,
    /// Install the global hotkey hook and the gamepad poll task.
    pub capture_devices: bool,
    /// Flush the configuration (joystick locks) back to disk on shutdown.
    pub persist_config: bool,
}

impl Default for StationOptions {
    fn default() -> Self {
        Self {
            link: LinkConfig::default(),
            capture_devices: true,
            persist_config: true,
        }
    }
}

/// Event surface handed to the external consumer.
pub struct StationEvents {
    /// Coalescing snapshot stream: late readers see only the latest value.
    pub state: watch::Receiver<RobotState>,
    pub stdout: broadcast::Receiver<String>,
    pub messages: broadcast::Receiver<TcpMessage>,
}

/// Command handle for the running engine.
pub struct StationHandle {
    cmd_tx: mpsc::Sender<Command>,
    task: JoinHandle<()>,
    local_recv_addr: std::net::SocketAddr,
}

impl StationHandle {
    pub async fn send(&self, command: Command) {
        if self.cmd_tx.send(command).await.is_err() {
            warn!("Station is no longer accepting commands");
        }
    }

    pub async fn enable(&self) {
        self.send(Command::Enable).await;
    }

    pub async fn disable(&self) {
        self.send(Command::Disable).await;
    }

    pub async fn estop(&self) {
        self.send(Command::EStop).await;
    }

    /// Where the telemetry socket is bound; tests aim the fake controller
    /// at this address.
    pub fn local_recv_addr(&self) -> std::net::SocketAddr {
        self.local_recv_addr
    }

    /// Stop the engine: one final disabled datagram goes out, the joystick
    /// locks are flushed to the configuration, and all tasks terminate.
    pub async fn shutdown(self) {
        let _ = self.cmd_tx.send(Command::Shutdown).await;
        if let Err(e) = self.task.await {
            error!("Coordinator task failed during shutdown: {e}");
        }
    }
}

pub struct Station;

impl Station {
    pub async fn spawn(config: Config) -> Result<(StationHandle, StationEvents), StationError> {
        Self::spawn_with(config, StationOptions::default()).await
    }

    pub async fn spawn_with(
        config: Config,
        options: StationOptions,
    ) -> Result<(StationHandle, StationEvents), StationError> {
        let shared: SharedHandle = Arc::new(Mutex::new(ControlShared::new(
            config.joystick_locks.clone(),
        )));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let (link_event_tx, link_event_rx) = mpsc::channel(EVENT_CAPACITY);
        let link = LinkHandle::spawn(
            shared.clone(),
            link_event_tx,
            options.link,
            config.team_number,
            config.use_usb,
            shutdown_rx.clone(),
        )
        .await?;
        let local_recv_addr = link.local_recv_addr();

        let (intent_tx, intent_rx) = mpsc::channel(16);
        let input = if options.capture_devices {
            match InputHandle::spawn(shared.clone(), intent_tx, shutdown_rx.clone()) {
                Ok(handle) => Some(handle),
                Err(e) => {
                    // A missing gamepad backend must not take the control
                    // link down with it.
                    warn!("Input subsystem unavailable: {e}");
                    None
                }
            }
        } else {
            None
        };

        let (hotkey_rx, estop_latch) = if options.capture_devices {
            let (_manager, rx, latch) = HotkeyManager::start();
            (rx, latch)
        } else {
            let (_tx, rx) = mpsc::unbounded_channel();
            (rx, Arc::new(AtomicBool::new(false)))
        };

        let (cmd_tx, cmd_rx) = mpsc::channel(64);
        let (state_tx, state_rx) = watch::channel(RobotState::default());
        let (stdout_tx, stdout_rx) = broadcast::channel(EVENT_CAPACITY);
        let (message_tx, message_rx) = broadcast::channel(EVENT_CAPACITY);

        let practice = PracticeSequencer::new(config.practice_timing);
        let coordinator = Coordinator {
            shared,
            config,
            persist_config: options.persist_config,
            practice,
            link: Some(link),
            input,
            estop_latch,
            estopped: false,
            last_operator_disable: None,
            link_state: LinkState::Resolving,
            status: StatusFlags::default(),
            voltage: 0.0,
            trace: 0,
            telemetry: TelemetryData::default(),
            joystick_outputs: JoystickOutputs::default(),
            trip_time_ms: 0.0,
            lost_packets: 0,
            inbound_sequence: 0,
            practice_view: (PracticePhase::Idle, 0.0, 0.0),
            state_tx,
            stdout_tx,
            message_tx,
            shutdown_tx,
        };

        let task = tokio::spawn(coordinator.run(cmd_rx, hotkey_rx, intent_rx, link_event_rx));

        Ok((
            StationHandle {
                cmd_tx,
                task,
                local_recv_addr,
            },
            StationEvents {
                state: state_rx,
                stdout: stdout_rx,
                messages: message_rx,
            },
        ))
    }
}

struct Coordinator {
    shared: SharedHandle,
    config: Config,
    persist_config: bool,
    practice: PracticeSequencer,
    link: Option<LinkHandle>,
    input: Option<InputHandle>,

    estop_latch: Arc<AtomicBool>,
    estopped: bool,
    last_operator_disable: Option<Instant>,

    // Live link status merged from inbound reports.
    link_state: LinkState,
    status: StatusFlags,
    voltage: f32,
    trace: u8,
    telemetry: TelemetryData,
    joystick_outputs: JoystickOutputs,
    trip_time_ms: f64,
    lost_packets: u32,
    inbound_sequence: u16,
    practice_view: (PracticePhase, f64, f64),

    state_tx: watch::Sender<RobotState>,
    stdout_tx: broadcast::Sender<String>,
    message_tx: broadcast::Sender<TcpMessage>,
    shutdown_tx: watch::Sender<bool>,
}

impl Coordinator {
    async fn run(
        mut self,
        mut cmd_rx: mpsc::Receiver<Command>,
        mut hotkey_rx: mpsc::UnboundedReceiver<HotkeyAction>,
        mut intent_rx: mpsc::Receiver<InputIntent>,
        mut link_event_rx: mpsc::Receiver<LinkEvent>,
    ) {
        info!("Coordinator running, {QUANTUM:?} quantum");
        let mut quantum = tokio::time::interval(QUANTUM);
        quantum.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = quantum.tick() => {
                    self.apply_estop_latch();
                    self.tick_practice();
                    self.publish_snapshot();
                }
                command = cmd_rx.recv() => {
                    // A dropped handle is a shutdown.
                    let stop = match command {
                        Some(command) => self.handle_command(command),
                        None => true,
                    };
                    if stop {
                        break;
                    }
                }
                Some(action) = hotkey_rx.recv() => self.handle_hotkey(action),
                Some(intent) = intent_rx.recv() => self.handle_intent(intent),
                Some(event) = link_event_rx.recv() => self.handle_link_event(event),
            }
        }

        self.finalize();
    }

    /// Returns true on a shutdown request.
    fn handle_command(&mut self, command: Command) -> bool {
        debug!("Command: {command:?}");
        match command {
            Command::Enable => self.operator_enable(),
            Command::Disable => self.operator_disable("operator command"),
            Command::EStop => self.apply_estop("operator command"),
            Command::ClearEStop => {
                info!("EStop latch cleared");
                self.estopped = false;
                self.estop_latch.store(false, Ordering::SeqCst);
                lock_shared(&self.shared).control.estop = false;
            }
            Command::SetMode(mode) => {
                lock_shared(&self.shared).control.mode = mode;
            }
            Command::SetTeam(team) => {
                let team = team.min(9999);
                self.config.team_number = team;
                if let Some(link) = &self.link {
                    link.retarget(team, self.config.use_usb);
                }
            }
            Command::SetAlliance(alliance) => {
                lock_shared(&self.shared).alliance = alliance;
            }
            Command::SetGameData(data) => {
                let mut data = data;
                let mut cut = data.len().min(3);
                while !data.is_char_boundary(cut) {
                    cut -= 1;
                }
                data.truncate(cut);
                self.config.game_data = data.clone();
                if let Some(link) = &self.link {
                    link.send_stream_frame(stream::game_data_frame(&data));
                }
            }
            Command::SetUsbMode(usb) => {
                self.config.use_usb = usb;
                if let Some(link) = &self.link {
                    link.retarget(self.config.team_number, usb);
                }
            }
            Command::RebootController => {
                info!("Requesting controller reboot");
                lock_shared(&self.shared).request.reboot_controller = true;
            }
            Command::RestartUserCode => {
                info!("Requesting user-code restart");
                lock_shared(&self.shared).request.restart_user_code = true;
            }
            Command::StartPractice => {
                let tick = self.practice.start(std::time::Instant::now());
                self.apply_practice_intents(tick.set_mode, tick.set_enabled);
            }
            Command::StopPractice => {
                self.practice.stop();
                lock_shared(&self.shared).countdown = None;
                self.operator_disable("practice stopped");
            }
            Command::SetPracticeTiming(timing) => {
                self.config.practice_timing = timing;
                self.practice.set_timing(timing);
            }
            Command::ReorderJoysticks(order) => {
                lock_shared(&self.shared).slots.reorder(&order);
            }
            Command::LockJoystick { uuid, slot } => {
                lock_shared(&self.shared).slots.lock(&uuid, slot);
            }
            Command::UnlockJoystick(uuid) => {
                lock_shared(&self.shared).slots.unlock(&uuid);
            }
            Command::RescanJoysticks => {
                if let Some(input) = &self.input {
                    input.rescan();
                }
            }
            Command::Shutdown => return true,
        }
        false
    }

    fn handle_hotkey(&mut self, action: HotkeyAction) {
        match action {
            HotkeyAction::EStop => self.apply_estop("hotkey"),
            HotkeyAction::Disable => self.operator_disable("hotkey"),
            HotkeyAction::Enable => {
                // The chord only enables a robot that is ready for it.
                if self.estopped {
                    warn!("Enable chord ignored: estopped");
                } else if self.link_state != LinkState::CodeRunning {
                    warn!("Enable chord ignored: no user code running");
                } else {
                    self.operator_enable();
                }
            }
            HotkeyAction::AStop => {
                if self.practice.a_stop() {
                    lock_shared(&self.shared).control.enabled = false;
                }
            }
            HotkeyAction::RescanJoysticks => {
                if let Some(input) = &self.input {
                    input.rescan();
                }
            }
        }
    }

    fn handle_intent(&mut self, intent: InputIntent) {
        match intent {
            InputIntent::SafetyDisable { slot } => {
                warn!("Disabling: active joystick in slot {slot} disconnected");
                self.operator_disable("joystick disconnect");
            }
        }
    }

    fn handle_link_event(&mut self, event: LinkEvent) {
        match event {
            LinkEvent::State(state) => {
                if state != self.link_state {
                    info!("Link state: {:?} -> {:?}", self.link_state, state);
                    self.link_state = state;
                }
            }
            LinkEvent::Inbound(report) => self.merge_inbound(report),
            LinkEvent::StreamConnected => self.replay_stream_state(),
            LinkEvent::Stream(message) => match message {
                TcpMessage::Stdout(text) => {
                    let _ = self.stdout_tx.send(text);
                }
                other => {
                    let _ = self.message_tx.send(other);
                }
            },
        }
    }

    fn merge_inbound(&mut self, report: InboundReport) {
        self.trip_time_ms = report.trip_time_ms;
        self.lost_packets = report.lost_packets;
        self.status = report.packet.status;
        self.voltage = report.packet.voltage.volts;
        self.trace = report.packet.trace;
        self.inbound_sequence = report.packet.sequence;

        for tag in report.packet.tags {
            match tag {
                TelemetryTag::CanMetrics(can) => self.telemetry.can = can,
                TelemetryTag::PdpCurrents(currents) => self.telemetry.pdp_currents = currents,
                TelemetryTag::CpuUsage(cores) => self.telemetry.cpu_usage = cores,
                TelemetryTag::RamUsage(ram) => self.telemetry.ram_usage = ram,
                TelemetryTag::DiskFree(disk) => self.telemetry.disk_free = disk,
                TelemetryTag::JoystickOutput(outputs) => self.joystick_outputs = outputs,
                TelemetryTag::Unknown { tag, .. } => {
                    debug!("Ignoring telemetry tag 0x{tag:02x}")
                }
            }
        }
    }

    /// On a fresh stream connection the controller has no game data or
    /// joystick descriptors yet; send the current picture.
    fn replay_stream_state(&self) {
        let Some(link) = &self.link else { return };
        if !self.config.game_data.is_empty() {
            link.send_stream_frame(stream::game_data_frame(&self.config.game_data));
        }
        for slot in lock_shared(&self.shared).slots.snapshot() {
            link.send_stream_frame(stream::joystick_descriptor_frame(
                slot.slot,
                &slot.name,
                slot.axis_count,
                slot.button_count,
                slot.hat_count,
            ));
        }
    }

    fn apply_estop_latch(&mut self) {
        if self.estop_latch.load(Ordering::SeqCst) && !self.estopped {
            self.apply_estop("hotkey latch");
        }
    }

    fn apply_estop(&mut self, source: &str) {
        if !self.estopped {
            error!("EMERGENCY STOP ({source})");
        }
        self.estopped = true;
        let mut shared = lock_shared(&self.shared);
        shared.control.estop = true;
        shared.control.enabled = false;
    }

    fn operator_enable(&mut self) {
        if self.estopped {
            warn!("Enable ignored: estopped");
            return;
        }
        info!("Robot enabled");
        lock_shared(&self.shared).control.enabled = true;
    }

    fn operator_disable(&mut self, source: &str) {
        info!("Robot disabled ({source})");
        self.last_operator_disable = Some(Instant::now());
        lock_shared(&self.shared).control.enabled = false;
    }

    fn tick_practice(&mut self) {
        if self.practice.phase() == PracticePhase::Idle {
            self.practice_view = (PracticePhase::Idle, 0.0, 0.0);
            return;
        }

        let tick = self.practice.tick(std::time::Instant::now());
        self.practice_view = (
            tick.phase,
            tick.elapsed.as_secs_f64(),
            tick.remaining.as_secs_f64(),
        );
        self.apply_practice_intents(tick.set_mode, tick.set_enabled);

        let mut shared = lock_shared(&self.shared);
        shared.countdown = if self.practice.is_running() {
            Some(tick.remaining.as_secs_f32())
        } else {
            None
        };
    }

    fn apply_practice_intents(&mut self, set_mode: Option<Mode>, set_enabled: Option<bool>) {
        if let Some(mode) = set_mode {
            lock_shared(&self.shared).control.mode = mode;
        }
        match set_enabled {
            Some(true) => {
                // EStop beats everything; a fresh operator disable beats a
                // practice enable landing in the same quantum.
                let operator_disable_pending = self
                    .last_operator_disable
                    .is_some_and(|at| at.elapsed() < QUANTUM);
                if self.estopped {
                    warn!("Practice enable suppressed: estopped");
                } else if operator_disable_pending {
                    warn!("Practice enable suppressed: operator disable wins");
                } else {
                    lock_shared(&self.shared).control.enabled = true;
                }
            }
            Some(false) => {
                lock_shared(&self.shared).control.enabled = false;
            }
            None => {}
        }
    }

    fn publish_snapshot(&mut self) {
        let (control, alliance, joysticks, any_joystick, publication) = {
            let mut shared = lock_shared(&self.shared);
            shared.publication += 1;
            (
                shared.control,
                shared.alliance,
                shared.slots.snapshot(),
                shared.slots.any_connected(),
                shared.publication,
            )
        };

        let (practice_phase, practice_elapsed_secs, practice_remaining_secs) = self.practice_view;

        let state = RobotState {
            publication,
            link: self.link_state,
            connected: self.link_state.is_connected(),
            code_running: self.link_state == LinkState::CodeRunning,
            trip_time_ms: self.trip_time_ms,
            lost_packets: self.lost_packets,
            sequence: self.inbound_sequence,
            estopped: self.estopped,
            enabled: control.enabled,
            mode: control.mode,
            status: self.status,
            voltage: self.voltage,
            trace: self.trace,
            telemetry: self.telemetry.clone(),
            joystick_outputs: self.joystick_outputs,
            joysticks,
            any_joystick_connected: any_joystick,
            practice_phase,
            practice_elapsed_secs,
            practice_remaining_secs,
            team_number: self.config.team_number,
            alliance,
        };
        let _ = self.state_tx.send(state);
    }

    fn finalize(&mut self) {
        info!("Coordinator shutting down");
        // The send loop emits one final disabled datagram on this signal.
        let _ = self.shutdown_tx.send(true);

        let locks = lock_shared(&self.shared).slots.locks().clone();
        self.config.joystick_locks = locks;
        if self.persist_config {
            if let Err(e) = self.config.save() {
                warn!("Failed to flush configuration: {e}");
            }
        }
    }
}

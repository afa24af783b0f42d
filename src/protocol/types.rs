//! Value types shared across the control, telemetry, and stream channels.
//!
//! Everything here is a plain value with byte-exact encode/decode rules.
//! Encoding never fails; decoding returns `None` (or falls back to a safe
//! default where the wire field is advisory) on out-of-range input.

use serde::Serialize;
use std::fmt;

/// Robot operating mode, a 2-bit field in both control and status bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum Mode {
    #[default]
    Teleop,
    Test,
    Autonomous,
}

impl Mode {
    pub fn to_bits(self) -> u8 {
        match self {
            Mode::Teleop => 0b00,
            Mode::Test => 0b01,
            Mode::Autonomous => 0b10,
        }
    }

    pub fn from_bits(bits: u8) -> Option<Mode> {
        match bits & 0b11 {
            0b00 => Some(Mode::Teleop),
            0b01 => Some(Mode::Test),
            0b10 => Some(Mode::Autonomous),
            _ => None,
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mode::Teleop => write!(f, "Teleoperated"),
            Mode::Test => write!(f, "Test"),
            Mode::Autonomous => write!(f, "Autonomous"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AllianceColor {
    Red,
    Blue,
}

/// Alliance color plus driver station position (1-3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Alliance {
    pub color: AllianceColor,
    pub station: u8,
}

impl Alliance {
    /// Station must be in 1..=3; out-of-range input is clamped.
    pub fn new(color: AllianceColor, station: u8) -> Self {
        Alliance {
            color,
            station: station.clamp(1, 3),
        }
    }

    pub fn to_byte(self) -> u8 {
        let base = match self.color {
            AllianceColor::Red => 0,
            AllianceColor::Blue => 3,
        };
        base + (self.station - 1)
    }

    pub fn from_byte(byte: u8) -> Option<Alliance> {
        let color = match byte {
            0..=2 => AllianceColor::Red,
            3..=5 => AllianceColor::Blue,
            _ => return None,
        };
        Some(Alliance::new(color, byte % 3 + 1))
    }
}

impl Default for Alliance {
    fn default() -> Self {
        Alliance::new(AllianceColor::Red, 1)
    }
}

/// Operator-driven control bits transmitted in every outbound datagram.
///
/// Bit 7 estop, bit 3 fms, bit 2 enabled, bits 1-0 mode. The estop latch
/// itself lives in the coordinator; this type only carries the bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct ControlFlags {
    pub estop: bool,
    pub fms_connected: bool,
    pub enabled: bool,
    pub mode: Mode,
}

impl ControlFlags {
    pub fn to_byte(self) -> u8 {
        let mut byte = self.mode.to_bits();
        if self.estop {
            byte |= 1 << 7;
        }
        if self.fms_connected {
            byte |= 1 << 3;
        }
        if self.enabled {
            byte |= 1 << 2;
        }
        byte
    }

    pub fn from_byte(byte: u8) -> ControlFlags {
        ControlFlags {
            estop: byte & (1 << 7) != 0,
            fms_connected: byte & (1 << 3) != 0,
            enabled: byte & (1 << 2) != 0,
            mode: Mode::from_bits(byte).unwrap_or(Mode::Teleop),
        }
    }
}

/// One-shot requests: latched for a single emission, then cleared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RequestFlags {
    pub reboot_controller: bool,
    pub restart_user_code: bool,
}

impl RequestFlags {
    pub fn to_byte(self) -> u8 {
        let mut byte = 0u8;
        if self.reboot_controller {
            byte |= 1 << 3;
        }
        if self.restart_user_code {
            byte |= 1 << 2;
        }
        byte
    }

    pub fn is_empty(self) -> bool {
        !self.reboot_controller && !self.restart_user_code
    }
}

/// Robot-reported status bits from inbound telemetry datagrams.
///
/// Bit 7 estop, bit 4 code-initializing, bit 3 brownout, bit 2 enabled,
/// bits 1-0 mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StatusFlags {
    pub estop: bool,
    pub code_initializing: bool,
    pub brownout: bool,
    pub enabled: bool,
    pub mode: Mode,
}

impl StatusFlags {
    pub fn from_byte(byte: u8) -> StatusFlags {
        StatusFlags {
            estop: byte & (1 << 7) != 0,
            code_initializing: byte & (1 << 4) != 0,
            brownout: byte & (1 << 3) != 0,
            enabled: byte & (1 << 2) != 0,
            mode: Mode::from_bits(byte).unwrap_or(Mode::Teleop),
        }
    }
}

impl Default for StatusFlags {
    fn default() -> Self {
        StatusFlags {
            estop: false,
            code_initializing: false,
            brownout: false,
            enabled: false,
            mode: Mode::Teleop,
        }
    }
}

/// Battery voltage transported as integer volts plus fractional 256ths.
///
/// `from_bytes(to_bytes(v))` is within 1/256 of `v`.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct BatteryVoltage {
    pub volts: f32,
}

impl BatteryVoltage {
    pub fn from_bytes(high: u8, low: u8) -> BatteryVoltage {
        BatteryVoltage {
            volts: high as f32 + low as f32 / 256.0,
        }
    }

    pub fn to_bytes(self) -> (u8, u8) {
        let high = self.volts.floor() as u8;
        let frac = (self.volts - high as f32) * 256.0;
        (high, frac.round().min(255.0) as u8)
    }
}

/// One joystick's wire payload: up to 12 axes, 32 buttons, 2 hats.
///
/// Axes are -128..127. A hat is degrees clockwise from north, -1 released.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct JoystickData {
    pub axes: Vec<i8>,
    pub buttons: Vec<bool>,
    pub hats: Vec<i16>,
}

impl JoystickData {
    pub const MAX_AXES: usize = 12;
    pub const MAX_BUTTONS: usize = 32;
    pub const MAX_HATS: usize = 2;

    /// True if any axis, button, or hat is away from rest.
    pub fn is_active(&self) -> bool {
        self.axes.iter().any(|&a| a != 0)
            || self.buttons.iter().any(|&b| b)
            || self.hats.iter().any(|&h| h != -1)
    }
}

/// Joystick outputs reported back by user code (tag 0x01).
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct JoystickOutputs {
    pub outputs: u32,
    pub left_rumble: u16,
    pub right_rumble: u16,
}

/// CAN bus health metrics (tag 0x0E).
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct CanMetrics {
    pub utilization: f32,
    pub bus_off_count: u32,
    pub tx_full_count: u32,
    pub rx_error_count: u8,
    pub tx_error_count: u8,
}

/// Aggregated robot telemetry, merged across inbound tagged sections.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TelemetryData {
    pub can: CanMetrics,
    /// Per-channel PDP current in amps, 16 channels.
    pub pdp_currents: Vec<f32>,
    /// Per-core CPU utilization in percent.
    pub cpu_usage: Vec<f32>,
    /// RAM bytes in use.
    pub ram_usage: u32,
    /// Disk bytes free.
    pub disk_free: u32,
}

/// Messages arriving on the stream channel.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum TcpMessage {
    Stdout(String),
    Message(String),
    ErrorReport {
        timestamp: f64,
        sequence: u16,
        error_code: i32,
        is_error: bool,
        details: String,
        location: String,
        call_stack: String,
    },
    VersionInfo {
        device_type: u8,
        device_id: u8,
        name: String,
        version: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_bits_round_trip() {
        assert_eq!(Mode::Teleop.to_bits(), 0b00);
        assert_eq!(Mode::Test.to_bits(), 0b01);
        assert_eq!(Mode::Autonomous.to_bits(), 0b10);
        for mode in [Mode::Teleop, Mode::Test, Mode::Autonomous] {
            assert_eq!(Mode::from_bits(mode.to_bits()), Some(mode));
        }
        assert_eq!(Mode::from_bits(0b11), None);
    }

    #[test]
    fn alliance_encoding() {
        let table = [
            (AllianceColor::Red, 1, 0u8),
            (AllianceColor::Red, 2, 1),
            (AllianceColor::Red, 3, 2),
            (AllianceColor::Blue, 1, 3),
            (AllianceColor::Blue, 2, 4),
            (AllianceColor::Blue, 3, 5),
        ];
        for (color, station, byte) in table {
            let alliance = Alliance::new(color, station);
            assert_eq!(alliance.to_byte(), byte);
            assert_eq!(Alliance::from_byte(byte), Some(alliance));
        }
    }

    #[test]
    fn alliance_rejects_out_of_range_bytes() {
        assert_eq!(Alliance::from_byte(6), None);
        assert_eq!(Alliance::from_byte(255), None);
    }

    #[test]
    fn control_flags_round_trip() {
        let flags = ControlFlags {
            estop: true,
            fms_connected: false,
            enabled: true,
            mode: Mode::Autonomous,
        };
        let byte = flags.to_byte();
        assert_eq!(byte, 0b1000_0110);
        assert_eq!(ControlFlags::from_byte(byte), flags);
    }

    #[test]
    fn request_flags_encoding() {
        let flags = RequestFlags {
            reboot_controller: true,
            restart_user_code: true,
        };
        assert_eq!(flags.to_byte(), 0b0000_1100);
        assert!(RequestFlags::default().is_empty());
        assert!(!flags.is_empty());
    }

    #[test]
    fn status_flags_decode() {
        let flags = StatusFlags::from_byte(0b1001_1110);
        assert!(flags.estop);
        assert!(flags.code_initializing);
        assert!(flags.brownout);
        assert!(flags.enabled);
        assert_eq!(flags.mode, Mode::Autonomous);

        let brownout_only = StatusFlags::from_byte(0b0000_1000);
        assert!(brownout_only.brownout);
        assert!(!brownout_only.estop);
        assert_eq!(brownout_only.mode, Mode::Teleop);
    }

    #[test]
    fn voltage_round_trips_within_tolerance() {
        for raw in 0..4096u32 {
            let volts = raw as f32 / 256.0;
            let (high, low) = BatteryVoltage { volts }.to_bytes();
            let decoded = BatteryVoltage::from_bytes(high, low);
            assert!(
                (decoded.volts - volts).abs() < 1.0 / 256.0,
                "voltage {volts} decoded to {}",
                decoded.volts
            );
        }
    }

    #[test]
    fn joystick_activity() {
        assert!(!JoystickData::default().is_active());
        let active = JoystickData {
            axes: vec![0, 3],
            buttons: vec![false],
            hats: vec![-1],
        };
        assert!(active.is_active());
        let resting = JoystickData {
            axes: vec![0, 0],
            buttons: vec![false, false],
            hats: vec![-1],
        };
        assert!(!resting.is_active());
        let hat_pressed = JoystickData {
            axes: vec![],
            buttons: vec![],
            hats: vec![90],
        };
        assert!(hat_pressed.is_active());
    }
}

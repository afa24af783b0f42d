//! On-wire codec for the three controller channels.
//!
//! 1. [`outgoing`] - DS -> controller control datagrams (port 1110)
//! 2. [`incoming`] - controller -> DS telemetry datagrams (port 1150)
//! 3. [`stream`] - bidirectional framed TCP messages (port 1740)
//!
//! The codec is pure: no sockets, no clocks (callers pass timestamps in),
//! no shared state. Malformed input produces a [`ProtocolError`] or a
//! skipped section, never a panic.

pub mod incoming;
pub mod outgoing;
pub mod stream;
pub mod types;

pub use incoming::{parse_status_packet, StatusPacket, TelemetryTag};
pub use outgoing::ControlPacket;
pub use stream::FrameReader;
pub use types::{
    Alliance, AllianceColor, BatteryVoltage, CanMetrics, ControlFlags, JoystickData,
    JoystickOutputs, Mode, RequestFlags, StatusFlags, TcpMessage, TelemetryData,
};

/// The only protocol revision this engine speaks.
pub const COMM_VERSION: u8 = 0x01;

/// Decode failures for datagrams and stream frames.
///
/// These are logged at debug level and the offending bytes dropped; they
/// never tear down a connection on their own.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("packet too short: expected at least {expected} bytes, got {actual}")]
    TooShort { expected: usize, actual: usize },

    #[error("unsupported comm version: 0x{0:02x}")]
    InvalidVersion(u8),
}

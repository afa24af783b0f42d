//! Connection layer: address resolution, socket lifecycle, the 50 Hz send
//! loop, the telemetry receive loop, and the framed stream channel.
//!
//! Liveness is gated purely by inbound timing: the send loop keeps emitting
//! in Disconnected to the last known address so recovery is immediate when
//! the peer reappears.

use serde::Serialize;
use std::net::IpAddr;
use std::time::Duration;

use crate::protocol::{StatusPacket, TcpMessage};

pub mod link;
pub mod resolve;

pub use link::LinkHandle;

#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    /// Startup bind failure. The engine refuses to start on this.
    #[error("failed to bind socket: {0}")]
    Bind(String),

    #[error("connection channel closed: {0}")]
    Channel(String),
}

/// Link state machine, gated by inbound datagram timing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum LinkState {
    Disconnected,
    Resolving,
    Connected,
    /// User code is up (`code_initializing` observed false). Report-only;
    /// control flows identically in `Connected`.
    CodeRunning,
}

impl LinkState {
    pub fn is_connected(self) -> bool {
        matches!(self, LinkState::Connected | LinkState::CodeRunning)
    }
}

/// Everything the connection layer reports up to the coordinator.
#[derive(Debug, Clone)]
pub enum LinkEvent {
    State(LinkState),
    Inbound(InboundReport),
    /// The stream channel (re)connected; the coordinator replays game data
    /// and joystick descriptors.
    StreamConnected,
    Stream(TcpMessage),
}

/// One parsed telemetry datagram plus the link metrics derived from it.
#[derive(Debug, Clone)]
pub struct InboundReport {
    pub packet: StatusPacket,
    /// EWMA round-trip time in milliseconds.
    pub trip_time_ms: f64,
    /// Total datagrams lost, counted by sequence gaps.
    pub lost_packets: u32,
}

/// Ports and timing knobs with the production defaults. Tests compress the
/// timeouts and point the target at loopback.
#[derive(Debug, Clone)]
pub struct LinkConfig {
    /// DS -> controller datagram port.
    pub control_port: u16,
    /// Controller -> DS datagram port, bound locally.
    pub telemetry_port: u16,
    /// Bidirectional stream port.
    pub stream_port: u16,
    /// Skip resolution entirely and talk to this host.
    pub target_override: Option<IpAddr>,
    pub send_period: Duration,
    pub recv_timeout: Duration,
    pub liveness_timeout: Duration,
    pub resolve_timeout: Duration,
    pub stream_connect_timeout: Duration,
    pub stream_read_timeout: Duration,
    pub backoff_initial: Duration,
    pub backoff_cap: Duration,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            control_port: 1110,
            telemetry_port: 1150,
            stream_port: 1740,
            target_override: None,
            send_period: Duration::from_millis(20),
            recv_timeout: Duration::from_millis(100),
            liveness_timeout: Duration::from_millis(1000),
            resolve_timeout: Duration::from_millis(2000),
            stream_connect_timeout: Duration::from_millis(5000),
            stream_read_timeout: Duration::from_millis(30000),
            backoff_initial: Duration::from_millis(100),
            backoff_cap: Duration::from_millis(2000),
        }
    }
}

//! The coordinator subsystem.
//!
//! [`coordinator`] owns the authoritative control state and every other
//! subsystem; [`state`] holds the shared control block and the published
//! [`state::RobotState`] snapshot.
//!
//! # Architecture
//!
//! ```text
//! Hotkeys ──┐                       ┌──► watch<RobotState>
//! Input ────┼──► Coordinator ───────┼──► broadcast<String>    (stdout)
//! Practice ─┤    (20 ms quantum)    └──► broadcast<TcpMessage>
//! Link ─────┘         │
//!                     └── shared ControlShared ──► send loop
//! ```

pub mod coordinator;
pub mod state;

pub use coordinator::{Command, Station, StationError, StationEvents, StationHandle, StationOptions};
pub use state::RobotState;

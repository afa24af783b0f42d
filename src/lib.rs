//! Open Station: a cross-platform driver station engine for FRC-style
//! robot controllers.
//!
//! The engine drives a bidirectional control channel at a fixed 50 Hz
//! cadence, aggregates gamepad input into six ordered slots, sequences
//! practice matches, captures global safety hotkeys, and publishes a
//! single coalescing robot-state snapshot to external consumers. The UI
//! shell is a separate collaborator speaking the [`station::Command`] /
//! [`station::StationEvents`] surface.

pub mod config;
pub mod connection;
pub mod hotkeys;
pub mod input;
pub mod practice;
pub mod protocol;
pub mod station;

//! Vendor input -> wire layout mapping.
//!
//! Axis positions 0-5 are fixed (left-X, left-Y, left-trigger, right-trigger,
//! right-X, right-Y); unmapped axes extend the list in enumeration order.
//! Button positions 0-9 are fixed (south through right-stick); unmapped
//! buttons append. The four-direction pad collapses to a single hat angle in
//! degrees clockwise from north, -1 when released.

use gilrs::{Axis, Button, Gamepad};

/// Fixed axis table: wire position for a vendor axis.
pub fn map_axis(axis: Axis) -> Option<usize> {
    match axis {
        Axis::LeftStickX => Some(0),
        Axis::LeftStickY => Some(1),
        Axis::LeftZ => Some(2),
        Axis::RightZ => Some(3),
        Axis::RightStickX => Some(4),
        Axis::RightStickY => Some(5),
        _ => None,
    }
}

/// Fixed button table: wire position for a vendor button.
pub fn map_button(button: Button) -> Option<usize> {
    match button {
        Button::South => Some(0),
        Button::East => Some(1),
        Button::North => Some(2),
        Button::West => Some(3),
        Button::LeftTrigger => Some(4),
        Button::RightTrigger => Some(5),
        Button::Select => Some(6),
        Button::Start => Some(7),
        Button::LeftThumb => Some(8),
        Button::RightThumb => Some(9),
        _ => None,
    }
}

/// The axes with fixed wire positions. Readers place each value at
/// [`map_axis`]'s position, so this list and the table cannot drift apart.
pub const MAPPED_AXES: [Axis; 6] = [
    Axis::LeftStickX,
    Axis::LeftStickY,
    Axis::LeftZ,
    Axis::RightZ,
    Axis::RightStickX,
    Axis::RightStickY,
];

/// The buttons with fixed wire positions; placed via [`map_button`].
pub const MAPPED_BUTTONS: [Button; 10] = [
    Button::South,
    Button::East,
    Button::North,
    Button::West,
    Button::LeftTrigger,
    Button::RightTrigger,
    Button::Select,
    Button::Start,
    Button::LeftThumb,
    Button::RightThumb,
];

/// Scale a normalized -1.0..1.0 amplitude to the wire's -128..127,
/// saturating so -1.0 lands exactly on -128.
pub fn scale_axis(value: f32) -> i8 {
    (value * 128.0).clamp(-128.0, 127.0) as i8
}

/// Collapse the four pad directions to a hat angle.
pub fn pad_to_hat(up: bool, right: bool, down: bool, left: bool) -> i16 {
    match (up, right, down, left) {
        (true, false, false, false) => 0,
        (true, true, false, false) => 45,
        (false, true, false, false) => 90,
        (false, true, true, false) => 135,
        (false, false, true, false) => 180,
        (false, false, true, true) => 225,
        (false, false, false, true) => 270,
        (true, false, false, true) => 315,
        _ => -1,
    }
}

/// Read the hat angle for a live gamepad.
pub fn read_hat(gamepad: &Gamepad) -> i16 {
    pad_to_hat(
        gamepad.is_pressed(Button::DPadUp),
        gamepad.is_pressed(Button::DPadRight),
        gamepad.is_pressed(Button::DPadDown),
        gamepad.is_pressed(Button::DPadLeft),
    )
}

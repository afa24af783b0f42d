//! Encoder for the DS -> controller control datagram.
//!
//! Layout: `[seq_hi][seq_lo][0x01][control][request][alliance]` followed by
//! zero or more tagged sections, each `[length][tag][payload]` where the
//! length byte counts the tag byte plus the payload.

use chrono::{DateTime, Datelike, Timelike, Utc};

use super::types::{Alliance, ControlFlags, JoystickData, RequestFlags};
use super::COMM_VERSION;

pub const TAG_COUNTDOWN: u8 = 0x07;
pub const TAG_JOYSTICK: u8 = 0x0C;
pub const TAG_DATETIME: u8 = 0x0F;
pub const TAG_TIMEZONE: u8 = 0x10;

/// One outbound control datagram, ready to encode.
///
/// The sequence counter and one-shot clearing live in the send loop; this
/// type is a pure value so the encoder can be exercised byte-for-byte.
#[derive(Debug, Clone, Default)]
pub struct ControlPacket {
    pub sequence: u16,
    pub control: ControlFlags,
    pub request: RequestFlags,
    pub alliance: Alliance,
    /// One entry per slot, in slot order. Disconnected slots carry empty data.
    pub joysticks: Vec<JoystickData>,
    /// Practice countdown in seconds, emitted as tag 0x07 while running.
    pub countdown: Option<f32>,
    /// When set, the datagram carries the date/time and timezone tags.
    pub timestamp: Option<DateTime<Utc>>,
    pub timezone: Option<String>,
}

impl ControlPacket {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(64);

        buf.extend_from_slice(&self.sequence.to_be_bytes());
        buf.push(COMM_VERSION);
        buf.push(self.control.to_byte());
        buf.push(self.request.to_byte());
        buf.push(self.alliance.to_byte());

        for joystick in self.joysticks.iter().take(6) {
            append_joystick_tag(&mut buf, joystick);
        }

        if let Some(stamp) = self.timestamp {
            append_datetime_tag(&mut buf, stamp);
            if let Some(tz) = &self.timezone {
                append_timezone_tag(&mut buf, tz);
            }
        }

        if let Some(remaining) = self.countdown {
            append_countdown_tag(&mut buf, remaining);
        }

        buf
    }
}

/// Joystick tag: `[axis_count][axes][button_count][packed bits][hat_count][hats]`.
///
/// Button bits pack LSB-first into `ceil(count / 8)` bytes. Hats are i16
/// big-endian degrees.
fn append_joystick_tag(buf: &mut Vec<u8>, joystick: &JoystickData) {
    let axes = &joystick.axes[..joystick.axes.len().min(JoystickData::MAX_AXES)];
    let buttons = &joystick.buttons[..joystick.buttons.len().min(JoystickData::MAX_BUTTONS)];
    let hats = &joystick.hats[..joystick.hats.len().min(JoystickData::MAX_HATS)];

    let button_bytes = buttons.len().div_ceil(8);
    let size = 1 + 1 + axes.len() + 1 + button_bytes + 1 + hats.len() * 2;

    buf.push(size as u8);
    buf.push(TAG_JOYSTICK);

    buf.push(axes.len() as u8);
    for &axis in axes {
        buf.push(axis as u8);
    }

    buf.push(buttons.len() as u8);
    for chunk in buttons.chunks(8) {
        let mut byte = 0u8;
        for (bit, &pressed) in chunk.iter().enumerate() {
            if pressed {
                byte |= 1 << bit;
            }
        }
        buf.push(byte);
    }

    buf.push(hats.len() as u8);
    for &hat in hats {
        buf.extend_from_slice(&hat.to_be_bytes());
    }
}

/// Date/time tag: microseconds u32 BE, then second, minute, hour,
/// day (1-31), month (0-11), year - 1900.
fn append_datetime_tag(buf: &mut Vec<u8>, stamp: DateTime<Utc>) {
    buf.push(11);
    buf.push(TAG_DATETIME);

    let micros = stamp.nanosecond() / 1000;
    buf.extend_from_slice(&micros.to_be_bytes());
    buf.push(stamp.second() as u8);
    buf.push(stamp.minute() as u8);
    buf.push(stamp.hour() as u8);
    buf.push(stamp.day() as u8);
    buf.push(stamp.month0() as u8);
    buf.push((stamp.year() - 1900) as u8);
}

fn append_timezone_tag(buf: &mut Vec<u8>, tz: &str) {
    buf.push((1 + tz.len()) as u8);
    buf.push(TAG_TIMEZONE);
    buf.extend_from_slice(tz.as_bytes());
}

/// Countdown tag: remaining seconds as f32 big-endian.
fn append_countdown_tag(buf: &mut Vec<u8>, remaining: f32) {
    buf.push(5);
    buf.push(TAG_COUNTDOWN);
    buf.extend_from_slice(&remaining.to_be_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::types::AllianceColor;
    use chrono::TimeZone;

    #[test]
    fn header_layout() {
        let packet = ControlPacket {
            sequence: 0x1234,
            alliance: Alliance::new(AllianceColor::Red, 1),
            ..Default::default()
        };
        let bytes = packet.encode();
        assert_eq!(bytes.len(), 6);
        assert_eq!(bytes[0], 0x12);
        assert_eq!(bytes[1], 0x34);
        assert_eq!(bytes[2], 0x01);
        assert_eq!(bytes[3], 0x00);
        assert_eq!(bytes[4], 0x00);
        assert_eq!(bytes[5], 0x00);
    }

    #[test]
    fn joystick_tag_layout() {
        let packet = ControlPacket {
            joysticks: vec![JoystickData {
                axes: vec![0, 127, -128, 64, -64, 0],
                buttons: vec![
                    true, false, true, false, false, false, false, false, true, false, false, true,
                ],
                hats: vec![90],
            }],
            ..Default::default()
        };
        let bytes = packet.encode();
        let tag = &bytes[6..];
        assert_eq!(tag[1], TAG_JOYSTICK);
        assert_eq!(tag[2], 6);
        assert_eq!(tag[3], 0);
        assert_eq!(tag[4], 127i8 as u8);
        assert_eq!(tag[5], (-128i8) as u8);
        assert_eq!(tag[9], 12);
        // bits 0,2 in the first byte; bits 0,3 in the second
        assert_eq!(tag[10], 0b0000_0101);
        assert_eq!(tag[11], 0b0000_1001);
        assert_eq!(tag[12], 1);
        assert_eq!(tag[13], 0x00);
        assert_eq!(tag[14], 0x5A);
        // length byte covers the tag byte and the payload
        assert_eq!(tag[0] as usize, tag.len() - 1);
    }

    #[test]
    fn empty_joystick_tag() {
        let packet = ControlPacket {
            joysticks: vec![JoystickData::default()],
            ..Default::default()
        };
        let bytes = packet.encode();
        assert_eq!(bytes.len(), 6 + 5);
        assert_eq!(bytes[6], 4);
        assert_eq!(bytes[7], TAG_JOYSTICK);
    }

    #[test]
    fn button_packing_lsb_first() {
        let packet = ControlPacket {
            joysticks: vec![JoystickData {
                axes: vec![],
                buttons: vec![true, false, true],
                hats: vec![],
            }],
            ..Default::default()
        };
        let bytes = packet.encode();
        assert_eq!(bytes[8], 0); // axis count
        assert_eq!(bytes[9], 3); // button count
        assert_eq!(bytes[10], 0b0000_0101);
    }

    #[test]
    fn at_most_six_joystick_tags() {
        let packet = ControlPacket {
            joysticks: vec![JoystickData::default(); 8],
            ..Default::default()
        };
        let bytes = packet.encode();
        let tags = bytes[6..].chunks(5).count();
        assert_eq!(tags, 6);
    }

    #[test]
    fn datetime_tag_fields() {
        let stamp = Utc.with_ymd_and_hms(2024, 3, 9, 14, 30, 45).unwrap();
        let packet = ControlPacket {
            timestamp: Some(stamp),
            timezone: Some("UTC".to_string()),
            ..Default::default()
        };
        let bytes = packet.encode();
        let tag = &bytes[6..];
        assert_eq!(tag[0], 11);
        assert_eq!(tag[1], TAG_DATETIME);
        assert_eq!(&tag[2..6], &[0, 0, 0, 0]); // whole-second stamp
        assert_eq!(tag[6], 45);
        assert_eq!(tag[7], 30);
        assert_eq!(tag[8], 14);
        assert_eq!(tag[9], 9);
        assert_eq!(tag[10], 2); // March, zero-based
        assert_eq!(tag[11], (2024 - 1900) as u8);

        let tz = &tag[12..];
        assert_eq!(tz[0], 4);
        assert_eq!(tz[1], TAG_TIMEZONE);
        assert_eq!(&tz[2..], b"UTC");
    }

    #[test]
    fn countdown_tag() {
        let packet = ControlPacket {
            countdown: Some(12.5),
            ..Default::default()
        };
        let bytes = packet.encode();
        let tag = &bytes[6..];
        assert_eq!(tag[0], 5);
        assert_eq!(tag[1], TAG_COUNTDOWN);
        assert_eq!(f32::from_be_bytes([tag[2], tag[3], tag[4], tag[5]]), 12.5);
    }
}

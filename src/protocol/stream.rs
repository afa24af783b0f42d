//! Codec for the bidirectional TCP stream channel.
//!
//! Frames are `[size: u16 BE][tag][payload]` where size counts the tag byte
//! plus the payload. [`FrameReader`] accumulates partial reads into complete
//! frames so the transport can hand it arbitrarily sliced byte chunks.

use super::types::TcpMessage;

pub const TAG_MESSAGE: u8 = 0x00;
pub const TAG_JOYSTICK_DESCRIPTOR: u8 = 0x02;
pub const TAG_MATCH_INFO: u8 = 0x07;
pub const TAG_VERSION_INFO: u8 = 0x0A;
pub const TAG_ERROR_REPORT: u8 = 0x0B;
pub const TAG_STDOUT: u8 = 0x0C;
pub const TAG_GAME_DATA: u8 = 0x0E;

/// Accumulates stream bytes and yields complete `(tag, payload)` frames.
#[derive(Debug, Default)]
pub struct FrameReader {
    buffer: Vec<u8>,
}

impl FrameReader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Extract the next complete frame, or `None` until enough bytes arrive.
    pub fn next_frame(&mut self) -> Option<(u8, Vec<u8>)> {
        if self.buffer.len() < 3 {
            return None;
        }

        let size = u16::from_be_bytes([self.buffer[0], self.buffer[1]]) as usize;
        if size == 0 {
            // Empty frame, drop the size bytes and keep scanning.
            self.buffer.drain(0..2);
            return self.next_frame();
        }
        if self.buffer.len() < 2 + size {
            return None;
        }

        let tag = self.buffer[2];
        let payload = self.buffer[3..2 + size].to_vec();
        self.buffer.drain(0..2 + size);
        Some((tag, payload))
    }
}

/// Parse an inbound frame into a [`TcpMessage`]. Unknown tags and malformed
/// payloads yield `None`; the stream itself stays healthy.
pub fn parse_stream_message(tag: u8, payload: &[u8]) -> Option<TcpMessage> {
    match tag {
        TAG_MESSAGE => Some(TcpMessage::Message(
            String::from_utf8(payload.to_vec()).ok()?,
        )),
        TAG_STDOUT => Some(TcpMessage::Stdout(
            String::from_utf8(payload.to_vec()).ok()?,
        )),
        TAG_VERSION_INFO => parse_version_info(payload),
        TAG_ERROR_REPORT => parse_error_report(payload),
        _ => None,
    }
}

/// Version info: `[device_type][device_id][name_len][name][ver_len][version]`.
fn parse_version_info(payload: &[u8]) -> Option<TcpMessage> {
    let device_type = *payload.first()?;
    let device_id = *payload.get(1)?;

    let name_len = *payload.get(2)? as usize;
    let name = payload.get(3..3 + name_len)?;

    let version_len = *payload.get(3 + name_len)? as usize;
    let version = payload.get(4 + name_len..4 + name_len + version_len)?;

    Some(TcpMessage::VersionInfo {
        device_type,
        device_id,
        name: String::from_utf8(name.to_vec()).ok()?,
        version: String::from_utf8(version.to_vec()).ok()?,
    })
}

/// Error report: f64 timestamp, u16 sequence, i32 code, u16 flags
/// (bit 0 = error, else warning), then three u16-length-prefixed strings.
fn parse_error_report(payload: &[u8]) -> Option<TcpMessage> {
    let timestamp = f64::from_be_bytes(payload.get(0..8)?.try_into().ok()?);
    let sequence = u16::from_be_bytes(payload.get(8..10)?.try_into().ok()?);
    let error_code = i32::from_be_bytes(payload.get(10..14)?.try_into().ok()?);
    let flags = u16::from_be_bytes(payload.get(14..16)?.try_into().ok()?);

    let mut offset = 16;
    let mut next_string = || -> Option<String> {
        let len = u16::from_be_bytes(payload.get(offset..offset + 2)?.try_into().ok()?) as usize;
        let text = payload.get(offset + 2..offset + 2 + len)?;
        offset += 2 + len;
        String::from_utf8(text.to_vec()).ok()
    };

    let details = next_string()?;
    let location = next_string()?;
    let call_stack = next_string()?;

    Some(TcpMessage::ErrorReport {
        timestamp,
        sequence,
        error_code,
        is_error: flags & 1 != 0,
        details,
        location,
        call_stack,
    })
}

/// Frame a tag + payload for transmission.
pub fn encode_frame(tag: u8, payload: &[u8]) -> Vec<u8> {
    let size = (1 + payload.len()) as u16;
    let mut frame = Vec::with_capacity(2 + size as usize);
    frame.extend_from_slice(&size.to_be_bytes());
    frame.push(tag);
    frame.extend_from_slice(payload);
    frame
}

pub fn game_data_frame(data: &str) -> Vec<u8> {
    encode_frame(TAG_GAME_DATA, data.as_bytes())
}

pub fn match_info_frame(name: &str, match_type: u8) -> Vec<u8> {
    let mut payload = Vec::with_capacity(2 + name.len());
    payload.push(name.len() as u8);
    payload.extend_from_slice(name.as_bytes());
    payload.push(match_type);
    encode_frame(TAG_MATCH_INFO, &payload)
}

/// Describe one occupied slot to the controller.
pub fn joystick_descriptor_frame(
    slot: u8,
    name: &str,
    axis_count: u8,
    button_count: u8,
    hat_count: u8,
) -> Vec<u8> {
    let mut payload = Vec::with_capacity(7 + name.len());
    payload.push(slot);
    payload.push(0); // is_xbox
    payload.push(0); // device type
    payload.push(name.len() as u8);
    payload.extend_from_slice(name.as_bytes());
    payload.push(axis_count);
    payload.push(button_count);
    payload.push(hat_count);
    encode_frame(TAG_JOYSTICK_DESCRIPTOR, &payload)
}

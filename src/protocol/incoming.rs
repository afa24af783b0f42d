//! Decoder for the controller -> DS telemetry datagram.
//!
//! Layout: `[seq_hi][seq_lo][0x01][status][trace][volt_hi][volt_lo][req_date]`
//! followed by tagged telemetry sections. Unknown tags are skipped by length;
//! trailing garbage never fails the whole datagram.

use super::types::{
    BatteryVoltage, CanMetrics, JoystickOutputs, StatusFlags,
};
use super::{ProtocolError, COMM_VERSION};

pub const TAG_JOYSTICK_OUTPUT: u8 = 0x01;
pub const TAG_DISK_FREE: u8 = 0x04;
pub const TAG_CPU_USAGE: u8 = 0x05;
pub const TAG_RAM_USAGE: u8 = 0x06;
pub const TAG_PDP_CURRENTS: u8 = 0x08;
pub const TAG_CAN_METRICS: u8 = 0x0E;

/// Amps per LSB of a packed 10-bit PDP channel.
const PDP_AMPS_PER_COUNT: f32 = 0.125;

/// A parsed inbound telemetry datagram.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusPacket {
    pub sequence: u16,
    pub status: StatusFlags,
    pub trace: u8,
    pub voltage: BatteryVoltage,
    /// Controller asks the DS to send the date/time tag on the next outbound.
    pub request_date: bool,
    pub tags: Vec<TelemetryTag>,
}

/// One tagged telemetry section.
#[derive(Debug, Clone, PartialEq)]
pub enum TelemetryTag {
    JoystickOutput(JoystickOutputs),
    DiskFree(u32),
    CpuUsage(Vec<f32>),
    RamUsage(u32),
    PdpCurrents(Vec<f32>),
    CanMetrics(CanMetrics),
    Unknown { tag: u8, payload: Vec<u8> },
}

/// Cursor over a byte slice; every read is bounds-checked.
struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Reader { data, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    fn u8(&mut self) -> Option<u8> {
        let byte = *self.data.get(self.pos)?;
        self.pos += 1;
        Some(byte)
    }

    fn u16(&mut self) -> Option<u16> {
        Some(u16::from_be_bytes([self.u8()?, self.u8()?]))
    }

    fn u32(&mut self) -> Option<u32> {
        Some(u32::from_be_bytes([
            self.u8()?,
            self.u8()?,
            self.u8()?,
            self.u8()?,
        ]))
    }

    fn f32(&mut self) -> Option<f32> {
        self.u32().map(f32::from_bits)
    }

    fn bytes(&mut self, len: usize) -> Option<&'a [u8]> {
        let slice = self.data.get(self.pos..self.pos + len)?;
        self.pos += len;
        Some(slice)
    }
}

pub fn parse_status_packet(data: &[u8]) -> Result<StatusPacket, ProtocolError> {
    if data.len() < 8 {
        return Err(ProtocolError::TooShort {
            expected: 8,
            actual: data.len(),
        });
    }

    let mut reader = Reader::new(data);
    let sequence = reader.u16().unwrap_or_default();

    let version = reader.u8().unwrap_or_default();
    if version != COMM_VERSION {
        return Err(ProtocolError::InvalidVersion(version));
    }

    let status = StatusFlags::from_byte(reader.u8().unwrap_or_default());
    let trace = reader.u8().unwrap_or_default();
    let volt_hi = reader.u8().unwrap_or_default();
    let volt_lo = reader.u8().unwrap_or_default();
    let request_date = reader.u8().unwrap_or_default() != 0;

    Ok(StatusPacket {
        sequence,
        status,
        trace,
        voltage: BatteryVoltage::from_bytes(volt_hi, volt_lo),
        request_date,
        tags: parse_tags(&mut reader),
    })
}

/// Walk the tagged sections after the 8-byte header. A truncated final
/// section ends the walk without failing the datagram.
fn parse_tags(reader: &mut Reader) -> Vec<TelemetryTag> {
    let mut tags = Vec::new();

    while reader.remaining() >= 2 {
        let size = reader.u8().unwrap_or_default() as usize;
        if size == 0 {
            continue;
        }
        let tag = match reader.u8() {
            Some(t) => t,
            None => break,
        };
        let payload = match reader.bytes(size - 1) {
            Some(p) => p,
            None => break,
        };
        tags.push(parse_tag(tag, payload));
    }

    tags
}

fn parse_tag(tag: u8, payload: &[u8]) -> TelemetryTag {
    let mut reader = Reader::new(payload);
    match tag {
        TAG_JOYSTICK_OUTPUT => {
            let outputs = reader.u32().unwrap_or_default();
            let left_rumble = reader.u16().unwrap_or_default();
            let right_rumble = reader.u16().unwrap_or_default();
            TelemetryTag::JoystickOutput(JoystickOutputs {
                outputs,
                left_rumble,
                right_rumble,
            })
        }
        TAG_DISK_FREE => TelemetryTag::DiskFree(reader.u32().unwrap_or_default()),
        TAG_RAM_USAGE => TelemetryTag::RamUsage(reader.u32().unwrap_or_default()),
        TAG_CPU_USAGE => TelemetryTag::CpuUsage(parse_cpu_usage(&mut reader)),
        TAG_PDP_CURRENTS => TelemetryTag::PdpCurrents(parse_pdp_currents(payload)),
        TAG_CAN_METRICS => {
            // Utilization f32 BE, then u32 bus-off and tx-full counters,
            // then the two one-byte error counts.
            let utilization = reader.f32().unwrap_or_default();
            let bus_off = reader.u32().unwrap_or_default();
            let tx_full = reader.u32().unwrap_or_default();
            let rx_error = reader.u8().unwrap_or_default();
            let tx_error = reader.u8().unwrap_or_default();
            TelemetryTag::CanMetrics(CanMetrics {
                utilization,
                bus_off_count: bus_off,
                tx_full_count: tx_full,
                rx_error_count: rx_error,
                tx_error_count: tx_error,
            })
        }
        other => TelemetryTag::Unknown {
            tag: other,
            payload: payload.to_vec(),
        },
    }
}

/// CPU usage: `[core_count]` then one fixed-point pair per core,
/// value = integer + fractional / 256.
fn parse_cpu_usage(reader: &mut Reader) -> Vec<f32> {
    let count = reader.u8().unwrap_or_default() as usize;
    let mut cores = Vec::with_capacity(count);
    for _ in 0..count {
        let (Some(int), Some(frac)) = (reader.u8(), reader.u8()) else {
            break;
        };
        cores.push(int as f32 + frac as f32 / 256.0);
    }
    cores
}

/// PDP currents: 21 bytes packing 16 channels of 10-bit values,
/// four channels per 5-byte group, 0.125 A per count.
fn parse_pdp_currents(payload: &[u8]) -> Vec<f32> {
    let mut currents = Vec::with_capacity(16);

    for group in payload.chunks_exact(5).take(4) {
        let a = (group[0] as u16) << 2 | (group[1] as u16) >> 6;
        let b = ((group[1] as u16) & 0x3F) << 4 | (group[2] as u16) >> 4;
        let c = ((group[2] as u16) & 0x0F) << 6 | (group[3] as u16) >> 2;
        let d = ((group[3] as u16) & 0x03) << 8 | group[4] as u16;

        for channel in [a, b, c, d] {
            currents.push(channel as f32 * PDP_AMPS_PER_COUNT);
        }
    }

    currents
}

//! Report payloads. Everything except the per-acknowledgement reply travels
//! inside a [`Frame`](crate::frame::Frame).

use bitflags::bitflags;
use byteorder::{ByteOrder, LittleEndian};

use super::DecodeError;
use crate::frame::{self, Frame, HEADER_LEN};

/// Latency reported for an interrupt the master had already acknowledged.
/// The master's statistics drop samples carrying this value.
pub const INVALID_TIME_SINCE_FALLING_EDGE: u32 = 0xFFFF_FFFF;

fn payload_of(bytes: &[u8], payload_len: usize) -> Result<&[u8], DecodeError> {
    frame::open(bytes)?;
    let expected = HEADER_LEN + payload_len;
    if bytes.len() != expected {
        return Err(DecodeError::Truncated {
            expected,
            actual: bytes.len(),
        });
    }
    Ok(&bytes[HEADER_LEN..])
}

/// Static capabilities, computed once at start-up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceInfo {
    pub device_id: u8,
    pub version: u8,
    pub min_data_bit_length: u8,
    pub max_data_bit_length: u8,
    /// Highest SPI clock the slave keeps up with, in Hz.
    pub max_frequency: u32,
    /// Rate of the counter behind every timing value, in Hz.
    pub clock_measurement_frequency: u32,
}

impl DeviceInfo {
    pub const PAYLOAD_LEN: usize = 12;
    pub const FRAME_LEN: usize = HEADER_LEN + Self::PAYLOAD_LEN;

    pub fn encode(&self) -> Frame {
        Frame::build(Self::PAYLOAD_LEN, |p| {
            p[0] = self.device_id;
            p[1] = self.version;
            p[2] = self.min_data_bit_length;
            p[3] = self.max_data_bit_length;
            LittleEndian::write_u32(&mut p[4..8], self.max_frequency);
            LittleEndian::write_u32(&mut p[8..12], self.clock_measurement_frequency);
        })
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let p = payload_of(bytes, Self::PAYLOAD_LEN)?;
        Ok(Self {
            device_id: p[0],
            version: p[1],
            min_data_bit_length: p[2],
            max_data_bit_length: p[3],
            max_frequency: LittleEndian::read_u32(&p[4..8]),
            clock_measurement_frequency: LittleEndian::read_u32(&p[8..12]),
        })
    }
}

/// Outcome of the active-clock measurement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum ClockMeasurementStatus {
    #[default]
    Success = 0,
    /// No falling edge was latched before the first word arrived; the time
    /// is measured from an approximated start.
    EdgeNotDetected = 1,
    /// The counter hit its limit; no time is reported.
    Overflow = 2,
}

impl TryFrom<u8> for ClockMeasurementStatus {
    type Error = DecodeError;

    fn try_from(raw: u8) -> Result<Self, Self::Error> {
        match raw {
            0 => Ok(ClockMeasurementStatus::Success),
            1 => Ok(ClockMeasurementStatus::EdgeNotDetected),
            2 => Ok(ClockMeasurementStatus::Overflow),
            other => Err(DecodeError::UnknownStatus(other)),
        }
    }
}

/// Result of the last CaptureNextTransfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TransferInfo {
    /// CRC-16 over every received word, low byte first.
    pub checksum: u16,
    pub clock_active_time_status: ClockMeasurementStatus,
    pub element_count: u32,
    /// Index of the first unexpected word; equal to `element_count` when
    /// every word matched.
    pub mismatch_index: u32,
    /// Counter ticks between the first and last SCK falling edge.
    pub clock_active_time: u32,
}

impl TransferInfo {
    pub const PAYLOAD_LEN: usize = 16;
    pub const FRAME_LEN: usize = HEADER_LEN + Self::PAYLOAD_LEN;

    pub fn mismatch(&self) -> Option<u32> {
        (self.mismatch_index != self.element_count).then_some(self.mismatch_index)
    }

    pub fn encode(&self) -> Frame {
        Frame::build(Self::PAYLOAD_LEN, |p| {
            LittleEndian::write_u16(&mut p[0..2], self.checksum);
            p[2] = self.clock_active_time_status as u8;
            LittleEndian::write_u32(&mut p[4..8], self.element_count);
            LittleEndian::write_u32(&mut p[8..12], self.mismatch_index);
            LittleEndian::write_u32(&mut p[12..16], self.clock_active_time);
        })
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let p = payload_of(bytes, Self::PAYLOAD_LEN)?;
        Ok(Self {
            checksum: LittleEndian::read_u16(&p[0..2]),
            clock_active_time_status: ClockMeasurementStatus::try_from(p[2])?,
            element_count: LittleEndian::read_u32(&p[4..8]),
            mismatch_index: LittleEndian::read_u32(&p[8..12]),
            clock_active_time: LittleEndian::read_u32(&p[12..16]),
        })
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct PeriodicInterruptStatus: u32 {
        const ARITHMETIC_OVERFLOW = 1 << 0;
        const NOT_ACKNOWLEDGED = 1 << 1;
        const INCOMPLETE_RECEIVE = 1 << 2;
        const INCOMPLETE_TRANSMIT = 1 << 3;
        const TRANSMIT_UNDERRUN = 1 << 4;
    }
}

/// Result of the last StartPeriodicInterrupts session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PeriodicInterruptInfo {
    pub status: PeriodicInterruptStatus,
    pub interrupt_count: u32,
    pub already_acknowledged_count: u32,
    pub acknowledged_before_deadline_count: u32,
    pub acknowledged_after_deadline_count: u32,
}

impl PeriodicInterruptInfo {
    pub const PAYLOAD_LEN: usize = 20;
    pub const FRAME_LEN: usize = HEADER_LEN + Self::PAYLOAD_LEN;

    /// A session cut short only reports why.
    pub fn aborted(status: PeriodicInterruptStatus) -> Self {
        Self {
            status,
            ..Default::default()
        }
    }

    pub fn encode(&self) -> Frame {
        Frame::build(Self::PAYLOAD_LEN, |p| {
            LittleEndian::write_u32(&mut p[0..4], self.status.bits());
            LittleEndian::write_u32(&mut p[4..8], self.interrupt_count);
            LittleEndian::write_u32(&mut p[8..12], self.already_acknowledged_count);
            LittleEndian::write_u32(&mut p[12..16], self.acknowledged_before_deadline_count);
            LittleEndian::write_u32(&mut p[16..20], self.acknowledged_after_deadline_count);
        })
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let p = payload_of(bytes, Self::PAYLOAD_LEN)?;
        Ok(Self {
            status: PeriodicInterruptStatus::from_bits_retain(LittleEndian::read_u32(&p[0..4])),
            interrupt_count: LittleEndian::read_u32(&p[4..8]),
            already_acknowledged_count: LittleEndian::read_u32(&p[8..12]),
            acknowledged_before_deadline_count: LittleEndian::read_u32(&p[12..16]),
            acknowledged_after_deadline_count: LittleEndian::read_u32(&p[16..20]),
        })
    }
}

/// Reply to one AcknowledgeInterrupt. Sent bare, without a frame header:
/// it has to be ready within a single SPI transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AcknowledgeInterruptInfo {
    pub time_since_falling_edge: u32,
    pub checksum: u32,
}

impl AcknowledgeInterruptInfo {
    pub const LEN: usize = 8;

    pub fn new(time_since_falling_edge: u32) -> Self {
        Self {
            time_since_falling_edge,
            checksum: !time_since_falling_edge,
        }
    }

    pub fn encode(&self) -> [u8; Self::LEN] {
        let mut out = [0u8; Self::LEN];
        LittleEndian::write_u32(&mut out[0..4], self.time_since_falling_edge);
        LittleEndian::write_u32(&mut out[4..8], self.checksum);
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        if bytes.len() < Self::LEN {
            return Err(DecodeError::Truncated {
                expected: Self::LEN,
                actual: bytes.len(),
            });
        }
        let info = Self {
            time_since_falling_edge: LittleEndian::read_u32(&bytes[0..4]),
            checksum: LittleEndian::read_u32(&bytes[4..8]),
        };
        if info.checksum != !info.time_since_falling_edge {
            return Err(DecodeError::AckChecksum);
        }
        Ok(info)
    }

    /// Latency in counter ticks, unless this was a repeat acknowledgement.
    pub fn latency(&self) -> Option<u32> {
        (self.time_since_falling_edge != INVALID_TIME_SINCE_FALLING_EDGE)
            .then_some(self.time_since_falling_edge)
    }
}

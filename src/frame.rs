//! Response frames: `length u16, device id, version, checksum u16`, then
//! the payload. CRC-16/XMODEM over the frame with the checksum zeroed.

use byteorder::{ByteOrder, LittleEndian};
use crc::{CRC_16_XMODEM, Crc, Digest};

use crate::proto::DecodeError;

pub const DEVICE_ID: u8 = 0x5A;
pub const PROTOCOL_VERSION: u8 = 1;

pub const HEADER_LEN: usize = 6;
/// Largest response the device ever sends.
pub const MAX_FRAME_LEN: usize = 32;

const CHECKSUM_OFFSET: usize = 4;

static CRC16: Crc<u16> = Crc::<u16>::new(&CRC_16_XMODEM);

pub fn crc16(bytes: &[u8]) -> u16 {
    CRC16.checksum(bytes)
}

/// Running CRC-16 fed one byte at a time from a receive loop.
pub struct Crc16Accumulator {
    digest: Digest<'static, u16>,
}

impl Crc16Accumulator {
    pub fn new() -> Self {
        Self {
            digest: CRC16.digest(),
        }
    }

    pub fn update(&mut self, byte: u8) {
        self.digest.update(&[byte]);
    }

    pub fn finish(self) -> u16 {
        self.digest.finalize()
    }
}

impl Default for Crc16Accumulator {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub length: u16,
    pub device_id: u8,
    pub version: u8,
    pub checksum: u16,
}

/// A response frame in a fixed buffer.
#[derive(Debug, Clone)]
pub struct Frame {
    buf: [u8; MAX_FRAME_LEN],
    len: usize,
}

impl Frame {
    /// Lays out a frame with `payload_len` payload bytes filled in by `fill`,
    /// then seals it.
    pub fn build(payload_len: usize, fill: impl FnOnce(&mut [u8])) -> Self {
        let len = HEADER_LEN + payload_len;
        assert!(len <= MAX_FRAME_LEN, "payload does not fit a frame");
        let mut buf = [0u8; MAX_FRAME_LEN];
        fill(&mut buf[HEADER_LEN..len]);
        seal(&mut buf[..len]);
        Self { buf, len }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf[..self.len]
    }

    pub fn payload(&self) -> &[u8] {
        &self.buf[HEADER_LEN..self.len]
    }
}

/// Writes the header into `frame` and computes its checksum.
pub fn seal(frame: &mut [u8]) {
    let len = frame.len() as u16;
    LittleEndian::write_u16(&mut frame[0..2], len);
    frame[2] = DEVICE_ID;
    frame[3] = PROTOCOL_VERSION;
    LittleEndian::write_u16(&mut frame[CHECKSUM_OFFSET..CHECKSUM_OFFSET + 2], 0);
    let checksum = crc16(frame);
    LittleEndian::write_u16(&mut frame[CHECKSUM_OFFSET..CHECKSUM_OFFSET + 2], checksum);
}

/// Verifies a received frame and returns its header.
pub fn open(frame: &[u8]) -> Result<FrameHeader, DecodeError> {
    if frame.len() < HEADER_LEN {
        return Err(DecodeError::Truncated {
            expected: HEADER_LEN,
            actual: frame.len(),
        });
    }
    let header = FrameHeader {
        length: LittleEndian::read_u16(&frame[0..2]),
        device_id: frame[2],
        version: frame[3],
        checksum: LittleEndian::read_u16(&frame[CHECKSUM_OFFSET..CHECKSUM_OFFSET + 2]),
    };
    if usize::from(header.length) != frame.len() {
        return Err(DecodeError::LengthMismatch {
            header: header.length,
            actual: frame.len(),
        });
    }
    if header.device_id != DEVICE_ID || header.version != PROTOCOL_VERSION {
        return Err(DecodeError::ForeignDevice {
            device_id: header.device_id,
            version: header.version,
        });
    }
    let mut digest = CRC16.digest();
    digest.update(&frame[..CHECKSUM_OFFSET]);
    digest.update(&[0, 0]);
    digest.update(&frame[CHECKSUM_OFFSET + 2..]);
    let computed = digest.finalize();
    if computed != header.checksum {
        return Err(DecodeError::Checksum {
            expected: header.checksum,
            computed,
        });
    }
    Ok(header)
}

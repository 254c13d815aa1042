//! Eight-byte command blocks sent by the master.
//!
//! Byte 0 selects the command, bytes 1..8 carry its parameters
//! (little-endian):
//!
//! * CaptureNextTransfer: `[1]` mode, `[2]` data bit length, `[3]` reserved,
//!   `[4..6]` send value, `[6..8]` receive value.
//! * StartPeriodicInterrupts: `[1]` reserved, `[2..4]` duration in seconds,
//!   `[4..8]` interrupt frequency in Hz.

use byteorder::{ByteOrder, LittleEndian};

use super::DecodeError;
use crate::hal::{DataFormat, FIFO_DEPTH, SpiDataMode};

pub const COMMAND_BLOCK_LEN: usize = 8;

// The periodic tester flushes the FIFOs with one command block worth of
// dummy words.
const _: () = assert!(COMMAND_BLOCK_LEN == FIFO_DEPTH);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CommandCode {
    GetDeviceInfo = 1,
    CaptureNextTransfer = 2,
    GetTransferInfo = 3,
    StartPeriodicInterrupts = 4,
    GetPeriodicInterruptInfo = 5,
    AcknowledgeInterrupt = 6,
}

impl TryFrom<u8> for CommandCode {
    type Error = DecodeError;

    fn try_from(raw: u8) -> Result<Self, Self::Error> {
        Ok(match raw {
            1 => CommandCode::GetDeviceInfo,
            2 => CommandCode::CaptureNextTransfer,
            3 => CommandCode::GetTransferInfo,
            4 => CommandCode::StartPeriodicInterrupts,
            5 => CommandCode::GetPeriodicInterruptInfo,
            6 => CommandCode::AcknowledgeInterrupt,
            other => return Err(DecodeError::UnknownCommand(other)),
        })
    }
}

/// Parameters of CaptureNextTransfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureParams {
    pub mode: SpiDataMode,
    /// Requested bit length as sent; see [`CaptureParams::format`].
    pub data_bit_length: u8,
    /// First word the tester transmits; each following word is one higher.
    pub send_value: u16,
    /// First word the tester expects to receive; each following word is one
    /// higher.
    pub receive_value: u16,
}

impl CaptureParams {
    pub fn format(&self) -> DataFormat {
        DataFormat::new(self.mode, self.data_bit_length)
    }
}

/// Parameters of StartPeriodicInterrupts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeriodicParams {
    pub duration_in_seconds: u16,
    pub interrupt_frequency: u32,
}

impl PeriodicParams {
    /// Total interrupts for the session, or `None` when it does not fit.
    pub fn interrupt_count(&self) -> Option<u32> {
        u32::from(self.duration_in_seconds).checked_mul(self.interrupt_frequency)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    GetDeviceInfo,
    CaptureNextTransfer(CaptureParams),
    GetTransferInfo,
    StartPeriodicInterrupts(PeriodicParams),
    GetPeriodicInterruptInfo,
    AcknowledgeInterrupt,
}

impl Command {
    pub fn code(&self) -> CommandCode {
        match self {
            Command::GetDeviceInfo => CommandCode::GetDeviceInfo,
            Command::CaptureNextTransfer(_) => CommandCode::CaptureNextTransfer,
            Command::GetTransferInfo => CommandCode::GetTransferInfo,
            Command::StartPeriodicInterrupts(_) => CommandCode::StartPeriodicInterrupts,
            Command::GetPeriodicInterruptInfo => CommandCode::GetPeriodicInterruptInfo,
            Command::AcknowledgeInterrupt => CommandCode::AcknowledgeInterrupt,
        }
    }

    pub fn decode(block: &[u8; COMMAND_BLOCK_LEN]) -> Result<Self, DecodeError> {
        Ok(match CommandCode::try_from(block[0])? {
            CommandCode::GetDeviceInfo => Command::GetDeviceInfo,
            CommandCode::CaptureNextTransfer => Command::CaptureNextTransfer(CaptureParams {
                mode: SpiDataMode::from_wire(block[1]),
                data_bit_length: block[2],
                send_value: LittleEndian::read_u16(&block[4..6]),
                receive_value: LittleEndian::read_u16(&block[6..8]),
            }),
            CommandCode::GetTransferInfo => Command::GetTransferInfo,
            CommandCode::StartPeriodicInterrupts => {
                Command::StartPeriodicInterrupts(PeriodicParams {
                    duration_in_seconds: LittleEndian::read_u16(&block[2..4]),
                    interrupt_frequency: LittleEndian::read_u32(&block[4..8]),
                })
            }
            CommandCode::GetPeriodicInterruptInfo => Command::GetPeriodicInterruptInfo,
            CommandCode::AcknowledgeInterrupt => Command::AcknowledgeInterrupt,
        })
    }

    pub fn encode(&self) -> [u8; COMMAND_BLOCK_LEN] {
        let mut block = [0u8; COMMAND_BLOCK_LEN];
        block[0] = self.code() as u8;
        match self {
            Command::CaptureNextTransfer(p) => {
                block[1] = p.mode.to_wire();
                block[2] = p.data_bit_length;
                LittleEndian::write_u16(&mut block[4..6], p.send_value);
                LittleEndian::write_u16(&mut block[6..8], p.receive_value);
            }
            Command::StartPeriodicInterrupts(p) => {
                LittleEndian::write_u16(&mut block[2..4], p.duration_in_seconds);
                LittleEndian::write_u32(&mut block[4..8], p.interrupt_frequency);
            }
            _ => {}
        }
        block
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capture_layout() {
        let block = [2, 3, 12, 0, 0x34, 0x12, 0x78, 0x56];
        let Command::CaptureNextTransfer(p) = Command::decode(&block).unwrap() else {
            panic!("wrong variant");
        };
        assert_eq!(p.mode, SpiDataMode::Mode3);
        assert_eq!(p.data_bit_length, 12);
        assert_eq!(p.send_value, 0x1234);
        assert_eq!(p.receive_value, 0x5678);
        assert_eq!(Command::CaptureNextTransfer(p).encode(), block);
    }

    #[test]
    fn periodic_layout() {
        let block = [4, 0, 10, 0, 0xE8, 0x03, 0, 0];
        let cmd = Command::decode(&block).unwrap();
        assert_eq!(
            cmd,
            Command::StartPeriodicInterrupts(PeriodicParams {
                duration_in_seconds: 10,
                interrupt_frequency: 1000,
            })
        );
        assert_eq!(cmd.encode(), block);
    }

    #[test]
    fn parameters_of_plain_commands_are_ignored() {
        let block = [3, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF];
        assert_eq!(Command::decode(&block).unwrap(), Command::GetTransferInfo);
    }

    #[test]
    fn unknown_code() {
        assert_eq!(
            Command::decode(&[0x42; 8]),
            Err(DecodeError::UnknownCommand(0x42))
        );
        assert_eq!(
            Command::decode(&[0; 8]),
            Err(DecodeError::UnknownCommand(0))
        );
    }

    #[test]
    fn interrupt_count_overflow() {
        let ok = PeriodicParams {
            duration_in_seconds: 60,
            interrupt_frequency: 10_000,
        };
        assert_eq!(ok.interrupt_count(), Some(600_000));
        let too_many = PeriodicParams {
            duration_in_seconds: u16::MAX,
            interrupt_frequency: 100_000,
        };
        assert_eq!(too_many.interrupt_count(), None);
    }
}

pub mod command;
pub mod response;

use thiserror::Error;

pub use command::{CaptureParams, Command, CommandCode, PeriodicParams, COMMAND_BLOCK_LEN};
pub use response::{
    AcknowledgeInterruptInfo, ClockMeasurementStatus, DeviceInfo, INVALID_TIME_SINCE_FALLING_EDGE,
    PeriodicInterruptInfo, PeriodicInterruptStatus, TransferInfo,
};

/// Why a frame read off the bus could not be turned into a typed value.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("frame truncated: need {expected} bytes, got {actual}")]
    Truncated { expected: usize, actual: usize },
    #[error("header length {header} does not match frame length {actual}")]
    LengthMismatch { header: u16, actual: usize },
    #[error("frame from unexpected device {device_id:#04x} version {version}")]
    ForeignDevice { device_id: u8, version: u8 },
    #[error("checksum {expected:#06x} != computed {computed:#06x}")]
    Checksum { expected: u16, computed: u16 },
    #[error("unknown command code {0:#04x}")]
    UnknownCommand(u8),
    #[error("unknown clock measurement status {0}")]
    UnknownStatus(u8),
    #[error("acknowledgement checksum does not invert its latency")]
    AckChecksum,
}

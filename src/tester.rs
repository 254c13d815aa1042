use std::sync::Arc;

use tracing::{debug, trace};

use crate::frame::{DEVICE_ID, Frame, PROTOCOL_VERSION};
use crate::hal::{
    CaptureTimer, Clocks, EdgeSenseInput, InterruptController, MAX_DATA_BIT_LENGTH,
    MIN_DATA_BIT_LENGTH, Peripherals, PinControl, SpiSlavePeripheral,
};
use crate::irq::InterruptCounter;
use crate::proto::{Command, DeviceInfo, PeriodicInterruptInfo, TransferInfo};
use crate::transport::{self, SendOutcome};
use crate::{capture, periodic, timer};

/// Fastest SPI clock advertised regardless of the peripheral clock.
pub const MAX_SPI_FREQUENCY_HZ: u32 = 5_000_000;

/// A slave needs twelve peripheral clocks per SCK period.
pub fn max_frequency(spi_clock_hz: u32) -> u32 {
    (spi_clock_hz / 12).min(MAX_SPI_FREQUENCY_HZ)
}

/// Command dispatcher. Holds the results of the last capture and the last
/// periodic session until the master asks for them.
pub struct SpiTester<S, T, E, I, P> {
    hw: Peripherals<S, T, E, I, P>,
    remaining: Arc<InterruptCounter>,
    device_info: DeviceInfo,
    transfer_info: TransferInfo,
    interrupt_info: PeriodicInterruptInfo,
}

impl<S, T, E, I, P> SpiTester<S, T, E, I, P>
where
    S: SpiSlavePeripheral,
    T: CaptureTimer,
    E: EdgeSenseInput,
    I: InterruptController,
    P: PinControl,
{
    pub fn new(
        mut hw: Peripherals<S, T, E, I, P>,
        clocks: Clocks,
        remaining: Arc<InterruptCounter>,
    ) -> Self {
        transport::restore_control_format(&mut hw.spi);
        timer::initialize(&mut hw.timer);

        let device_info = DeviceInfo {
            device_id: DEVICE_ID,
            version: PROTOCOL_VERSION,
            min_data_bit_length: MIN_DATA_BIT_LENGTH,
            max_data_bit_length: MAX_DATA_BIT_LENGTH,
            max_frequency: max_frequency(clocks.spi_clock_hz),
            clock_measurement_frequency: clocks.core_clock_hz,
        };
        debug!(
            "SPI clock: {} Hz, max SPI frequency: {} Hz",
            clocks.spi_clock_hz, device_info.max_frequency
        );

        Self {
            hw,
            remaining,
            device_info,
            transfer_info: TransferInfo::default(),
            interrupt_info: PeriodicInterruptInfo::default(),
        }
    }

    pub fn device_info(&self) -> &DeviceInfo {
        &self.device_info
    }

    pub fn transfer_info(&self) -> &TransferInfo {
        &self.transfer_info
    }

    pub fn interrupt_info(&self) -> &PeriodicInterruptInfo {
        &self.interrupt_info
    }

    /// Handles at most one command. Returns it if one was received and
    /// understood.
    pub fn run_state_machine(&mut self) -> Option<Command> {
        let block = transport::receive_command(&mut self.hw.spi)?;
        let command = match Command::decode(&block) {
            Ok(command) => command,
            Err(err) => {
                trace!("Ignoring command block {:02x?}: {}", block, err);
                return None;
            }
        };

        match command {
            Command::GetDeviceInfo => {
                let frame = self.device_info.encode();
                self.reply(&frame);
            }
            Command::CaptureNextTransfer(params) => {
                self.transfer_info = capture::capture_transfer(&mut self.hw, &params);
            }
            Command::GetTransferInfo => {
                let frame = self.transfer_info.encode();
                self.reply(&frame);
            }
            Command::StartPeriodicInterrupts(params) => {
                self.interrupt_info = periodic::run_periodic_interrupts(
                    &mut self.hw,
                    &self.remaining,
                    self.device_info.clock_measurement_frequency,
                    &params,
                );
            }
            Command::GetPeriodicInterruptInfo => {
                let frame = self.interrupt_info.encode();
                self.reply(&frame);
            }
            Command::AcknowledgeInterrupt => {
                trace!("AcknowledgeInterrupt outside a periodic session");
            }
        }
        Some(command)
    }

    fn reply(&mut self, frame: &Frame) {
        match transport::send(&mut self.hw.spi, &mut self.hw.irq, frame.as_bytes()) {
            SendOutcome::Sent => {}
            outcome => debug!("Response not delivered cleanly: {:?}", outcome),
        }
    }
}

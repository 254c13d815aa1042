//! CaptureNextTransfer: clock out an incrementing sequence, check the
//! incoming one, and time how long SCK was active.

use tracing::debug;

use crate::frame::Crc16Accumulator;
use crate::hal::{
    CaptureTimer, FIFO_DEPTH, InterruptController, Peripherals, SpiSlavePeripheral, SpiStatus,
};
use crate::irq::CriticalSection;
use crate::proto::{CaptureParams, ClockMeasurementStatus, TransferInfo};
use crate::{timer, transport};

pub fn capture_transfer<S, T, E, I, P>(
    hw: &mut Peripherals<S, T, E, I, P>,
    params: &CaptureParams,
) -> TransferInfo
where
    S: SpiSlavePeripheral,
    T: CaptureTimer,
    I: InterruptController,
{
    let format = params.format();
    let mask = format.mask();
    let mut info = TransferInfo::default();
    let mut checksum = Crc16Accumulator::new();
    let mut tx_value = params.send_value;
    let mut rx_value = params.receive_value;
    let mut received: u32 = 0;
    let mut mismatch: Option<u32> = None;

    transport::configure(&mut hw.spi, format);
    timer::arm_transfer_capture(&mut hw.timer);

    let capture1 = {
        let _cs = CriticalSection::enter(&mut hw.irq);

        for _ in 0..FIFO_DEPTH {
            hw.spi.write(tx_value & mask);
            tx_value = tx_value.wrapping_add(1);
        }

        while !hw.spi.chip_select_asserted() {}
        hw.timer.start();

        let (capture1, status) = timer::wait_for_capture(&mut hw.spi, &mut hw.timer);
        info.clock_active_time_status = status;

        loop {
            let status = hw.spi.status();
            if status.contains(SpiStatus::RNE) {
                let data = hw.spi.read();
                checksum.update(data as u8);
                if format.is_wide() {
                    checksum.update((data >> 8) as u8);
                }
                if data != rx_value & mask && mismatch.is_none() {
                    mismatch = Some(received);
                }
                rx_value = rx_value.wrapping_add(1);
                received = received.wrapping_add(1);
            } else if !hw.spi.chip_select_asserted() {
                // Only once the receive FIFO is empty, or the last word
                // would be lost.
                break;
            }

            if status.contains(SpiStatus::TNF) {
                hw.spi.write(tx_value & mask);
                tx_value = tx_value.wrapping_add(1);
            }
        }
        capture1
    };

    if info.clock_active_time_status == ClockMeasurementStatus::Success {
        if !hw.timer.is_running() {
            info.clock_active_time_status = ClockMeasurementStatus::Overflow;
        } else {
            let capture2 = hw.timer.capture();
            hw.timer.reset();
            info.clock_active_time = capture2.wrapping_sub(capture1);
        }
    }

    info.checksum = checksum.finish();
    info.element_count = received;
    info.mismatch_index = mismatch.unwrap_or(received);

    transport::restore_control_format(&mut hw.spi);

    debug!(
        "Captured transfer: elements={} mismatch={:?} clock={:?}/{}",
        info.element_count, mismatch, info.clock_active_time_status, info.clock_active_time
    );
    info
}

//! Capture-timer recipes shared by the capture engine and the periodic tester.

use crate::hal::{
    CaptureEdge, CaptureTimer, MatchActions, MatchOutput, MatchOutputAction, PinLevel,
    SpiSlavePeripheral, SpiStatus,
};
use crate::proto::ClockMeasurementStatus;

/// Capture register reads per receive-FIFO check in [`wait_for_capture`].
const CAPTURE_POLLS_PER_FIFO_CHECK: usize = 11;

/// Start-up state: held in reset, counting every input clock, match output
/// high.
pub fn initialize<T: CaptureTimer>(timer: &mut T) {
    timer.reset();
    timer.set_capture_edge(CaptureEdge::Disabled);
    timer.set_match(0, MatchActions::empty());
    timer.set_match_output(MatchOutput::IDLE);
}

/// Latches the counter on every SCK falling edge. The counter stops instead
/// of wrapping, so a stopped timer afterwards means the measurement
/// overflowed.
pub fn arm_transfer_capture<T: CaptureTimer>(timer: &mut T) {
    timer.reset();
    timer.set_match(u32::MAX, MatchActions::STOP);
    timer.set_capture_edge(CaptureEdge::Falling);
}

/// Interrupt and restart every `period` ticks, pulling the match output low
/// at each match. The output starts high.
pub fn arm_periodic_match<T: CaptureTimer>(timer: &mut T, period: u32) {
    timer.reset();
    timer.clear_interrupt();
    timer.set_match(period, MatchActions::INTERRUPT | MatchActions::RESET);
    timer.set_match_output(MatchOutput {
        level: PinLevel::High,
        on_match: MatchOutputAction::DriveLow,
    });
    timer.set_capture_edge(CaptureEdge::Disabled);
}

/// Waits for the first falling edge to be latched, or for the first word to
/// arrive without one.
///
/// The capture register has no queue: a second edge overwrites the first.
/// It is therefore read several times for every look at the receive FIFO.
/// When a word shows up first (or chip select goes away), the free-running
/// counter stands in for the missing capture.
pub fn wait_for_capture<S, T>(spi: &mut S, timer: &mut T) -> (u32, ClockMeasurementStatus)
where
    S: SpiSlavePeripheral,
    T: CaptureTimer,
{
    while !spi.status().contains(SpiStatus::RNE) {
        if !spi.chip_select_asserted() {
            break;
        }
        for _ in 0..CAPTURE_POLLS_PER_FIFO_CHECK {
            let capture = timer.capture();
            if capture != 0 {
                return (capture, ClockMeasurementStatus::Success);
            }
        }
    }
    (timer.counter(), ClockMeasurementStatus::EdgeNotDetected)
}

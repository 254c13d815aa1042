//! Byte-level SPI slave transport. Feeding loops run with interrupts masked
//! because the master clocks at its own pace once chip select is asserted.

use tracing::{debug, warn};

use crate::hal::{DataFormat, FIFO_DEPTH, InterruptController, SpiSlavePeripheral, SpiStatus};
use crate::irq::CriticalSection;
use crate::proto::COMMAND_BLOCK_LEN;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Sent,
    /// Every byte was queued, but the FIFO ran dry at least once.
    SentWithUnderrun,
    /// Chip select went away before the whole frame was queued.
    Aborted,
    /// The transmit FIFO held stale data; nothing was sent.
    FifoNotEmpty,
}

pub fn configure<S: SpiSlavePeripheral>(spi: &mut S, format: DataFormat) {
    spi.set_data_format(format);
}

pub fn restore_control_format<S: SpiSlavePeripheral>(spi: &mut S) {
    spi.set_data_format(DataFormat::CONTROL);
}

/// Drains the receive FIFO until the master has released chip select.
///
/// The master may keep clocking after the payload, so returning early would
/// leave its trailing words in the FIFO for the next command.
pub fn wait_for_cs_to_deassert<S: SpiSlavePeripheral>(spi: &mut S) {
    while spi.chip_select_asserted() || spi.status().contains(SpiStatus::RNE) {
        let _ = spi.read();
    }
}

/// Sends a response frame.
///
/// Up to one FIFO worth of bytes is queued before chip select is seen, so
/// the first bytes go out without any software latency.
pub fn send<S, I>(spi: &mut S, irq: &mut I, frame: &[u8]) -> SendOutcome
where
    S: SpiSlavePeripheral,
    I: InterruptController,
{
    if !spi.status().contains(SpiStatus::TFE) {
        warn!("SSP transmit fifo is not empty");
        return SendOutcome::FifoNotEmpty;
    }

    let preload = frame.len().min(FIFO_DEPTH);
    for &byte in &frame[..preload] {
        spi.write(u16::from(byte));
    }

    while !spi.chip_select_asserted() {}

    let mut underrun = false;
    {
        let _cs = CriticalSection::enter(irq);
        let mut next = preload;
        while next < frame.len() {
            let status = spi.status();
            if status.contains(SpiStatus::TFE) {
                underrun = true;
            }
            if status.contains(SpiStatus::TNF) {
                spi.write(u16::from(frame[next]));
                next += 1;
            }
            if !spi.chip_select_asserted() {
                return SendOutcome::Aborted;
            }
        }
    }

    wait_for_cs_to_deassert(spi);

    if underrun {
        debug!("Transmit underrun occurred");
        SendOutcome::SentWithUnderrun
    } else {
        SendOutcome::Sent
    }
}

/// Reads one command block if the master has started sending one.
///
/// Returns `None` straight away when nothing is waiting, and also when chip
/// select drops before a whole block arrived; the partial block is discarded.
pub fn receive_command<S: SpiSlavePeripheral>(spi: &mut S) -> Option<[u8; COMMAND_BLOCK_LEN]> {
    if !spi.status().contains(SpiStatus::RNE) {
        return None;
    }

    let mut block = [0u8; COMMAND_BLOCK_LEN];
    let mut i = 0;
    while i < COMMAND_BLOCK_LEN {
        if spi.status().contains(SpiStatus::RNE) {
            block[i] = spi.read() as u8;
            i += 1;
        } else if !spi.chip_select_asserted() {
            return None;
        }
    }

    wait_for_cs_to_deassert(spi);
    Some(block)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::{Command, DeviceInfo};
    use crate::sim::{SimConfig, Simulator, Transfer};

    #[test]
    fn receive_returns_none_when_idle() {
        let sim = Simulator::new(SimConfig::default());
        let mut hw = sim.peripherals();
        assert_eq!(receive_command(&mut hw.spi), None);
    }

    #[test]
    fn receive_full_block() {
        let sim = Simulator::new(SimConfig::default());
        let mut hw = sim.peripherals();
        sim.send_command(&Command::GetTransferInfo);
        let block = loop {
            if let Some(block) = receive_command(&mut hw.spi) {
                break block;
            }
        };
        assert_eq!(block, Command::GetTransferInfo.encode());
        assert!(!sim.pending());
    }

    #[test]
    fn partial_block_is_discarded() {
        let sim = Simulator::new(SimConfig::default());
        let mut hw = sim.peripherals();
        sim.enqueue(Transfer::bytes(&[1, 2, 3, 4, 5, 6, 7, 8]).abort_after(3));
        sim.send_command(&Command::GetDeviceInfo);
        let mut received = Vec::new();
        while sim.pending() {
            if let Some(block) = receive_command(&mut hw.spi) {
                received.push(block);
            }
        }
        assert_eq!(received, vec![Command::GetDeviceInfo.encode()]);
    }

    #[test]
    fn send_refuses_stale_fifo() {
        let sim = Simulator::new(SimConfig::default());
        let mut hw = sim.peripherals();
        hw.spi.write(0xAA);
        assert_eq!(send(&mut hw.spi, &mut hw.irq, &[1, 2, 3]), SendOutcome::FifoNotEmpty);
    }

    #[test]
    fn send_long_frame() {
        let sim = Simulator::new(SimConfig::default());
        let mut hw = sim.peripherals();
        let frame: Vec<u8> = (0..DeviceInfo::FRAME_LEN as u8).collect();
        sim.read_response(frame.len());
        assert_eq!(send(&mut hw.spi, &mut hw.irq, &frame), SendOutcome::Sent);
        let done = sim.completed();
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].miso_bytes(), frame);
        assert!(sim.interrupts_enabled());
    }

    #[test]
    fn slow_feed_reports_underrun() {
        let sim = Simulator::new(SimConfig {
            access_ticks: 6,
            ..SimConfig::default()
        });
        let mut hw = sim.peripherals();
        let frame: Vec<u8> = (1..=DeviceInfo::FRAME_LEN as u8).collect();
        sim.enqueue(Transfer::idle(64).bit_ticks(1));

        assert_eq!(
            send(&mut hw.spi, &mut hw.irq, &frame),
            SendOutcome::SentWithUnderrun
        );
        let done = sim.last_completed().unwrap();
        assert!(done.underruns > 0);
        assert!(!done.aborted);
        assert!(sim.interrupts_enabled());
    }

    #[test]
    fn send_aborted_by_chip_select() {
        let sim = Simulator::new(SimConfig::default());
        let mut hw = sim.peripherals();
        let frame = [0x11u8; 20];
        sim.enqueue(Transfer::idle(frame.len()).abort_after(2));
        assert_eq!(send(&mut hw.spi, &mut hw.irq, &frame), SendOutcome::Aborted);
        assert!(sim.interrupts_enabled());
    }
}

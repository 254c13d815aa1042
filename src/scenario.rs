//! Master-side scripts: queue transfers, run the tester until the script is
//! done, then decode and check what came back.

use anyhow::{Context, Result, bail, ensure};
use tracing::{info, warn};

use spi_tester::frame::Crc16Accumulator;
use spi_tester::periodic;
use spi_tester::hal::{DataFormat, SpiDataMode};
use spi_tester::proto::{
    AcknowledgeInterruptInfo, COMMAND_BLOCK_LEN, CaptureParams, ClockMeasurementStatus, Command,
    CommandCode, DeviceInfo, PeriodicInterruptInfo, PeriodicParams, TransferInfo,
};
use spi_tester::sim::{SimTester, Simulator, Transfer};

use crate::cli::{CaptureOpts, PeriodicOpts};

fn run(sim: &Simulator, tester: &mut SimTester) -> Result<()> {
    let start = sim.now();
    let overruns = sim.receive_overruns();
    sim.run(tester)?;
    info!("script done after {} ticks", sim.now() - start);
    let dropped = sim.receive_overruns() - overruns;
    if dropped > 0 {
        info!("{} words arrived with the receive FIFO full", dropped);
    }
    Ok(())
}

fn last_response(sim: &Simulator) -> Result<Vec<u8>> {
    let done = sim
        .last_completed()
        .context("master never clocked a response")?;
    ensure!(!done.aborted, "response transfer was cut short");
    Ok(done.miso_bytes())
}

fn ticks_to_us(ticks: u32, clock_hz: u32) -> f64 {
    f64::from(ticks) * 1e6 / f64::from(clock_hz.max(1))
}

pub fn device_info(sim: &Simulator, tester: &mut SimTester) -> Result<DeviceInfo> {
    sim.send_command(&Command::GetDeviceInfo);
    sim.read_response(DeviceInfo::FRAME_LEN);
    run(sim, tester)?;
    let info = DeviceInfo::decode(&last_response(sim)?).context("decode DeviceInfo")?;
    println!(
        "device: id={:#04x} version={} bits={}..={} max_frequency={} Hz clock={} Hz",
        info.device_id,
        info.version,
        info.min_data_bit_length,
        info.max_data_bit_length,
        info.max_frequency,
        info.clock_measurement_frequency
    );
    Ok(info)
}

pub fn capture(sim: &Simulator, tester: &mut SimTester, opts: &CaptureOpts) -> Result<TransferInfo> {
    let params = CaptureParams {
        mode: SpiDataMode::from_wire(opts.mode),
        data_bit_length: opts.bits,
        send_value: opts.send_value,
        receive_value: opts.receive_value,
    };
    let format = params.format();
    if format.bits != opts.bits {
        warn!("{} bits is not supported, the tester will use {}", opts.bits, format.bits);
    }
    let mask = format.mask();

    let mosi: Vec<u16> = (0..opts.count)
        .map(|i| {
            let word = opts.receive_value.wrapping_add(i as u16) & mask;
            if opts.corrupt_index == Some(i) {
                word ^ 1
            } else {
                word
            }
        })
        .collect();

    sim.send_command(&Command::CaptureNextTransfer(params));
    sim.enqueue(Transfer::words(&mosi, format.bits));
    sim.send_command(&Command::GetTransferInfo);
    sim.read_response(TransferInfo::FRAME_LEN);
    run(sim, tester)?;

    let info = TransferInfo::decode(&last_response(sim)?).context("decode TransferInfo")?;
    ensure!(
        info == *tester.transfer_info(),
        "[BAD ] TransferInfo corrupted on the wire: {:?}",
        info
    );
    let clock_hz = tester.device_info().clock_measurement_frequency;

    println!(
        "transfer: elements={} mismatch={} checksum={:#06x} clock={:?} active={} ticks ({:.3} us)",
        info.element_count,
        info.mismatch()
            .map_or_else(|| "none".to_string(), |i| i.to_string()),
        info.checksum,
        info.clock_active_time_status,
        info.clock_active_time,
        ticks_to_us(info.clock_active_time, clock_hz)
    );

    verify_capture(&info, &mosi, format, opts)?;
    verify_sent_sequence(sim, format, opts.send_value)?;
    Ok(info)
}

fn verify_capture(
    info: &TransferInfo,
    mosi: &[u16],
    format: DataFormat,
    opts: &CaptureOpts,
) -> Result<()> {
    let mut crc = Crc16Accumulator::new();
    for &word in mosi {
        crc.update(word as u8);
        if format.is_wide() {
            crc.update((word >> 8) as u8);
        }
    }
    let expected_crc = crc.finish();

    ensure!(
        info.element_count as usize == mosi.len(),
        "[BAD ] element count {} != {}",
        info.element_count,
        mosi.len()
    );
    ensure!(
        info.checksum == expected_crc,
        "[BAD ] checksum {:#06x} != {:#06x}",
        info.checksum,
        expected_crc
    );
    let expected_mismatch = opts.corrupt_index.filter(|&i| i < mosi.len());
    ensure!(
        info.mismatch().map(|i| i as usize) == expected_mismatch,
        "[BAD ] mismatch {:?} != {:?}",
        info.mismatch(),
        expected_mismatch
    );
    if info.clock_active_time_status != ClockMeasurementStatus::Success {
        warn!("no clock timing: {:?}", info.clock_active_time_status);
    }
    Ok(())
}

/// Checks the words the tester clocked back against its incrementing
/// sequence.
fn verify_sent_sequence(sim: &Simulator, format: DataFormat, send_value: u16) -> Result<()> {
    let done = sim.completed();
    let Some(capture) = done.iter().rev().nth(2) else {
        bail!("capture transfer missing from the script log");
    };
    let mask = format.mask();
    for (i, &word) in capture.miso.iter().enumerate() {
        let expected = send_value.wrapping_add(i as u16) & mask;
        ensure!(
            word == expected,
            "[BAD ] tester sent {:#06x} at {}, expected {:#06x}",
            word,
            i,
            expected
        );
    }
    if capture.underruns > 0 {
        warn!("tester transmit FIFO ran dry {} times", capture.underruns);
    }
    Ok(())
}

pub fn periodic(
    sim: &Simulator,
    tester: &mut SimTester,
    opts: &PeriodicOpts,
) -> Result<PeriodicInterruptInfo> {
    let params = PeriodicParams {
        duration_in_seconds: opts.duration,
        interrupt_frequency: opts.frequency,
    };
    let clock_hz = tester.device_info().clock_measurement_frequency;
    // A session the tester refuses never pulses the interrupt line.
    let acks = match opts.acks {
        Some(n) => n,
        None => periodic::session_plan(clock_hz, &params)
            .and_then(|(_, count)| usize::try_from(count).ok())
            .unwrap_or(0),
    };

    let first = sim.completed().len();
    sim.send_command(&Command::StartPeriodicInterrupts(params));
    sim.acknowledge_interrupts(acks, opts.ack_delay);
    sim.send_command(&Command::GetPeriodicInterruptInfo);
    sim.read_response(PeriodicInterruptInfo::FRAME_LEN);
    run(sim, tester)?;

    let info = PeriodicInterruptInfo::decode(&last_response(sim)?)
        .context("decode PeriodicInterruptInfo")?;

    let mut latencies = Vec::new();
    let mut invalid = 0usize;
    for done in sim.completed().iter().skip(first) {
        let is_ack = done.mosi.first() == Some(&u16::from(CommandCode::AcknowledgeInterrupt as u8));
        if !is_ack || done.aborted {
            continue;
        }
        let bytes = done.miso_bytes();
        match AcknowledgeInterruptInfo::decode(&bytes[COMMAND_BLOCK_LEN..]) {
            Ok(ack) => match ack.latency() {
                Some(ticks) => latencies.push(ticks),
                None => invalid += 1,
            },
            Err(err) => warn!("[BAD ] acknowledgement reply: {}", err),
        }
    }

    println!(
        "periodic: status={:?} interrupts={} before_deadline={} after_deadline={} already_acked={}",
        info.status,
        info.interrupt_count,
        info.acknowledged_before_deadline_count,
        info.acknowledged_after_deadline_count,
        info.already_acknowledged_count
    );
    if let (Some(min), Some(max)) = (latencies.iter().min(), latencies.iter().max()) {
        let mean = latencies.iter().map(|&t| f64::from(t)).sum::<f64>() / latencies.len() as f64;
        println!(
            "latency: n={} min={:.3} us max={:.3} us mean={:.3} us (repeats={})",
            latencies.len(),
            ticks_to_us(*min, clock_hz),
            ticks_to_us(*max, clock_hz),
            mean * 1e6 / f64::from(clock_hz.max(1)),
            invalid
        );
    }

    let tallied = info.already_acknowledged_count
        + info.acknowledged_before_deadline_count
        + info.acknowledged_after_deadline_count;
    if info.status.is_empty() && tallied != info.interrupt_count {
        warn!(
            "acknowledgements ({}) do not add up to interrupts ({})",
            tallied, info.interrupt_count
        );
    }
    Ok(info)
}

#[cfg(test)]
mod tests {
    use super::*;
    use spi_tester::proto::PeriodicInterruptStatus;
    use spi_tester::sim::SimConfig;

    fn sim() -> Simulator {
        Simulator::new(SimConfig {
            core_clock_hz: 1000,
            tick_budget: 200_000,
            ..SimConfig::default()
        })
    }

    fn periodic_opts(frequency: u32, acks: Option<usize>) -> PeriodicOpts {
        PeriodicOpts {
            duration: 1,
            frequency,
            ack_delay: 50,
            acks,
        }
    }

    #[test]
    fn refused_session_is_reported_not_stuck() {
        let sim = sim();
        let mut tester = sim.tester();
        let info = periodic(&sim, &mut tester, &periodic_opts(5000, None)).unwrap();
        assert_eq!(info.status, PeriodicInterruptStatus::ARITHMETIC_OVERFLOW);
        assert!(!sim.pending());
    }

    #[test]
    fn forced_acknowledgements_run_out_the_budget() {
        let sim = sim();
        let mut tester = sim.tester();
        let err = periodic(&sim, &mut tester, &periodic_opts(5000, Some(2))).unwrap_err();
        assert!(err.to_string().contains("tick budget"), "{err}");
    }

    #[test]
    fn periodic_session_acknowledges_every_pulse() {
        let sim = sim();
        let mut tester = sim.tester();
        let info = periodic(&sim, &mut tester, &periodic_opts(4, None)).unwrap();
        assert_eq!(info.status, PeriodicInterruptStatus::empty());
        assert_eq!(info.acknowledged_before_deadline_count, 4);
    }
}

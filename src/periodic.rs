//! StartPeriodicInterrupts: timed pulses on the interrupt output and the
//! master's acknowledgement latency for each.

use tracing::{debug, trace, warn};

use crate::hal::{
    CaptureTimer, EdgeSenseInput, InterruptController, MatchActions, MatchOutput, Peripherals,
    PinControl, PinLevel, SpiSlavePeripheral, SpiStatus,
};
use crate::irq::{CriticalSection, InterruptCounter};
use crate::proto::{
    AcknowledgeInterruptInfo, COMMAND_BLOCK_LEN, CommandCode, INVALID_TIME_SINCE_FALLING_EDGE,
    PeriodicInterruptInfo, PeriodicInterruptStatus, PeriodicParams,
};
use crate::stats::{AckStats, LatencyBucket};
use crate::{timer, transport};

/// Match interrupt handler: the only writer of the remaining count.
///
/// After the last pulse the counter runs on from the zero the match left it
/// at, so the final acknowledgement is timed like every other one.
pub fn on_match_interrupt<T: CaptureTimer>(timer: &mut T, remaining: &InterruptCounter) {
    timer.clear_interrupt();
    if remaining.decrement() == 0 {
        timer.set_match_actions(MatchActions::empty());
    }
}

/// One classified acknowledgement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Acknowledgement {
    pub bucket: LatencyBucket,
    pub time_since_falling_edge: u32,
    /// Pulses covered by this acknowledgement.
    pub difference: u32,
}

/// Classifies an acknowledgement seen `timestamp` ticks after the most
/// recent pulse, given the remaining count at the previous acknowledgement
/// and now. Returns `None` if the count went up, which cannot happen.
pub fn classify_acknowledgement(
    last_acked: u32,
    remaining: u32,
    period: u32,
    timestamp: u32,
) -> Option<Acknowledgement> {
    let difference = last_acked.checked_sub(remaining)?;
    let (bucket, time_since_falling_edge) = match difference {
        0 => (
            LatencyBucket::AlreadyAcknowledged,
            INVALID_TIME_SINCE_FALLING_EDGE,
        ),
        1 => (LatencyBucket::BeforeDeadline, timestamp),
        n => {
            let periods_late = n - 1;
            (
                LatencyBucket::PastDeadline { periods_late },
                periods_late.wrapping_mul(period).wrapping_add(timestamp),
            )
        }
    };
    Some(Acknowledgement {
        bucket,
        time_since_falling_edge,
        difference,
    })
}

/// Match period and pulse count for a session, or `None` when either does
/// not fit the counter. `None` sessions never drive the interrupt output.
pub fn session_plan(clock_measurement_frequency: u32, params: &PeriodicParams) -> Option<(u32, u32)> {
    let period = clock_measurement_frequency
        .checked_div(params.interrupt_frequency)
        .filter(|&p| p > 0)?;
    let count = params.interrupt_count()?;
    Some((period, count))
}

pub fn run_periodic_interrupts<S, T, E, I, P>(
    hw: &mut Peripherals<S, T, E, I, P>,
    remaining: &InterruptCounter,
    clock_measurement_frequency: u32,
    params: &PeriodicParams,
) -> PeriodicInterruptInfo
where
    S: SpiSlavePeripheral,
    T: CaptureTimer,
    E: EdgeSenseInput,
    I: InterruptController,
    P: PinControl,
{
    debug!("Entering periodic interrupt mode");

    let Some((period, interrupt_count)) = session_plan(clock_measurement_frequency, params) else {
        debug!(
            "Interrupt count overflow. (DurationInSeconds={}, InterruptFrequency={})",
            params.duration_in_seconds, params.interrupt_frequency
        );
        return PeriodicInterruptInfo::aborted(PeriodicInterruptStatus::ARITHMETIC_OVERFLOW);
    };

    timer::arm_periodic_match(&mut hw.timer, period);
    remaining.arm(interrupt_count);
    hw.pins.mux_interrupt_output();
    hw.pins.set_activity_led(true);
    hw.irq.enable_timer_interrupt();
    hw.timer.start();
    hw.sck.enable_falling_edge();

    let outcome = acknowledge_interrupts(hw, remaining, period, interrupt_count);

    hw.sck.disable_falling_edge();
    hw.timer.reset();
    hw.irq.disable_timer_interrupt();
    hw.timer.set_match_output(MatchOutput::IDLE);
    hw.pins.demux_interrupt_output();
    hw.pins.set_activity_led(false);
    transport::restore_control_format(&mut hw.spi);

    match outcome {
        Ok(stats) => {
            if remaining.remaining() != 0 {
                warn!("remainingInterrupts is not zero");
            }
            debug!(
                "Leaving interrupt mode. (alreadyAcked={}, ackedPastDeadline={}, ackedBeforeDeadline={}, interruptCount={})",
                stats.already_acknowledged,
                stats.past_deadline,
                stats.before_deadline,
                interrupt_count
            );
            stats.into_info(interrupt_count)
        }
        Err(status) => {
            debug!("Leaving interrupt mode early: {:?}", status);
            PeriodicInterruptInfo::aborted(status)
        }
    }
}

fn acknowledge_interrupts<S, T, E, I, P>(
    hw: &mut Peripherals<S, T, E, I, P>,
    remaining: &InterruptCounter,
    period: u32,
    interrupt_count: u32,
) -> Result<AckStats, PeriodicInterruptStatus>
where
    S: SpiSlavePeripheral,
    T: CaptureTimer,
    E: EdgeSenseInput,
    I: InterruptController,
{
    let mut stats = AckStats::new();
    let mut last_acked = interrupt_count;

    while remaining.remaining() != 0 {
        // One command block of dummy words: clears what the master left in
        // the receive FIFO and fills the transmit FIFO it will clock first.
        for _ in 0..COMMAND_BLOCK_LEN {
            hw.spi.write(0);
            let _ = hw.spi.read();
        }

        trace!("Waiting for SCK falling edge");
        wait_for_sck_falling_edge(&mut hw.sck);

        let _cs = CriticalSection::enter(&mut hw.irq);
        let timestamp = hw.timer.counter();
        hw.timer.set_match_output_level(PinLevel::High);

        while !hw.spi.status().contains(SpiStatus::RNE) {
            if !hw.spi.chip_select_asserted() {
                return Err(PeriodicInterruptStatus::INCOMPLETE_RECEIVE);
            }
        }
        let command = hw.spi.read() as u8;
        if command != CommandCode::AcknowledgeInterrupt as u8 {
            transport::wait_for_cs_to_deassert(&mut hw.spi);
            return Err(PeriodicInterruptStatus::NOT_ACKNOWLEDGED);
        }

        let Some(ack) =
            classify_acknowledgement(last_acked, remaining.remaining(), period, timestamp)
        else {
            return Err(PeriodicInterruptStatus::ARITHMETIC_OVERFLOW);
        };
        stats.record(ack.bucket);
        last_acked -= ack.difference;

        let reply = AcknowledgeInterruptInfo::new(ack.time_since_falling_edge).encode();
        if let Some(fault) = stream_reply(&mut hw.spi, &reply) {
            stats.flag(fault);
        }

        transport::wait_for_cs_to_deassert(&mut hw.spi);
    }

    Ok(stats)
}

fn wait_for_sck_falling_edge<E: EdgeSenseInput>(sck: &mut E) {
    sck.clear_falling_edge();
    while !sck.falling_edge_detected() {}
}

/// Feeds the acknowledgement reply behind whatever is still queued. A fault
/// ends the reply but not the session.
fn stream_reply<S: SpiSlavePeripheral>(
    spi: &mut S,
    reply: &[u8],
) -> Option<PeriodicInterruptStatus> {
    let mut next = 0;
    while next < reply.len() {
        let status = spi.status();
        if status.contains(SpiStatus::TFE) {
            trace!("Transmit underrun during acknowledgement");
            return Some(PeriodicInterruptStatus::TRANSMIT_UNDERRUN);
        }
        if status.contains(SpiStatus::TNF) {
            spi.write(u16::from(reply[next]));
            next += 1;
        }
        if !spi.chip_select_asserted() {
            return Some(PeriodicInterruptStatus::INCOMPLETE_TRANSMIT);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{SimConfig, Simulator, Transfer};
    use proptest::prelude::*;

    const PERIOD: u32 = 500;

    fn sim_at(core_clock_hz: u32) -> Simulator {
        Simulator::new(SimConfig {
            core_clock_hz,
            ..SimConfig::default()
        })
    }

    fn run(sim: &Simulator, duration_in_seconds: u16, interrupt_frequency: u32) -> PeriodicInterruptInfo {
        let mut hw = sim.peripherals();
        let counter = sim.interrupt_counter();
        run_periodic_interrupts(
            &mut hw,
            &counter,
            sim.clocks().core_clock_hz,
            &PeriodicParams {
                duration_in_seconds,
                interrupt_frequency,
            },
        )
    }

    fn replies(sim: &Simulator) -> Vec<AcknowledgeInterruptInfo> {
        sim.completed()
            .iter()
            .map(|t| AcknowledgeInterruptInfo::decode(&t.miso_bytes()[COMMAND_BLOCK_LEN..]).unwrap())
            .collect()
    }

    fn assert_torn_down(sim: &Simulator) {
        assert!(!sim.interrupt_output_muxed());
        assert!(!sim.timer_interrupt_enabled());
        assert!(!sim.sck_detection_enabled());
        assert!(!sim.activity_led());
        assert!(sim.interrupts_enabled());
        assert!(!sim.pending());
    }

    #[test]
    fn on_time_acknowledgements() {
        let sim = sim_at(2000);
        sim.acknowledge_interrupts(4, 60);
        let info = run(&sim, 1, 4);

        assert_eq!(info.status, PeriodicInterruptStatus::empty());
        assert_eq!(info.interrupt_count, 4);
        assert_eq!(info.acknowledged_before_deadline_count, 4);
        assert_eq!(
            info.already_acknowledged_count
                + info.acknowledged_before_deadline_count
                + info.acknowledged_after_deadline_count,
            info.interrupt_count
        );
        for reply in replies(&sim) {
            let latency = reply.latency().unwrap();
            assert!((64..=70).contains(&latency), "latency {latency}");
        }
        assert_torn_down(&sim);
    }

    #[test]
    fn repeated_acknowledgement_is_flagged_invalid() {
        let sim = sim_at(2000);
        sim.acknowledge_interrupts(1, 60);
        sim.enqueue(Transfer::acknowledge().after(100));
        sim.acknowledge_interrupts(3, 60);
        let info = run(&sim, 1, 4);

        assert_eq!(info.status, PeriodicInterruptStatus::empty());
        assert_eq!(info.already_acknowledged_count, 1);
        assert_eq!(info.acknowledged_before_deadline_count, 4);
        let replies = replies(&sim);
        assert_eq!(replies.len(), 5);
        assert_eq!(replies[1].time_since_falling_edge, INVALID_TIME_SINCE_FALLING_EDGE);
        assert_eq!(replies[1].checksum, 0);
    }

    #[test]
    fn late_acknowledgements_add_whole_periods() {
        let sim = sim_at(2000);
        sim.acknowledge_interrupts(4, 600);
        let info = run(&sim, 1, 4);

        assert_eq!(info.status, PeriodicInterruptStatus::empty());
        assert_eq!(info.interrupt_count, 4);
        assert_eq!(info.acknowledged_after_deadline_count, 2);
        assert_eq!(info.acknowledged_before_deadline_count, 0);
        let replies = replies(&sim);
        assert_eq!(replies.len(), 2);
        for reply in replies {
            let latency = reply.latency().unwrap();
            assert!((PERIOD + 95..=PERIOD + 115).contains(&latency), "latency {latency}");
        }
        assert_torn_down(&sim);
    }

    #[test]
    fn chip_select_lost_mid_reply_keeps_going() {
        let sim = sim_at(2000);
        sim.enqueue(Transfer::acknowledge().on_interrupt(60).abort_after(4));
        sim.acknowledge_interrupts(1, 60);
        let info = run(&sim, 1, 2);

        assert_eq!(info.status, PeriodicInterruptStatus::INCOMPLETE_TRANSMIT);
        assert_eq!(info.interrupt_count, 2);
        assert_eq!(info.acknowledged_before_deadline_count, 2);
        assert_torn_down(&sim);
    }

    #[test]
    fn chip_select_lost_before_first_word() {
        let sim = sim_at(2000);
        sim.enqueue(Transfer::acknowledge().on_interrupt(60).abort_after_bits(3));
        let info = run(&sim, 1, 1);

        assert_eq!(
            info,
            PeriodicInterruptInfo::aborted(PeriodicInterruptStatus::INCOMPLETE_RECEIVE)
        );
        assert!(sim.last_completed().unwrap().aborted);
        assert_torn_down(&sim);
    }

    #[test]
    fn slow_reply_feed_underruns() {
        let sim = Simulator::new(SimConfig {
            core_clock_hz: 2000,
            access_ticks: 6,
            ..SimConfig::default()
        });
        sim.acknowledge_interrupts(1, 60);
        let info = run(&sim, 1, 1);

        assert_eq!(info.status, PeriodicInterruptStatus::TRANSMIT_UNDERRUN);
        assert_eq!(info.interrupt_count, 1);
        assert_eq!(info.acknowledged_before_deadline_count, 1);
        assert!(sim.last_completed().unwrap().underruns > 0);
        assert_torn_down(&sim);
    }

    #[test]
    fn wrong_command_ends_session() {
        let sim = sim_at(2000);
        let mut bytes = [0u8; 16];
        bytes[0] = CommandCode::GetDeviceInfo as u8;
        sim.enqueue(Transfer::bytes(&bytes).on_interrupt(60));
        sim.acknowledge_interrupts(3, 60);
        let info = run(&sim, 1, 4);

        assert_eq!(
            info,
            PeriodicInterruptInfo::aborted(PeriodicInterruptStatus::NOT_ACKNOWLEDGED)
        );
        assert_torn_down(&sim);
    }

    #[test]
    fn count_overflow_generates_nothing() {
        let sim = sim_at(100_000_000);
        let info = run(&sim, u16::MAX, 100_000);
        assert_eq!(
            info,
            PeriodicInterruptInfo::aborted(PeriodicInterruptStatus::ARITHMETIC_OVERFLOW)
        );
        assert!(!sim.interrupt_output_ever_muxed());
        assert!(!sim.timer_interrupt_enabled());
        assert_eq!(sim.interrupt_counter().remaining(), 0);
    }

    #[test]
    fn plan_matches_what_the_session_arms() {
        let params = |duration_in_seconds, interrupt_frequency| PeriodicParams {
            duration_in_seconds,
            interrupt_frequency,
        };
        assert_eq!(session_plan(2000, &params(2, 4)), Some((500, 8)));
        assert_eq!(session_plan(2000, &params(1, 3000)), None);
        assert_eq!(session_plan(2000, &params(1, 0)), None);
    }

    #[test]
    fn zero_frequency_is_rejected() {
        let sim = sim_at(2000);
        let info = run(&sim, 1, 0);
        assert!(info.status.contains(PeriodicInterruptStatus::ARITHMETIC_OVERFLOW));
        let info = run(&sim, 1, 4000);
        assert!(info.status.contains(PeriodicInterruptStatus::ARITHMETIC_OVERFLOW));
        assert!(!sim.interrupt_output_ever_muxed());
    }

    #[test]
    fn handler_switches_to_free_run_on_last_pulse() {
        let sim = sim_at(2000);
        let mut hw = sim.peripherals();
        let counter = InterruptCounter::new();
        timer::arm_periodic_match(&mut hw.timer, 100);
        counter.arm(2);
        hw.timer.start();

        on_match_interrupt(&mut hw.timer, &counter);
        assert_eq!(counter.remaining(), 1);
        assert_eq!(sim.match_actions(), MatchActions::INTERRUPT | MatchActions::RESET);

        let before = hw.timer.counter();
        on_match_interrupt(&mut hw.timer, &counter);
        assert_eq!(counter.remaining(), 0);
        assert_eq!(sim.match_actions(), MatchActions::empty());
        assert!(hw.timer.is_running());
        // Not restarted: the count carries on.
        assert!(hw.timer.counter() > before);
    }

    #[test]
    fn last_acknowledgement_timed_like_the_rest() {
        let sim = sim_at(2000);
        sim.acknowledge_interrupts(3, 60);
        let info = run(&sim, 1, 3);
        assert_eq!(info.acknowledged_before_deadline_count, 3);

        let latencies: Vec<u32> = replies(&sim).iter().filter_map(|r| r.latency()).collect();
        assert_eq!(latencies.len(), 3);
        assert!(latencies.iter().all(|&l| l == latencies[0]), "{latencies:?}");
    }

    #[test]
    fn negative_difference_is_impossible() {
        assert_eq!(classify_acknowledgement(3, 4, 100, 5), None);
    }

    #[test]
    fn duplicate_uses_sentinel() {
        let ack = classify_acknowledgement(7, 7, 100, 42).unwrap();
        assert_eq!(ack.bucket, LatencyBucket::AlreadyAcknowledged);
        assert_eq!(ack.time_since_falling_edge, INVALID_TIME_SINCE_FALLING_EDGE);
        assert_eq!(ack.difference, 0);
    }

    proptest! {
        #[test]
        fn on_time_latency_is_timestamp(remaining in 0u32..u32::MAX, period: u32, timestamp: u32) {
            let ack = classify_acknowledgement(remaining + 1, remaining, period, timestamp).unwrap();
            prop_assert_eq!(ack.bucket, LatencyBucket::BeforeDeadline);
            prop_assert_eq!(ack.time_since_falling_edge, timestamp);
            prop_assert_eq!(ack.difference, 1);
        }

        #[test]
        fn late_latency_adds_missed_periods(
            remaining in 0u32..1_000_000,
            difference in 2u32..1_000,
            period in 1u32..1_000_000,
            timestamp in 0u32..1_000_000,
        ) {
            let ack = classify_acknowledgement(remaining + difference, remaining, period, timestamp).unwrap();
            prop_assert_eq!(ack.bucket, LatencyBucket::PastDeadline { periods_late: difference - 1 });
            prop_assert_eq!(
                u64::from(ack.time_since_falling_edge),
                u64::from(difference - 1) * u64::from(period) + u64::from(timestamp)
            );
        }
    }
}

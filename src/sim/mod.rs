//! Discrete-time stand-in for the board. Every peripheral access advances
//! the world by [`SimConfig::access_ticks`] ticks.

mod master;

use std::cell::RefCell;
use std::panic::{self, AssertUnwindSafe};
use std::collections::VecDeque;
use std::rc::Rc;
use std::sync::Arc;

use thiserror::Error;

use crate::hal::{
    CaptureEdge, CaptureTimer, Clocks, DataFormat, EdgeSenseInput, FIFO_DEPTH,
    InterruptController, MatchActions, MatchOutput, MatchOutputAction, Peripherals, PinControl,
    PinLevel, SpiSlavePeripheral, SpiStatus,
};
use crate::irq::InterruptCounter;
use crate::periodic;
use crate::proto::Command;
use crate::tester::SpiTester;

pub use master::{Completed, Transfer};
use master::Master;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SimConfig {
    /// Rate the capture timer counts at; one count per tick at `timer_step` 1.
    pub core_clock_hz: u32,
    pub spi_clock_hz: u32,
    /// SCK half-periods are `bit_ticks / 2` ticks for transfers that do not
    /// set their own.
    pub bit_ticks: u64,
    /// Counter increment per tick.
    pub timer_step: u32,
    /// Whether SCK is wired to the capture input.
    pub capture_input_connected: bool,
    /// Ticks one register access takes.
    pub access_ticks: u64,
    pub tick_budget: u64,
}

/// A script kept the engines waiting past [`SimConfig::tick_budget`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("simulation exceeded its tick budget of {budget}")]
pub struct TickBudgetExceeded {
    pub budget: u64,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            core_clock_hz: 100_000_000,
            spi_clock_hz: 100_000_000,
            bit_ticks: 2,
            timer_step: 1,
            capture_input_connected: true,
            access_ticks: 1,
            tick_budget: 50_000_000,
        }
    }
}

#[derive(Debug)]
struct SpiState {
    tx: VecDeque<u16>,
    rx: VecDeque<u16>,
    format: DataFormat,
    overruns: u32,
}

#[derive(Debug)]
struct TimerState {
    running: bool,
    counter: u32,
    capture: u32,
    edge: CaptureEdge,
    match_value: u32,
    actions: MatchActions,
    output: MatchOutput,
    pending: bool,
}

#[derive(Debug, Default)]
struct SckState {
    enabled: bool,
    flag: bool,
}

#[derive(Debug)]
struct IrqState {
    global: bool,
    timer: bool,
    in_handler: bool,
}

#[derive(Debug, Default)]
struct PinState {
    muxed: bool,
    ever_muxed: bool,
    led: bool,
}

#[derive(Debug)]
struct World {
    config: SimConfig,
    now: u64,
    spi: SpiState,
    timer: TimerState,
    sck: SckState,
    irq: IrqState,
    pins: PinState,
    master: Master,
}

impl World {
    fn new(config: SimConfig) -> Self {
        Self {
            config,
            now: 0,
            spi: SpiState {
                tx: VecDeque::with_capacity(FIFO_DEPTH),
                rx: VecDeque::with_capacity(FIFO_DEPTH),
                format: DataFormat::CONTROL,
                overruns: 0,
            },
            timer: TimerState {
                running: false,
                counter: 0,
                capture: 0,
                edge: CaptureEdge::Disabled,
                match_value: 0,
                actions: MatchActions::empty(),
                output: MatchOutput::IDLE,
                pending: false,
            },
            sck: SckState::default(),
            irq: IrqState {
                global: true,
                timer: false,
                in_handler: false,
            },
            pins: PinState::default(),
            master: Master::default(),
        }
    }

    fn interrupt_asserted(&self) -> bool {
        self.pins.muxed && self.timer.output.level == PinLevel::Low
    }

    fn tick(&mut self) {
        self.tick_timer();
        self.tick_master();
    }

    fn tick_timer(&mut self) {
        let t = &mut self.timer;
        if !t.running {
            return;
        }
        let before = u64::from(t.counter);
        let after = before + u64::from(self.config.timer_step);
        let match_value = u64::from(t.match_value);
        if before < match_value && match_value <= after {
            t.counter = t.match_value;
            if t.actions.contains(MatchActions::INTERRUPT) {
                t.pending = true;
            }
            if t.actions.contains(MatchActions::RESET) {
                t.counter = 0;
            }
            if t.actions.contains(MatchActions::STOP) {
                t.running = false;
            }
            t.output.level = match (t.output.on_match, t.output.level) {
                (MatchOutputAction::Nothing, level) => level,
                (MatchOutputAction::DriveLow, _) => PinLevel::Low,
                (MatchOutputAction::DriveHigh, _) => PinLevel::High,
                (MatchOutputAction::Toggle, PinLevel::Low) => PinLevel::High,
                (MatchOutputAction::Toggle, PinLevel::High) => PinLevel::Low,
            };
        } else {
            t.counter = after as u32;
        }
    }

    fn tick_master(&mut self) {
        let asserted = self.interrupt_asserted();
        self.master.poll_start(self.now, asserted, self.config.bit_ticks);
        let clocking = self.master.clock(self.now);

        if clocking.shift_out {
            let word = self.spi.tx.pop_front();
            self.master.shifted_out(word);
        }
        if clocking.falling_edge {
            let t = &mut self.timer;
            if t.running && t.edge == CaptureEdge::Falling && self.config.capture_input_connected {
                t.capture = t.counter;
            }
            if self.sck.enabled {
                self.sck.flag = true;
            }
        }
        if let Some(word) = clocking.shifted_in {
            if self.spi.rx.len() < FIFO_DEPTH {
                self.spi.rx.push_back(word);
            } else {
                self.spi.overruns += 1;
            }
        }
    }

    /// Claims the match interrupt for delivery if nothing masks it.
    fn take_interrupt(&mut self) -> bool {
        let deliver = self.timer.pending
            && self.irq.timer
            && self.irq.global
            && !self.irq.in_handler;
        if deliver {
            self.irq.in_handler = true;
        }
        deliver
    }
}

/// Shared handle every simulated peripheral goes through.
#[derive(Clone)]
struct Bus {
    world: Rc<RefCell<World>>,
    remaining: Arc<InterruptCounter>,
}

impl Bus {
    fn step(&self) {
        let ticks = self.world.borrow().config.access_ticks.max(1);
        for _ in 0..ticks {
            self.tick();
        }
    }

    /// Unwinds out of the engines once the budget is spent; see
    /// [`Simulator::within_budget`]. Guards dropped on the way out still
    /// reach the bus, so they must not raise it again.
    fn tick(&self) {
        let deliver = {
            let mut w = self.world.borrow_mut();
            w.now += 1;
            if w.now > w.config.tick_budget && !std::thread::panicking() {
                let budget = w.config.tick_budget;
                drop(w);
                panic::resume_unwind(Box::new(TickBudgetExceeded { budget }));
            }
            w.tick();
            w.take_interrupt()
        };
        if deliver {
            let mut timer = SimTimer { bus: self.clone() };
            periodic::on_match_interrupt(&mut timer, &self.remaining);
            self.world.borrow_mut().irq.in_handler = false;
        }
    }

    /// One register access: advance time, then touch the world.
    fn access<R>(&self, f: impl FnOnce(&mut World) -> R) -> R {
        self.step();
        f(&mut self.world.borrow_mut())
    }
}

pub struct SimSpi {
    bus: Bus,
}

impl SpiSlavePeripheral for SimSpi {
    fn status(&mut self) -> SpiStatus {
        self.bus.access(|w| {
            let mut status = SpiStatus::empty();
            status.set(SpiStatus::TFE, w.spi.tx.is_empty());
            status.set(SpiStatus::TNF, w.spi.tx.len() < FIFO_DEPTH);
            status.set(SpiStatus::RNE, !w.spi.rx.is_empty());
            status.set(SpiStatus::RFF, w.spi.rx.len() >= FIFO_DEPTH);
            status.set(SpiStatus::BSY, w.master.chip_select());
            status
        })
    }

    fn write(&mut self, word: u16) {
        self.bus.access(|w| {
            if w.spi.tx.len() < FIFO_DEPTH {
                let mask = w.spi.format.mask();
                w.spi.tx.push_back(word & mask);
            }
        })
    }

    fn read(&mut self) -> u16 {
        self.bus.access(|w| w.spi.rx.pop_front().unwrap_or(0))
    }

    fn chip_select_asserted(&mut self) -> bool {
        self.bus.access(|w| w.master.chip_select())
    }

    fn set_data_format(&mut self, format: DataFormat) {
        self.bus.access(|w| {
            w.spi.tx.clear();
            w.spi.rx.clear();
            w.spi.format = format;
        })
    }
}

pub struct SimTimer {
    bus: Bus,
}

impl CaptureTimer for SimTimer {
    fn reset(&mut self) {
        self.bus.access(|w| {
            w.timer.running = false;
            w.timer.counter = 0;
            w.timer.capture = 0;
        })
    }

    fn start(&mut self) {
        self.bus.access(|w| w.timer.running = true)
    }

    fn is_running(&mut self) -> bool {
        self.bus.access(|w| w.timer.running)
    }

    fn counter(&mut self) -> u32 {
        self.bus.access(|w| w.timer.counter)
    }

    fn capture(&mut self) -> u32 {
        self.bus.access(|w| w.timer.capture)
    }

    fn set_capture_edge(&mut self, edge: CaptureEdge) {
        self.bus.access(|w| w.timer.edge = edge)
    }

    fn set_match(&mut self, value: u32, actions: MatchActions) {
        self.bus.access(|w| {
            w.timer.match_value = value;
            w.timer.actions = actions;
        })
    }

    fn set_match_actions(&mut self, actions: MatchActions) {
        self.bus.access(|w| w.timer.actions = actions)
    }

    fn set_match_output(&mut self, output: MatchOutput) {
        self.bus.access(|w| w.timer.output = output)
    }

    fn set_match_output_level(&mut self, level: PinLevel) {
        self.bus.access(|w| w.timer.output.level = level)
    }

    fn clear_interrupt(&mut self) {
        self.bus.access(|w| w.timer.pending = false)
    }
}

pub struct SimSck {
    bus: Bus,
}

impl EdgeSenseInput for SimSck {
    fn enable_falling_edge(&mut self) {
        self.bus.access(|w| w.sck.enabled = true)
    }

    fn disable_falling_edge(&mut self) {
        self.bus.access(|w| w.sck.enabled = false)
    }

    fn clear_falling_edge(&mut self) {
        self.bus.access(|w| w.sck.flag = false)
    }

    fn falling_edge_detected(&mut self) -> bool {
        self.bus.access(|w| w.sck.flag)
    }
}

pub struct SimIrq {
    bus: Bus,
}

impl InterruptController for SimIrq {
    fn disable_interrupts(&mut self) -> bool {
        self.bus
            .access(|w| std::mem::replace(&mut w.irq.global, false))
    }

    fn enable_interrupts(&mut self) {
        self.bus.access(|w| w.irq.global = true)
    }

    fn enable_timer_interrupt(&mut self) {
        self.bus.access(|w| w.irq.timer = true)
    }

    fn disable_timer_interrupt(&mut self) {
        self.bus.access(|w| w.irq.timer = false)
    }
}

pub struct SimPins {
    bus: Bus,
}

impl PinControl for SimPins {
    fn mux_interrupt_output(&mut self) {
        self.bus.access(|w| {
            w.pins.muxed = true;
            w.pins.ever_muxed = true;
        })
    }

    fn demux_interrupt_output(&mut self) {
        self.bus.access(|w| {
            w.pins.muxed = false;
            w.master.cancel_interrupt_transfers();
        })
    }

    fn set_activity_led(&mut self, on: bool) {
        self.bus.access(|w| w.pins.led = on)
    }
}

pub type SimPeripherals = Peripherals<SimSpi, SimTimer, SimSck, SimIrq, SimPins>;
pub type SimTester = SpiTester<SimSpi, SimTimer, SimSck, SimIrq, SimPins>;

/// Owner of a simulated board and its scripted master.
///
/// The observer methods read state without advancing time.
pub struct Simulator {
    bus: Bus,
}

impl Simulator {
    pub fn new(config: SimConfig) -> Self {
        Self {
            bus: Bus {
                world: Rc::new(RefCell::new(World::new(config))),
                remaining: Arc::new(InterruptCounter::new()),
            },
        }
    }

    fn world(&self) -> std::cell::Ref<'_, World> {
        self.bus.world.borrow()
    }

    pub fn config(&self) -> SimConfig {
        self.world().config
    }

    pub fn clocks(&self) -> Clocks {
        let config = self.config();
        Clocks {
            spi_clock_hz: config.spi_clock_hz,
            core_clock_hz: config.core_clock_hz,
        }
    }

    pub fn peripherals(&self) -> SimPeripherals {
        Peripherals {
            spi: SimSpi {
                bus: self.bus.clone(),
            },
            timer: SimTimer {
                bus: self.bus.clone(),
            },
            sck: SimSck {
                bus: self.bus.clone(),
            },
            irq: SimIrq {
                bus: self.bus.clone(),
            },
            pins: SimPins {
                bus: self.bus.clone(),
            },
        }
    }

    /// The counter the simulated match interrupt decrements.
    pub fn interrupt_counter(&self) -> Arc<InterruptCounter> {
        Arc::clone(&self.bus.remaining)
    }

    pub fn tester(&self) -> SimTester {
        SpiTester::new(self.peripherals(), self.clocks(), self.interrupt_counter())
    }

    pub fn enqueue(&self, transfer: Transfer) {
        self.bus.world.borrow_mut().master.enqueue(transfer);
    }

    pub fn send_command(&self, command: &Command) {
        self.enqueue(Transfer::bytes(&command.encode()));
    }

    /// Clocks out a response of `len` bytes.
    pub fn read_response(&self, len: usize) {
        self.enqueue(Transfer::idle(len));
    }

    /// Queues `count` acknowledgements, each `delay` ticks after the
    /// interrupt output goes low.
    pub fn acknowledge_interrupts(&self, count: usize, delay: u64) {
        for _ in 0..count {
            self.enqueue(Transfer::acknowledge().on_interrupt(delay));
        }
    }

    /// Whether the master still has a transfer running or queued.
    pub fn pending(&self) -> bool {
        self.world().master.pending()
    }

    pub fn completed(&self) -> Vec<Completed> {
        self.world().master.completed().to_vec()
    }

    pub fn last_completed(&self) -> Option<Completed> {
        self.world().master.completed().last().cloned()
    }

    /// Runs `f` against this board, turning a spent tick budget into an
    /// error. Other panics pass through.
    pub fn within_budget<R>(&self, f: impl FnOnce() -> R) -> Result<R, TickBudgetExceeded> {
        match panic::catch_unwind(AssertUnwindSafe(f)) {
            Ok(value) => Ok(value),
            Err(payload) => match payload.downcast::<TickBudgetExceeded>() {
                Ok(exceeded) => Err(*exceeded),
                Err(other) => panic::resume_unwind(other),
            },
        }
    }

    /// Runs the state machine until the master's script is exhausted.
    pub fn run(&self, tester: &mut SimTester) -> Result<(), TickBudgetExceeded> {
        self.within_budget(|| {
            while self.pending() {
                tester.run_state_machine();
            }
        })
    }

    pub fn now(&self) -> u64 {
        self.world().now
    }

    pub fn interrupts_enabled(&self) -> bool {
        self.world().irq.global
    }

    pub fn timer_interrupt_enabled(&self) -> bool {
        self.world().irq.timer
    }

    pub fn match_output_level(&self) -> PinLevel {
        self.world().timer.output.level
    }

    pub fn match_actions(&self) -> MatchActions {
        self.world().timer.actions
    }

    pub fn data_format(&self) -> DataFormat {
        self.world().spi.format
    }

    pub fn interrupt_output_muxed(&self) -> bool {
        self.world().pins.muxed
    }

    pub fn interrupt_output_ever_muxed(&self) -> bool {
        self.world().pins.ever_muxed
    }

    pub fn sck_detection_enabled(&self) -> bool {
        self.world().sck.enabled
    }

    pub fn activity_led(&self) -> bool {
        self.world().pins.led
    }

    /// Words the master clocked into a full receive FIFO.
    pub fn receive_overruns(&self) -> u32 {
        self.world().spi.overruns
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_access_is_one_tick() {
        let sim = Simulator::new(SimConfig::default());
        let mut hw = sim.peripherals();
        hw.timer.start();
        let a = hw.timer.counter();
        let b = hw.timer.counter();
        assert_eq!(b - a, 1);
        assert_eq!(sim.now(), 3);
    }

    #[test]
    fn fifo_depth_limits_writes() {
        let sim = Simulator::new(SimConfig::default());
        let mut hw = sim.peripherals();
        for w in 0..10 {
            hw.spi.write(w);
        }
        assert!(!hw.spi.status().contains(SpiStatus::TNF));
        hw.spi.set_data_format(DataFormat::CONTROL);
        assert!(hw.spi.status().contains(SpiStatus::TFE));
    }

    #[test]
    fn match_interrupt_is_held_off_while_masked() {
        let sim = Simulator::new(SimConfig::default());
        let mut hw = sim.peripherals();
        let counter = sim.interrupt_counter();
        counter.arm(5);
        crate::timer::arm_periodic_match(&mut hw.timer, 4);
        hw.irq.enable_timer_interrupt();
        let was_enabled = hw.irq.disable_interrupts();
        assert!(was_enabled);
        hw.timer.start();
        for _ in 0..10 {
            let _ = hw.timer.counter();
        }
        assert_eq!(counter.remaining(), 5);
        hw.irq.enable_interrupts();
        // Delivered on the first tick after unmasking.
        let _ = hw.timer.counter();
        assert_eq!(counter.remaining(), 4);
    }

    #[test]
    fn slow_access_costs_several_ticks() {
        let sim = Simulator::new(SimConfig {
            access_ticks: 6,
            ..SimConfig::default()
        });
        let mut hw = sim.peripherals();
        hw.timer.start();
        let a = hw.timer.counter();
        let b = hw.timer.counter();
        assert_eq!(b - a, 6);
        assert_eq!(sim.now(), 18);
    }

    #[test]
    fn stuck_wait_hits_the_budget() {
        let sim = Simulator::new(SimConfig {
            tick_budget: 1_000,
            ..SimConfig::default()
        });
        let mut hw = sim.peripherals();
        let err = sim
            .within_budget(|| while !hw.spi.chip_select_asserted() {})
            .unwrap_err();
        assert_eq!(err, TickBudgetExceeded { budget: 1_000 });
        assert_eq!(sim.now(), 1_001);
    }

    #[test]
    fn budget_error_leaves_interrupts_unmasked() {
        let sim = Simulator::new(SimConfig {
            tick_budget: 500,
            ..SimConfig::default()
        });
        let mut hw = sim.peripherals();
        let err = sim.within_budget(|| {
            let _cs = crate::irq::CriticalSection::enter(&mut hw.irq);
            while hw.timer.counter() != u32::MAX {}
        });
        assert!(err.is_err());
        assert!(sim.interrupts_enabled());
    }

    #[test]
    fn interrupt_acknowledgements_never_fire_without_a_session() {
        let sim = Simulator::new(SimConfig {
            tick_budget: 20_000,
            ..SimConfig::default()
        });
        let mut tester = sim.tester();
        sim.acknowledge_interrupts(1, 10);
        assert!(sim.run(&mut tester).is_err());
    }
}

//! Capability interfaces the engines are written against.

use bitflags::bitflags;

/// Depth of the SPI transmit and receive FIFOs, in words.
pub const FIFO_DEPTH: usize = 8;

pub const MIN_DATA_BIT_LENGTH: u8 = 4;
pub const MAX_DATA_BIT_LENGTH: u8 = 16;

bitflags! {
    /// Snapshot of the SPI status register.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SpiStatus: u8 {
        /// Transmit FIFO empty.
        const TFE = 1 << 0;
        /// Transmit FIFO not full.
        const TNF = 1 << 1;
        /// Receive FIFO not empty.
        const RNE = 1 << 2;
        /// Receive FIFO full.
        const RFF = 1 << 3;
        /// Busy shifting a frame.
        const BSY = 1 << 4;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SpiDataMode {
    #[default]
    Mode0,
    Mode1,
    Mode2,
    Mode3,
}

impl SpiDataMode {
    /// Unknown mode numbers fall back to mode 0.
    pub fn from_wire(raw: u8) -> Self {
        match raw {
            1 => SpiDataMode::Mode1,
            2 => SpiDataMode::Mode2,
            3 => SpiDataMode::Mode3,
            _ => SpiDataMode::Mode0,
        }
    }

    pub fn to_wire(self) -> u8 {
        match self {
            SpiDataMode::Mode0 => 0,
            SpiDataMode::Mode1 => 1,
            SpiDataMode::Mode2 => 2,
            SpiDataMode::Mode3 => 3,
        }
    }
}

/// Frame format the SPI slave is programmed with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataFormat {
    pub mode: SpiDataMode,
    pub bits: u8,
}

impl DataFormat {
    /// Format used for command and response traffic.
    pub const CONTROL: DataFormat = DataFormat {
        mode: SpiDataMode::Mode0,
        bits: 8,
    };

    /// Builds a format from command parameters. Bit lengths the peripheral
    /// cannot do are replaced by 8.
    pub fn new(mode: SpiDataMode, bits: u8) -> Self {
        let bits = if (MIN_DATA_BIT_LENGTH..=MAX_DATA_BIT_LENGTH).contains(&bits) {
            bits
        } else {
            8
        };
        Self { mode, bits }
    }

    pub fn mask(self) -> u16 {
        ((1u32 << self.bits) - 1) as u16
    }

    /// Words wider than a byte occupy two bytes in checksums.
    pub fn is_wide(self) -> bool {
        self.bits > 8
    }
}

pub trait SpiSlavePeripheral {
    fn status(&mut self) -> SpiStatus;
    /// Pushes a word into the transmit FIFO. Ignored by the hardware when full.
    fn write(&mut self, word: u16);
    /// Pops a word from the receive FIFO.
    fn read(&mut self) -> u16;
    fn chip_select_asserted(&mut self) -> bool;
    /// Reprograms the frame format. The block is disabled while doing so,
    /// which drops whatever is still queued in either FIFO.
    fn set_data_format(&mut self, format: DataFormat);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureEdge {
    Disabled,
    Falling,
}

bitflags! {
    /// What the match unit does when the counter reaches the match value.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MatchActions: u8 {
        const INTERRUPT = 1 << 0;
        const RESET = 1 << 1;
        const STOP = 1 << 2;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PinLevel {
    Low,
    High,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchOutputAction {
    Nothing,
    DriveLow,
    DriveHigh,
    Toggle,
}

/// External match output: the current level and what a match does to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MatchOutput {
    pub level: PinLevel,
    pub on_match: MatchOutputAction,
}

impl MatchOutput {
    pub const IDLE: MatchOutput = MatchOutput {
        level: PinLevel::High,
        on_match: MatchOutputAction::Nothing,
    };
}

/// Counter with one capture channel and one match channel.
pub trait CaptureTimer {
    /// Holds the counter in reset: stopped, counter and capture cleared.
    fn reset(&mut self);
    fn start(&mut self);
    /// Reads the enable bit. A stop-on-match clears it.
    fn is_running(&mut self) -> bool;
    fn counter(&mut self) -> u32;
    fn capture(&mut self) -> u32;
    fn set_capture_edge(&mut self, edge: CaptureEdge);
    fn set_match(&mut self, value: u32, actions: MatchActions);
    fn set_match_actions(&mut self, actions: MatchActions);
    fn set_match_output(&mut self, output: MatchOutput);
    fn set_match_output_level(&mut self, level: PinLevel);
    fn clear_interrupt(&mut self);
}

/// Falling-edge flag on the SCK input, independent of the SPI block.
pub trait EdgeSenseInput {
    fn enable_falling_edge(&mut self);
    fn disable_falling_edge(&mut self);
    fn clear_falling_edge(&mut self);
    fn falling_edge_detected(&mut self) -> bool;
}

pub trait InterruptController {
    /// Masks interrupts and returns whether they were enabled before.
    fn disable_interrupts(&mut self) -> bool;
    fn enable_interrupts(&mut self);
    fn enable_timer_interrupt(&mut self);
    fn disable_timer_interrupt(&mut self);
}

pub trait PinControl {
    /// Routes the interrupt output pin to the timer match output.
    fn mux_interrupt_output(&mut self);
    /// Returns the interrupt output pin to plain GPIO.
    fn demux_interrupt_output(&mut self);
    fn set_activity_led(&mut self, on: bool);
}

/// Everything the engines touch, already brought up.
pub struct Peripherals<S, T, E, I, P> {
    pub spi: S,
    pub timer: T,
    pub sck: E,
    pub irq: I,
    pub pins: P,
}

/// Answers to the reference clock queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Clocks {
    /// Clock feeding the SPI block.
    pub spi_clock_hz: u32,
    /// Clock the capture timer counts, reported as the measurement frequency.
    pub core_clock_hz: u32,
}

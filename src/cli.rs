use anyhow::anyhow;
use clap::{Args, Parser, Subcommand};

use spi_tester::sim::SimConfig;

#[derive(Parser, Debug, Clone)]
#[command(
    name = "spi-tester",
    about = "SPI slave tester engines driven by a scripted master on a simulated board"
)]
pub struct Cli {
    /// -v info, -vv debug, -vvv trace
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,
    /// Serial device to send diagnostics to instead of stderr
    #[arg(long, global = true)]
    pub log_port: Option<String>,
    /// Baud rate of the diagnostics port
    #[arg(long, global = true, default_value_t = 115_200)]
    pub log_baud: u32,
    #[command(flatten)]
    pub sim: SimOpts,
    #[command(subcommand)]
    pub cmd: Cmd,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Cmd {
    /// Query the device information block
    DeviceInfo,
    /// Capture one transfer and check it
    Capture(CaptureOpts),
    /// Run a periodic interrupt session and report acknowledgement latency
    Periodic(PeriodicOpts),
}

#[derive(Args, Debug, Clone)]
pub struct SimOpts {
    /// Capture timer rate; one simulator tick is one count
    #[arg(long, global = true, default_value_t = 1_000_000)]
    pub core_clock_hz: u32,
    /// SPI peripheral clock
    #[arg(long, global = true, default_value_t = 60_000_000)]
    pub spi_clock_hz: u32,
    /// Ticks per SCK period
    #[arg(long, global = true, default_value_t = 2)]
    pub bit_ticks: u64,
    /// Timer counts per tick
    #[arg(long, global = true, default_value_t = 1)]
    pub timer_step: u32,
    /// Ticks each tester register access takes
    #[arg(long, global = true, default_value_t = 1)]
    pub access_ticks: u64,
    /// Abort a run that takes more ticks than this
    #[arg(long, global = true, default_value_t = 50_000_000)]
    pub tick_budget: u64,
}

impl SimOpts {
    pub fn config(&self) -> SimConfig {
        SimConfig {
            core_clock_hz: self.core_clock_hz,
            spi_clock_hz: self.spi_clock_hz,
            bit_ticks: self.bit_ticks.max(1),
            timer_step: self.timer_step,
            access_ticks: self.access_ticks.max(1),
            tick_budget: self.tick_budget,
            ..SimConfig::default()
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct CaptureOpts {
    /// SPI mode
    #[arg(long, default_value_t = 0, value_parser = clap::value_parser!(u8).range(0..=3))]
    pub mode: u8,
    /// Bits per word
    #[arg(long, default_value_t = 8)]
    pub bits: u8,
    /// First word the tester sends (decimal or 0x hex)
    #[arg(long, default_value = "0", value_parser = parse_u16)]
    pub send_value: u16,
    /// First word the tester expects (decimal or 0x hex)
    #[arg(long, default_value = "0", value_parser = parse_u16)]
    pub receive_value: u16,
    /// Words in the transfer
    #[arg(long, default_value_t = 16)]
    pub count: usize,
    /// Flip the low bit of this word on the way to the tester
    #[arg(long)]
    pub corrupt_index: Option<usize>,
}

#[derive(Args, Debug, Clone)]
pub struct PeriodicOpts {
    /// Session length in seconds
    #[arg(long, default_value_t = 1)]
    pub duration: u16,
    /// Interrupts per second
    #[arg(long, default_value_t = 100)]
    pub frequency: u32,
    /// Ticks between the interrupt going low and the acknowledgement
    #[arg(long, default_value_t = 50)]
    pub ack_delay: u64,
    /// Acknowledgements to script (default: one per interrupt)
    #[arg(long)]
    pub acks: Option<usize>,
}

pub fn parse_u16(s: &str) -> anyhow::Result<u16> {
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u16::from_str_radix(hex, 16),
        None => s.parse(),
    };
    parsed.map_err(|_| anyhow!("expected a 16-bit value, decimal or 0x-prefixed hex"))
}

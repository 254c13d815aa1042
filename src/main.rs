use std::sync::Mutex;

use anyhow::Result;
use clap::Parser;
use tracing::Level;
use tracing_subscriber::fmt::writer::BoxMakeWriter;

use spi_tester::sim::Simulator;

mod cli;
mod port;
mod scenario;

fn init_logging(args: &cli::Cli) -> Result<()> {
    let level = match args.verbose {
        0 => Level::WARN,
        1 => Level::INFO,
        2 => Level::DEBUG,
        _ => Level::TRACE,
    };
    let (writer, ansi) = match &args.log_port {
        Some(dev) => {
            let port = port::open_log_port(dev, args.log_baud)?;
            (BoxMakeWriter::new(Mutex::new(port)), false)
        }
        None => (BoxMakeWriter::new(std::io::stderr), true),
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .with_ansi(ansi)
        .with_writer(writer)
        .init();
    Ok(())
}

fn main() -> Result<()> {
    let args = cli::Cli::parse();
    init_logging(&args)?;

    let sim = Simulator::new(args.sim.config());
    let mut tester = sim.tester();

    match &args.cmd {
        cli::Cmd::DeviceInfo => scenario::device_info(&sim, &mut tester).map(drop),
        cli::Cmd::Capture(opts) => scenario::capture(&sim, &mut tester, opts).map(drop),
        cli::Cmd::Periodic(opts) => scenario::periodic(&sim, &mut tester, opts).map(drop),
    }
}

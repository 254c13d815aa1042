//! SPI slave tester engines, written against the traits in [`hal`] and run
//! on the host by [`sim`].

pub mod capture;
pub mod frame;
pub mod hal;
pub mod irq;
pub mod periodic;
pub mod proto;
pub mod sim;
pub mod stats;
pub mod tester;
pub mod timer;
pub mod transport;

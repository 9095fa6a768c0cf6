//! # sdspi
//!
//! > An SD/MMC block device driver written in Embedded Rust
//!
//! This crate turns a raw SPI bus and a chip select line into a block device:
//! it powers the card up, works out which version of the protocol it speaks,
//! reads its capacity from the CSD register and then reads and writes 512
//! byte blocks. It is written in pure-Rust, is `#![no_std]` and does not use
//! `alloc` or `collections` to keep the memory footprint low. In the first
//! instance it is designed for readability and simplicity over performance.
//!
//! ## Using the crate
//!
//! You will need something that implements the [`Transport`] trait (or an
//! embedded-hal SPI peripheral wrapped in a [`HalTransport`]), an
//! `OutputPin` for chip select and a microsecond delay. The initialised
//! driver implements [`BlockDevice`], which is what a filesystem mounts
//! against.
//!
//! ```rust,ignore
//! use sdspi::{BlockDevice, HalTransport, SdMmcSpi, SpiConfig};
//!
//! let transport = HalTransport::new(spi, |spi, config: &SpiConfig| {
//!     spi.set_baudrate(config.baudrate);
//!     Ok(())
//! });
//! let card = match SdMmcSpi::new(transport, cs, delay).acquire() {
//!     Ok(card) => card,
//!     Err((e, _card)) => panic!("no card: {:?}", e),
//! };
//! writeln!(uart, "Card size {} bytes", card.card_size_bytes()).unwrap();
//!
//! let mut block = [0u8; 512];
//! card.read_blocks(0, &mut block)?;
//! ```
//!
//! ## Features
//!
//! * `log` (default): log messages through the `log` crate.
//! * `defmt-log`: By turning off the default features and enabling the
//!   `defmt-log` feature you can configure this crate to log messages over
//!   defmt instead.
//! * `refcell-blockdevice` (default): implement [`BlockDevice`] for
//!   `RefCell<T>`, so one card can be shared by several users.
//! * `alloc`: add [`Transport::read`], which returns an owned buffer.
//!
//! Make sure that either the `log` feature or the `defmt-log` feature is enabled.

#![cfg_attr(not(test), no_std)]
#![warn(missing_docs)]

// ****************************************************************************
//
// Imports
//
// ****************************************************************************

#[cfg(feature = "alloc")]
extern crate alloc;

#[cfg(all(feature = "defmt-log", feature = "log"))]
compile_error!("Cannot enable both log and defmt-log");

#[cfg(all(not(feature = "defmt-log"), not(feature = "log")))]
compile_error!("Must enable either log or defmt-log");

#[macro_use]
mod structure;

pub mod block_device;
pub mod sdmmc;
pub mod sdmmc_proto;
pub mod transport;

pub use crate::block_device::{BlockDevice, MemoryBlockDevice, MemoryError, BLOCK_SIZE};
pub use crate::sdmmc::Error as DriverError;
pub use crate::sdmmc::{
    AcquireOpts, CardVersion, CommandOpts, Geometry, Initialized, NotInit, SdMmcSpi, SpiBus,
};
pub use crate::transport::{HalTransport, SpiConfig, Transport};

// ****************************************************************************
//
// End Of File
//
// ****************************************************************************

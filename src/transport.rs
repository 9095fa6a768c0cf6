//! sdspi - Byte transport
//!
//! The raw SPI side of the driver. The card only ever sees bytes clocked
//! out of and into this trait; chip select is a separate
//! [`OutputPin`](embedded_hal::digital::v2::OutputPin) so we can clock bytes
//! with the card deselected.

use core::fmt::Debug;

use embedded_hal::blocking::spi::{Transfer, Write};
use embedded_hal::spi::{Mode, Phase, Polarity, MODE_0};

#[cfg(feature = "alloc")]
use alloc::vec::Vec;

/// Bus settings applied through [`Transport::configure`].
#[derive(Copy, Clone, PartialEq)]
pub struct SpiConfig {
    /// SPI clock rate in Hz
    pub baudrate: u32,
    /// Clock polarity and phase
    pub mode: Mode,
}

impl SpiConfig {
    /// SPI mode 0 (polarity 0, phase 0) at the given clock rate.
    pub fn new(baudrate: u32) -> SpiConfig {
        SpiConfig {
            baudrate,
            mode: MODE_0,
        }
    }
}

// embedded-hal's `Mode` doesn't implement `Debug`
impl core::fmt::Debug for SpiConfig {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SpiConfig")
            .field("baudrate", &self.baudrate)
            .field("idle_high", &(self.mode.polarity == Polarity::IdleHigh))
            .field(
                "second_edge",
                &(self.mode.phase == Phase::CaptureOnSecondTransition),
            )
            .finish()
    }
}

/// A byte-oriented, full-duplex SPI peripheral.
pub trait Transport {
    /// The errors that the peripheral can return. Must be debug formattable.
    type Error: Debug;

    /// Clock out `bytes`, discarding whatever comes back.
    fn write(&mut self, bytes: &[u8]) -> Result<(), Self::Error>;

    /// Fill `buf` from the bus, clocking out `fill` for every byte.
    fn read_into(&mut self, buf: &mut [u8], fill: u8) -> Result<(), Self::Error>;

    /// Clock out `out` while receiving into `in_buf`. Both slices have the
    /// same length.
    fn duplex(&mut self, out: &[u8], in_buf: &mut [u8]) -> Result<(), Self::Error>;

    /// Change clock rate and mode.
    fn configure(&mut self, config: &SpiConfig) -> Result<(), Self::Error>;

    /// Receive a single byte while clocking out `fill`.
    fn read_byte(&mut self, fill: u8) -> Result<u8, Self::Error> {
        let mut byte = [0u8];
        self.read_into(&mut byte, fill)?;
        Ok(byte[0])
    }

    /// Receive `n` bytes into a new buffer while clocking out `fill`.
    #[cfg(feature = "alloc")]
    fn read(&mut self, n: usize, fill: u8) -> Result<Vec<u8>, Self::Error> {
        let mut buf = alloc::vec![0u8; n];
        self.read_into(&mut buf, fill)?;
        Ok(buf)
    }
}

impl<T> Transport for &mut T
where
    T: Transport,
{
    type Error = T::Error;

    fn write(&mut self, bytes: &[u8]) -> Result<(), Self::Error> {
        (*self).write(bytes)
    }

    fn read_into(&mut self, buf: &mut [u8], fill: u8) -> Result<(), Self::Error> {
        (*self).read_into(buf, fill)
    }

    fn duplex(&mut self, out: &[u8], in_buf: &mut [u8]) -> Result<(), Self::Error> {
        (*self).duplex(out, in_buf)
    }

    fn configure(&mut self, config: &SpiConfig) -> Result<(), Self::Error> {
        (*self).configure(config)
    }
}

/// Adapts a blocking embedded-hal SPI peripheral into a [`Transport`].
///
/// embedded-hal has no notion of changing the clock after construction, so
/// the caller supplies `reclock`, which is handed the peripheral and the new
/// settings whenever the driver asks for a different clock rate.
pub struct HalTransport<SPI, F> {
    spi: SPI,
    reclock: F,
}

impl<SPI, F, E> HalTransport<SPI, F>
where
    SPI: Transfer<u8, Error = E> + Write<u8, Error = E>,
    F: FnMut(&mut SPI, &SpiConfig) -> Result<(), E>,
{
    /// Wrap `spi`, using `reclock` to apply clock changes.
    pub fn new(spi: SPI, reclock: F) -> Self {
        HalTransport { spi, reclock }
    }

    /// Get a temporary borrow on the underlying SPI device.
    pub fn spi(&mut self) -> &mut SPI {
        &mut self.spi
    }

    /// Give back the underlying SPI device.
    pub fn free(self) -> SPI {
        self.spi
    }
}

impl<SPI, F, E> Transport for HalTransport<SPI, F>
where
    SPI: Transfer<u8, Error = E> + Write<u8, Error = E>,
    F: FnMut(&mut SPI, &SpiConfig) -> Result<(), E>,
    E: Debug,
{
    type Error = E;

    fn write(&mut self, bytes: &[u8]) -> Result<(), E> {
        Write::write(&mut self.spi, bytes)
    }

    fn read_into(&mut self, buf: &mut [u8], fill: u8) -> Result<(), E> {
        for b in buf.iter_mut() {
            *b = fill;
        }
        Transfer::transfer(&mut self.spi, buf)?;
        Ok(())
    }

    fn duplex(&mut self, out: &[u8], in_buf: &mut [u8]) -> Result<(), E> {
        in_buf.copy_from_slice(out);
        Transfer::transfer(&mut self.spi, in_buf)?;
        Ok(())
    }

    fn configure(&mut self, config: &SpiConfig) -> Result<(), E> {
        (self.reclock)(&mut self.spi, config)
    }
}

// ****************************************************************************
//
// Unit Tests
//
// ****************************************************************************


// ****************************************************************************
//
// End Of File
//
// ****************************************************************************

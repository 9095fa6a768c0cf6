//! sdspi - SDMMC Protocol
//!
//! Implements the SD/MMC protocol on some generic SPI interface.
//!
//! This is currently optimised for readability and debugability, not
//! performance.

mod bus;
mod geometry;

pub use bus::{
    CommandOpts, SpiBus, BUSY_POLL_DELAY_US, BUSY_RETRIES, CMD_RETRIES, READ_POLL_DELAY_US,
};
pub use geometry::Geometry;

use embedded_hal::{blocking::delay::DelayUs, digital::v2::OutputPin};

use crate::block_device::{BlockDevice, BLOCK_SIZE};
use crate::sdmmc_proto::*;
use crate::transport::{SpiConfig, Transport};

#[cfg(feature = "log")]
use log::{debug, trace, warn};

#[cfg(feature = "defmt-log")]
use defmt::{debug, trace, warn};

/// How many times we send GO_IDLE_STATE before deciding there is no card.
pub const CMD0_ATTEMPTS: u32 = 5;

/// Pause at the top of every ACMD41 round for a version 2 card.
pub const INIT_POLL_DELAY_US: u32 = 50_000;

/// Represents an SD Card on an SPI bus.
///
/// Built from a [`Transport`], a Chip Select pin and a delay source. We need
/// Chip Select to be separate so we can clock out some bytes without Chip
/// Select asserted (which puts the card into SPI mode).
pub struct SdMmcSpi<T, CS, D, State>
where
    T: Transport,
    CS: OutputPin,
    D: DelayUs<u32>,
{
    bus: SpiBus<T, CS, D>,
    state: State,
}

/// The possible errors `SdMmcSpi` can generate.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Error {
    /// We got an error from the SPI peripheral
    Transport,
    /// Couldn't set the chip select pin
    GpioError,
    /// The card never reported the idle state after a reset
    NoCard,
    /// The card gave an unexpected answer to SEND_IF_COND
    UnsupportedCard,
    /// The card didn't become ready within the ACMD41 retry budget
    InitTimeout,
    /// The CSD register has a structure version we don't understand
    UnsupportedCsd,
    /// The card refused a 512 byte block length
    BlockSizeRejected,
    /// We didn't get a response when executing this command
    CommandTimeout(u8),
    /// We didn't get a start token when reading data from the card
    ReadTimeout,
    /// The card rejected a data block; carries the data response byte
    WriteRejected(u8),
    /// We didn't get a response when waiting for the card to not be busy
    BusyTimeout,
    /// This address setting command returned a non-zero status
    IoErrorOnCommand(u8),
    /// Buffers must be a non-zero multiple of 512 bytes
    BadBufferLength(usize),
    /// The block number doesn't fit the card's address space
    AddressOverflow(u32),
}

/// The state of an SdMmcSpi if it is not initialized
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
pub struct NotInit;

/// The state of an SdMmcSpi if it is initialized
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct Initialized {
    version: CardVersion,
    cdv: u32,
    geometry: Geometry,
}

/// The card versions we tell apart during initialisation.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CardVersion {
    /// Rejects SEND_IF_COND; byte addressed
    V1,
    /// Accepts SEND_IF_COND; block addressed
    V2,
}

impl CardVersion {
    /// What a block number is multiplied by to form a command argument.
    pub fn address_multiplier(self) -> u32 {
        match self {
            CardVersion::V1 => BLOCK_SIZE as u32,
            CardVersion::V2 => 1,
        }
    }
}

/// Options for acquiring the card.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct AcquireOpts {
    /// SPI clock used while negotiating with the card. Cards must cope with
    /// 100-400 kHz here.
    pub init_baudrate: u32,
    /// SPI clock used once the card is up.
    pub baudrate: u32,
}

impl Default for AcquireOpts {
    fn default() -> Self {
        AcquireOpts {
            init_baudrate: 100_000,
            baudrate: 1_320_000,
        }
    }
}

impl<T, CS, D, State> SdMmcSpi<T, CS, D, State>
where
    T: Transport,
    CS: OutputPin,
    D: DelayUs<u32>,
{
    /// Get a temporary borrow on the underlying transport. Useful if you
    /// need to re-clock the SPI.
    pub fn transport<R, F>(&mut self, func: F) -> R
    where
        F: FnOnce(&mut T) -> R,
    {
        func(self.bus.transport())
    }

    /// Give back the transport, chip select pin and delay source.
    pub fn free(self) -> (T, CS, D) {
        self.bus.free()
    }
}

impl<T, CS, D> SdMmcSpi<T, CS, D, NotInit>
where
    T: Transport,
    CS: OutputPin,
    D: DelayUs<u32>,
{
    /// Create a new SD/MMC controller using a raw SPI interface.
    pub fn new(transport: T, cs: CS, delay: D) -> Self {
        SdMmcSpi {
            bus: SpiBus::new(transport, cs, delay),
            state: NotInit,
        }
    }

    /// Initializes the card into a known state
    pub fn acquire(self) -> Result<SdMmcSpi<T, CS, D, Initialized>, (Error, Self)> {
        self.acquire_with_opts(Default::default())
    }

    /// Initializes the card into a known state
    pub fn acquire_with_opts(
        mut self,
        options: AcquireOpts,
    ) -> Result<SdMmcSpi<T, CS, D, Initialized>, (Error, Self)> {
        debug!("acquiring card with opts: {:?}", options);
        match initialize(&mut self.bus, &options) {
            Ok(state) => Ok(SdMmcSpi {
                bus: self.bus,
                state,
            }),
            Err(e) => {
                self.bus.release().ok();
                Err((e, self))
            }
        }
    }
}

/// Treat a command timeout as "not yet" inside a retry loop.
fn tolerate_timeout(result: Result<u8, Error>) -> Result<Option<u8>, Error> {
    match result {
        Ok(r1) => Ok(Some(r1)),
        Err(Error::CommandTimeout(_)) => Ok(None),
        Err(e) => Err(e),
    }
}

fn initialize<T, CS, D>(
    bus: &mut SpiBus<T, CS, D>,
    options: &AcquireOpts,
) -> Result<Initialized, Error>
where
    T: Transport,
    CS: OutputPin,
    D: DelayUs<u32>,
{
    trace!("Reset card..");
    bus.configure(&SpiConfig::new(options.init_baudrate))?;
    // Supply minimum of 74 clock cycles without CS asserted.
    bus.power_up()?;

    // Enter SPI mode
    let mut idle = false;
    for attempt in 0..CMD0_ATTEMPTS {
        match tolerate_timeout(bus.card_command(CMD0, 0, CommandOpts::default()))? {
            Some(r1) if r1 == R1::IDLE_STATE.bits() => {
                idle = true;
                break;
            }
            Some(r1) => {
                warn!("CMD0 attempt {} got {:x}", attempt, r1);
            }
            None => {
                warn!("CMD0 attempt {} timed out", attempt);
            }
        }
    }
    if !idle {
        return Err(Error::NoCard);
    }

    // Check card version
    let r1 = bus.card_command(CMD8, IF_COND_CHECK, CommandOpts::default().trailing(4));
    let r1 = match tolerate_timeout(r1)? {
        Some(r1) => R1::from_bits_truncate(r1),
        None => return Err(Error::UnsupportedCard),
    };
    let version = if r1 == R1::IDLE_STATE {
        CardVersion::V2
    } else if r1 == R1::IDLE_STATE | R1::ILLEGAL_COMMAND {
        CardVersion::V1
    } else {
        warn!("CMD8 got {:x}", r1.bits());
        return Err(Error::UnsupportedCard);
    };
    debug!("Card version: {:?}", version);

    match version {
        CardVersion::V1 => wait_ready_v1(bus)?,
        CardVersion::V2 => wait_ready_v2(bus)?,
    }

    let csd = read_csd_register(bus)?;
    let geometry = Geometry::from_register(csd)?;
    debug!("Card has {} sectors", geometry.sector_count());

    let r1 = bus.card_command(CMD16, BLOCK_SIZE as u32, CommandOpts::default());
    if tolerate_timeout(r1)? != Some(0) {
        return Err(Error::BlockSizeRejected);
    }

    debug!("Switching to {} Hz", options.baudrate);
    bus.configure(&SpiConfig::new(options.baudrate))?;

    Ok(Initialized {
        version,
        cdv: version.address_multiplier(),
        geometry,
    })
}

fn wait_ready_v1<T, CS, D>(bus: &mut SpiBus<T, CS, D>) -> Result<(), Error>
where
    T: Transport,
    CS: OutputPin,
    D: DelayUs<u32>,
{
    for _ in 0..CMD_RETRIES {
        tolerate_timeout(bus.card_command(CMD55, 0, CommandOpts::default()))?;
        if tolerate_timeout(bus.card_command(ACMD41, 0, CommandOpts::default()))? == Some(0) {
            return Ok(());
        }
    }
    Err(Error::InitTimeout)
}

fn wait_ready_v2<T, CS, D>(bus: &mut SpiBus<T, CS, D>) -> Result<(), Error>
where
    T: Transport,
    CS: OutputPin,
    D: DelayUs<u32>,
{
    for _ in 0..CMD_RETRIES {
        bus.delay_us(INIT_POLL_DELAY_US);
        tolerate_timeout(bus.card_command(CMD58, 0, CommandOpts::default().trailing(4)))?;
        tolerate_timeout(bus.card_command(CMD55, 0, CommandOpts::default()))?;
        let r1 = bus.card_command(ACMD41, HOST_CAPACITY_SUPPORT, CommandOpts::default());
        if tolerate_timeout(r1)? == Some(0) {
            bus.card_command(CMD58, 0, CommandOpts::default().trailing(4))?;
            return Ok(());
        }
    }
    Err(Error::InitTimeout)
}

fn read_csd_register<T, CS, D>(bus: &mut SpiBus<T, CS, D>) -> Result<[u8; 16], Error>
where
    T: Transport,
    CS: OutputPin,
    D: DelayUs<u32>,
{
    let mut csd = [0u8; 16];
    let r1 = bus.card_command(CMD9, 0, CommandOpts::default().hold());
    if tolerate_timeout(r1)? != Some(0) {
        bus.release()?;
        return Err(Error::NoCard);
    }
    bus.read_block(&mut csd, true)?;
    Ok(csd)
}

/// How many blocks `len` bytes hold, if it is a whole number of them.
fn blocks_in(len: usize) -> Result<usize, Error> {
    if len == 0 || len % BLOCK_SIZE != 0 {
        return Err(Error::BadBufferLength(len));
    }
    Ok(len / BLOCK_SIZE)
}

impl<T, CS, D> SdMmcSpi<T, CS, D, Initialized>
where
    T: Transport,
    CS: OutputPin,
    D: DelayUs<u32>,
{
    /// Mark the card as unused, keeping the hardware.
    pub fn deinit(self) -> SdMmcSpi<T, CS, D, NotInit> {
        SdMmcSpi {
            bus: self.bus,
            state: NotInit,
        }
    }

    /// Which version of the protocol the card speaks.
    pub fn card_version(&self) -> CardVersion {
        self.state.version
    }

    /// 512 for byte addressed cards, 1 for block addressed ones.
    pub fn address_multiplier(&self) -> u32 {
        self.state.cdv
    }

    /// The card geometry found during initialisation.
    pub fn geometry(&self) -> Geometry {
        self.state.geometry
    }

    /// Return the usable size of this SD card in bytes.
    pub fn card_size_bytes(&self) -> u64 {
        self.state.geometry.capacity_bytes()
    }

    /// Read the 'card specific data' block.
    pub fn read_csd(&mut self) -> Result<Csd, Error> {
        let data = read_csd_register(&mut self.bus)?;
        Csd::from_bytes(data).ok_or(Error::UnsupportedCsd)
    }

    fn block_address(&self, start_block: u32) -> Result<u32, Error> {
        start_block
            .checked_mul(self.state.cdv)
            .ok_or(Error::AddressOverflow(start_block))
    }

    /// Send an address setting command, leaving chip select asserted for
    /// the data phase.
    fn start_transfer(&mut self, command: u8, address: u32) -> Result<(), Error> {
        let r1 = self
            .bus
            .card_command(command, address, CommandOpts::default().hold())?;
        if r1 != 0 {
            warn!("CMD{} @ {} got {:x}", command, address, r1);
            self.bus.release()?;
            return Err(Error::IoErrorOnCommand(command));
        }
        Ok(())
    }
}

impl<T, CS, D> BlockDevice for SdMmcSpi<T, CS, D, Initialized>
where
    T: Transport,
    CS: OutputPin,
    D: DelayUs<u32>,
{
    type Error = Error;

    /// Read one or more blocks, starting at the given block index.
    fn read_blocks(&mut self, start_block: u32, buf: &mut [u8]) -> Result<(), Self::Error> {
        let num_blocks = blocks_in(buf.len())?;
        let address = self.block_address(start_block)?;
        debug!("Read {} blocks @ {}", num_blocks, start_block);
        if num_blocks == 1 {
            // Start a single-block read
            self.start_transfer(CMD17, address)?;
            self.bus.read_block(buf, true)?;
        } else {
            // Start a multi-block read
            self.start_transfer(CMD18, address)?;
            let bus = &mut self.bus;
            let streamed = buf
                .chunks_mut(BLOCK_SIZE)
                .try_for_each(|block| bus.read_block(block, false));
            // Stop the read, even if a block failed
            let stopped =
                bus.card_command(CMD12, 0, CommandOpts::default().skip_leading_byte());
            if let Err(e) = streamed {
                warn!("Multi-block read stopped early: {:?}", e);
                return Err(e);
            }
            if stopped? != 0 {
                return Err(Error::IoErrorOnCommand(CMD12));
            }
        }
        Ok(())
    }

    /// Write one or more blocks, starting at the given block index.
    fn write_blocks(&mut self, start_block: u32, buf: &[u8]) -> Result<(), Self::Error> {
        let num_blocks = blocks_in(buf.len())?;
        let address = self.block_address(start_block)?;
        debug!("Writing {} blocks @ {}", num_blocks, start_block);
        if num_blocks == 1 {
            // Start a single-block write
            self.start_transfer(CMD24, address)?;
            self.bus.write_block(DATA_START_BLOCK, buf)?;
        } else {
            // Start a multi-block write
            self.start_transfer(CMD25, address)?;
            let bus = &mut self.bus;
            let written = buf
                .chunks(BLOCK_SIZE)
                .try_for_each(|block| bus.write_block(WRITE_MULTIPLE_TOKEN, block));
            // Stop the write, even if a block failed
            let stopped = bus.write_stop_token(STOP_TRAN_TOKEN);
            if let Err(e) = written {
                warn!("Multi-block write stopped early: {:?}", e);
                return Err(e);
            }
            stopped?;
        }
        Ok(())
    }

    /// Determine how many blocks this device can hold.
    fn block_count(&self) -> u32 {
        self.state.geometry.sector_count()
    }
}

// ****************************************************************************
//
// End Of File
//
// ****************************************************************************

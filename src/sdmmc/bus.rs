use embedded_hal::{blocking::delay::DelayUs, digital::v2::OutputPin};

use crate::block_device::BLOCK_SIZE;
use crate::sdmmc_proto::*;
use crate::transport::{SpiConfig, Transport};

use super::Error;

#[cfg(feature = "log")]
use log::{trace, warn};

#[cfg(feature = "defmt-log")]
use defmt::{trace, warn};

/// How many bytes we poll for a command response, a data start token, and
/// how many rounds the card gets to finish its ACMD41 initialisation.
pub const CMD_RETRIES: u32 = 1000;

/// Pause between polls for a data start token.
pub const READ_POLL_DELAY_US: u32 = 1_000;

/// How many bytes we poll while the card is busy programming a block.
pub const BUSY_RETRIES: u32 = 25_000;

/// Pause between polls of the busy signal.
pub const BUSY_POLL_DELAY_US: u32 = 10;

/// Filler bytes clocked with chip select deasserted at power up (128 clocks).
const POWER_UP_BYTES: usize = 16;

/// How [`SpiBus::send_command`] finishes off a command.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct CommandOpts {
    /// Filler bytes to clock out after the R1 byte, to get through the rest
    /// of an R3 or R7 response.
    pub trailing_bytes: u32,
    /// Deassert chip select once the response is in. Block transfers leave
    /// this off so the data phase follows on the same selection.
    pub release: bool,
    /// Throw away one byte before looking for the response (the stuff byte
    /// after STOP_TRANSMISSION).
    pub skip_leading_byte: bool,
}

impl Default for CommandOpts {
    fn default() -> Self {
        CommandOpts {
            trailing_bytes: 0,
            release: true,
            skip_leading_byte: false,
        }
    }
}

impl CommandOpts {
    /// Clock out `n` filler bytes after the response.
    pub fn trailing(self, n: u32) -> Self {
        CommandOpts {
            trailing_bytes: n,
            ..self
        }
    }

    /// Keep chip select asserted after the response.
    pub fn hold(self) -> Self {
        CommandOpts {
            release: false,
            ..self
        }
    }

    /// Discard one byte before polling for the response.
    pub fn skip_leading_byte(self) -> Self {
        CommandOpts {
            skip_leading_byte: true,
            ..self
        }
    }
}

/// The SPI transport and chip select of one card, plus the scratch buffers
/// every transaction goes through.
///
/// Chip select is tracked, so releasing twice is harmless and every error
/// path can release unconditionally.
pub struct SpiBus<T, CS, D>
where
    T: Transport,
    CS: OutputPin,
    D: DelayUs<u32>,
{
    transport: T,
    cs: CS,
    delay: D,
    selected: bool,
    command: [u8; 6],
    token: [u8; 1],
    crc: [u8; 2],
    filler: [u8; BLOCK_SIZE],
}

impl<T, CS, D> SpiBus<T, CS, D>
where
    T: Transport,
    CS: OutputPin,
    D: DelayUs<u32>,
{
    /// Take ownership of the transport, chip select pin and delay source.
    ///
    /// The pin is assumed to be high (deasserted) already.
    pub fn new(transport: T, cs: CS, delay: D) -> Self {
        SpiBus {
            transport,
            cs,
            delay,
            selected: false,
            command: [0; 6],
            token: [0; 1],
            crc: [0; 2],
            filler: [FILLER; BLOCK_SIZE],
        }
    }

    /// Give back the transport, chip select pin and delay source.
    pub fn free(self) -> (T, CS, D) {
        (self.transport, self.cs, self.delay)
    }

    /// Get a temporary borrow on the transport.
    pub fn transport(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Is chip select currently asserted?
    pub fn is_selected(&self) -> bool {
        self.selected
    }

    /// Apply new clock settings to the transport.
    pub fn configure(&mut self, config: &SpiConfig) -> Result<(), Error> {
        self.transport
            .configure(config)
            .map_err(|_e| Error::Transport)
    }

    /// Sleep for `us` microseconds.
    pub fn delay_us(&mut self, us: u32) {
        self.delay.delay_us(us);
    }

    /// Supply the card with its power up clocks while it is deselected.
    pub fn power_up(&mut self) -> Result<(), Error> {
        self.cs.set_high().map_err(|_| Error::GpioError)?;
        self.selected = false;
        self.transport
            .write(&self.filler[..POWER_UP_BYTES])
            .map_err(|_e| Error::Transport)
    }

    /// Assert chip select, if it isn't already.
    pub fn select(&mut self) -> Result<(), Error> {
        if !self.selected {
            self.cs.set_low().map_err(|_| Error::GpioError)?;
            self.selected = true;
        }
        Ok(())
    }

    /// Deassert chip select and clock one more byte, so the card lets go of
    /// MISO. Does nothing when already deselected.
    pub fn release(&mut self) -> Result<(), Error> {
        if self.selected {
            self.cs.set_high().map_err(|_| Error::GpioError)?;
            self.selected = false;
            self.transport
                .write(&self.filler[..1])
                .map_err(|_e| Error::Transport)?;
        }
        Ok(())
    }

    /// Receive a byte from the SD card by clocking out a filler byte.
    fn receive(&mut self) -> Result<u8, Error> {
        self.transport
            .read_into(&mut self.token, FILLER)
            .map_err(|_e| Error::Transport)?;
        Ok(self.token[0])
    }

    fn send(&mut self, bytes: &[u8]) -> Result<(), Error> {
        self.transport.write(bytes).map_err(|_e| Error::Transport)
    }

    fn on_error<R>(&mut self, result: Result<R, Error>) -> Result<R, Error> {
        if result.is_err() {
            self.release().ok();
        }
        result
    }

    /// Send a command frame and return its R1 response byte.
    ///
    /// Chip select is asserted for the command, and deasserted again
    /// afterwards if `opts.release` is set or if anything fails.
    pub fn send_command(
        &mut self,
        command: u8,
        arg: u32,
        crc: u8,
        opts: CommandOpts,
    ) -> Result<u8, Error> {
        let result = self.command_inner(command, arg, crc, opts);
        self.on_error(result)
    }

    /// Send a command frame carrying its correct CRC7.
    pub fn card_command(&mut self, command: u8, arg: u32, opts: CommandOpts) -> Result<u8, Error> {
        let crc = command_frame_with_crc(command, arg)[5];
        self.send_command(command, arg, crc, opts)
    }

    fn command_inner(
        &mut self,
        command: u8,
        arg: u32,
        crc: u8,
        opts: CommandOpts,
    ) -> Result<u8, Error> {
        self.select()?;
        self.command = command_frame(command, arg, crc);
        self.transport
            .write(&self.command)
            .map_err(|_e| Error::Transport)?;

        if opts.skip_leading_byte {
            let _stuff = self.receive()?;
        }

        let r1 = self.wait_response(command)?;
        trace!("CMD{} arg {:x} -> R1 {:x}", command, arg, r1);

        for _ in 0..opts.trailing_bytes {
            self.transport
                .write(&self.filler[..1])
                .map_err(|_e| Error::Transport)?;
        }
        if opts.release {
            self.release()?;
        }
        Ok(r1)
    }

    fn wait_response(&mut self, command: u8) -> Result<u8, Error> {
        for _ in 0..CMD_RETRIES {
            let byte = self.receive()?;
            if R1::is_response(byte) {
                return Ok(byte);
            }
        }
        warn!("CMD{} got no response", command);
        Err(Error::CommandTimeout(command))
    }

    /// Read one data block into `buf`: wait for the start token, clock in
    /// the payload and discard the CRC.
    ///
    /// With `release` unset chip select stays asserted, for the next block
    /// of a multi-block read.
    pub fn read_block(&mut self, buf: &mut [u8], release: bool) -> Result<(), Error> {
        let result = self.read_block_inner(buf, release);
        self.on_error(result)
    }

    fn read_block_inner(&mut self, buf: &mut [u8], release: bool) -> Result<(), Error> {
        self.select()?;

        let mut attempts = CMD_RETRIES;
        while self.receive()? != DATA_START_BLOCK {
            attempts -= 1;
            if attempts == 0 {
                warn!("No start token after {} polls", CMD_RETRIES);
                return Err(Error::ReadTimeout);
            }
            self.delay.delay_us(READ_POLL_DELAY_US);
        }

        for chunk in buf.chunks_mut(BLOCK_SIZE) {
            let out = &self.filler[..chunk.len()];
            self.transport
                .duplex(out, chunk)
                .map_err(|_e| Error::Transport)?;
        }
        // The card sends a CRC16 which we don't check
        self.transport
            .read_into(&mut self.crc, FILLER)
            .map_err(|_e| Error::Transport)?;

        if release {
            self.release()?;
        }
        Ok(())
    }

    /// Write one data block behind `token`, check the card took it and wait
    /// for it to finish programming.
    pub fn write_block(&mut self, token: u8, buf: &[u8]) -> Result<(), Error> {
        let result = self.write_block_inner(token, buf);
        self.on_error(result)
    }

    fn write_block_inner(&mut self, token: u8, buf: &[u8]) -> Result<(), Error> {
        self.select()?;
        self.token[0] = token;
        self.transport
            .write(&self.token)
            .map_err(|_e| Error::Transport)?;
        self.send(buf)?;
        // CRC is not checked by the card in SPI mode
        self.transport
            .write(&self.filler[..2])
            .map_err(|_e| Error::Transport)?;

        let status = self.receive()?;
        if (status & DATA_RES_MASK) != DATA_RES_ACCEPTED {
            warn!("Data block rejected, status {:x}", status);
            return Err(Error::WriteRejected(status));
        }
        self.wait_not_busy()?;
        self.release()
    }

    /// Send a lone token (the end of a multi-block write) and wait for the
    /// card to finish.
    pub fn write_stop_token(&mut self, token: u8) -> Result<(), Error> {
        let result = self.stop_token_inner(token);
        self.on_error(result)
    }

    fn stop_token_inner(&mut self, token: u8) -> Result<(), Error> {
        self.select()?;
        self.token[0] = token;
        self.transport
            .write(&self.token)
            .map_err(|_e| Error::Transport)?;
        self.transport
            .write(&self.filler[..1])
            .map_err(|_e| Error::Transport)?;
        self.wait_not_busy()?;
        self.release()
    }

    /// Spin until the card stops holding MISO low.
    fn wait_not_busy(&mut self) -> Result<(), Error> {
        for _ in 0..BUSY_RETRIES {
            if self.receive()? != 0x00 {
                return Ok(());
            }
            self.delay.delay_us(BUSY_POLL_DELAY_US);
        }
        warn!("Card still busy after {} polls", BUSY_RETRIES);
        Err(Error::BusyTimeout)
    }
}

// ****************************************************************************
//
// End Of File
//
// ****************************************************************************

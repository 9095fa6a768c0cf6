//! sdspi - Block Device support
//!
//! The contract a filesystem mounts against: whole 512-byte blocks, read
//! and written by block number.

#[cfg(feature = "refcell-blockdevice")]
mod refcell;

/// The size of every block we read or write.
pub const BLOCK_SIZE: usize = 512;

/// Represents a block device - a device which can read and write blocks (or
/// sectors). Only supports devices which are <= 2 TiB in size.
///
/// Buffers passed to `read_blocks` and `write_blocks` must be a non-zero
/// multiple of [`BLOCK_SIZE`] bytes long.
pub trait BlockDevice {
    /// The errors that the `BlockDevice` can return. Must be debug formattable.
    type Error: core::fmt::Debug;
    /// Read one or more blocks, starting at the given block index.
    fn read_blocks(&mut self, start_block: u32, buf: &mut [u8]) -> Result<(), Self::Error>;
    /// Write one or more blocks, starting at the given block index.
    fn write_blocks(&mut self, start_block: u32, buf: &[u8]) -> Result<(), Self::Error>;
    /// Determine how many blocks this device can hold.
    fn block_count(&self) -> u32;
    /// The size of a block in bytes.
    fn block_size(&self) -> u32 {
        BLOCK_SIZE as u32
    }
}

impl<T> BlockDevice for &mut T
where
    T: BlockDevice,
{
    type Error = T::Error;

    fn read_blocks(&mut self, start_block: u32, buf: &mut [u8]) -> Result<(), Self::Error> {
        (*self).read_blocks(start_block, buf)
    }

    fn write_blocks(&mut self, start_block: u32, buf: &[u8]) -> Result<(), Self::Error> {
        (*self).write_blocks(start_block, buf)
    }

    fn block_count(&self) -> u32 {
        (**self).block_count()
    }

    fn block_size(&self) -> u32 {
        (**self).block_size()
    }
}

/// The errors a [`MemoryBlockDevice`] can return.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum MemoryError {
    /// Buffers must be a non-zero multiple of 512 bytes
    BadBufferLength(usize),
    /// The transfer runs past the end of the memory
    OutOfRange {
        /// First block of the transfer
        start_block: u32,
        /// Blocks available
        block_count: u32,
    },
}

/// A block device backed by a byte slice. Handy for testing the layers
/// above the card.
#[derive(Debug)]
pub struct MemoryBlockDevice<'a> {
    memory: &'a mut [u8],
}

impl<'a> MemoryBlockDevice<'a> {
    /// Use `memory` as the device contents. Any trailing partial block is
    /// ignored.
    pub fn new(memory: &'a mut [u8]) -> Self {
        Self { memory }
    }

    fn range(
        &self,
        start_block: u32,
        len: usize,
    ) -> Result<core::ops::Range<usize>, MemoryError> {
        if len == 0 || len % BLOCK_SIZE != 0 {
            return Err(MemoryError::BadBufferLength(len));
        }
        let out_of_range = MemoryError::OutOfRange {
            start_block,
            block_count: self.block_count(),
        };
        let blk_start = (start_block as usize)
            .checked_mul(BLOCK_SIZE)
            .ok_or(out_of_range)?;
        let blk_end = blk_start.checked_add(len).ok_or(out_of_range)?;
        if blk_end > self.block_count() as usize * BLOCK_SIZE {
            return Err(out_of_range);
        }
        Ok(blk_start..blk_end)
    }
}

impl<'a> BlockDevice for MemoryBlockDevice<'a> {
    type Error = MemoryError;

    fn read_blocks(&mut self, start_block: u32, buf: &mut [u8]) -> Result<(), Self::Error> {
        let range = self.range(start_block, buf.len())?;
        buf.copy_from_slice(&self.memory[range]);
        Ok(())
    }

    fn write_blocks(&mut self, start_block: u32, buf: &[u8]) -> Result<(), Self::Error> {
        let range = self.range(start_block, buf.len())?;
        self.memory[range].copy_from_slice(buf);
        Ok(())
    }

    fn block_count(&self) -> u32 {
        (self.memory.len() / BLOCK_SIZE) as u32
    }
}


// ****************************************************************************
//
// End Of File
//
// ****************************************************************************

use core::cell::RefCell;

use super::BlockDevice;

impl<T> BlockDevice for RefCell<T>
where
    T: BlockDevice,
{
    type Error = T::Error;

    fn read_blocks(&mut self, start_block: u32, buf: &mut [u8]) -> Result<(), Self::Error> {
        let mut underlying = self.borrow_mut();
        underlying.read_blocks(start_block, buf)
    }

    fn write_blocks(&mut self, start_block: u32, buf: &[u8]) -> Result<(), Self::Error> {
        let mut underlying = self.borrow_mut();
        underlying.write_blocks(start_block, buf)
    }

    fn block_count(&self) -> u32 {
        self.borrow().block_count()
    }

    fn block_size(&self) -> u32 {
        self.borrow().block_size()
    }
}

impl<T> BlockDevice for &RefCell<T>
where
    T: BlockDevice,
{
    type Error = T::Error;

    fn read_blocks(&mut self, start_block: u32, buf: &mut [u8]) -> Result<(), Self::Error> {
        let mut underlying = self.borrow_mut();
        underlying.read_blocks(start_block, buf)
    }

    fn write_blocks(&mut self, start_block: u32, buf: &[u8]) -> Result<(), Self::Error> {
        let mut underlying = self.borrow_mut();
        underlying.write_blocks(start_block, buf)
    }

    fn block_count(&self) -> u32 {
        self.borrow().block_count()
    }

    fn block_size(&self) -> u32 {
        self.borrow().block_size()
    }
}

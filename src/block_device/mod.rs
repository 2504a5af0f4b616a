//! embedded-sdc-spi - Block Device support
//!
//! Generic code for handling block devices.

#[cfg(feature = "refcell-blockdevice")]
mod refcell;

mod block;
pub use block::*;

/// Represents a block device - a device which can read and write blocks (or
/// sectors). Only supports devices which are <= 2 TiB in size.
pub trait BlockDevice {
    /// The errors that the `BlockDevice` can return. Must be debug formattable.
    type Error: core::fmt::Debug;
    /// Read one or more blocks, starting at the given block index.
    fn read(
        &mut self,
        blocks: &mut [Block],
        start_block_idx: BlockIdx,
        reason: &str,
    ) -> Result<(), Self::Error>;
    /// Write one or more blocks, starting at the given block index.
    fn write(&mut self, blocks: &[Block], start_block_idx: BlockIdx) -> Result<(), Self::Error>;
    /// Determine how many blocks this device can hold.
    fn num_blocks(&mut self) -> Result<BlockCount, Self::Error>;

    /// Read a single block.
    fn read_block(&mut self, block_idx: BlockIdx) -> Result<Block, Self::Error> {
        let mut blocks = [Block::new()];
        self.read(&mut blocks, block_idx, "read_block")?;
        let [block] = blocks;
        Ok(block)
    }
}

impl<T> BlockDevice for &mut T
where
    T: BlockDevice,
{
    type Error = T::Error;

    fn read(
        &mut self,
        blocks: &mut [Block],
        start_block_idx: BlockIdx,
        reason: &str,
    ) -> Result<(), Self::Error> {
        (*self).read(blocks, start_block_idx, reason)
    }

    fn write(&mut self, blocks: &[Block], start_block_idx: BlockIdx) -> Result<(), Self::Error> {
        (*self).write(blocks, start_block_idx)
    }

    fn num_blocks(&mut self) -> Result<BlockCount, Self::Error> {
        (*self).num_blocks()
    }
}

/// The only thing that can go wrong with a [`MemoryBlockDevice`].
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum MemoryError {
    /// The request ran past the end of the backing memory
    OutOfRange { num_blocks: BlockCount },
}

/// A block device over a byte slice. The slice length is rounded down to a
/// whole number of blocks.
#[derive(Debug)]
pub struct MemoryBlockDevice<'a> {
    memory: &'a mut [u8],
}

impl<'a> MemoryBlockDevice<'a> {
    pub fn new(memory: &'a mut [u8]) -> Self {
        Self { memory }
    }

    fn block_count(&self) -> BlockCount {
        BlockCount((self.memory.len() / Block::LEN) as u32)
    }

    fn span(&self, start_block_idx: BlockIdx, len: usize) -> Result<(usize, usize), MemoryError> {
        let num_blocks = self.block_count();
        let start = start_block_idx.0 as usize;
        if start + len > num_blocks.0 as usize {
            return Err(MemoryError::OutOfRange { num_blocks });
        }
        Ok((start * Block::LEN, (start + len) * Block::LEN))
    }
}

impl<'a> BlockDevice for MemoryBlockDevice<'a> {
    type Error = MemoryError;

    fn read(
        &mut self,
        blocks: &mut [Block],
        start_block_idx: BlockIdx,
        _reason: &str,
    ) -> Result<(), Self::Error> {
        let (start, end) = self.span(start_block_idx, blocks.len())?;
        for (block, chunk) in blocks
            .iter_mut()
            .zip(self.memory[start..end].chunks_exact(Block::LEN))
        {
            block.contents.copy_from_slice(chunk);
        }
        Ok(())
    }

    fn write(&mut self, blocks: &[Block], start_block_idx: BlockIdx) -> Result<(), Self::Error> {
        let (start, end) = self.span(start_block_idx, blocks.len())?;
        for (block, chunk) in blocks
            .iter()
            .zip(self.memory[start..end].chunks_exact_mut(Block::LEN))
        {
            chunk.copy_from_slice(&block.contents);
        }
        Ok(())
    }

    fn num_blocks(&mut self) -> Result<BlockCount, Self::Error> {
        Ok(self.block_count())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_device_round_trip() {
        let mut memory = vec![0u8; 4 * Block::LEN + 100];
        let mut bd = MemoryBlockDevice::new(&mut memory);
        assert_eq!(bd.num_blocks().unwrap(), BlockCount(4));

        let mut block = Block::new();
        block.contents[0] = 0xAB;
        block.contents[511] = 0xCD;
        bd.write(&[block.clone(), block], BlockIdx(2)).unwrap();

        let back = bd.read_block(BlockIdx(3)).unwrap();
        assert_eq!(back.contents[0], 0xAB);
        assert_eq!(back.contents[511], 0xCD);
        assert_eq!(memory[2 * 512], 0xAB);
    }

    #[test]
    fn memory_device_range_checks() {
        let mut memory = vec![0u8; 2 * Block::LEN];
        let mut bd = MemoryBlockDevice::new(&mut memory);
        assert_eq!(
            bd.write(&[Block::new(), Block::new()], BlockIdx(1)),
            Err(MemoryError::OutOfRange {
                num_blocks: BlockCount(2)
            })
        );
        assert!(bd.read_block(BlockIdx(2)).is_err());
        assert!(bd.read_block(BlockIdx(1)).is_ok());
    }
}

//! Command descriptor pool.
//!
//! One DMA region is carved into equally sized, 128-byte aligned blocks at
//! start-up. Requests borrow a block by index and hand it back afterwards, so
//! descriptor memory is never allocated on the submission path.

use tracing::debug;

use crate::{
    constants::trd,
    dma::{DmaAllocator, DmaRegion},
    error::{Result, UfsError},
};

/// A block on loan from the pool.
#[derive(Debug, PartialEq, Eq)]
pub struct PoolBlock {
    index: usize,
    address: u64,
}

impl PoolBlock {
    /// Device address of the block.
    #[must_use]
    pub const fn address(&self) -> u64 {
        self.address
    }
}

#[derive(Debug)]
pub struct CommandDescriptorPool {
    backing: DmaRegion,
    block_size: usize,
    blocks: usize,
    free: Vec<usize>,
}

impl CommandDescriptorPool {
    /// Carve `blocks` blocks of `block_size` bytes out of `allocator`.
    ///
    /// The block size is rounded up to the command descriptor alignment.
    pub fn new(allocator: &mut dyn DmaAllocator, blocks: usize, block_size: usize) -> Result<Self> {
        if blocks == 0 || block_size == 0 {
            return Err(UfsError::InvalidParameter("descriptor pool geometry"));
        }
        let block_size = block_size.next_multiple_of(trd::UCD_ALIGN);
        let len = blocks
            .checked_mul(block_size)
            .ok_or(UfsError::InvalidParameter("descriptor pool geometry"))?;
        let backing = allocator.allocate(len, trd::UCD_ALIGN)?;
        debug!(
            "descriptor pool: {blocks} blocks of {block_size} bytes at {:#x}",
            backing.address
        );

        Ok(Self {
            backing,
            block_size,
            blocks,
            free: (0..blocks).rev().collect(),
        })
    }

    /// Borrow a block able to hold `len` bytes.
    pub fn acquire(&mut self, len: usize) -> Result<PoolBlock> {
        if len > self.block_size {
            return Err(UfsError::OutOfResources("command descriptor too large"));
        }
        let index = self
            .free
            .pop()
            .ok_or(UfsError::OutOfResources("command descriptor pool"))?;
        Ok(PoolBlock {
            index,
            address: self.backing.address + (index * self.block_size) as u64,
        })
    }

    /// Return a block to the pool.
    pub fn release(&mut self, block: PoolBlock) {
        debug_assert!(!self.free.contains(&block.index));
        self.free.push(block.index);
    }

    /// Number of blocks currently on loan.
    #[must_use]
    pub fn in_use(&self) -> usize {
        self.blocks - self.free.len()
    }

    #[must_use]
    pub const fn block_size(&self) -> usize {
        self.block_size
    }

    /// Give the backing memory back to the allocator it came from.
    pub fn destroy(self, allocator: &mut dyn DmaAllocator) {
        if self.in_use() != 0 {
            debug!("destroying descriptor pool with {} blocks on loan", self.in_use());
        }
        allocator.free(self.backing);
    }
}

//! Block allocator: a bitmap-backed free list over the data-block region.
//!
//! One bit per data block, LSB-first within each byte. Bit `n` set means
//! block `first_data_block + n` is allocated. The bitmap page itself is
//! mapped through the page cache but its page index is fixed at
//! construction.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::cache::PageCache;
use crate::error::{FsError, Result};

/// Index of a physical data block (as opposed to a logical offset within a
/// file).
pub type BlockIndex = u64;

pub struct BlockAllocator {
    cache: Arc<PageCache>,
    bitmap_page: u64,
    first_data_block: BlockIndex,
    max_blocks: u64,
    lock: Mutex<()>,
}

impl BlockAllocator {
    pub fn new(
        cache: Arc<PageCache>,
        bitmap_page: u64,
        first_data_block: BlockIndex,
        max_blocks: u64,
    ) -> Self {
        Self {
            cache,
            bitmap_page,
            first_data_block,
            max_blocks,
            lock: Mutex::new(()),
        }
    }

    /// Allocates the first free block, zeroes it, and returns its physical
    /// index. Fails [`FsError::OutOfSpace`] if the bitmap is full.
    pub fn allocate(&self) -> Result<BlockIndex> {
        let _guard = self.lock.lock();

        let bit = self.cache.with_page_ref(self.bitmap_page, |page| {
            find_first_clear_bit(page, self.max_blocks)
        })?;

        let Some(bit) = bit else {
            return Err(FsError::OutOfSpace);
        };

        self.cache.with_page(self.bitmap_page, |page| {
            set_bit(page, bit);
        })?;

        let block = self.first_data_block + bit;
        self.cache.zero_page(block)?;
        Ok(block)
    }

    /// Clears the bit for physical block `block`. Idempotent at the bit
    /// level: freeing an already-free block is a no-op.
    pub fn free(&self, block: BlockIndex) -> Result<()> {
        let _guard = self.lock.lock();
        let bit = block
            .checked_sub(self.first_data_block)
            .filter(|&b| b < self.max_blocks)
            .ok_or_else(|| {
                FsError::InvalidArgument(format!("block {block} is outside the data region"))
            })?;
        self.cache.with_page(self.bitmap_page, |page| {
            clear_bit(page, bit);
        })
    }

    /// Returns whether `block`'s bit is currently set.
    pub fn is_allocated(&self, block: BlockIndex) -> Result<bool> {
        let bit = block
            .checked_sub(self.first_data_block)
            .filter(|&b| b < self.max_blocks)
            .ok_or_else(|| {
                FsError::InvalidArgument(format!("block {block} is outside the data region"))
            })?;
        self.cache
            .with_page_ref(self.bitmap_page, |page| bit_is_set(page, bit))
    }
}

fn bit_is_set(page: &[u8], bit: u64) -> bool {
    let byte = (bit / 8) as usize;
    let mask = 1u8 << (bit % 8);
    page[byte] & mask != 0
}

fn set_bit(page: &mut [u8], bit: u64) {
    let byte = (bit / 8) as usize;
    let mask = 1u8 << (bit % 8);
    page[byte] |= mask;
}

fn clear_bit(page: &mut [u8], bit: u64) {
    let byte = (bit / 8) as usize;
    let mask = 1u8 << (bit % 8);
    page[byte] &= !mask;
}

fn find_first_clear_bit(page: &[u8], limit: u64) -> Option<u64> {
    let limit_bytes = limit.div_ceil(8) as usize;
    for (byte_idx, &byte) in page.iter().enumerate().take(limit_bytes) {
        if byte == 0xff {
            continue;
        }
        for bit in 0..8 {
            let n = (byte_idx as u64) * 8 + bit;
            if n >= limit {
                return None;
            }
            if byte & (1 << bit) == 0 {
                return Some(n);
            }
        }
    }
    None
}

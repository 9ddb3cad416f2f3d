#![forbid(unsafe_code)]
//! Data-block allocation over the on-image free bitmap.
//!
//! One bit per block, bitmap blocks directly after the superblock. Bit set
//! means in use; format marks every non-data block used so the scan never
//! hands out metadata. Allocation and free run inside the caller's
//! transaction, so the bitmap edit and the caller's pointer update commit
//! or roll back together.

use rill_block::BufferCache;
use rill_error::{Result, RillError};
use rill_journal::Transaction;
use rill_ondisk::Layout;
use rill_types::{BlockNumber, BITS_PER_BLOCK, BLOCK_SIZE};
use std::sync::atomic::{AtomicU32, Ordering};
use tracing::{debug, trace};

/// Get bit `idx` from a bitmap block.
#[must_use]
pub fn bitmap_get(bitmap: &[u8], idx: usize) -> bool {
    (bitmap[idx / 8] >> (idx % 8)) & 1 == 1
}

/// Set bit `idx` in a bitmap block.
pub fn bitmap_set(bitmap: &mut [u8], idx: usize) {
    bitmap[idx / 8] |= 1 << (idx % 8);
}

/// Clear bit `idx` in a bitmap block.
pub fn bitmap_clear(bitmap: &mut [u8], idx: usize) {
    bitmap[idx / 8] &= !(1 << (idx % 8));
}

/// Count zero bits among the first `count` bits.
#[must_use]
pub fn bitmap_count_free(bitmap: &[u8], count: usize) -> u32 {
    let mut free = 0_u32;
    for idx in 0..count {
        if !bitmap_get(bitmap, idx) {
            free += 1;
        }
    }
    free
}

/// Data-block allocator. Scans the bitmap from a rotating hint so repeated
/// allocations spread forward instead of rescanning the front of the disk.
#[derive(Debug)]
pub struct BlockAllocator {
    layout: Layout,
    hint: AtomicU32,
}

impl BlockAllocator {
    #[must_use]
    pub fn new(layout: Layout) -> Self {
        let hint = AtomicU32::new(layout.data_start.0);
        Self { layout, hint }
    }

    /// Write the initial bitmap for a fresh image: every block outside the
    /// data region marked in use, every data block free. Used by format,
    /// before any mount.
    pub fn format_bitmap(cache: &BufferCache, layout: &Layout) -> Result<()> {
        let bitmap_blocks = layout.inode_start.0 - layout.bitmap_start.0;
        for i in 0..bitmap_blocks {
            let mut data = vec![0_u8; BLOCK_SIZE];
            let first_bit = (i as usize) * BITS_PER_BLOCK;
            for bit in 0..BITS_PER_BLOCK {
                let block = first_bit + bit;
                if block >= layout.total_blocks as usize {
                    break;
                }
                if !layout.is_data_block(BlockNumber(block as u32)) {
                    bitmap_set(&mut data, bit);
                }
            }
            cache
                .device()
                .write_block(BlockNumber(layout.bitmap_start.0 + i), &data)?;
        }
        Ok(())
    }

    /// Allocate one data block and zero it inside `txn`.
    ///
    /// Costs the transaction one grant per bitmap block touched plus one
    /// for the new block itself. Returns [`RillError::NoSpace`] with
    /// the bitmap unchanged when no data block is free.
    pub fn allocate(&self, cache: &BufferCache, txn: &mut Transaction) -> Result<BlockNumber> {
        let data_start = self.layout.data_start.0;
        let data_end = data_start + self.layout.data_blocks;
        let hint = self.hint.load(Ordering::Relaxed).clamp(data_start, data_end - 1);

        // Two passes: hint to end of region, then front of region to hint.
        for range in [hint..data_end, data_start..hint] {
            let mut block = range.start;
            while block < range.end {
                let (bitmap_block, first_bit) = self.layout.bitmap_location(BlockNumber(block));
                let handle = cache.get(bitmap_block);
                let lease = txn.get_write_access(&handle)?;

                // Scan the rest of this bitmap block in one grant.
                let span = (BITS_PER_BLOCK - first_bit).min((range.end - block) as usize);
                let found = txn.with_block(lease, |data| {
                    (0..span).find(|i| !bitmap_get(data, first_bit + i))
                });

                if let Some(i) = found {
                    let bit = first_bit + i;
                    let chosen = BlockNumber(block + i as u32);
                    txn.with_block_mut(lease, |data| bitmap_set(data, bit));
                    txn.mark_dirty(lease);

                    // Fresh contents are undefined on disk; journal a zero
                    // image so the block reads as zero even across replay.
                    let new_handle = cache.get(chosen);
                    let new_lease = txn.get_create_access(&new_handle)?;
                    txn.mark_dirty(new_lease);

                    self.hint.store(chosen.0 + 1, Ordering::Relaxed);
                    trace!(block = chosen.0, "allocated data block");
                    return Ok(chosen);
                }
                block += span as u32;
            }
        }
        debug!("data region exhausted");
        Err(RillError::NoSpace)
    }

    /// Return `block` to the free bitmap inside `txn`.
    pub fn free(&self, cache: &BufferCache, txn: &mut Transaction, block: BlockNumber) -> Result<()> {
        if !self.layout.is_data_block(block) {
            return Err(RillError::Corrupt {
                block: block.0,
                detail: "freeing a block outside the data region".to_string(),
            });
        }
        let (bitmap_block, bit) = self.layout.bitmap_location(block);
        let handle = cache.get(bitmap_block);
        let lease = txn.get_write_access(&handle)?;
        let was_set = txn.with_block(lease, |data| bitmap_get(data, bit));
        if !was_set {
            return Err(RillError::Corrupt {
                block: block.0,
                detail: "freeing a free block".to_string(),
            });
        }
        txn.with_block_mut(lease, |data| bitmap_clear(data, bit));
        txn.mark_dirty(lease);
        trace!(block = block.0, "freed data block");
        Ok(())
    }

    /// Free data blocks remaining, by shared bitmap scan.
    pub fn count_free(&self, cache: &BufferCache) -> Result<u32> {
        let mut free = 0;
        let bitmap_blocks = self.layout.inode_start.0 - self.layout.bitmap_start.0;
        for i in 0..bitmap_blocks {
            let first_bit = (i as usize) * BITS_PER_BLOCK;
            let bits = BITS_PER_BLOCK.min(self.layout.total_blocks as usize - first_bit);
            let handle = cache.get(BlockNumber(self.layout.bitmap_start.0 + i));
            let guard = cache.read_shared(&handle)?;
            free += guard.with_data(|data| bitmap_count_free(data, bits));
        }
        Ok(free)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rill_journal::{DurabilityMode, Journal};
    use std::sync::Arc;

    const IMAGE_BLOCKS: u32 = 256;

    struct Fixture {
        cache: Arc<BufferCache>,
        layout: Layout,
        journal: Journal,
        alloc: BlockAllocator,
    }

    fn fixture() -> Fixture {
        let mem = rill_block::MemByteDevice::new(IMAGE_BLOCKS);
        let dev = rill_block::ByteBlockDevice::new(mem).unwrap();
        let cache = Arc::new(BufferCache::new(Arc::new(dev), 64).unwrap());
        let layout = Layout::compute(IMAGE_BLOCKS, 64).unwrap();
        BlockAllocator::format_bitmap(&cache, &layout).unwrap();
        Journal::format_log(&cache, &layout).unwrap();
        let journal =
            Journal::open(Arc::clone(&cache), layout, DurabilityMode::SyncChecksummed).unwrap();
        let alloc = BlockAllocator::new(layout);
        Fixture {
            cache,
            layout,
            journal,
            alloc,
        }
    }

    #[test]
    fn formatted_bitmap_frees_exactly_the_data_region() {
        let fx = fixture();
        assert_eq!(fx.alloc.count_free(&fx.cache).unwrap(), fx.layout.data_blocks);
    }

    #[test]
    fn allocate_returns_distinct_zeroed_data_blocks() {
        let fx = fixture();
        let mut txn = fx.journal.start(8).unwrap();
        let a = fx.alloc.allocate(&fx.cache, &mut txn).unwrap();
        let b = fx.alloc.allocate(&fx.cache, &mut txn).unwrap();
        assert_ne!(a, b);
        assert!(fx.layout.is_data_block(a));
        assert!(fx.layout.is_data_block(b));
        txn.commit().unwrap();

        for block in [a, b] {
            let on_disk = fx.cache.device().read_block(block).unwrap();
            assert!(on_disk.as_slice().iter().all(|&byte| byte == 0));
        }
        assert_eq!(
            fx.alloc.count_free(&fx.cache).unwrap(),
            fx.layout.data_blocks - 2
        );
    }

    #[test]
    fn free_then_allocate_reuses_the_block() {
        let fx = fixture();
        let mut txn = fx.journal.start(8).unwrap();
        let block = fx.alloc.allocate(&fx.cache, &mut txn).unwrap();
        txn.commit().unwrap();

        let mut txn = fx.journal.start(8).unwrap();
        fx.alloc.free(&fx.cache, &mut txn, block).unwrap();
        txn.commit().unwrap();
        assert_eq!(fx.alloc.count_free(&fx.cache).unwrap(), fx.layout.data_blocks);

        // The rotating hint moved past the freed block; the wrap-around
        // pass finds it once everything ahead is taken.
        let mut txn = fx.journal.start(8).unwrap();
        let again = fx.alloc.allocate(&fx.cache, &mut txn).unwrap();
        txn.commit().unwrap();
        assert!(fx.layout.is_data_block(again));
    }

    #[test]
    fn allocating_then_freeing_restores_the_bitmap_pattern() {
        let fx = fixture();
        let bitmap_image = |fx: &Fixture| -> Vec<u8> {
            let mut bytes = Vec::new();
            for b in fx.layout.bitmap_start.0..fx.layout.inode_start.0 {
                let block = fx.cache.device().read_block(BlockNumber(b)).unwrap();
                bytes.extend_from_slice(block.as_slice());
            }
            bytes
        };
        let before = bitmap_image(&fx);

        let mut txn = fx.journal.start(16).unwrap();
        let blocks: Vec<_> = (0..10)
            .map(|_| fx.alloc.allocate(&fx.cache, &mut txn).unwrap())
            .collect();
        txn.commit().unwrap();
        assert_ne!(bitmap_image(&fx), before);

        let mut txn = fx.journal.start(16).unwrap();
        for block in blocks {
            fx.alloc.free(&fx.cache, &mut txn, block).unwrap();
        }
        txn.commit().unwrap();
        assert_eq!(bitmap_image(&fx), before);
    }

    #[test]
    fn exhaustion_reports_no_space_and_keeps_the_bitmap_intact() {
        let fx = fixture();
        // Drain the region. The per-transaction budget caps how many grants
        // one transaction may hold, so drain in batches.
        let mut allocated = Vec::new();
        while allocated.len() < fx.layout.data_blocks as usize {
            let mut txn = fx.journal.start(rill_ondisk::MAX_OP_BLOCKS).unwrap();
            for _ in 0..8 {
                if allocated.len() == fx.layout.data_blocks as usize {
                    break;
                }
                allocated.push(fx.alloc.allocate(&fx.cache, &mut txn).unwrap());
            }
            txn.commit().unwrap();
        }
        assert_eq!(fx.alloc.count_free(&fx.cache).unwrap(), 0);

        let mut txn = fx.journal.start(8).unwrap();
        let err = fx.alloc.allocate(&fx.cache, &mut txn).unwrap_err();
        assert!(matches!(err, RillError::NoSpace));
        txn.abort();

        // Freeing everything restores the formatted pattern.
        for batch in allocated.chunks(16) {
            let mut txn = fx.journal.start(rill_ondisk::MAX_OP_BLOCKS).unwrap();
            for &block in batch {
                fx.alloc.free(&fx.cache, &mut txn, block).unwrap();
            }
            txn.commit().unwrap();
        }
        assert_eq!(fx.alloc.count_free(&fx.cache).unwrap(), fx.layout.data_blocks);
    }

    #[test]
    fn aborted_allocation_rolls_the_bitmap_back() {
        let fx = fixture();
        let mut txn = fx.journal.start(8).unwrap();
        fx.alloc.allocate(&fx.cache, &mut txn).unwrap();
        txn.abort();
        assert_eq!(fx.alloc.count_free(&fx.cache).unwrap(), fx.layout.data_blocks);
    }

    #[test]
    fn double_free_is_corruption() {
        let fx = fixture();
        let mut txn = fx.journal.start(8).unwrap();
        let block = fx.alloc.allocate(&fx.cache, &mut txn).unwrap();
        txn.commit().unwrap();

        let mut txn = fx.journal.start(8).unwrap();
        fx.alloc.free(&fx.cache, &mut txn, block).unwrap();
        let err = fx.alloc.free(&fx.cache, &mut txn, block).unwrap_err();
        assert!(matches!(err, RillError::Corrupt { .. }));
        txn.abort();
    }

    #[test]
    fn metadata_blocks_cannot_be_freed() {
        let fx = fixture();
        let mut txn = fx.journal.start(8).unwrap();
        let err = fx
            .alloc
            .free(&fx.cache, &mut txn, fx.layout.bitmap_start)
            .unwrap_err();
        assert!(matches!(err, RillError::Corrupt { .. }));
        txn.abort();
    }

    #[test]
    fn bitmap_bit_helpers() {
        let mut bitmap = vec![0_u8; 16];
        assert!(!bitmap_get(&bitmap, 37));
        bitmap_set(&mut bitmap, 37);
        assert!(bitmap_get(&bitmap, 37));
        assert_eq!(bitmap_count_free(&bitmap, 128), 127);
        bitmap_clear(&mut bitmap, 37);
        assert!(!bitmap_get(&bitmap, 37));
        assert_eq!(bitmap_count_free(&bitmap, 128), 128);
    }
}

#![forbid(unsafe_code)]
//! Inode table and file block mapping.
//!
//! Packed inode records live in the inode-table region, 51 per block.
//! File content is addressed through 8 direct slots, one single-indirect
//! slot, and one double-indirect slot; indirect blocks are arrays of 1024
//! raw pointer slots with the same hole encodings as the inode's own.
//!
//! Hole semantics: a `NotPresent` slot reads as zeros and allocates on
//! first write. A `ZeroOnDemand` slot is the same, except the slot was
//! placed deliberately by space reservation, so readers past EOF-adjacent
//! holes and writers landing in reserved ranges behave identically.
//!
//! Every mutating operation runs inside a caller-supplied transaction and
//! only edits the in-memory [`DiskInode`]; [`InodeTable::update`] persists
//! the record. Callers commit the two together.

use rill_alloc::BlockAllocator;
use rill_block::BufferCache;
use rill_error::{Result, RillError};
use rill_journal::Transaction;
use rill_ondisk::{DiskInode, Layout};
use rill_types::{
    BlockNumber, BlockRef, InodeKind, InodeNumber, BLOCK_SIZE, DOUBLE_SLOT, INODES_PER_BLOCK,
    INODE_SIZE, MAX_FILE_BLOCKS, NDIRECT, NINDIRECT, SINGLE_SLOT,
};
use std::sync::Arc;
use tracing::{debug, trace};

/// Largest representable file, in bytes.
pub const MAX_FILE_SIZE: u64 = (MAX_FILE_BLOCKS * BLOCK_SIZE) as u64;

/// Where file block `index` lives in the addressing tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotPath {
    Direct(usize),
    Single(usize),
    Double(usize, usize),
}

fn slot_path(index: usize) -> Option<SlotPath> {
    if index < NDIRECT {
        return Some(SlotPath::Direct(index));
    }
    let index = index - NDIRECT;
    if index < NINDIRECT {
        return Some(SlotPath::Single(index));
    }
    let index = index - NINDIRECT;
    if index < NINDIRECT * NINDIRECT {
        return Some(SlotPath::Double(index / NINDIRECT, index % NINDIRECT));
    }
    None
}

/// Pointer slot `idx` of an indirect block.
fn read_entry(data: &[u8], idx: usize) -> BlockRef {
    let off = idx * 4;
    let raw = u32::from_le_bytes([data[off], data[off + 1], data[off + 2], data[off + 3]]);
    BlockRef::from_raw(raw)
}

fn write_entry(data: &mut [u8], idx: usize, entry: BlockRef) {
    let off = idx * 4;
    data[off..off + 4].copy_from_slice(&entry.to_raw().to_le_bytes());
}

fn file_too_large(requested: u64) -> RillError {
    RillError::FileTooLarge {
        requested,
        max: MAX_FILE_SIZE,
    }
}

/// The inode table: record I/O plus content block mapping.
#[derive(Debug)]
pub struct InodeTable {
    layout: Layout,
    alloc: Arc<BlockAllocator>,
}

impl InodeTable {
    #[must_use]
    pub fn new(layout: Layout, alloc: Arc<BlockAllocator>) -> Self {
        Self { layout, alloc }
    }

    /// Zero the inode-table region (every record free). Used by format,
    /// before any mount.
    pub fn format_table(cache: &BufferCache, layout: &Layout) -> Result<()> {
        let zero = vec![0_u8; BLOCK_SIZE];
        for block in layout.inode_start.0..layout.data_start.0 {
            cache.device().write_block(BlockNumber(block), &zero)?;
        }
        Ok(())
    }

    /// Read inode `inum`'s on-disk record.
    pub fn read(&self, cache: &BufferCache, inum: InodeNumber) -> Result<DiskInode> {
        let (block, offset) = self.locate(inum)?;
        let handle = cache.get(block);
        let guard = cache.read_shared(&handle)?;
        guard.with_data(|data| DiskInode::decode(data, offset)).map_err(|err| {
            RillError::Corrupt {
                block: block.0,
                detail: format!("inode {inum}: {err}"),
            }
        })
    }

    /// Persist inode `inum`'s record inside `txn`.
    pub fn update(
        &self,
        cache: &BufferCache,
        txn: &mut Transaction,
        inum: InodeNumber,
        inode: &DiskInode,
    ) -> Result<()> {
        let (block, offset) = self.locate(inum)?;
        let handle = cache.get(block);
        let lease = txn.get_write_access(&handle)?;
        txn.with_block_mut(lease, |data| inode.encode(data, offset))
            .map_err(|err| RillError::Corrupt {
                block: block.0,
                detail: format!("inode {inum}: {err}"),
            })?;
        txn.mark_dirty(lease);
        Ok(())
    }

    /// Claim a free inode record and stamp its kind. The rest of the
    /// record starts zeroed; the caller fills nlink, times, and device
    /// numbers before commit.
    pub fn allocate_inode(
        &self,
        cache: &BufferCache,
        txn: &mut Transaction,
        kind: InodeKind,
    ) -> Result<InodeNumber> {
        for inum in 1..self.layout.ninodes {
            let inum = InodeNumber(inum);
            let (block, offset) = self.locate(inum)?;

            // Cheap shared probe first; claiming takes the block lock and
            // rechecks, since another transaction may have won the slot.
            let free = {
                let handle = cache.get(block);
                let probe = txn.snapshot(&handle)?;
                DiskInode::decode(&probe, offset).map(|rec| rec.is_free())
            };
            if !matches!(free, Ok(true)) {
                continue;
            }

            let handle = cache.get(block);
            let lease = txn.get_write_access(&handle)?;
            let still_free = txn
                .with_block(lease, |data| DiskInode::decode(data, offset))
                .map(|rec| rec.is_free())
                .unwrap_or(false);
            if !still_free {
                continue;
            }
            let mut record = DiskInode::free();
            record.kind = Some(kind);
            txn.with_block_mut(lease, |data| record.encode(data, offset))
                .map_err(|err| RillError::Corrupt {
                    block: block.0,
                    detail: format!("inode {inum}: {err}"),
                })?;
            txn.mark_dirty(lease);
            debug!(inum = inum.0, ?kind, "allocated inode");
            return Ok(inum);
        }
        Err(RillError::NoSpace)
    }

    /// Release inode `inum`: drop all content blocks, then zero the record.
    pub fn free_inode(
        &self,
        cache: &BufferCache,
        txn: &mut Transaction,
        inum: InodeNumber,
        inode: &mut DiskInode,
    ) -> Result<()> {
        self.truncate(cache, txn, inode, 0)?;
        *inode = DiskInode::free();
        self.update(cache, txn, inum, inode)?;
        debug!(inum = inum.0, "freed inode");
        Ok(())
    }

    /// Copy file content into `buf` starting at byte `offset`. Holes read
    /// as zeros; the result is clamped at EOF. Returns bytes read.
    pub fn read_at(
        &self,
        cache: &BufferCache,
        inode: &DiskInode,
        offset: u64,
        buf: &mut [u8],
    ) -> Result<usize> {
        if offset >= inode.size || buf.is_empty() {
            return Ok(0);
        }
        let end = inode.size.min(offset + buf.len() as u64);
        let mut pos = offset;
        while pos < end {
            let index = (pos / BLOCK_SIZE as u64) as usize;
            let within = (pos % BLOCK_SIZE as u64) as usize;
            let n = (BLOCK_SIZE - within).min((end - pos) as usize);
            let dst = &mut buf[(pos - offset) as usize..(pos - offset) as usize + n];
            match self.lookup_block(cache, inode, index)? {
                Some(block) => {
                    let handle = cache.get(block);
                    let guard = cache.read_shared(&handle)?;
                    guard.with_data(|data| dst.copy_from_slice(&data[within..within + n]));
                }
                None => dst.fill(0),
            }
            pos += n as u64;
        }
        Ok((end - offset) as usize)
    }

    /// [`Self::read_at`] for use inside a transaction: blocks the
    /// transaction already holds are read through its grants instead of a
    /// shared lock, which would deadlock against ourselves.
    pub fn read_at_in_txn(
        &self,
        cache: &BufferCache,
        txn: &Transaction,
        inode: &DiskInode,
        offset: u64,
        buf: &mut [u8],
    ) -> Result<usize> {
        if offset >= inode.size || buf.is_empty() {
            return Ok(0);
        }
        let end = inode.size.min(offset + buf.len() as u64);
        let mut pos = offset;
        while pos < end {
            let index = (pos / BLOCK_SIZE as u64) as usize;
            let within = (pos % BLOCK_SIZE as u64) as usize;
            let n = (BLOCK_SIZE - within).min((end - pos) as usize);
            let dst = &mut buf[(pos - offset) as usize..(pos - offset) as usize + n];
            match self.lookup_block_in_txn(cache, txn, inode, index)? {
                Some(block) => {
                    let handle = cache.get(block);
                    let data = txn.snapshot(&handle)?;
                    dst.copy_from_slice(&data[within..within + n]);
                }
                None => dst.fill(0),
            }
            pos += n as u64;
        }
        Ok((end - offset) as usize)
    }

    /// Write `data` at byte `offset`, allocating blocks and growing the
    /// file as needed. Returns bytes written (all of `data` on success).
    pub fn write_at(
        &self,
        cache: &BufferCache,
        txn: &mut Transaction,
        inode: &mut DiskInode,
        offset: u64,
        data: &[u8],
    ) -> Result<usize> {
        let end = offset
            .checked_add(data.len() as u64)
            .ok_or_else(|| file_too_large(u64::MAX))?;
        if end > MAX_FILE_SIZE {
            return Err(file_too_large(end));
        }
        let mut pos = offset;
        while pos < end {
            let index = (pos / BLOCK_SIZE as u64) as usize;
            let within = (pos % BLOCK_SIZE as u64) as usize;
            let n = (BLOCK_SIZE - within).min((end - pos) as usize);
            let block = self.ensure_block(cache, txn, inode, index)?;
            let handle = cache.get(block);
            let lease = txn.get_write_access(&handle)?;
            let src = &data[(pos - offset) as usize..(pos - offset) as usize + n];
            txn.with_block_mut(lease, |block_data| {
                block_data[within..within + n].copy_from_slice(src);
            });
            txn.mark_dirty(lease);
            pos += n as u64;
        }
        if end > inode.size {
            inode.size = end;
        }
        Ok(data.len())
    }

    /// Set the file length. Growing leaves a hole; shrinking frees every
    /// whole block past the boundary and zeroes the kept tail, so former
    /// content never resurfaces through a later extension.
    pub fn truncate(
        &self,
        cache: &BufferCache,
        txn: &mut Transaction,
        inode: &mut DiskInode,
        new_size: u64,
    ) -> Result<()> {
        if new_size > MAX_FILE_SIZE {
            return Err(file_too_large(new_size));
        }
        if new_size >= inode.size {
            inode.size = new_size;
            return Ok(());
        }
        let keep = usize::try_from(new_size.div_ceil(BLOCK_SIZE as u64))
            .map_err(|_| file_too_large(new_size))?;

        for i in 0..NDIRECT {
            if i >= keep {
                self.free_ref(cache, txn, &mut inode.addrs[i])?;
            }
        }

        let single_base = NDIRECT;
        if keep <= single_base {
            self.free_single_subtree(cache, txn, &mut inode.addrs[SINGLE_SLOT])?;
        } else if keep < single_base + NINDIRECT {
            if let BlockRef::Data(l1) = inode.addrs[SINGLE_SLOT] {
                self.clear_tail_entries(cache, txn, l1, keep - single_base)?;
            }
        }

        let double_base = NDIRECT + NINDIRECT;
        if keep <= double_base {
            self.free_double_subtree(cache, txn, &mut inode.addrs[DOUBLE_SLOT])?;
        } else if let BlockRef::Data(l1) = inode.addrs[DOUBLE_SLOT] {
            let keep_leaves = keep - double_base;
            let full_children = keep_leaves / NINDIRECT;
            let partial = keep_leaves % NINDIRECT;

            let handle = cache.get(l1);
            let lease = txn.get_write_access(&handle)?;
            let mut changed = false;
            for j in full_children..NINDIRECT {
                let entry = txn.with_block(lease, |data| read_entry(data, j));
                if j == full_children && partial > 0 {
                    if let BlockRef::Data(l2) = entry {
                        self.clear_tail_entries(cache, txn, l2, partial)?;
                    }
                    continue;
                }
                let mut slot = entry;
                self.free_single_subtree(cache, txn, &mut slot)?;
                if slot != entry {
                    txn.with_block_mut(lease, |data| write_entry(data, j, slot));
                    changed = true;
                }
            }
            if changed {
                txn.mark_dirty(lease);
            }
        }

        // Zero the kept tail of the boundary block.
        let within = (new_size % BLOCK_SIZE as u64) as usize;
        if within != 0 {
            if let Some(block) = self.lookup_block_in_txn(cache, txn, inode, keep - 1)? {
                let handle = cache.get(block);
                let lease = txn.get_write_access(&handle)?;
                txn.with_block_mut(lease, |data| data[within..].fill(0));
                txn.mark_dirty(lease);
            }
        }

        inode.size = new_size;
        trace!(new_size, "truncated");
        Ok(())
    }

    /// Reserve `len` bytes of backing at `offset` without writing: every
    /// unmapped block in the range becomes a deliberate zero-filled hole,
    /// and the file grows to cover the range. No data blocks are consumed
    /// until something writes into the reservation.
    pub fn reserve_range(
        &self,
        cache: &BufferCache,
        txn: &mut Transaction,
        inode: &mut DiskInode,
        offset: u64,
        len: u64,
    ) -> Result<()> {
        let end = offset.checked_add(len).ok_or_else(|| file_too_large(u64::MAX))?;
        if end > MAX_FILE_SIZE {
            return Err(file_too_large(end));
        }
        if len == 0 {
            return Ok(());
        }
        let first = (offset / BLOCK_SIZE as u64) as usize;
        let last = ((end - 1) / BLOCK_SIZE as u64) as usize;
        for index in first..=last {
            self.reserve_block(cache, txn, inode, index)?;
        }
        if end > inode.size {
            inode.size = end;
        }
        Ok(())
    }

    /// The block backing byte `offset`, without allocating. `None` is a
    /// hole reading as zeros.
    pub fn block_for_offset(
        &self,
        cache: &BufferCache,
        inode: &DiskInode,
        offset: u64,
    ) -> Result<Option<BlockNumber>> {
        self.lookup_block(cache, inode, (offset / BLOCK_SIZE as u64) as usize)
    }

    /// The block backing byte `offset`, allocating it (and any missing
    /// indirect blocks) inside `txn`. Idempotent per offset.
    pub fn block_for_offset_create(
        &self,
        cache: &BufferCache,
        txn: &mut Transaction,
        inode: &mut DiskInode,
        offset: u64,
    ) -> Result<BlockNumber> {
        if offset >= MAX_FILE_SIZE {
            return Err(file_too_large(offset));
        }
        self.ensure_block(cache, txn, inode, (offset / BLOCK_SIZE as u64) as usize)
    }

    /// Resolve file block `index` without allocating. `None` is a hole.
    pub fn lookup_block(
        &self,
        cache: &BufferCache,
        inode: &DiskInode,
        index: usize,
    ) -> Result<Option<BlockNumber>> {
        let Some(path) = slot_path(index) else {
            return Ok(None);
        };
        match path {
            SlotPath::Direct(i) => Ok(inode.addrs[i].block()),
            SlotPath::Single(j) => match inode.addrs[SINGLE_SLOT].block() {
                Some(l1) => self.read_entry_shared(cache, l1, j),
                None => Ok(None),
            },
            SlotPath::Double(j, k) => {
                let Some(l1) = inode.addrs[DOUBLE_SLOT].block() else {
                    return Ok(None);
                };
                match self.read_entry_shared(cache, l1, j)? {
                    Some(l2) => self.read_entry_shared(cache, l2, k),
                    None => Ok(None),
                }
            }
        }
    }

    /// [`Self::lookup_block`] for use inside a transaction, where a plain
    /// shared read could wait on our own grant.
    fn lookup_block_in_txn(
        &self,
        cache: &BufferCache,
        txn: &Transaction,
        inode: &DiskInode,
        index: usize,
    ) -> Result<Option<BlockNumber>> {
        let Some(path) = slot_path(index) else {
            return Ok(None);
        };
        let entry_at = |block: BlockNumber, idx: usize| -> Result<Option<BlockNumber>> {
            let handle = cache.get(block);
            let data = txn.snapshot(&handle)?;
            Ok(read_entry(&data, idx).block())
        };
        match path {
            SlotPath::Direct(i) => Ok(inode.addrs[i].block()),
            SlotPath::Single(j) => match inode.addrs[SINGLE_SLOT].block() {
                Some(l1) => entry_at(l1, j),
                None => Ok(None),
            },
            SlotPath::Double(j, k) => {
                let Some(l1) = inode.addrs[DOUBLE_SLOT].block() else {
                    return Ok(None);
                };
                match entry_at(l1, j)? {
                    Some(l2) => entry_at(l2, k),
                    None => Ok(None),
                }
            }
        }
    }

    /// Resolve file block `index`, allocating the block (and any missing
    /// indirect blocks on the way) inside `txn`.
    fn ensure_block(
        &self,
        cache: &BufferCache,
        txn: &mut Transaction,
        inode: &mut DiskInode,
        index: usize,
    ) -> Result<BlockNumber> {
        let path = slot_path(index)
            .ok_or_else(|| file_too_large((index as u64 + 1) * BLOCK_SIZE as u64))?;
        match path {
            SlotPath::Direct(i) => {
                if let Some(block) = inode.addrs[i].block() {
                    return Ok(block);
                }
                let block = self.alloc.allocate(cache, txn)?;
                inode.addrs[i] = BlockRef::Data(block);
                Ok(block)
            }
            SlotPath::Single(j) => {
                let l1 = self.ensure_slot_block(cache, txn, inode, SINGLE_SLOT)?;
                self.ensure_entry(cache, txn, l1, j)
            }
            SlotPath::Double(j, k) => {
                let l1 = self.ensure_slot_block(cache, txn, inode, DOUBLE_SLOT)?;
                let l2 = self.ensure_entry(cache, txn, l1, j)?;
                self.ensure_entry(cache, txn, l2, k)
            }
        }
    }

    /// Materialize the indirect block an inode slot points at.
    fn ensure_slot_block(
        &self,
        cache: &BufferCache,
        txn: &mut Transaction,
        inode: &mut DiskInode,
        slot: usize,
    ) -> Result<BlockNumber> {
        if let Some(block) = inode.addrs[slot].block() {
            return Ok(block);
        }
        let block = self.alloc.allocate(cache, txn)?;
        inode.addrs[slot] = BlockRef::Data(block);
        Ok(block)
    }

    /// Materialize pointer slot `idx` of indirect block `indirect`.
    fn ensure_entry(
        &self,
        cache: &BufferCache,
        txn: &mut Transaction,
        indirect: BlockNumber,
        idx: usize,
    ) -> Result<BlockNumber> {
        let handle = cache.get(indirect);
        let lease = txn.get_write_access(&handle)?;
        if let Some(block) = txn.with_block(lease, |data| read_entry(data, idx)).block() {
            return Ok(block);
        }
        let block = self.alloc.allocate(cache, txn)?;
        txn.with_block_mut(lease, |data| write_entry(data, idx, BlockRef::Data(block)));
        txn.mark_dirty(lease);
        Ok(block)
    }

    /// Mark file block `index` reserved if it has no backing yet.
    fn reserve_block(
        &self,
        cache: &BufferCache,
        txn: &mut Transaction,
        inode: &mut DiskInode,
        index: usize,
    ) -> Result<()> {
        let path = slot_path(index)
            .ok_or_else(|| file_too_large((index as u64 + 1) * BLOCK_SIZE as u64))?;
        match path {
            SlotPath::Direct(i) => {
                if inode.addrs[i] == BlockRef::NotPresent {
                    inode.addrs[i] = BlockRef::ZeroOnDemand;
                }
                Ok(())
            }
            SlotPath::Single(j) => {
                let l1 = self.ensure_slot_block(cache, txn, inode, SINGLE_SLOT)?;
                self.reserve_entry(cache, txn, l1, j)
            }
            SlotPath::Double(j, k) => {
                let l1 = self.ensure_slot_block(cache, txn, inode, DOUBLE_SLOT)?;
                let l2 = self.ensure_entry(cache, txn, l1, j)?;
                self.reserve_entry(cache, txn, l2, k)
            }
        }
    }

    fn reserve_entry(
        &self,
        cache: &BufferCache,
        txn: &mut Transaction,
        indirect: BlockNumber,
        idx: usize,
    ) -> Result<()> {
        let handle = cache.get(indirect);
        let lease = txn.get_write_access(&handle)?;
        let entry = txn.with_block(lease, |data| read_entry(data, idx));
        if entry == BlockRef::NotPresent {
            txn.with_block_mut(lease, |data| write_entry(data, idx, BlockRef::ZeroOnDemand));
            txn.mark_dirty(lease);
        }
        Ok(())
    }

    /// Free the block behind `slot` (if any) and clear the slot.
    fn free_ref(
        &self,
        cache: &BufferCache,
        txn: &mut Transaction,
        slot: &mut BlockRef,
    ) -> Result<()> {
        if let Some(block) = slot.block() {
            self.alloc.free(cache, txn, block)?;
        }
        *slot = BlockRef::NotPresent;
        Ok(())
    }

    /// Free an entire single-indirect subtree: every mapped leaf, then the
    /// indirect block itself.
    fn free_single_subtree(
        &self,
        cache: &BufferCache,
        txn: &mut Transaction,
        slot: &mut BlockRef,
    ) -> Result<()> {
        if let Some(l1) = slot.block() {
            let handle = cache.get(l1);
            let entries = txn.snapshot(&handle)?;
            for idx in 0..NINDIRECT {
                if let Some(leaf) = read_entry(&entries, idx).block() {
                    self.alloc.free(cache, txn, leaf)?;
                }
            }
            self.alloc.free(cache, txn, l1)?;
        }
        *slot = BlockRef::NotPresent;
        Ok(())
    }

    fn free_double_subtree(
        &self,
        cache: &BufferCache,
        txn: &mut Transaction,
        slot: &mut BlockRef,
    ) -> Result<()> {
        if let Some(l1) = slot.block() {
            let handle = cache.get(l1);
            let entries = txn.snapshot(&handle)?;
            for idx in 0..NINDIRECT {
                let mut child = read_entry(&entries, idx);
                self.free_single_subtree(cache, txn, &mut child)?;
            }
            self.alloc.free(cache, txn, l1)?;
        }
        *slot = BlockRef::NotPresent;
        Ok(())
    }

    /// Clear (and free the backing of) every pointer slot at `from` and
    /// beyond in indirect block `indirect`.
    fn clear_tail_entries(
        &self,
        cache: &BufferCache,
        txn: &mut Transaction,
        indirect: BlockNumber,
        from: usize,
    ) -> Result<()> {
        let handle = cache.get(indirect);
        let lease = txn.get_write_access(&handle)?;
        let mut changed = false;
        for idx in from..NINDIRECT {
            let entry = txn.with_block(lease, |data| read_entry(data, idx));
            if entry == BlockRef::NotPresent {
                continue;
            }
            if let Some(block) = entry.block() {
                self.alloc.free(cache, txn, block)?;
            }
            txn.with_block_mut(lease, |data| write_entry(data, idx, BlockRef::NotPresent));
            changed = true;
        }
        if changed {
            txn.mark_dirty(lease);
        }
        Ok(())
    }

    fn read_entry_shared(
        &self,
        cache: &BufferCache,
        indirect: BlockNumber,
        idx: usize,
    ) -> Result<Option<BlockNumber>> {
        let handle = cache.get(indirect);
        let guard = cache.read_shared(&handle)?;
        Ok(guard.with_data(|data| read_entry(data, idx)).block())
    }

    fn locate(&self, inum: InodeNumber) -> Result<(BlockNumber, usize)> {
        self.layout
            .inode_location(inum)
            .map_err(|err| RillError::Format(format!("inode {inum}: {err}")))
    }
}

const _: () = assert!(INODES_PER_BLOCK * INODE_SIZE <= BLOCK_SIZE);

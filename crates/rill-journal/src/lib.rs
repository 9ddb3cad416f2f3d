#![forbid(unsafe_code)]
//! Write-ahead journal and transaction manager.
//!
//! Transactions are grouped: every open transaction joins the running
//! group, and the last one to close commits the whole group in one ordered,
//! checksummed log write. Commit ordering is the order `commit` calls reach
//! the journal; checkpoint writes to home locations never precede their
//! group's commit record reaching the device.
//!
//! # Log region format
//!
//! The log occupies the image tail. Block `log_start` is the header (the
//! commit record); blocks `log_start+1 ..` hold post-images:
//!
//! ```text
//! Header block:
//! | magic u32 | flags u32 | seq u64 | count u32 | checksum u32 | home[count] u32 |
//! ```
//!
//! `flags` bit 0 says the checksum field is meaningful: CRC32C over the
//! `count` post-image blocks in order, then the packed `home` array.
//! `count == 0` means no committed-but-uncheckpointed transaction exists.
//!
//! # Transaction state machine
//!
//! `Open → (grant accesses)* → Committing → Committed`, with `Aborted`
//! reachable from `Open`. Write/create grants take the block's exclusive
//! cache lock and hold it until the transaction closes, which is what
//! serializes two transactions touching the same block.

use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use rill_block::{BlockHandle, BufferCache, ExclusiveGuard};
use rill_error::{Result, RillError};
use rill_ondisk::{Layout, LOG_BLOCKS, MAX_OP_BLOCKS};
use rill_types::{
    read_le_u32, read_le_u64, write_le_u32, write_le_u64, BlockNumber, ParseError, TxnId,
    BLOCK_SIZE, SUPERBLOCK_BLOCK,
};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Log header magic ("RLOG").
pub const LOG_MAGIC: u32 = 0x524C_4F47;

const FLAG_CHECKSUMMED: u32 = 1;

/// When and how hard `commit` pushes data to stable storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DurabilityMode {
    /// Commit record carries a CRC32C checksum; `commit` returns only after
    /// post-images, commit record, and checkpoint are synced, in that order.
    #[default]
    SyncChecksummed,
    /// Same ordering and syncs, but the commit record is not checksummed.
    /// Recovery then trusts any header with a valid magic and count.
    SyncPlain,
    /// Checksummed, but `commit` issues no device syncs: the commit is
    /// acknowledged before it is durable. [`Journal::force_commit`] is the
    /// durability barrier. Trades crash-durability latency for throughput.
    AsyncAck,
}

impl DurabilityMode {
    fn checksummed(self) -> bool {
        !matches!(self, Self::SyncPlain)
    }

    fn synchronous(self) -> bool {
        !matches!(self, Self::AsyncAck)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct LogHeader {
    flags: u32,
    seq: u64,
    checksum: u32,
    home: Vec<BlockNumber>,
}

impl LogHeader {
    fn empty(seq: u64) -> Self {
        Self {
            flags: 0,
            seq,
            checksum: 0,
            home: Vec::new(),
        }
    }

    fn decode(data: &[u8]) -> std::result::Result<Self, ParseError> {
        let magic = read_le_u32(data, 0)?;
        if magic != LOG_MAGIC {
            return Err(ParseError::InvalidMagic {
                expected: LOG_MAGIC,
                actual: magic,
            });
        }
        let flags = read_le_u32(data, 4)?;
        let seq = read_le_u64(data, 8)?;
        let count = read_le_u32(data, 16)?;
        if count > LOG_BLOCKS {
            return Err(ParseError::InvalidField {
                field: "count",
                reason: "commit record exceeds log capacity",
            });
        }
        let checksum = read_le_u32(data, 20)?;
        let mut home = Vec::with_capacity(count as usize);
        for i in 0..count as usize {
            home.push(BlockNumber(read_le_u32(data, 24 + i * 4)?));
        }
        Ok(Self {
            flags,
            seq,
            checksum,
            home,
        })
    }

    fn encode(&self) -> Vec<u8> {
        let mut data = vec![0_u8; BLOCK_SIZE];
        // Infallible: the header always fits one block (count <= LOG_BLOCKS).
        let _ = write_le_u32(&mut data, 0, LOG_MAGIC);
        let _ = write_le_u32(&mut data, 4, self.flags);
        let _ = write_le_u64(&mut data, 8, self.seq);
        let _ = write_le_u32(&mut data, 16, self.home.len() as u32);
        let _ = write_le_u32(&mut data, 20, self.checksum);
        for (i, block) in self.home.iter().enumerate() {
            let _ = write_le_u32(&mut data, 24 + i * 4, block.0);
        }
        data
    }

    fn home_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.home.len() * 4);
        for block in &self.home {
            bytes.extend_from_slice(&block.0.to_le_bytes());
        }
        bytes
    }
}

struct LogState {
    /// Open transactions in the running group.
    outstanding: u32,
    /// Sum of open transactions' declared block budgets.
    reserved: usize,
    /// A group commit is writing to the log right now.
    committing: bool,
    /// Commit set of the running group: home block numbers in first-dirtied
    /// order, plus the cache handles to snapshot and checkpoint.
    queued: Vec<BlockNumber>,
    handles: HashMap<BlockNumber, BlockHandle>,
    /// Sequence number of the last durable commit record.
    seq: u64,
    next_txn: u64,
}

struct JournalShared {
    cache: Arc<BufferCache>,
    layout: Layout,
    mode: DurabilityMode,
    state: Mutex<LogState>,
    cond: Condvar,
}

/// The journal. One per mounted engine.
pub struct Journal {
    shared: Arc<JournalShared>,
}

impl std::fmt::Debug for Journal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Journal")
            .field("mode", &self.shared.mode)
            .finish_non_exhaustive()
    }
}

impl Journal {
    /// Write an empty log header. Used by format, before any mount.
    pub fn format_log(cache: &BufferCache, layout: &Layout) -> Result<()> {
        cache
            .device()
            .write_block(layout.log_start, &LogHeader::empty(0).encode())
    }

    /// Open the journal, running crash recovery first: replay the newest
    /// valid commit record into home locations, or discard an unreplayable
    /// tail. Must run before any other component touches the image.
    pub fn open(cache: Arc<BufferCache>, layout: Layout, mode: DurabilityMode) -> Result<Self> {
        let seq = recover(&cache, &layout)?;
        info!(seq, ?mode, "journal opened");
        Ok(Self {
            shared: Arc::new(JournalShared {
                cache,
                layout,
                mode,
                state: Mutex::new(LogState {
                    outstanding: 0,
                    reserved: 0,
                    committing: false,
                    queued: Vec::new(),
                    handles: HashMap::new(),
                    seq,
                    next_txn: 1,
                }),
                cond: Condvar::new(),
            }),
        })
    }

    /// Begin a transaction that will touch at most `max_blocks` blocks.
    ///
    /// Blocks the caller while a group commit is in flight or while the
    /// log cannot absorb this budget alongside the already-open
    /// transactions.
    pub fn start(&self, max_blocks: usize) -> Result<Transaction> {
        if max_blocks == 0 || max_blocks > MAX_OP_BLOCKS {
            return Err(RillError::Format(format!(
                "transaction budget {max_blocks} outside 1..={MAX_OP_BLOCKS}"
            )));
        }
        let shared = &self.shared;
        let mut state = shared.state.lock();
        while state.committing
            || state.queued.len() + state.reserved + max_blocks > LOG_BLOCKS as usize
        {
            shared.cond.wait(&mut state);
        }
        state.outstanding += 1;
        state.reserved += max_blocks;
        let id = TxnId(state.next_txn);
        state.next_txn += 1;
        drop(state);
        debug!(txn = id.0, max_blocks, "transaction started");
        Ok(Transaction {
            shared: Arc::clone(shared),
            id,
            max_blocks,
            grants: Vec::new(),
            by_block: HashMap::new(),
            closed: false,
        })
    }

    /// Durability barrier: wait out the running group, commit anything
    /// queued, and sync the device. After this returns, every transaction
    /// that closed before the call is on stable storage.
    pub fn force_commit(&self) -> Result<()> {
        let shared = &self.shared;
        let mut state = shared.state.lock();
        while state.committing || state.outstanding > 0 {
            shared.cond.wait(&mut state);
        }
        if state.queued.is_empty() {
            drop(state);
            return self.shared.cache.sync_device();
        }
        commit_group(shared, &mut state)?;
        drop(state);
        self.shared.cache.sync_device()
    }

    /// Sequence number of the most recent durable commit record.
    #[must_use]
    pub fn commit_seq(&self) -> u64 {
        self.shared.state.lock().seq
    }
}

/// Recovery: returns the sequence number to resume from.
fn recover(cache: &BufferCache, layout: &Layout) -> Result<u64> {
    let dev = cache.device();
    let header_block = dev.read_block(layout.log_start)?;
    let header = LogHeader::decode(header_block.as_slice()).map_err(|err| RillError::Corrupt {
        block: layout.log_start.0,
        detail: format!("log header: {err}"),
    })?;

    if header.home.is_empty() {
        info!("journal clean, nothing to recover");
        return Ok(header.seq);
    }

    // A replay writes to the home locations the record names. The record
    // survived a crash, so it gets the same trust as a mismatched checksum:
    // any home outside (superblock, log) discards the tail instead of
    // scribbling over the superblock or the log region itself.
    if let Some(bad) = header
        .home
        .iter()
        .find(|b| b.0 <= SUPERBLOCK_BLOCK || b.0 >= layout.log_start.0)
    {
        warn!(
            seq = header.seq,
            block = bad.0,
            "commit record names an out-of-range home block; discarding unreplayable tail"
        );
        dev.write_block(layout.log_start, &LogHeader::empty(header.seq).encode())?;
        dev.sync()?;
        return Ok(header.seq);
    }

    // Read every post-image first so a checksum verdict covers all of them.
    let mut images = Vec::with_capacity(header.home.len());
    for i in 0..header.home.len() {
        let image_block = BlockNumber(layout.log_image_start().0 + i as u32);
        images.push(dev.read_block(image_block)?);
    }

    if header.flags & FLAG_CHECKSUMMED != 0 {
        let mut crc = 0_u32;
        for image in &images {
            crc = crc32c::crc32c_append(crc, image.as_slice());
        }
        crc = crc32c::crc32c_append(crc, &header.home_bytes());
        if crc != header.checksum {
            warn!(
                seq = header.seq,
                expected = header.checksum,
                actual = crc,
                "commit record checksum mismatch; discarding unreplayable tail"
            );
            dev.write_block(layout.log_start, &LogHeader::empty(header.seq).encode())?;
            dev.sync()?;
            return Ok(header.seq);
        }
    }

    info!(
        seq = header.seq,
        blocks = header.home.len(),
        "replaying committed transaction"
    );
    for (image, home) in images.iter().zip(&header.home) {
        dev.write_block(*home, image.as_slice())?;
    }
    dev.sync()?;
    dev.write_block(layout.log_start, &LogHeader::empty(header.seq).encode())?;
    dev.sync()?;
    Ok(header.seq)
}

/// Write the running group's post-images, commit record, and checkpoint.
/// Called with the journal lock held. `outstanding` is zero, so nothing
/// races the commit set while the lock blocks new starts.
fn commit_group(shared: &JournalShared, state: &mut parking_lot::MutexGuard<'_, LogState>) -> Result<()> {
    state.committing = true;
    let queued = std::mem::take(&mut state.queued);
    let handles = std::mem::take(&mut state.handles);
    let seq = state.seq + 1;

    let result = write_group(shared, &queued, &handles, seq);

    match &result {
        Ok(()) => {
            state.seq = seq;
        }
        Err(err) => {
            warn!(seq, error = %err, "group commit failed");
            // The group could not be made durable; put it back so a retry
            // (or force_commit) can see it.
            state.queued = queued;
            state.handles = handles;
        }
    }
    state.committing = false;
    shared.cond.notify_all();
    result
}

fn write_group(
    shared: &JournalShared,
    queued: &[BlockNumber],
    handles: &HashMap<BlockNumber, BlockHandle>,
    seq: u64,
) -> Result<()> {
    let dev = shared.cache.device();
    let layout = &shared.layout;
    debug!(seq, blocks = queued.len(), "committing group");

    // Post-images to the log, in commit-set order.
    let mut crc = 0_u32;
    for (i, block) in queued.iter().enumerate() {
        let handle = handles
            .get(block)
            .ok_or_else(|| RillError::Format(format!("commit set lost handle for block {block}")))?;
        let snapshot = shared.cache.read_snapshot(handle)?;
        if shared.mode.checksummed() {
            crc = crc32c::crc32c_append(crc, &snapshot);
        }
        dev.write_block(BlockNumber(layout.log_image_start().0 + i as u32), &snapshot)?;
    }
    if shared.mode.synchronous() {
        dev.sync()?;
    }

    // Commit record. Durable before any home-location write.
    let mut header = LogHeader {
        flags: 0,
        seq,
        checksum: 0,
        home: queued.to_vec(),
    };
    if shared.mode.checksummed() {
        header.flags |= FLAG_CHECKSUMMED;
        header.checksum = crc32c::crc32c_append(crc, &header.home_bytes());
    }
    dev.write_block(layout.log_start, &header.encode())?;
    if shared.mode.synchronous() {
        dev.sync()?;
    }

    // Checkpoint: home-location writeback, then clear the record.
    for block in queued {
        if let Some(handle) = handles.get(block) {
            shared.cache.write_back(handle)?;
        }
    }
    if shared.mode.synchronous() {
        dev.sync()?;
    }
    dev.write_block(layout.log_start, &LogHeader::empty(seq).encode())?;
    if shared.mode.synchronous() {
        dev.sync()?;
    }
    debug!(seq, "group committed and checkpointed");
    Ok(())
}

struct Grant {
    guard: ExclusiveGuard,
    preimage: Option<Vec<u8>>,
    dirty: bool,
}

/// Token naming one granted block within a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockLease(usize);

/// One atomic group of block mutations.
///
/// Dropping an open transaction aborts it.
pub struct Transaction {
    shared: Arc<JournalShared>,
    id: TxnId,
    max_blocks: usize,
    grants: Vec<Grant>,
    by_block: HashMap<BlockNumber, usize>,
    closed: bool,
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.id)
            .field("grants", &self.grants.len())
            .finish_non_exhaustive()
    }
}

impl Transaction {
    #[must_use]
    pub fn id(&self) -> TxnId {
        self.id
    }

    /// Register intent to modify an existing block. Takes the block's
    /// exclusive lock (blocking contenders) and copies the pre-image so an
    /// abort can roll back. Idempotent per block.
    pub fn get_write_access(&mut self, handle: &BlockHandle) -> Result<BlockLease> {
        if let Some(&idx) = self.by_block.get(&handle.number()) {
            return Ok(BlockLease(idx));
        }
        self.check_budget()?;
        let guard = self.shared.cache.lock_exclusive(handle, self.id)?;
        let preimage = guard.with_data(<[u8]>::to_vec);
        self.push_grant(Grant {
            guard,
            preimage: Some(preimage),
            dirty: false,
        })
    }

    /// Register intent to fill a newly allocated block. No pre-image is
    /// kept (there is nothing meaningful to restore); the cache slot starts
    /// zeroed without reading the device.
    pub fn get_create_access(&mut self, handle: &BlockHandle) -> Result<BlockLease> {
        if let Some(&idx) = self.by_block.get(&handle.number()) {
            // Already granted; fresh semantics still apply.
            self.grants[idx].guard.with_data_mut(|data| data.fill(0));
            return Ok(BlockLease(idx));
        }
        self.check_budget()?;
        let guard = self.shared.cache.lock_exclusive_fresh(handle, self.id);
        self.push_grant(Grant {
            guard,
            preimage: None,
            dirty: false,
        })
    }

    fn check_budget(&self) -> Result<()> {
        if self.grants.len() >= self.max_blocks {
            return Err(RillError::Format(format!(
                "transaction {} exceeded its {}-block budget",
                self.id, self.max_blocks
            )));
        }
        Ok(())
    }

    fn push_grant(&mut self, grant: Grant) -> Result<BlockLease> {
        let block = grant.guard.number();
        let idx = self.grants.len();
        self.grants.push(grant);
        self.by_block.insert(block, idx);
        Ok(BlockLease(idx))
    }

    /// Read the granted block.
    pub fn with_block<R>(&self, lease: BlockLease, f: impl FnOnce(&[u8]) -> R) -> R {
        self.grants[lease.0].guard.with_data(f)
    }

    /// Copy a block's current contents, whether or not this transaction
    /// holds it. A plain shared read would deadlock against our own
    /// exclusive grant, so granted blocks are read through the grant.
    pub fn snapshot(&self, handle: &BlockHandle) -> Result<Vec<u8>> {
        if let Some(&idx) = self.by_block.get(&handle.number()) {
            return Ok(self.grants[idx].guard.with_data(<[u8]>::to_vec));
        }
        self.shared.cache.read_snapshot(handle)
    }

    /// Mutate the granted block. Call [`Self::mark_dirty`] afterwards to
    /// put the block in the commit set.
    pub fn with_block_mut<R>(&mut self, lease: BlockLease, f: impl FnOnce(&mut [u8]) -> R) -> R {
        self.grants[lease.0].guard.with_data_mut(f)
    }

    /// Add the block to this transaction's commit set.
    pub fn mark_dirty(&mut self, lease: BlockLease) {
        let grant = &mut self.grants[lease.0];
        grant.dirty = true;
        grant.guard.mark_dirty();
    }

    /// Close the transaction, committing its marked blocks as part of the
    /// running group. The last transaction to close commits the group.
    pub fn commit(mut self) -> Result<()> {
        self.closed = true;
        let dirty: Vec<(BlockNumber, BlockHandle)> = self
            .grants
            .iter()
            .filter(|g| g.dirty)
            .map(|g| (g.guard.number(), g.guard.handle()))
            .collect();
        // Release the exclusive locks before the group snapshot takes
        // shared locks.
        self.grants.clear();
        self.by_block.clear();

        let shared = Arc::clone(&self.shared);
        let mut state = shared.state.lock();
        for (block, handle) in dirty {
            if !state.queued.contains(&block) {
                state.queued.push(block);
            }
            state.handles.insert(block, handle); // absorption keeps the newest handle
        }
        state.outstanding -= 1;
        state.reserved -= self.max_blocks;
        debug!(txn = self.id.0, "transaction closed");

        if state.outstanding == 0 && !state.queued.is_empty() {
            let result = commit_group(&shared, &mut state);
            drop(state);
            return result;
        }
        drop(state);
        shared.cond.notify_all();
        Ok(())
    }

    /// Abort: restore pre-images, drop locks, leave the group untouched.
    /// Only valid while `Open`; `commit` consumes the transaction, so the
    /// type system already forbids aborting past that point.
    pub fn abort(mut self) {
        self.abort_inner();
    }

    fn abort_inner(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        let shared = Arc::clone(&self.shared);
        {
            // Blocks queued by an earlier transaction of the same group must
            // keep their dirty mark; only this transaction's own damage is
            // rolled back.
            let state = shared.state.lock();
            for grant in self.grants.iter_mut().rev() {
                if let Some(pre) = grant.preimage.take() {
                    grant.guard.with_data_mut(|data| data.copy_from_slice(&pre));
                }
                if !state.queued.contains(&grant.guard.number()) {
                    grant.guard.clear_dirty();
                }
            }
        }
        self.grants.clear();
        self.by_block.clear();

        let mut state = shared.state.lock();
        state.outstanding -= 1;
        state.reserved -= self.max_blocks;
        debug!(txn = self.id.0, "transaction aborted");

        // An abort can be the group's last closer. Blocks queued by
        // already-acknowledged transactions must not wait for an unrelated
        // later group; commit them now, as any last closer would.
        if state.outstanding == 0 && !state.queued.is_empty() {
            if let Err(err) = commit_group(&shared, &mut state) {
                // The group stays queued; force_commit or the next group
                // retries it.
                warn!(error = %err, "group commit on abort failed");
            }
            return;
        }
        drop(state);
        shared.cond.notify_all();
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        self.abort_inner();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rill_block::{ByteBlockDevice, MemByteDevice};
    use std::thread;
    use std::time::Duration;

    const IMAGE_BLOCKS: u32 = 512;

    struct Fixture {
        mem: Arc<MemByteDevice>,
        cache: Arc<BufferCache>,
        layout: Layout,
    }

    fn fixture() -> Fixture {
        let mem = Arc::new(MemByteDevice::new(IMAGE_BLOCKS));
        let layout = Layout::compute(IMAGE_BLOCKS, 64).unwrap();
        let cache = cache_for(&mem);
        Journal::format_log(&cache, &layout).unwrap();
        Fixture { mem, cache, layout }
    }

    fn cache_for(mem: &Arc<MemByteDevice>) -> Arc<BufferCache> {
        let dev = ByteBlockDevice::new(Arc::clone(mem)).unwrap();
        Arc::new(BufferCache::new(Arc::new(dev), 128).unwrap())
    }

    fn open(fx: &Fixture) -> Journal {
        Journal::open(Arc::clone(&fx.cache), fx.layout, DurabilityMode::SyncChecksummed).unwrap()
    }

    fn data_block(fx: &Fixture, i: u32) -> BlockNumber {
        BlockNumber(fx.layout.data_start.0 + i)
    }

    #[test]
    fn commit_reaches_home_location() {
        let fx = fixture();
        let journal = open(&fx);
        let target = data_block(&fx, 0);

        let mut txn = journal.start(4).unwrap();
        let handle = fx.cache.get(target);
        let lease = txn.get_write_access(&handle).unwrap();
        txn.with_block_mut(lease, |data| data[0] = 0x5A);
        txn.mark_dirty(lease);
        txn.commit().unwrap();

        let on_disk = fx.cache.device().read_block(target).unwrap();
        assert_eq!(on_disk.as_slice()[0], 0x5A);
        assert_eq!(journal.commit_seq(), 1);

        // Checkpoint cleared the commit record.
        let header = fx.cache.device().read_block(fx.layout.log_start).unwrap();
        let decoded = LogHeader::decode(header.as_slice()).unwrap();
        assert!(decoded.home.is_empty());
        assert_eq!(decoded.seq, 1);
    }

    #[test]
    fn unmarked_blocks_stay_out_of_the_commit_set() {
        let fx = fixture();
        let journal = open(&fx);
        let target = data_block(&fx, 1);

        let mut txn = journal.start(4).unwrap();
        let handle = fx.cache.get(target);
        let lease = txn.get_write_access(&handle).unwrap();
        txn.with_block_mut(lease, |data| data[0] = 0x77);
        // No mark_dirty.
        txn.commit().unwrap();

        let on_disk = fx.cache.device().read_block(target).unwrap();
        assert_eq!(on_disk.as_slice()[0], 0);
    }

    #[test]
    fn abort_restores_pre_image() {
        let fx = fixture();
        let journal = open(&fx);
        let target = data_block(&fx, 2);
        fx.cache
            .device()
            .write_block(target, &{
                let mut b = vec![0_u8; BLOCK_SIZE];
                b[0] = 0xAA;
                b
            })
            .unwrap();

        let mut txn = journal.start(4).unwrap();
        let handle = fx.cache.get(target);
        let lease = txn.get_write_access(&handle).unwrap();
        txn.with_block_mut(lease, |data| data[0] = 0xBB);
        txn.mark_dirty(lease);
        txn.abort();

        // Cache content rolled back, nothing dirty, nothing on disk changed.
        assert!(!handle.is_dirty());
        let snapshot = fx.cache.read_snapshot(&handle).unwrap();
        assert_eq!(snapshot[0], 0xAA);

        // The journal accepts new transactions afterwards.
        let txn = journal.start(4).unwrap();
        txn.commit().unwrap();
    }

    #[test]
    fn dropping_an_open_transaction_aborts_it() {
        let fx = fixture();
        let journal = open(&fx);
        let target = data_block(&fx, 3);

        {
            let mut txn = journal.start(4).unwrap();
            let handle = fx.cache.get(target);
            let lease = txn.get_write_access(&handle).unwrap();
            txn.with_block_mut(lease, |data| data[0] = 1);
            txn.mark_dirty(lease);
            // Dropped without commit.
        }
        journal.force_commit().unwrap();
        let on_disk = fx.cache.device().read_block(target).unwrap();
        assert_eq!(on_disk.as_slice()[0], 0);
    }

    #[test]
    fn group_absorbs_repeat_writes_to_one_block() {
        let fx = fixture();
        let journal = open(&fx);
        let target = data_block(&fx, 4);

        // Two transactions in one group touch the same block; the second
        // observes and extends the first's content.
        let mut a = journal.start(4).unwrap();
        let mut b = journal.start(4).unwrap();

        let handle = fx.cache.get(target);
        let lease = a.get_write_access(&handle).unwrap();
        a.with_block_mut(lease, |data| data[0] = 1);
        a.mark_dirty(lease);
        a.commit().unwrap(); // group still open: b outstanding

        let lease = b.get_write_access(&handle).unwrap();
        b.with_block_mut(lease, |data| data[1] = 2);
        b.mark_dirty(lease);
        b.commit().unwrap(); // commits the whole group

        let on_disk = fx.cache.device().read_block(target).unwrap();
        assert_eq!(on_disk.as_slice()[0], 1);
        assert_eq!(on_disk.as_slice()[1], 2);
        // One group, one commit record.
        assert_eq!(journal.commit_seq(), 1);
    }

    #[test]
    fn abort_closing_the_group_commits_prior_transactions() {
        let fx = fixture();
        let journal = open(&fx);
        let target = data_block(&fx, 9);

        let mut a = journal.start(4).unwrap();
        let mut b = journal.start(4).unwrap();

        let handle = fx.cache.get(target);
        let lease = a.get_write_access(&handle).unwrap();
        a.with_block_mut(lease, |data| data[0] = 0x5A);
        a.mark_dirty(lease);
        a.commit().unwrap(); // group still open: b outstanding

        // b gives up without touching anything. It is the last closer, so
        // a's acknowledged write must reach its home location now, not at
        // some unrelated later commit.
        b.abort();

        let on_disk = fx.cache.device().read_block(target).unwrap();
        assert_eq!(on_disk.as_slice()[0], 0x5A);
        assert_eq!(journal.commit_seq(), 1);

        // The checkpoint also cleared the commit record.
        let header = fx.cache.device().read_block(fx.layout.log_start).unwrap();
        assert!(LogHeader::decode(header.as_slice()).unwrap().home.is_empty());
    }

    #[test]
    fn budget_saturation_blocks_start_until_commit() {
        let fx = fixture();
        let journal = Arc::new(open(&fx));

        // Three 32-block budgets fill the 96-block log.
        let t1 = journal.start(MAX_OP_BLOCKS).unwrap();
        let t2 = journal.start(MAX_OP_BLOCKS).unwrap();
        let t3 = journal.start(MAX_OP_BLOCKS).unwrap();

        let journal2 = Arc::clone(&journal);
        let blocked = thread::spawn(move || {
            let txn = journal2.start(1).unwrap();
            txn.commit().unwrap();
        });

        thread::sleep(Duration::from_millis(50));
        assert!(!blocked.is_finished());

        t1.commit().unwrap();
        t2.commit().unwrap();
        t3.commit().unwrap();
        blocked.join().unwrap();
    }

    #[test]
    fn oversized_budget_is_rejected() {
        let fx = fixture();
        let journal = open(&fx);
        assert!(journal.start(0).is_err());
        assert!(journal.start(MAX_OP_BLOCKS + 1).is_err());

        let mut txn = journal.start(1).unwrap();
        let h1 = fx.cache.get(data_block(&fx, 0));
        let h2 = fx.cache.get(data_block(&fx, 1));
        txn.get_write_access(&h1).unwrap();
        assert!(txn.get_write_access(&h2).is_err());
    }

    #[test]
    fn crash_before_commit_record_discards_transaction() {
        let fx = fixture();
        let journal = open(&fx);
        let target = data_block(&fx, 5);

        // Allow the post-image write, fail the commit-record write.
        let mut txn = journal.start(4).unwrap();
        let handle = fx.cache.get(target);
        let lease = txn.get_write_access(&handle).unwrap();
        txn.with_block_mut(lease, |data| data[0] = 9);
        txn.mark_dirty(lease);
        fx.mem.fail_after_writes(1);
        assert!(txn.commit().is_err());

        // "Crash": re-open from the surviving bytes.
        let mem = Arc::new(MemByteDevice::from_bytes(fx.mem.snapshot()));
        let cache = cache_for(&mem);
        let layout = fx.layout;
        let journal = Journal::open(cache.clone(), layout, DurabilityMode::SyncChecksummed).unwrap();
        assert_eq!(journal.commit_seq(), 0);
        let on_disk = cache.device().read_block(target).unwrap();
        assert_eq!(on_disk.as_slice()[0], 0);
    }

    #[test]
    fn crash_after_commit_record_replays_on_recovery() {
        let fx = fixture();
        let journal = open(&fx);
        let target = data_block(&fx, 6);

        // Post-image and commit record succeed; the checkpoint write fails.
        let mut txn = journal.start(4).unwrap();
        let handle = fx.cache.get(target);
        let lease = txn.get_write_access(&handle).unwrap();
        txn.with_block_mut(lease, |data| data[0] = 0xC4);
        txn.mark_dirty(lease);
        fx.mem.fail_after_writes(2);
        assert!(txn.commit().is_err());

        // Home location untouched before recovery.
        assert_eq!(fx.mem.snapshot()[target.byte_offset() as usize], 0);

        let mem = Arc::new(MemByteDevice::from_bytes(fx.mem.snapshot()));
        let cache = cache_for(&mem);
        let journal =
            Journal::open(cache.clone(), fx.layout, DurabilityMode::SyncChecksummed).unwrap();
        assert_eq!(journal.commit_seq(), 1);
        let on_disk = cache.device().read_block(target).unwrap();
        assert_eq!(on_disk.as_slice()[0], 0xC4);

        // Recovery is idempotent: a second open changes nothing.
        let mem2 = Arc::new(MemByteDevice::from_bytes(mem.snapshot()));
        let cache2 = cache_for(&mem2);
        let journal2 =
            Journal::open(cache2.clone(), fx.layout, DurabilityMode::SyncChecksummed).unwrap();
        assert_eq!(journal2.commit_seq(), 1);
        let on_disk = cache2.device().read_block(target).unwrap();
        assert_eq!(on_disk.as_slice()[0], 0xC4);
    }

    #[test]
    fn corrupt_commit_checksum_truncates_replay() {
        let fx = fixture();
        let journal = open(&fx);
        let target = data_block(&fx, 7);

        let mut txn = journal.start(4).unwrap();
        let handle = fx.cache.get(target);
        let lease = txn.get_write_access(&handle).unwrap();
        txn.with_block_mut(lease, |data| data[0] = 0xD1);
        txn.mark_dirty(lease);
        fx.mem.fail_after_writes(2); // record durable, checkpoint lost
        assert!(txn.commit().is_err());

        // Flip a byte of the logged post-image.
        let mut bytes = fx.mem.snapshot();
        let image_off = fx.layout.log_image_start().byte_offset() as usize;
        bytes[image_off] ^= 0xFF;

        let mem = Arc::new(MemByteDevice::from_bytes(bytes));
        let cache = cache_for(&mem);
        let journal =
            Journal::open(cache.clone(), fx.layout, DurabilityMode::SyncChecksummed).unwrap();

        // Tail discarded, home untouched, journal usable.
        let on_disk = cache.device().read_block(target).unwrap();
        assert_eq!(on_disk.as_slice()[0], 0);
        journal.start(1).unwrap().commit().unwrap();
    }

    #[test]
    fn garbage_log_header_fails_mount_as_corrupt() {
        let fx = fixture();
        let mut bytes = fx.mem.snapshot();
        let off = fx.layout.log_start.byte_offset() as usize;
        bytes[off..off + 4].copy_from_slice(&0xBAD0_BAD0_u32.to_le_bytes());

        let mem = Arc::new(MemByteDevice::from_bytes(bytes));
        let cache = cache_for(&mem);
        let err = Journal::open(cache, fx.layout, DurabilityMode::SyncChecksummed).unwrap_err();
        assert!(matches!(err, RillError::Corrupt { .. }));
    }

    #[test]
    fn async_ack_defers_durability_to_force_commit() {
        let fx = fixture();
        let journal =
            Journal::open(Arc::clone(&fx.cache), fx.layout, DurabilityMode::AsyncAck).unwrap();
        let target = data_block(&fx, 8);

        let mut txn = journal.start(4).unwrap();
        let handle = fx.cache.get(target);
        let lease = txn.get_write_access(&handle).unwrap();
        txn.with_block_mut(lease, |data| data[0] = 3);
        txn.mark_dirty(lease);
        txn.commit().unwrap();
        journal.force_commit().unwrap();

        let on_disk = fx.cache.device().read_block(target).unwrap();
        assert_eq!(on_disk.as_slice()[0], 3);
    }

    #[test]
    fn sync_plain_mode_recovers_without_checksum() {
        let fx = fixture();
        let journal =
            Journal::open(Arc::clone(&fx.cache), fx.layout, DurabilityMode::SyncPlain).unwrap();
        let target = data_block(&fx, 9);

        let mut txn = journal.start(4).unwrap();
        let handle = fx.cache.get(target);
        let lease = txn.get_write_access(&handle).unwrap();
        txn.with_block_mut(lease, |data| data[0] = 6);
        txn.mark_dirty(lease);
        fx.mem.fail_after_writes(2);
        assert!(txn.commit().is_err());

        let mem = Arc::new(MemByteDevice::from_bytes(fx.mem.snapshot()));
        let cache = cache_for(&mem);
        let journal =
            Journal::open(cache.clone(), fx.layout, DurabilityMode::SyncPlain).unwrap();
        assert_eq!(journal.commit_seq(), 1);
        let on_disk = cache.device().read_block(target).unwrap();
        assert_eq!(on_disk.as_slice()[0], 6);
    }

    #[test]
    fn out_of_range_home_block_is_discarded_not_replayed() {
        let fx = fixture();
        let sb_before = fx.cache.device().read_block(BlockNumber(SUPERBLOCK_BLOCK)).unwrap();

        // A commit record claiming the superblock and the log region as
        // home locations. SyncPlain, so no checksum stands in the way.
        let rogue = LogHeader {
            flags: 0,
            seq: 1,
            checksum: 0,
            home: vec![BlockNumber(SUPERBLOCK_BLOCK), fx.layout.log_start],
        };
        fx.cache
            .device()
            .write_block(fx.layout.log_start, &rogue.encode())
            .unwrap();

        let mem = Arc::new(MemByteDevice::from_bytes(fx.mem.snapshot()));
        let cache = cache_for(&mem);
        let journal = Journal::open(cache.clone(), fx.layout, DurabilityMode::SyncPlain).unwrap();
        assert_eq!(journal.commit_seq(), 1);

        let sb_after = cache.device().read_block(BlockNumber(SUPERBLOCK_BLOCK)).unwrap();
        assert_eq!(sb_before.as_slice(), sb_after.as_slice());
        let header_block = cache.device().read_block(fx.layout.log_start).unwrap();
        assert!(LogHeader::decode(header_block.as_slice()).unwrap().home.is_empty());
    }

    #[test]
    fn log_header_round_trip() {
        let header = LogHeader {
            flags: FLAG_CHECKSUMMED,
            seq: 17,
            checksum: 0xFEED_BEEF,
            home: vec![BlockNumber(100), BlockNumber(205), BlockNumber(3)],
        };
        let decoded = LogHeader::decode(&header.encode()).unwrap();
        assert_eq!(decoded, header);

        let mut bad = header.encode();
        bad[16..20].copy_from_slice(&(LOG_BLOCKS + 1).to_le_bytes());
        assert!(LogHeader::decode(&bad).is_err());
    }
}

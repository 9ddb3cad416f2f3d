#![forbid(unsafe_code)]
//! The mounted filesystem engine.
//!
//! [`Engine::format`] lays a fresh image down; [`Engine::mount`] loads the
//! superblock, runs journal recovery, and returns a live engine; the
//! [`Vfs`] impl on `Engine` is the operation surface hosts dispatch into.
//!
//! # Locking
//!
//! Two levels above the block cache's per-block locks:
//!
//! - a per-inode stripe lock serializes operations on one inode (data ops
//!   take exactly one stripe; attribute reads included);
//! - one namespace lock serializes all structural operations (create,
//!   link, unlink, rename), which may hold several stripes at once.
//!
//! A single-stripe holder never waits for a second stripe, and multi-
//! stripe holders are serialized by the namespace lock, so stripe
//! acquisition cannot form a cycle. At the block level, every transaction
//! pins the inode-table blocks it will touch before taking any bitmap,
//! directory, or data grants; with a uniform region order across
//! transactions, block-grant waits cannot form a cycle either.
//!
//! All record and directory reads happen before the operation's
//! transaction starts; once inode-table blocks are pinned exclusively, a
//! shared read of them would wait on our own grant.

mod vfs;

pub use vfs::{Attr, DirEntry, Vfs};

pub use rill_journal::DurabilityMode;
pub use rill_types::InodeNumber;

use parking_lot::{Mutex, MutexGuard};
use rill_alloc::BlockAllocator;
use rill_block::{BlockDevice, BufferCache};
use rill_error::{Result, RillError};
use rill_inode::InodeTable;
use rill_journal::{Journal, Transaction};
use rill_ondisk::{DiskInode, Layout, Superblock, MAX_OP_BLOCKS};
use rill_types::{BlockNumber, InodeKind, BLOCK_SIZE, SUPERBLOCK_BLOCK};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, info};

const STRIPES: usize = 64;
const OP_BUDGET: usize = MAX_OP_BLOCKS;
/// Content bytes one write transaction may carry; larger writes split.
const WRITE_CHUNK: usize = 8 * BLOCK_SIZE;
/// File blocks one reservation transaction may cover; larger ranges split.
const RESERVE_CHUNK: usize = 256;

/// The root directory's inode number.
pub const ROOT_INUM: InodeNumber = rill_types::InodeNumber::ROOT;

/// Mount-time configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MountOptions {
    /// Commit durability discipline.
    pub durability: DurabilityMode,
    /// Block cache capacity, in blocks.
    pub cache_blocks: usize,
    /// Refuse every mutating operation.
    pub read_only: bool,
}

impl Default for MountOptions {
    fn default() -> Self {
        Self {
            durability: DurabilityMode::default(),
            cache_blocks: 1024,
            read_only: false,
        }
    }
}

/// Capacity and usage counters, the statfs view.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineStats {
    pub total_blocks: u32,
    pub data_blocks: u32,
    pub free_data_blocks: u32,
    pub log_blocks: u32,
    pub ninodes: u32,
    pub used_inodes: u32,
}

/// A mounted filesystem.
pub struct Engine {
    cache: Arc<BufferCache>,
    journal: Journal,
    alloc: Arc<BlockAllocator>,
    table: InodeTable,
    layout: Layout,
    options: MountOptions,
    ns_lock: Mutex<()>,
    stripes: Vec<Mutex<()>>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("layout", &self.layout)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_secs())
}

fn corrupt_super(err: impl std::fmt::Display) -> RillError {
    RillError::Corrupt {
        block: SUPERBLOCK_BLOCK,
        detail: format!("superblock: {err}"),
    }
}

impl Engine {
    /// Write a fresh filesystem across the whole of `dev`: superblock,
    /// free bitmap, empty inode table, clean log, and a root directory.
    /// Offline operation; the image must not be mounted.
    pub fn format(dev: &Arc<dyn BlockDevice>, ninodes: u32) -> Result<()> {
        let total_blocks = dev.block_count();
        let layout = Layout::compute(total_blocks, ninodes)
            .map_err(|reason| RillError::Format(format!("cannot format: {reason}")))?;

        let mut sb_block = vec![0_u8; BLOCK_SIZE];
        layout
            .superblock()
            .encode(&mut sb_block)
            .map_err(|err| RillError::Format(err.to_string()))?;
        dev.write_block(BlockNumber(SUPERBLOCK_BLOCK), &sb_block)?;

        let cache = Arc::new(BufferCache::new(Arc::clone(dev), 64)?);
        BlockAllocator::format_bitmap(&cache, &layout)?;
        InodeTable::format_table(&cache, &layout)?;
        Journal::format_log(&cache, &layout)?;

        // Root directory, through a real transaction so the image carries
        // a checkpointed state from the start.
        let journal = Journal::open(Arc::clone(&cache), layout, DurabilityMode::default())?;
        let alloc = Arc::new(BlockAllocator::new(layout));
        let table = InodeTable::new(layout, alloc);
        let now = unix_now();

        let mut txn = journal.start(OP_BUDGET)?;
        let root = table.allocate_inode(&cache, &mut txn, InodeKind::Directory)?;
        if root != ROOT_INUM {
            return Err(RillError::Format(format!(
                "fresh inode table yielded inode {root} for the root"
            )));
        }
        let mut record = DiskInode::free();
        record.kind = Some(InodeKind::Directory);
        record.nlink = 2;
        record.atime = now;
        record.mtime = now;
        record.ctime = now;
        rill_dir::link(&table, &cache, &mut txn, &mut record, b".", root, InodeKind::Directory)?;
        rill_dir::link(&table, &cache, &mut txn, &mut record, b"..", root, InodeKind::Directory)?;
        table.update(&cache, &mut txn, root, &record)?;
        txn.commit()?;
        journal.force_commit()?;

        info!(total_blocks, ninodes, "formatted image");
        Ok(())
    }

    /// Load the superblock, recover the journal, and come up. Fails with
    /// [`RillError::Corrupt`] rather than mounting a bad image.
    pub fn mount(dev: Arc<dyn BlockDevice>, options: MountOptions) -> Result<Self> {
        let sb_block = dev.read_block(BlockNumber(SUPERBLOCK_BLOCK))?;
        let sb = Superblock::decode(sb_block.as_slice()).map_err(corrupt_super)?;
        sb.validate().map_err(corrupt_super)?;
        let layout = sb.layout();
        if layout.total_blocks > dev.block_count() {
            return Err(corrupt_super(format!(
                "superblock spans {} blocks but the device holds {}",
                layout.total_blocks,
                dev.block_count()
            )));
        }

        let cache = Arc::new(BufferCache::new(dev, options.cache_blocks)?);
        let journal = Journal::open(Arc::clone(&cache), layout, options.durability)?;
        let alloc = Arc::new(BlockAllocator::new(layout));
        let table = InodeTable::new(layout, Arc::clone(&alloc));

        let root = table.read(&cache, ROOT_INUM)?;
        if root.kind != Some(InodeKind::Directory) {
            return Err(RillError::Corrupt {
                block: layout.inode_start.0,
                detail: "root inode is not a directory".to_string(),
            });
        }

        info!(
            total_blocks = layout.total_blocks,
            ninodes = layout.ninodes,
            read_only = options.read_only,
            "mounted"
        );
        Ok(Self {
            cache,
            journal,
            alloc,
            table,
            layout,
            options,
            ns_lock: Mutex::new(()),
            stripes: (0..STRIPES).map(|_| Mutex::new(())).collect(),
        })
    }

    /// Flush everything and tear the engine down.
    pub fn unmount(self) -> Result<()> {
        self.journal.force_commit()?;
        info!("unmounted");
        Ok(())
    }

    /// The region layout this engine is mounted over.
    #[must_use]
    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    /// Capacity and usage counters.
    pub fn stats(&self) -> Result<EngineStats> {
        let free_data_blocks = self.alloc.count_free(&self.cache)?;
        let mut used_inodes = 0;
        for inum in 1..self.layout.ninodes {
            if !self.table.read(&self.cache, InodeNumber(inum))?.is_free() {
                used_inodes += 1;
            }
        }
        Ok(EngineStats {
            total_blocks: self.layout.total_blocks,
            data_blocks: self.layout.data_blocks,
            free_data_blocks,
            log_blocks: self.layout.log_blocks,
            ninodes: self.layout.ninodes,
            used_inodes,
        })
    }

    fn require_writable(&self) -> Result<()> {
        if self.options.read_only {
            return Err(RillError::ReadOnly);
        }
        Ok(())
    }

    /// Stripe guards for `inos`, deduplicated and in stripe order.
    fn lock_stripes(&self, inos: &[InodeNumber]) -> Vec<MutexGuard<'_, ()>> {
        let mut indices: Vec<usize> = inos.iter().map(|i| i.0 as usize % STRIPES).collect();
        indices.sort_unstable();
        indices.dedup();
        indices.into_iter().map(|i| self.stripes[i].lock()).collect()
    }

    /// Pin the inode-table blocks backing `inos` before any other grant.
    /// Inode-table blocks come first in every transaction; bitmap,
    /// directory, and data grants follow.
    fn pin_records(&self, txn: &mut Transaction, inos: &[InodeNumber]) -> Result<()> {
        let mut blocks: Vec<BlockNumber> = Vec::with_capacity(inos.len());
        for &ino in inos {
            let (block, _) = self
                .layout
                .inode_location(ino)
                .map_err(|err| RillError::Format(format!("inode {ino}: {err}")))?;
            blocks.push(block);
        }
        blocks.sort_unstable();
        blocks.dedup();
        for block in blocks {
            let handle = self.cache.get(block);
            txn.get_write_access(&handle)?;
        }
        Ok(())
    }

    fn load(&self, ino: InodeNumber) -> Result<DiskInode> {
        let record = self.table.read(&self.cache, ino)?;
        if record.is_free() {
            return Err(RillError::NotFound(format!("inode {ino}")));
        }
        Ok(record)
    }

    fn load_dir(&self, ino: InodeNumber) -> Result<DiskInode> {
        let record = self.load(ino)?;
        if record.kind != Some(InodeKind::Directory) {
            return Err(RillError::NotDirectory);
        }
        Ok(record)
    }

    fn attr_of(&self, ino: InodeNumber, record: &DiskInode) -> Result<Attr> {
        let kind = record
            .kind
            .ok_or_else(|| RillError::NotFound(format!("inode {ino}")))?;
        Ok(Attr {
            ino,
            kind,
            nlink: u32::from(record.nlink),
            size: record.size,
            blocks: record.size.div_ceil(BLOCK_SIZE as u64),
            major: record.major,
            minor: record.minor,
            atime: record.atime,
            mtime: record.mtime,
            ctime: record.ctime,
            blksize: BLOCK_SIZE as u32,
        })
    }

    fn not_found(name: &[u8]) -> RillError {
        RillError::NotFound(String::from_utf8_lossy(name).into_owned())
    }

    fn reject_dots(name: &[u8]) -> Result<()> {
        if name == b"." || name == b".." {
            return Err(RillError::Format(
                "`.` and `..` cannot be created, removed, or renamed".to_string(),
            ));
        }
        Ok(())
    }

    /// Content operations apply to files and symlinks only.
    fn require_file(record: &DiskInode) -> Result<()> {
        match record.kind {
            Some(InodeKind::Directory) => Err(RillError::IsDirectory),
            Some(InodeKind::Device) => Err(RillError::Format(
                "device content lives with the host, not the engine".to_string(),
            )),
            _ => Ok(()),
        }
    }

    /// Shared create path for files, directories, device nodes, and
    /// symlinks. `content` seeds the new inode's data in the same
    /// transaction; symlinks store their target this way.
    fn create_node(
        &self,
        parent: InodeNumber,
        name: &[u8],
        kind: InodeKind,
        major: u16,
        minor: u16,
        content: Option<&[u8]>,
    ) -> Result<Attr> {
        self.require_writable()?;
        rill_dir::validate_name(name)?;
        Self::reject_dots(name)?;
        let _ns = self.ns_lock.lock();
        let _locks = self.lock_stripes(&[parent]);

        let mut pdir = self.load_dir(parent)?;
        if rill_dir::lookup(&self.table, &self.cache, &pdir, name)?.is_some() {
            return Err(RillError::Exists);
        }

        let now = unix_now();
        let mut txn = self.journal.start(OP_BUDGET)?;
        self.pin_records(&mut txn, &[parent])?;
        let ino = self.table.allocate_inode(&self.cache, &mut txn, kind)?;

        let mut child = DiskInode::free();
        child.kind = Some(kind);
        child.major = major;
        child.minor = minor;
        child.nlink = 1;
        child.atime = now;
        child.mtime = now;
        child.ctime = now;
        if kind == InodeKind::Directory {
            child.nlink = 2;
            rill_dir::link(&self.table, &self.cache, &mut txn, &mut child, b".", ino, kind)?;
            rill_dir::link(
                &self.table,
                &self.cache,
                &mut txn,
                &mut child,
                b"..",
                parent,
                InodeKind::Directory,
            )?;
            pdir.nlink += 1;
        }
        if let Some(content) = content {
            self.table
                .write_at(&self.cache, &mut txn, &mut child, 0, content)?;
        }
        rill_dir::link(&self.table, &self.cache, &mut txn, &mut pdir, name, ino, kind)?;
        pdir.mtime = now;
        pdir.ctime = now;
        self.table.update(&self.cache, &mut txn, ino, &child)?;
        self.table.update(&self.cache, &mut txn, parent, &pdir)?;
        txn.commit()?;

        debug!(parent = parent.0, ino = ino.0, ?kind, "created");
        self.attr_of(ino, &child)
    }

    /// Root-ward walk from `start`, failing if `dir` is on the path. Keeps
    /// rename from moving a directory beneath its own descendant.
    fn ensure_not_descendant(&self, dir: InodeNumber, start: InodeNumber) -> Result<()> {
        let mut current = start;
        for _ in 0..self.layout.ninodes {
            if current == dir {
                return Err(RillError::Format(
                    "cannot move a directory beneath itself".to_string(),
                ));
            }
            if current == ROOT_INUM {
                return Ok(());
            }
            let record = self.load_dir(current)?;
            let up = rill_dir::lookup(&self.table, &self.cache, &record, b"..")?
                .ok_or_else(|| RillError::Corrupt {
                    block: 0,
                    detail: format!("directory {current} has no `..` entry"),
                })?;
            current = up.inum;
        }
        Err(RillError::Corrupt {
            block: 0,
            detail: "`..` chain does not terminate at the root".to_string(),
        })
    }
}

impl Vfs for Engine {
    fn getattr(&self, ino: InodeNumber) -> Result<Attr> {
        let _locks = self.lock_stripes(&[ino]);
        let record = self.load(ino)?;
        self.attr_of(ino, &record)
    }

    fn lookup(&self, parent: InodeNumber, name: &[u8]) -> Result<Attr> {
        let _locks = self.lock_stripes(&[parent]);
        let pdir = self.load_dir(parent)?;
        let slot = rill_dir::lookup(&self.table, &self.cache, &pdir, name)?
            .ok_or_else(|| Self::not_found(name))?;
        let record = self.load(slot.inum)?;
        self.attr_of(slot.inum, &record)
    }

    fn readdir(&self, ino: InodeNumber) -> Result<Vec<DirEntry>> {
        let _locks = self.lock_stripes(&[ino]);
        let dir = self.load_dir(ino)?;
        let slots = rill_dir::entries(&self.table, &self.cache, &dir)?;
        Ok(slots
            .into_iter()
            .map(|slot| DirEntry {
                ino: slot.inum,
                kind: slot.kind,
                offset: slot.offset,
                name: slot.name,
            })
            .collect())
    }

    fn create(&self, parent: InodeNumber, name: &[u8], kind: InodeKind) -> Result<Attr> {
        match kind {
            InodeKind::Device => {
                return Err(RillError::Format(
                    "device nodes are created through mknod".to_string(),
                ))
            }
            InodeKind::Symlink => {
                return Err(RillError::Format(
                    "symbolic links are created through symlink".to_string(),
                ))
            }
            InodeKind::Directory | InodeKind::File => {}
        }
        self.create_node(parent, name, kind, 0, 0, None)
    }

    fn mknod(&self, parent: InodeNumber, name: &[u8], major: u16, minor: u16) -> Result<Attr> {
        self.create_node(parent, name, InodeKind::Device, major, minor, None)
    }

    fn symlink(&self, parent: InodeNumber, name: &[u8], target: &[u8]) -> Result<Attr> {
        if target.is_empty() {
            return Err(RillError::Format("empty symlink target".to_string()));
        }
        // One block keeps the target write inside the create transaction.
        if target.len() > BLOCK_SIZE {
            return Err(RillError::NameTooLong);
        }
        self.create_node(parent, name, InodeKind::Symlink, 0, 0, Some(target))
    }

    fn readlink(&self, ino: InodeNumber) -> Result<Vec<u8>> {
        let _locks = self.lock_stripes(&[ino]);
        let record = self.load(ino)?;
        if record.kind != Some(InodeKind::Symlink) {
            return Err(RillError::Format(format!("inode {ino} is not a symlink")));
        }
        let mut buf = vec![0_u8; record.size as usize];
        let n = self.table.read_at(&self.cache, &record, 0, &mut buf)?;
        buf.truncate(n);
        Ok(buf)
    }

    fn link(&self, ino: InodeNumber, parent: InodeNumber, name: &[u8]) -> Result<Attr> {
        self.require_writable()?;
        rill_dir::validate_name(name)?;
        Self::reject_dots(name)?;
        let _ns = self.ns_lock.lock();
        let _locks = self.lock_stripes(&[parent, ino]);

        let mut pdir = self.load_dir(parent)?;
        let mut child = self.load(ino)?;
        let kind = child
            .kind
            .ok_or_else(|| RillError::NotFound(format!("inode {ino}")))?;
        if kind == InodeKind::Directory {
            return Err(RillError::IsDirectory);
        }
        if rill_dir::lookup(&self.table, &self.cache, &pdir, name)?.is_some() {
            return Err(RillError::Exists);
        }

        let now = unix_now();
        let mut txn = self.journal.start(OP_BUDGET)?;
        self.pin_records(&mut txn, &[parent, ino])?;
        rill_dir::link(&self.table, &self.cache, &mut txn, &mut pdir, name, ino, kind)?;
        child.nlink += 1;
        child.ctime = now;
        pdir.mtime = now;
        pdir.ctime = now;
        self.table.update(&self.cache, &mut txn, ino, &child)?;
        self.table.update(&self.cache, &mut txn, parent, &pdir)?;
        txn.commit()?;
        self.attr_of(ino, &child)
    }

    fn unlink(&self, parent: InodeNumber, name: &[u8]) -> Result<()> {
        self.require_writable()?;
        rill_dir::validate_name(name)?;
        Self::reject_dots(name)?;
        let _ns = self.ns_lock.lock();

        // The namespace lock holds name bindings stable, so the stripe set
        // can be computed from an unlocked probe.
        let probe = self.load_dir(parent)?;
        let slot = rill_dir::lookup(&self.table, &self.cache, &probe, name)?
            .ok_or_else(|| Self::not_found(name))?;
        let _locks = self.lock_stripes(&[parent, slot.inum]);

        let mut pdir = self.load_dir(parent)?;
        let mut child = self.load(slot.inum)?;
        let is_dir = child.kind == Some(InodeKind::Directory);
        if is_dir && !rill_dir::is_empty(&self.table, &self.cache, &child)? {
            return Err(RillError::NotEmpty);
        }

        let now = unix_now();
        let mut txn = self.journal.start(OP_BUDGET)?;
        self.pin_records(&mut txn, &[parent, slot.inum])?;
        rill_dir::remove(&self.table, &self.cache, &mut txn, &mut pdir, name)?;
        if is_dir {
            pdir.nlink -= 1;
            self.table
                .free_inode(&self.cache, &mut txn, slot.inum, &mut child)?;
        } else {
            child.nlink -= 1;
            if child.nlink == 0 {
                self.table
                    .free_inode(&self.cache, &mut txn, slot.inum, &mut child)?;
            } else {
                child.ctime = now;
                self.table.update(&self.cache, &mut txn, slot.inum, &child)?;
            }
        }
        pdir.mtime = now;
        pdir.ctime = now;
        self.table.update(&self.cache, &mut txn, parent, &pdir)?;
        txn.commit()?;
        debug!(parent = parent.0, ino = slot.inum.0, "unlinked");
        Ok(())
    }

    fn rename(
        &self,
        parent: InodeNumber,
        name: &[u8],
        new_parent: InodeNumber,
        new_name: &[u8],
    ) -> Result<()> {
        self.require_writable()?;
        rill_dir::validate_name(name)?;
        rill_dir::validate_name(new_name)?;
        Self::reject_dots(name)?;
        Self::reject_dots(new_name)?;
        let _ns = self.ns_lock.lock();
        let same_parent = parent == new_parent;

        let pdir_probe = self.load_dir(parent)?;
        let src = rill_dir::lookup(&self.table, &self.cache, &pdir_probe, name)?
            .ok_or_else(|| Self::not_found(name))?;
        if same_parent && name == new_name {
            return Ok(());
        }
        let ndir_probe = if same_parent {
            pdir_probe
        } else {
            self.load_dir(new_parent)?
        };
        let dst = rill_dir::lookup(&self.table, &self.cache, &ndir_probe, new_name)?;
        if let Some(d) = &dst {
            if d.inum == src.inum {
                return Ok(());
            }
        }

        let mut stripe_set = vec![parent, new_parent, src.inum];
        if let Some(d) = &dst {
            stripe_set.push(d.inum);
        }
        let _locks = self.lock_stripes(&stripe_set);

        let mut pdir = self.load_dir(parent)?;
        let mut ndir = if same_parent {
            None
        } else {
            Some(self.load_dir(new_parent)?)
        };
        let mut child = self.load(src.inum)?;
        let src_kind = child
            .kind
            .ok_or_else(|| Self::not_found(name))?;
        let src_is_dir = src_kind == InodeKind::Directory;

        if src_is_dir {
            self.ensure_not_descendant(src.inum, new_parent)?;
        }
        let mut victim = None;
        if let Some(d) = &dst {
            let record = self.load(d.inum)?;
            let dst_is_dir = record.kind == Some(InodeKind::Directory);
            match (src_is_dir, dst_is_dir) {
                (false, true) => return Err(RillError::IsDirectory),
                (true, false) => return Err(RillError::NotDirectory),
                (true, true) => {
                    if !rill_dir::is_empty(&self.table, &self.cache, &record)? {
                        return Err(RillError::NotEmpty);
                    }
                }
                (false, false) => {}
            }
            victim = Some((d.clone(), record, dst_is_dir));
        }
        // `..` slot of a moving directory, found before the transaction.
        let dotdot = if src_is_dir && !same_parent {
            Some(
                rill_dir::lookup(&self.table, &self.cache, &child, b"..")?.ok_or_else(|| {
                    RillError::Corrupt {
                        block: 0,
                        detail: format!("directory {} has no `..` entry", src.inum),
                    }
                })?,
            )
        } else {
            None
        };

        let now = unix_now();
        let mut txn = self.journal.start(OP_BUDGET)?;
        self.pin_records(&mut txn, &stripe_set)?;

        rill_dir::remove(&self.table, &self.cache, &mut txn, &mut pdir, name)?;
        {
            let target = ndir.as_mut().unwrap_or(&mut pdir);
            match &victim {
                Some((slot, _, _)) => rill_dir::retarget(
                    &self.table,
                    &self.cache,
                    &mut txn,
                    target,
                    slot,
                    src.inum,
                    src_kind,
                    new_name,
                )?,
                None => rill_dir::link(
                    &self.table,
                    &self.cache,
                    &mut txn,
                    target,
                    new_name,
                    src.inum,
                    src_kind,
                )?,
            }
        }

        // Subdirectory counts: a moved directory leaves one parent and
        // joins another; a replaced directory leaves its parent.
        if src_is_dir && !same_parent {
            pdir.nlink -= 1;
            if let Some(ndir) = ndir.as_mut() {
                ndir.nlink += 1;
            }
        }
        if let Some((_, _, true)) = &victim {
            match ndir.as_mut() {
                Some(ndir) => ndir.nlink -= 1,
                None => pdir.nlink -= 1,
            }
        }
        if let Some((slot, mut record, dst_is_dir)) = victim {
            let inum = slot.inum;
            if dst_is_dir {
                self.table.free_inode(&self.cache, &mut txn, inum, &mut record)?;
            } else {
                record.nlink -= 1;
                if record.nlink == 0 {
                    self.table.free_inode(&self.cache, &mut txn, inum, &mut record)?;
                } else {
                    record.ctime = now;
                    self.table.update(&self.cache, &mut txn, inum, &record)?;
                }
            }
        }
        if let Some(slot) = dotdot {
            rill_dir::retarget(
                &self.table,
                &self.cache,
                &mut txn,
                &mut child,
                &slot,
                new_parent,
                InodeKind::Directory,
                b"..",
            )?;
        }

        child.ctime = now;
        pdir.mtime = now;
        pdir.ctime = now;
        self.table.update(&self.cache, &mut txn, src.inum, &child)?;
        self.table.update(&self.cache, &mut txn, parent, &pdir)?;
        if let Some(mut ndir) = ndir {
            ndir.mtime = now;
            ndir.ctime = now;
            self.table.update(&self.cache, &mut txn, new_parent, &ndir)?;
        }
        txn.commit()?;
        debug!(
            from = parent.0,
            to = new_parent.0,
            ino = src.inum.0,
            "renamed"
        );
        Ok(())
    }

    fn read(&self, ino: InodeNumber, offset: u64, size: u32) -> Result<Vec<u8>> {
        let _locks = self.lock_stripes(&[ino]);
        let mut record = self.load(ino)?;
        Self::require_file(&record)?;
        let len = (size as u64).min(record.size.saturating_sub(offset));
        let mut buf = vec![0_u8; len as usize];
        let n = self.table.read_at(&self.cache, &record, offset, &mut buf)?;
        buf.truncate(n);

        if !self.options.read_only {
            let mut txn = self.journal.start(OP_BUDGET)?;
            self.pin_records(&mut txn, &[ino])?;
            record.atime = unix_now();
            self.table.update(&self.cache, &mut txn, ino, &record)?;
            txn.commit()?;
        }
        Ok(buf)
    }

    fn write(&self, ino: InodeNumber, offset: u64, data: &[u8]) -> Result<usize> {
        self.require_writable()?;
        let _locks = self.lock_stripes(&[ino]);
        let mut record = self.load(ino)?;
        Self::require_file(&record)?;

        let now = unix_now();
        let mut written = 0;
        while written < data.len() {
            let n = WRITE_CHUNK.min(data.len() - written);
            let mut txn = self.journal.start(OP_BUDGET)?;
            self.pin_records(&mut txn, &[ino])?;
            self.table.write_at(
                &self.cache,
                &mut txn,
                &mut record,
                offset + written as u64,
                &data[written..written + n],
            )?;
            record.mtime = now;
            record.ctime = now;
            self.table.update(&self.cache, &mut txn, ino, &record)?;
            txn.commit()?;
            written += n;
        }
        Ok(data.len())
    }

    fn truncate(&self, ino: InodeNumber, size: u64) -> Result<()> {
        self.require_writable()?;
        let _locks = self.lock_stripes(&[ino]);
        let mut record = self.load(ino)?;
        Self::require_file(&record)?;
        let now = unix_now();
        let mut txn = self.journal.start(OP_BUDGET)?;
        self.pin_records(&mut txn, &[ino])?;
        self.table.truncate(&self.cache, &mut txn, &mut record, size)?;
        record.mtime = now;
        record.ctime = now;
        self.table.update(&self.cache, &mut txn, ino, &record)?;
        txn.commit()
    }

    fn allocate(&self, ino: InodeNumber, offset: u64, len: u64) -> Result<()> {
        self.require_writable()?;
        let _locks = self.lock_stripes(&[ino]);
        let mut record = self.load(ino)?;
        Self::require_file(&record)?;
        let now = unix_now();
        let mut pos = offset;
        let end = offset
            .checked_add(len)
            .ok_or_else(|| RillError::FileTooLarge {
                requested: u64::MAX,
                max: rill_inode::MAX_FILE_SIZE,
            })?;
        loop {
            let chunk_end = end.min(pos + (RESERVE_CHUNK * BLOCK_SIZE) as u64);
            let mut txn = self.journal.start(OP_BUDGET)?;
            self.pin_records(&mut txn, &[ino])?;
            self.table
                .reserve_range(&self.cache, &mut txn, &mut record, pos, chunk_end - pos)?;
            record.ctime = now;
            self.table.update(&self.cache, &mut txn, ino, &record)?;
            txn.commit()?;
            if chunk_end == end {
                break;
            }
            pos = chunk_end;
        }
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        self.journal.force_commit()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_mount_options_are_writable_and_checksummed() {
        let options = MountOptions::default();
        assert!(!options.read_only);
        assert_eq!(options.durability, DurabilityMode::SyncChecksummed);
        assert!(options.cache_blocks > 0);
    }

    #[test]
    fn dot_names_are_rejected() {
        assert!(Engine::reject_dots(b".").is_err());
        assert!(Engine::reject_dots(b"..").is_err());
        assert!(Engine::reject_dots(b"...").is_ok());
        assert!(Engine::reject_dots(b"a").is_ok());
    }
}

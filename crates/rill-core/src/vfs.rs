//! The capability interface hosts drive the engine through.
//!
//! A host collaborator (FUSE adapter, test harness, embedded caller) holds
//! a `dyn Vfs` and dispatches its requests per method; the engine is the
//! one implementation here. Operations address files by inode number, so
//! path walking is the host's business, one `lookup` per component.

use rill_error::Result;
use rill_types::{InodeKind, InodeNumber};
use serde::{Deserialize, Serialize};

/// Inode attributes, the stat-level view of one file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attr {
    /// Inode number.
    pub ino: InodeNumber,
    /// File type.
    pub kind: InodeKind,
    /// Number of directory entries referencing this inode.
    pub nlink: u32,
    /// File size in bytes.
    pub size: u64,
    /// Content blocks the size spans (holes included).
    pub blocks: u64,
    /// Device major number; zero unless `kind` is a device.
    pub major: u16,
    /// Device minor number; zero unless `kind` is a device.
    pub minor: u16,
    /// Last access time, seconds since the epoch.
    pub atime: u64,
    /// Last content modification time, seconds since the epoch.
    pub mtime: u64,
    /// Last attribute change time, seconds since the epoch.
    pub ctime: u64,
    /// Preferred I/O size.
    pub blksize: u32,
}

/// One name in a directory listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirEntry {
    /// Inode number of the target.
    pub ino: InodeNumber,
    /// File type of the target.
    pub kind: Option<InodeKind>,
    /// Byte offset of the entry's slot in the directory stream.
    pub offset: u64,
    /// Entry name (one component, not a path).
    pub name: Vec<u8>,
}

impl DirEntry {
    /// The name as a UTF-8 string (lossy).
    #[must_use]
    pub fn name_str(&self) -> String {
        String::from_utf8_lossy(&self.name).into_owned()
    }
}

/// Filesystem operations, one method per host request.
///
/// `Send + Sync` so hosts may call concurrently from multiple threads; the
/// engine does its own locking.
pub trait Vfs: Send + Sync {
    /// Attributes of inode `ino`.
    fn getattr(&self, ino: InodeNumber) -> Result<Attr>;

    /// Find `name` in directory `parent`.
    fn lookup(&self, parent: InodeNumber, name: &[u8]) -> Result<Attr>;

    /// Every live entry of directory `ino`, in stream order.
    fn readdir(&self, ino: InodeNumber) -> Result<Vec<DirEntry>>;

    /// Create a file or directory named `name` under `parent`.
    fn create(&self, parent: InodeNumber, name: &[u8], kind: InodeKind) -> Result<Attr>;

    /// Create a device node named `name` under `parent`.
    fn mknod(&self, parent: InodeNumber, name: &[u8], major: u16, minor: u16) -> Result<Attr>;

    /// Create a symbolic link named `name` under `parent` whose content is
    /// the byte string `target`. The target is not resolved or validated.
    fn symlink(&self, parent: InodeNumber, name: &[u8], target: &[u8]) -> Result<Attr>;

    /// The stored target of symlink `ino`.
    fn readlink(&self, ino: InodeNumber) -> Result<Vec<u8>>;

    /// Add a second directory entry (`parent`/`name`) for existing inode
    /// `ino`. Directories cannot be hard-linked.
    fn link(&self, ino: InodeNumber, parent: InodeNumber, name: &[u8]) -> Result<Attr>;

    /// Remove entry `name` from `parent`. Removing the last link frees the
    /// inode and its blocks; a directory must be empty.
    fn unlink(&self, parent: InodeNumber, name: &[u8]) -> Result<()>;

    /// Move `parent`/`name` to `new_parent`/`new_name`, atomically
    /// replacing a compatible existing target.
    fn rename(
        &self,
        parent: InodeNumber,
        name: &[u8],
        new_parent: InodeNumber,
        new_name: &[u8],
    ) -> Result<()>;

    /// Up to `size` bytes of `ino`'s content starting at `offset`. Short
    /// reads happen only at EOF; holes read as zeros.
    fn read(&self, ino: InodeNumber, offset: u64, size: u32) -> Result<Vec<u8>>;

    /// Write `data` into `ino` at `offset`, extending the file as needed.
    fn write(&self, ino: InodeNumber, offset: u64, data: &[u8]) -> Result<usize>;

    /// Set `ino`'s length, freeing or hole-extending as needed.
    fn truncate(&self, ino: InodeNumber, size: u64) -> Result<()>;

    /// Reserve zero-filled backing for `[offset, offset + len)` without
    /// writing data.
    fn allocate(&self, ino: InodeNumber, offset: u64, len: u64) -> Result<()>;

    /// Durability barrier: flush every committed transaction to stable
    /// storage before returning.
    fn sync(&self) -> Result<()>;
}

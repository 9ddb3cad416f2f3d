#![forbid(unsafe_code)]
//! Directory entry management.
//!
//! A directory's content is a linear array of fixed-width 64-byte entry
//! slots; a slot with inode number 0 is free and gets reused in place, so
//! removing entries never compacts the stream. Lookup is a full scan.
//!
//! Mutating functions scan through their transaction, so they stay safe on
//! blocks the transaction already holds. The read-only functions scan with
//! shared reads and must run before the caller's transaction takes grants
//! on the directory's blocks.

use rill_block::BufferCache;
use rill_error::{Result, RillError};
use rill_inode::InodeTable;
use rill_journal::Transaction;
use rill_ondisk::{DiskInode, Dirent};
use rill_types::{InodeKind, InodeNumber, BLOCK_SIZE, DIRENT_NAME_LEN, DIRENT_SIZE};
use tracing::trace;

/// A live entry found in a directory, with its byte offset in the stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirSlot {
    pub inum: InodeNumber,
    pub kind: Option<InodeKind>,
    pub offset: u64,
    pub name: Vec<u8>,
}

/// Reject names the entry format cannot hold.
pub fn validate_name(name: &[u8]) -> Result<()> {
    if name.is_empty() || name.contains(&0) || name.contains(&b'/') {
        return Err(RillError::Format(format!(
            "invalid entry name {:?}",
            String::from_utf8_lossy(name)
        )));
    }
    if name.len() > DIRENT_NAME_LEN {
        return Err(RillError::NameTooLong);
    }
    Ok(())
}

fn require_directory(dir: &DiskInode) -> Result<()> {
    if dir.kind != Some(InodeKind::Directory) {
        return Err(RillError::NotDirectory);
    }
    Ok(())
}

/// Walk every slot of `dir`, live or free, in stream order. `txn` must be
/// supplied whenever the calling transaction may already hold directory
/// blocks; a plain shared read would then wait on our own grant.
fn scan<T>(
    table: &InodeTable,
    cache: &BufferCache,
    txn: Option<&Transaction>,
    dir: &DiskInode,
    mut visit: impl FnMut(u64, &Dirent) -> Option<T>,
) -> Result<Option<T>> {
    let mut chunk = vec![0_u8; BLOCK_SIZE];
    let mut offset = 0_u64;
    while offset < dir.size {
        let n = match txn {
            Some(txn) => table.read_at_in_txn(cache, txn, dir, offset, &mut chunk)?,
            None => table.read_at(cache, dir, offset, &mut chunk)?,
        };
        if n == 0 {
            break;
        }
        let mut at = 0;
        while at + DIRENT_SIZE <= n {
            let slot = Dirent::decode(&chunk, at).map_err(|err| RillError::Corrupt {
                block: 0,
                detail: format!("directory entry at offset {}: {err}", offset + at as u64),
            })?;
            if let Some(found) = visit(offset + at as u64, &slot) {
                return Ok(Some(found));
            }
            at += DIRENT_SIZE;
        }
        offset += at as u64;
        if at == 0 {
            break;
        }
    }
    Ok(None)
}

/// Find `name` in `dir`.
pub fn lookup(
    table: &InodeTable,
    cache: &BufferCache,
    dir: &DiskInode,
    name: &[u8],
) -> Result<Option<DirSlot>> {
    require_directory(dir)?;
    validate_name(name)?;
    scan(table, cache, None, dir, |offset, slot| {
        if !slot.is_free() && slot.name_bytes() == name {
            Some(DirSlot {
                inum: slot.inum,
                kind: slot.kind,
                offset,
                name: slot.name_bytes().to_vec(),
            })
        } else {
            None
        }
    })
}

/// Add entry `name -> inum` to `dir`, reusing the first free slot or
/// appending one. Fails with [`RillError::Exists`] if the name is taken.
///
/// The caller persists the directory inode afterwards; appending grows
/// the directory by one slot.
pub fn link(
    table: &InodeTable,
    cache: &BufferCache,
    txn: &mut Transaction,
    dir: &mut DiskInode,
    name: &[u8],
    inum: InodeNumber,
    kind: InodeKind,
) -> Result<()> {
    require_directory(dir)?;
    validate_name(name)?;

    let mut free_slot = None;
    let taken = scan(table, cache, Some(txn), dir, |offset, slot| {
        if slot.is_free() {
            if free_slot.is_none() {
                free_slot = Some(offset);
            }
            None
        } else if slot.name_bytes() == name {
            Some(())
        } else {
            None
        }
    })?;
    if taken.is_some() {
        return Err(RillError::Exists);
    }
    let offset = free_slot.unwrap_or(dir.size);

    let entry = Dirent::new(inum, kind, name).map_err(|err| RillError::Format(err.to_string()))?;
    let mut slot = [0_u8; DIRENT_SIZE];
    entry
        .encode(&mut slot, 0)
        .map_err(|err| RillError::Format(err.to_string()))?;
    table.write_at(cache, txn, dir, offset, &slot)?;
    trace!(
        name = %String::from_utf8_lossy(name),
        inum = inum.0,
        offset,
        "linked entry"
    );
    Ok(())
}

/// Remove entry `name` from `dir`, freeing its slot in place. Returns the
/// removed entry.
pub fn remove(
    table: &InodeTable,
    cache: &BufferCache,
    txn: &mut Transaction,
    dir: &mut DiskInode,
    name: &[u8],
) -> Result<DirSlot> {
    require_directory(dir)?;
    validate_name(name)?;
    let found = scan(table, cache, Some(txn), dir, |offset, slot| {
        if !slot.is_free() && slot.name_bytes() == name {
            Some(DirSlot {
                inum: slot.inum,
                kind: slot.kind,
                offset,
                name: slot.name_bytes().to_vec(),
            })
        } else {
            None
        }
    })?;
    let Some(found) = found else {
        return Err(RillError::NotFound(
            String::from_utf8_lossy(name).into_owned(),
        ));
    };
    let mut slot = [0_u8; DIRENT_SIZE];
    Dirent::empty()
        .encode(&mut slot, 0)
        .map_err(|err| RillError::Format(err.to_string()))?;
    table.write_at(cache, txn, dir, found.offset, &slot)?;
    trace!(
        name = %String::from_utf8_lossy(name),
        inum = found.inum.0,
        "removed entry"
    );
    Ok(found)
}

/// Point an existing entry `name` at a different inode, in place. Used by
/// rename when the destination name already exists.
pub fn retarget(
    table: &InodeTable,
    cache: &BufferCache,
    txn: &mut Transaction,
    dir: &mut DiskInode,
    slot: &DirSlot,
    inum: InodeNumber,
    kind: InodeKind,
    name: &[u8],
) -> Result<()> {
    require_directory(dir)?;
    let entry = Dirent::new(inum, kind, name).map_err(|err| RillError::Format(err.to_string()))?;
    let mut bytes = [0_u8; DIRENT_SIZE];
    entry
        .encode(&mut bytes, 0)
        .map_err(|err| RillError::Format(err.to_string()))?;
    table.write_at(cache, txn, dir, slot.offset, &bytes)?;
    Ok(())
}

/// True when `dir` holds no live entries besides `.` and `..`.
pub fn is_empty(table: &InodeTable, cache: &BufferCache, dir: &DiskInode) -> Result<bool> {
    require_directory(dir)?;
    let busy = scan(table, cache, None, dir, |_, slot| {
        if slot.is_free() || slot.name_bytes() == b"." || slot.name_bytes() == b".." {
            None
        } else {
            Some(())
        }
    })?;
    Ok(busy.is_none())
}

/// Every live entry of `dir`, in stream order.
pub fn entries(table: &InodeTable, cache: &BufferCache, dir: &DiskInode) -> Result<Vec<DirSlot>> {
    require_directory(dir)?;
    let mut out = Vec::new();
    scan(table, cache, None, dir, |offset, slot| {
        if !slot.is_free() {
            out.push(DirSlot {
                inum: slot.inum,
                kind: slot.kind,
                offset,
                name: slot.name_bytes().to_vec(),
            });
        }
        None::<()>
    })?;
    Ok(out)
}

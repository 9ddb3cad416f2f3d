#![forbid(unsafe_code)]
//! Core types for rillfs: identifier newtypes, on-disk layout constants,
//! and little-endian byte parsing helpers shared by every other crate.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Fixed block size of the backing store, in bytes.
pub const BLOCK_SIZE: usize = 4096;

/// Direct block pointers per inode.
pub const NDIRECT: usize = 8;

/// Block pointers per indirect block (4096 / 4).
pub const NINDIRECT: usize = BLOCK_SIZE / 4;

/// Blocks addressable through the double-indirect pointer.
pub const NDINDIRECT: usize = NINDIRECT * NINDIRECT;

/// Maximum file size in blocks: direct + single-indirect + double-indirect.
pub const MAX_FILE_BLOCKS: usize = NDIRECT + NINDIRECT + NDINDIRECT;

/// Pointer slots per inode: direct array plus single- and double-indirect.
pub const NADDRS: usize = NDIRECT + 2;

/// Index of the single-indirect pointer in the address array.
pub const SINGLE_SLOT: usize = NDIRECT;

/// Index of the double-indirect pointer in the address array.
pub const DOUBLE_SLOT: usize = NDIRECT + 1;

/// Size of one packed on-disk inode record in bytes.
pub const INODE_SIZE: usize = 80;

/// Inode records per block.
pub const INODES_PER_BLOCK: usize = BLOCK_SIZE / INODE_SIZE;

/// Bytes reserved for a directory entry name (NUL padded, not necessarily
/// NUL terminated at maximum length).
pub const DIRENT_NAME_LEN: usize = 58;

/// Size of one packed directory entry in bytes.
pub const DIRENT_SIZE: usize = 64;

/// Directory entries per block.
pub const DIRENTS_PER_BLOCK: usize = BLOCK_SIZE / DIRENT_SIZE;

/// Bitmap bits per bitmap block.
pub const BITS_PER_BLOCK: usize = BLOCK_SIZE * 8;

/// Block number of the superblock. Block 0 is reserved.
pub const SUPERBLOCK_BLOCK: u32 = 1;

/// Inode number of the root directory.
pub const ROOT_INUM: u32 = 1;

/// A block number on the backing store.
///
/// On-disk pointers are 32-bit, which caps an image at 2^32 blocks (16 TiB
/// at 4 KiB blocks).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockNumber(pub u32);

/// A stable inode number. 1-indexed; 0 marks a free directory slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct InodeNumber(pub u32);

/// Monotonic transaction identifier, assigned by the journal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TxnId(pub u64);

impl fmt::Display for BlockNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for InodeNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for TxnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl InodeNumber {
    pub const ROOT: Self = Self(ROOT_INUM);
}

impl BlockNumber {
    /// Byte offset of this block on the backing store.
    #[must_use]
    pub fn byte_offset(self) -> u64 {
        u64::from(self.0) * BLOCK_SIZE as u64
    }

    /// Add a block count, returning `None` on overflow.
    #[must_use]
    pub fn checked_add(self, count: u32) -> Option<Self> {
        self.0.checked_add(count).map(Self)
    }
}

/// The kind of object an inode describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u16)]
pub enum InodeKind {
    Directory = 1,
    File = 2,
    Device = 3,
    Symlink = 4,
}

impl InodeKind {
    /// Decode an on-disk type tag. `0` means the record is free and has no
    /// kind; any other unknown value is a parse error.
    pub fn from_raw(raw: u16) -> Result<Option<Self>, ParseError> {
        match raw {
            0 => Ok(None),
            1 => Ok(Some(Self::Directory)),
            2 => Ok(Some(Self::File)),
            3 => Ok(Some(Self::Device)),
            4 => Ok(Some(Self::Symlink)),
            _ => Err(ParseError::InvalidField {
                field: "itype",
                reason: "unknown inode type tag",
            }),
        }
    }

    #[must_use]
    pub fn to_raw(self) -> u16 {
        self as u16
    }
}

/// Decoded form of one on-disk block pointer slot.
///
/// The raw encoding reserves two sentinel values: `0` for an absent pointer
/// and `1` for a reserved-but-unmaterialized block. Real block numbers start
/// at 2, which is always inside the metadata region and therefore never a
/// legal data pointer by accident.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BlockRef {
    /// No block: a hole. Reads as zeros; a write allocates.
    NotPresent,
    /// Reserved by `allocate` but not yet backed by a physical block.
    /// Reads as zeros; the first write allocates and replaces this.
    ZeroOnDemand,
    /// A real, allocated block.
    Data(BlockNumber),
}

/// Raw slot value for [`BlockRef::NotPresent`].
pub const RAW_NOT_PRESENT: u32 = 0;
/// Raw slot value for [`BlockRef::ZeroOnDemand`].
pub const RAW_ZERO_ON_DEMAND: u32 = 1;
/// Lowest raw slot value that is a real block number.
pub const RAW_FIRST_BLOCK: u32 = 2;

impl BlockRef {
    /// Decode a raw on-disk pointer slot.
    #[must_use]
    pub fn from_raw(raw: u32) -> Self {
        match raw {
            RAW_NOT_PRESENT => Self::NotPresent,
            RAW_ZERO_ON_DEMAND => Self::ZeroOnDemand,
            n => Self::Data(BlockNumber(n)),
        }
    }

    /// Encode to the raw on-disk pointer slot value.
    #[must_use]
    pub fn to_raw(self) -> u32 {
        match self {
            Self::NotPresent => RAW_NOT_PRESENT,
            Self::ZeroOnDemand => RAW_ZERO_ON_DEMAND,
            Self::Data(block) => block.0,
        }
    }

    /// The backing block, if one is materialized.
    #[must_use]
    pub fn block(self) -> Option<BlockNumber> {
        match self {
            Self::Data(block) => Some(block),
            Self::NotPresent | Self::ZeroOnDemand => None,
        }
    }

    /// True for both hole encodings (anything that reads as zeros).
    #[must_use]
    pub fn is_hole(self) -> bool {
        !matches!(self, Self::Data(_))
    }
}

/// Errors raised while decoding on-disk bytes.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("insufficient data: need {needed} bytes at offset {offset}, got {actual}")]
    InsufficientData {
        needed: usize,
        offset: usize,
        actual: usize,
    },
    #[error("invalid magic: expected {expected:#x}, got {actual:#x}")]
    InvalidMagic { expected: u32, actual: u32 },
    #[error("invalid field: {field} ({reason})")]
    InvalidField {
        field: &'static str,
        reason: &'static str,
    },
}

#[inline]
pub fn ensure_slice(data: &[u8], offset: usize, len: usize) -> Result<&[u8], ParseError> {
    let Some(end) = offset.checked_add(len) else {
        return Err(ParseError::InvalidField {
            field: "offset",
            reason: "overflow",
        });
    };

    if end > data.len() {
        return Err(ParseError::InsufficientData {
            needed: len,
            offset,
            actual: data.len().saturating_sub(offset),
        });
    }

    Ok(&data[offset..end])
}

#[inline]
fn ensure_slice_mut(data: &mut [u8], offset: usize, len: usize) -> Result<&mut [u8], ParseError> {
    let Some(end) = offset.checked_add(len) else {
        return Err(ParseError::InvalidField {
            field: "offset",
            reason: "overflow",
        });
    };

    if end > data.len() {
        return Err(ParseError::InsufficientData {
            needed: len,
            offset,
            actual: data.len().saturating_sub(offset),
        });
    }

    Ok(&mut data[offset..end])
}

#[inline]
pub fn read_le_u16(data: &[u8], offset: usize) -> Result<u16, ParseError> {
    let bytes = ensure_slice(data, offset, 2)?;
    Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
}

#[inline]
pub fn read_le_u32(data: &[u8], offset: usize) -> Result<u32, ParseError> {
    let bytes = ensure_slice(data, offset, 4)?;
    Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

#[inline]
pub fn read_le_u64(data: &[u8], offset: usize) -> Result<u64, ParseError> {
    let bytes = ensure_slice(data, offset, 8)?;
    Ok(u64::from_le_bytes([
        bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
    ]))
}

#[inline]
pub fn write_le_u16(data: &mut [u8], offset: usize, value: u16) -> Result<(), ParseError> {
    ensure_slice_mut(data, offset, 2)?.copy_from_slice(&value.to_le_bytes());
    Ok(())
}

#[inline]
pub fn write_le_u32(data: &mut [u8], offset: usize, value: u32) -> Result<(), ParseError> {
    ensure_slice_mut(data, offset, 4)?.copy_from_slice(&value.to_le_bytes());
    Ok(())
}

#[inline]
pub fn write_le_u64(data: &mut [u8], offset: usize, value: u64) -> Result<(), ParseError> {
    ensure_slice_mut(data, offset, 8)?.copy_from_slice(&value.to_le_bytes());
    Ok(())
}

#[inline]
pub fn read_fixed<const N: usize>(data: &[u8], offset: usize) -> Result<[u8; N], ParseError> {
    let bytes = ensure_slice(data, offset, N)?;
    let mut out = [0_u8; N];
    out.copy_from_slice(bytes);
    Ok(out)
}

/// Interpret a NUL-padded name field. Stops at the first NUL; a name that
/// fills the whole field has no terminator.
#[must_use]
pub fn trim_nul_padded(bytes: &[u8]) -> &[u8] {
    let end = bytes.iter().position(|b| *b == 0).unwrap_or(bytes.len());
    &bytes[..end]
}

#![forbid(unsafe_code)]
//! On-disk structures: superblock, packed inode records, directory entries,
//! and the region layout computed at format time.
//!
//! Image layout, in block order:
//!
//! ```text
//! | 0: reserved | 1: superblock | bitmap | inode table | data | log (tail) |
//! ```
//!
//! All fields are little-endian and packed. Decoding never panics;
//! structural violations surface as `ParseError`.

use rill_types::{
    ensure_slice, read_fixed, read_le_u16, read_le_u32, read_le_u64, trim_nul_padded, write_le_u16,
    write_le_u32, write_le_u64, BlockNumber, BlockRef, InodeKind, InodeNumber, ParseError,
    BITS_PER_BLOCK, DIRENT_NAME_LEN, DIRENT_SIZE, INODES_PER_BLOCK, INODE_SIZE, NADDRS,
    SUPERBLOCK_BLOCK,
};
use serde::{Deserialize, Serialize};

/// Superblock magic ("RLFS").
pub const SUPER_MAGIC: u32 = 0x524C_4653;

/// Packed superblock size in bytes (8 × u32).
pub const SUPERBLOCK_SIZE: usize = 32;

/// Journal capacity in post-image blocks. Matches the per-transaction block
/// budget times a small concurrency factor, so a full group of concurrent
/// operations always fits one commit.
pub const LOG_BLOCKS: u32 = 96;

/// Largest number of blocks one transaction may touch.
pub const MAX_OP_BLOCKS: usize = 32;

/// Static layout descriptor, written once at format time and read-only for
/// the lifetime of a mount.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Superblock {
    /// Size of the whole image in blocks.
    pub total_blocks: u32,
    /// Number of blocks in the data region.
    pub data_blocks: u32,
    /// Number of inode records in the inode table.
    pub ninodes: u32,
    /// Number of post-image blocks in the log region (header excluded).
    pub log_blocks: u32,
    /// First block of the log region (the log header block).
    pub log_start: u32,
    /// First block of the inode table.
    pub inode_start: u32,
    /// First block of the free bitmap.
    pub bitmap_start: u32,
    /// Must equal [`SUPER_MAGIC`].
    pub magic: u32,
}

impl Superblock {
    /// Decode from the leading bytes of the superblock block.
    pub fn decode(data: &[u8]) -> Result<Self, ParseError> {
        ensure_slice(data, 0, SUPERBLOCK_SIZE)?;
        Ok(Self {
            total_blocks: read_le_u32(data, 0)?,
            data_blocks: read_le_u32(data, 4)?,
            ninodes: read_le_u32(data, 8)?,
            log_blocks: read_le_u32(data, 12)?,
            log_start: read_le_u32(data, 16)?,
            inode_start: read_le_u32(data, 20)?,
            bitmap_start: read_le_u32(data, 24)?,
            magic: read_le_u32(data, 28)?,
        })
    }

    /// Encode into the leading bytes of `data`.
    pub fn encode(&self, data: &mut [u8]) -> Result<(), ParseError> {
        if data.len() < SUPERBLOCK_SIZE {
            return Err(ParseError::InsufficientData {
                needed: SUPERBLOCK_SIZE,
                offset: 0,
                actual: data.len(),
            });
        }
        write_le_u32(data, 0, self.total_blocks)?;
        write_le_u32(data, 4, self.data_blocks)?;
        write_le_u32(data, 8, self.ninodes)?;
        write_le_u32(data, 12, self.log_blocks)?;
        write_le_u32(data, 16, self.log_start)?;
        write_le_u32(data, 20, self.inode_start)?;
        write_le_u32(data, 24, self.bitmap_start)?;
        write_le_u32(data, 28, self.magic)?;
        Ok(())
    }

    /// Validate magic and region geometry: canonical order, disjoint,
    /// in-range, log at the tail.
    pub fn validate(&self) -> Result<(), ParseError> {
        if self.magic != SUPER_MAGIC {
            return Err(ParseError::InvalidMagic {
                expected: SUPER_MAGIC,
                actual: self.magic,
            });
        }
        let expected = Layout::compute(self.total_blocks, self.ninodes).map_err(|reason| {
            ParseError::InvalidField {
                field: "superblock",
                reason,
            }
        })?;
        if self.bitmap_start != expected.bitmap_start.0 {
            return Err(ParseError::InvalidField {
                field: "bitmap_start",
                reason: "bitmap region not at its canonical position",
            });
        }
        if self.inode_start != expected.inode_start.0 {
            return Err(ParseError::InvalidField {
                field: "inode_start",
                reason: "inode table overlaps the bitmap region",
            });
        }
        if self.log_blocks != expected.log_blocks {
            return Err(ParseError::InvalidField {
                field: "log_blocks",
                reason: "unexpected log capacity",
            });
        }
        if self.log_start != expected.log_start.0 {
            return Err(ParseError::InvalidField {
                field: "log_start",
                reason: "log region not at the image tail",
            });
        }
        if self.data_blocks != expected.data_blocks {
            return Err(ParseError::InvalidField {
                field: "data_blocks",
                reason: "data block count inconsistent with region boundaries",
            });
        }
        Ok(())
    }

    /// Region layout carried by this superblock.
    #[must_use]
    pub fn layout(&self) -> Layout {
        Layout {
            total_blocks: self.total_blocks,
            ninodes: self.ninodes,
            bitmap_start: BlockNumber(self.bitmap_start),
            inode_start: BlockNumber(self.inode_start),
            data_start: BlockNumber(self.inode_start + inode_table_blocks(self.ninodes)),
            data_blocks: self.data_blocks,
            log_start: BlockNumber(self.log_start),
            log_blocks: self.log_blocks,
        }
    }
}

fn div_ceil_u32(a: u32, b: u32) -> u32 {
    a / b + u32::from(a % b != 0)
}

fn bitmap_blocks(total_blocks: u32) -> u32 {
    let bits_per_block = u32::try_from(BITS_PER_BLOCK).unwrap_or(u32::MAX);
    div_ceil_u32(total_blocks, bits_per_block)
}

fn inode_table_blocks(ninodes: u32) -> u32 {
    let per_block = u32::try_from(INODES_PER_BLOCK).unwrap_or(u32::MAX);
    div_ceil_u32(ninodes, per_block)
}

/// Computed region boundaries for one image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Layout {
    pub total_blocks: u32,
    pub ninodes: u32,
    pub bitmap_start: BlockNumber,
    pub inode_start: BlockNumber,
    pub data_start: BlockNumber,
    pub data_blocks: u32,
    pub log_start: BlockNumber,
    pub log_blocks: u32,
}

impl Layout {
    /// Choose region boundaries for a fresh image.
    ///
    /// The bitmap covers every block of the image, so metadata and log
    /// blocks are representable and get their bits pre-set at format time.
    pub fn compute(total_blocks: u32, ninodes: u32) -> Result<Self, &'static str> {
        if ninodes == 0 {
            return Err("ninodes must be > 0");
        }
        let bitmap_start = SUPERBLOCK_BLOCK + 1;
        let inode_start = bitmap_start
            .checked_add(bitmap_blocks(total_blocks))
            .ok_or("bitmap region overflows")?;
        let data_start = inode_start
            .checked_add(inode_table_blocks(ninodes))
            .ok_or("inode table overflows")?;
        let log_region = LOG_BLOCKS + 1; // header + post-images
        let log_start = total_blocks
            .checked_sub(log_region)
            .ok_or("image too small for the log region")?;
        if log_start <= data_start {
            return Err("image too small: no data region between metadata and log");
        }
        Ok(Self {
            total_blocks,
            ninodes,
            bitmap_start: BlockNumber(bitmap_start),
            inode_start: BlockNumber(inode_start),
            data_start: BlockNumber(data_start),
            data_blocks: log_start - data_start,
            log_start: BlockNumber(log_start),
            log_blocks: LOG_BLOCKS,
        })
    }

    /// Superblock carrying this layout.
    #[must_use]
    pub fn superblock(&self) -> Superblock {
        Superblock {
            total_blocks: self.total_blocks,
            data_blocks: self.data_blocks,
            ninodes: self.ninodes,
            log_blocks: self.log_blocks,
            log_start: self.log_start.0,
            inode_start: self.inode_start.0,
            bitmap_start: self.bitmap_start.0,
            magic: SUPER_MAGIC,
        }
    }

    /// Bitmap block and bit index covering `block`.
    #[must_use]
    pub fn bitmap_location(&self, block: BlockNumber) -> (BlockNumber, usize) {
        let bits = u32::try_from(BITS_PER_BLOCK).unwrap_or(u32::MAX);
        let bitmap_block = self.bitmap_start.0 + block.0 / bits;
        (BlockNumber(bitmap_block), (block.0 % bits) as usize)
    }

    /// Inode table block and byte offset holding inode `inum`.
    ///
    /// Inode numbers are 1-indexed; slot 0 of the table is never used, the
    /// same way block 0 is reserved.
    pub fn inode_location(&self, inum: InodeNumber) -> Result<(BlockNumber, usize), ParseError> {
        if inum.0 == 0 || inum.0 >= self.ninodes {
            return Err(ParseError::InvalidField {
                field: "inum",
                reason: "inode number out of range",
            });
        }
        let per_block = INODES_PER_BLOCK as u32;
        let block = self.inode_start.0 + inum.0 / per_block;
        let offset = (inum.0 % per_block) as usize * INODE_SIZE;
        Ok((BlockNumber(block), offset))
    }

    /// True if `block` lies in the data region.
    #[must_use]
    pub fn is_data_block(&self, block: BlockNumber) -> bool {
        block >= self.data_start && block < self.log_start
    }

    /// First post-image block of the log (`log_start` itself is the header).
    #[must_use]
    pub fn log_image_start(&self) -> BlockNumber {
        BlockNumber(self.log_start.0 + 1)
    }
}

/// One packed 80-byte inode record.
///
/// A record with `kind == None` is free. `addrs` holds the 8 direct slots
/// followed by the single- and double-indirect slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiskInode {
    pub kind: Option<InodeKind>,
    pub major: u16,
    pub minor: u16,
    pub nlink: u16,
    pub size: u64,
    pub atime: u64,
    pub mtime: u64,
    pub ctime: u64,
    pub addrs: [BlockRef; NADDRS],
}

impl DiskInode {
    /// An all-zero (free) record.
    #[must_use]
    pub fn free() -> Self {
        Self {
            kind: None,
            major: 0,
            minor: 0,
            nlink: 0,
            size: 0,
            atime: 0,
            mtime: 0,
            ctime: 0,
            addrs: [BlockRef::NotPresent; NADDRS],
        }
    }

    /// Decode one record from `data` at `offset`.
    pub fn decode(data: &[u8], offset: usize) -> Result<Self, ParseError> {
        ensure_slice(data, offset, INODE_SIZE)?;
        let kind = InodeKind::from_raw(read_le_u16(data, offset)?)?;
        let mut addrs = [BlockRef::NotPresent; NADDRS];
        for (i, slot) in addrs.iter_mut().enumerate() {
            *slot = BlockRef::from_raw(read_le_u32(data, offset + 40 + i * 4)?);
        }
        Ok(Self {
            kind,
            major: read_le_u16(data, offset + 2)?,
            minor: read_le_u16(data, offset + 4)?,
            nlink: read_le_u16(data, offset + 6)?,
            size: read_le_u64(data, offset + 8)?,
            atime: read_le_u64(data, offset + 16)?,
            mtime: read_le_u64(data, offset + 24)?,
            ctime: read_le_u64(data, offset + 32)?,
            addrs,
        })
    }

    /// Encode one record into `data` at `offset`.
    pub fn encode(&self, data: &mut [u8], offset: usize) -> Result<(), ParseError> {
        if offset + INODE_SIZE > data.len() {
            return Err(ParseError::InsufficientData {
                needed: INODE_SIZE,
                offset,
                actual: data.len().saturating_sub(offset),
            });
        }
        write_le_u16(data, offset, self.kind.map_or(0, InodeKind::to_raw))?;
        write_le_u16(data, offset + 2, self.major)?;
        write_le_u16(data, offset + 4, self.minor)?;
        write_le_u16(data, offset + 6, self.nlink)?;
        write_le_u64(data, offset + 8, self.size)?;
        write_le_u64(data, offset + 16, self.atime)?;
        write_le_u64(data, offset + 24, self.mtime)?;
        write_le_u64(data, offset + 32, self.ctime)?;
        for (i, slot) in self.addrs.iter().enumerate() {
            write_le_u32(data, offset + 40 + i * 4, slot.to_raw())?;
        }
        Ok(())
    }

    #[must_use]
    pub fn is_free(&self) -> bool {
        self.kind.is_none()
    }
}

/// One fixed-width 64-byte directory entry slot.
///
/// `inum == 0` marks a free slot; free slots are reused in place without
/// compacting the rest of the stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dirent {
    pub inum: InodeNumber,
    pub kind: Option<InodeKind>,
    pub name: [u8; DIRENT_NAME_LEN],
}

impl Dirent {
    /// A free slot.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            inum: InodeNumber(0),
            kind: None,
            name: [0; DIRENT_NAME_LEN],
        }
    }

    /// Build a live entry. Fails if `name` is empty or does not fit.
    pub fn new(inum: InodeNumber, kind: InodeKind, name: &[u8]) -> Result<Self, ParseError> {
        if name.is_empty() {
            return Err(ParseError::InvalidField {
                field: "name",
                reason: "directory entry name cannot be empty",
            });
        }
        if name.len() > DIRENT_NAME_LEN {
            return Err(ParseError::InvalidField {
                field: "name",
                reason: "directory entry name exceeds the name field",
            });
        }
        let mut field = [0_u8; DIRENT_NAME_LEN];
        field[..name.len()].copy_from_slice(name);
        Ok(Self {
            inum,
            kind: Some(kind),
            name: field,
        })
    }

    /// Decode one slot from `data` at `offset`.
    pub fn decode(data: &[u8], offset: usize) -> Result<Self, ParseError> {
        ensure_slice(data, offset, DIRENT_SIZE)?;
        Ok(Self {
            inum: InodeNumber(read_le_u32(data, offset)?),
            kind: InodeKind::from_raw(read_le_u16(data, offset + 4)?)?,
            name: read_fixed::<DIRENT_NAME_LEN>(data, offset + 6)?,
        })
    }

    /// Encode one slot into `data` at `offset`.
    pub fn encode(&self, data: &mut [u8], offset: usize) -> Result<(), ParseError> {
        if offset + DIRENT_SIZE > data.len() {
            return Err(ParseError::InsufficientData {
                needed: DIRENT_SIZE,
                offset,
                actual: data.len().saturating_sub(offset),
            });
        }
        write_le_u32(data, offset, self.inum.0)?;
        write_le_u16(data, offset + 4, self.kind.map_or(0, InodeKind::to_raw))?;
        data[offset + 6..offset + 6 + DIRENT_NAME_LEN].copy_from_slice(&self.name);
        Ok(())
    }

    #[must_use]
    pub fn is_free(&self) -> bool {
        self.inum.0 == 0
    }

    /// The live portion of the name field.
    #[must_use]
    pub fn name_bytes(&self) -> &[u8] {
        trim_nul_padded(&self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rill_types::{BLOCK_SIZE, NDIRECT};

    fn small_layout() -> Layout {
        Layout::compute(2048, 512).expect("layout")
    }

    #[test]
    fn layout_regions_are_ordered_and_disjoint() {
        let layout = small_layout();
        assert_eq!(layout.bitmap_start, BlockNumber(2));
        assert!(layout.inode_start > layout.bitmap_start);
        assert!(layout.data_start > layout.inode_start);
        assert!(layout.log_start > layout.data_start);
        assert_eq!(layout.log_start.0 + layout.log_blocks + 1, 2048);
        assert_eq!(
            layout.data_blocks,
            layout.log_start.0 - layout.data_start.0
        );
    }

    #[test]
    fn layout_rejects_tiny_images() {
        assert!(Layout::compute(16, 64).is_err());
        assert!(Layout::compute(LOG_BLOCKS + 1, 64).is_err());
        assert!(Layout::compute(2048, 0).is_err());
    }

    #[test]
    fn superblock_encode_decode_round_trip() {
        let sb = small_layout().superblock();
        let mut block = vec![0_u8; BLOCK_SIZE];
        sb.encode(&mut block).unwrap();
        let decoded = Superblock::decode(&block).unwrap();
        assert_eq!(decoded, sb);
        decoded.validate().unwrap();
    }

    #[test]
    fn superblock_rejects_bad_magic() {
        let mut sb = small_layout().superblock();
        sb.magic = 0xBAD0_F00D;
        assert!(matches!(
            sb.validate(),
            Err(ParseError::InvalidMagic { .. })
        ));
    }

    #[test]
    fn superblock_rejects_overlapping_regions() {
        let mut sb = small_layout().superblock();
        sb.inode_start = sb.bitmap_start; // inode table on top of the bitmap
        assert!(sb.validate().is_err());

        let mut sb = small_layout().superblock();
        sb.log_start -= 10; // log not at the tail
        assert!(sb.validate().is_err());

        let mut sb = small_layout().superblock();
        sb.data_blocks += 1;
        assert!(sb.validate().is_err());
    }

    #[test]
    fn superblock_layout_round_trip() {
        let layout = small_layout();
        assert_eq!(layout.superblock().layout(), layout);
    }

    #[test]
    fn inode_location_math() {
        let layout = small_layout();
        let (block0, off0) = layout.inode_location(InodeNumber(1)).unwrap();
        assert_eq!(block0, layout.inode_start);
        assert_eq!(off0, INODE_SIZE);

        // Last inode of the first table block, then the first of the second.
        let last = InodeNumber(INODES_PER_BLOCK as u32 - 1);
        let (block, off) = layout.inode_location(last).unwrap();
        assert_eq!(block, layout.inode_start);
        assert_eq!(off, (INODES_PER_BLOCK - 1) * INODE_SIZE);

        let next = InodeNumber(INODES_PER_BLOCK as u32);
        let (block, off) = layout.inode_location(next).unwrap();
        assert_eq!(block.0, layout.inode_start.0 + 1);
        assert_eq!(off, 0);

        assert!(layout.inode_location(InodeNumber(0)).is_err());
        assert!(layout.inode_location(InodeNumber(512)).is_err());
    }

    #[test]
    fn bitmap_location_math() {
        let layout = small_layout();
        let (block, bit) = layout.bitmap_location(BlockNumber(0));
        assert_eq!(block, layout.bitmap_start);
        assert_eq!(bit, 0);
        let (block, bit) = layout.bitmap_location(BlockNumber(BITS_PER_BLOCK as u32 + 5));
        assert_eq!(block.0, layout.bitmap_start.0 + 1);
        assert_eq!(bit, 5);
    }

    #[test]
    fn disk_inode_round_trip() {
        let mut inode = DiskInode::free();
        inode.kind = Some(InodeKind::File);
        inode.nlink = 1;
        inode.size = 123_456;
        inode.mtime = 1_700_000_000;
        inode.addrs[0] = BlockRef::Data(BlockNumber(900));
        inode.addrs[3] = BlockRef::ZeroOnDemand;
        inode.addrs[NDIRECT] = BlockRef::Data(BlockNumber(901));

        let mut block = vec![0_u8; BLOCK_SIZE];
        inode.encode(&mut block, INODE_SIZE * 7).unwrap();
        let decoded = DiskInode::decode(&block, INODE_SIZE * 7).unwrap();
        assert_eq!(decoded, inode);

        // Untouched slots still decode as free records.
        let free = DiskInode::decode(&block, 0).unwrap();
        assert!(free.is_free());
        assert_eq!(free, DiskInode::free());
    }

    #[test]
    fn disk_inode_rejects_unknown_type() {
        let mut block = vec![0_u8; INODE_SIZE];
        write_le_u16(&mut block, 0, 9).unwrap();
        assert!(DiskInode::decode(&block, 0).is_err());
    }

    #[test]
    fn dirent_round_trip_and_free_slots() {
        let entry = Dirent::new(InodeNumber(42), InodeKind::File, b"notes.txt").unwrap();
        let mut block = vec![0_u8; BLOCK_SIZE];
        entry.encode(&mut block, DIRENT_SIZE * 3).unwrap();

        let decoded = Dirent::decode(&block, DIRENT_SIZE * 3).unwrap();
        assert_eq!(decoded, entry);
        assert_eq!(decoded.name_bytes(), b"notes.txt");
        assert!(!decoded.is_free());

        assert!(Dirent::decode(&block, 0).unwrap().is_free());
    }

    #[test]
    fn dirent_name_fills_field_without_terminator() {
        let name = [b'x'; DIRENT_NAME_LEN];
        let entry = Dirent::new(InodeNumber(7), InodeKind::Directory, &name).unwrap();
        assert_eq!(entry.name_bytes(), &name);

        let too_long = [b'x'; DIRENT_NAME_LEN + 1];
        assert!(Dirent::new(InodeNumber(7), InodeKind::Directory, &too_long).is_err());
        assert!(Dirent::new(InodeNumber(7), InodeKind::File, b"").is_err());
    }
}

#![forbid(unsafe_code)]
//! Error types for rillfs.
//!
//! Two-layer model: `ParseError` in `rill-types` covers on-disk byte
//! decoding, and `RillError` (this crate) is the user-facing taxonomy that
//! every public operation returns. `rill-error` deliberately does not depend
//! on `rill-types`; conversions happen at the crate boundaries that see both
//! (parse failures on live metadata become `Corrupt` with the block number,
//! parse failures at mount become `Format`).
//!
//! Every variant maps to exactly one POSIX errno via [`RillError::to_errno`].
//! The match is exhaustive so a new variant will not compile until its errno
//! is assigned.

use thiserror::Error;

/// Unified error type for all rillfs operations.
#[derive(Debug, Error)]
pub enum RillError {
    /// Backing-store read/write failure. Surfaced to the caller; the engine
    /// never retries on its own.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// On-disk metadata corruption at a known block: bad superblock or
    /// journal magic, checksum mismatch, out-of-range field values.
    /// Fatal at mount; the engine refuses to come up.
    #[error("corrupt metadata at block {block}: {detail}")]
    Corrupt { block: u32, detail: String },

    /// Structurally invalid image geometry or invalid arguments to format.
    #[error("invalid format: {0}")]
    Format(String),

    /// The block bitmap is exhausted. No partial allocation persists.
    #[error("no space left on device")]
    NoSpace,

    /// Named object does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Target name already exists in the directory.
    #[error("file exists")]
    Exists,

    /// Request past the direct + indirect + double-indirect addressing limit.
    #[error("file too large: block index {requested} exceeds maximum {max}")]
    FileTooLarge { requested: u64, max: u64 },

    /// Name exceeds the fixed directory entry name field.
    #[error("name too long")]
    NameTooLong,

    /// A directory operation was attempted on a non-directory inode.
    #[error("not a directory")]
    NotDirectory,

    /// A file operation was attempted on a directory inode.
    #[error("is a directory")]
    IsDirectory,

    /// Unlink of a directory that still has live entries.
    #[error("directory not empty")]
    NotEmpty,

    /// Write attempted on a read-only mount.
    #[error("read-only filesystem")]
    ReadOnly,
}

impl RillError {
    /// POSIX errno for this error, for the host dispatch layer to reply with.
    #[must_use]
    pub fn to_errno(&self) -> libc::c_int {
        match self {
            Self::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
            Self::Corrupt { .. } => libc::EIO,
            Self::Format(_) => libc::EINVAL,
            Self::NoSpace => libc::ENOSPC,
            Self::NotFound(_) => libc::ENOENT,
            Self::Exists => libc::EEXIST,
            Self::FileTooLarge { .. } => libc::EFBIG,
            Self::NameTooLong => libc::ENAMETOOLONG,
            Self::NotDirectory => libc::ENOTDIR,
            Self::IsDirectory => libc::EISDIR,
            Self::NotEmpty => libc::ENOTEMPTY,
            Self::ReadOnly => libc::EROFS,
        }
    }
}

/// Result alias using `RillError`.
pub type Result<T> = std::result::Result<T, RillError>;

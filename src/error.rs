//! Error kinds surfaced across the crate boundary.

use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T> = core::result::Result<T, FsError>;

/// Every way a filesystem operation can fail.
///
/// Each non-[`FsError::Io`] variant corresponds to one of the error kinds
/// named by the on-disk format's external interface; `Io` additionally
/// surfaces host I/O failures (mmap, flush, file creation) that a
/// host-backed implementation must report but that the format itself does
/// not distinguish.
#[derive(Debug, Error)]
pub enum FsError {
    /// Path resolution failed at some segment.
    #[error("no such file or directory: {0}")]
    NoSuchFile(String),

    /// The destination of a create/insert/move already has a live entry.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// A non-absolute path, an RW open of a directory, or an out-of-range
    /// seek/offset.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A lock conflict: RW requested while readers or a writer hold the
    /// inode, or RO requested while a writer holds it.
    #[error("resource busy: {0}")]
    Busy(String),

    /// The data-block bitmap has no free bit left.
    #[error("out of space")]
    OutOfSpace,

    /// The inode table has no unused slot left.
    #[error("out of inodes")]
    OutOfInodes,

    /// The operation targets a handle or filesystem that has been closed.
    #[error("filesystem or handle is closed")]
    Closed,

    /// Wrong magic, wrong version, or a byte-swapped (wrong-endian)
    /// container header.
    #[error("bad container format: {0}")]
    Format(String),

    /// Write to a read-only handle, read of a directory as a file, or
    /// `remove` through a directory-stream handle.
    #[error("unsupported operation: {0}")]
    Unsupported(String),

    /// A host I/O failure: mapping, flushing, or sizing the container file.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

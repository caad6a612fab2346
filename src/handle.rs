//! The three handle variants — read-only file, read-write file, and
//! directory — modeled as one concrete state plus a capability tag rather
//! than a deep type hierarchy, per the design note that they share cursor,
//! size, timestamp, close, and lock-release behaviour and differ only in
//! `read`/`write`/`truncate`.

use std::sync::Arc;

use crate::error::{FsError, Result};
use crate::inode::{InodeIndex, InodeTable};

/// The mode an `open` call requested.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OpenRequest {
    ReadOnly,
    ReadWrite,
}

/// The capability tag distinguishing the three handle variants.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HandleMode {
    ReadOnly,
    ReadWrite,
    Directory,
}

/// An open handle onto a file or directory inode.
///
/// Owns one runtime reference (`ref++` on open, `ref--` on close) and one
/// per-inode lock (shared for `ReadOnly`/`Directory`, exclusive for
/// `ReadWrite`), plus the chain of shared ancestor-path locks acquired
/// while resolving the path that led to it. All of these are released by
/// [`Handle::close`].
pub struct Handle {
    table: Arc<InodeTable>,
    inode: InodeIndex,
    mode: HandleMode,
    pos: u64,
    ancestor_locks: Vec<InodeIndex>,
    closed: bool,
}

impl Handle {
    pub(crate) fn new(
        table: Arc<InodeTable>,
        inode: InodeIndex,
        mode: HandleMode,
        ancestor_locks: Vec<InodeIndex>,
    ) -> Self {
        Self {
            table,
            inode,
            mode,
            pos: 0,
            ancestor_locks,
            closed: false,
        }
    }

    fn check_open(&self) -> Result<()> {
        if self.closed {
            return Err(FsError::Closed);
        }
        self.table.check_open()
    }

    pub fn is_dir(&self) -> bool {
        self.mode == HandleMode::Directory
    }

    pub fn is_file(&self) -> bool {
        !self.is_dir()
    }

    pub fn can_read(&self) -> bool {
        matches!(self.mode, HandleMode::ReadOnly | HandleMode::ReadWrite)
    }

    pub fn can_write(&self) -> bool {
        self.mode == HandleMode::ReadWrite
    }

    pub fn size(&self) -> Result<u64> {
        self.check_open()?;
        self.table.size(self.inode)
    }

    pub fn created_at(&self) -> Result<i64> {
        self.check_open()?;
        self.table.created_at(self.inode)
    }

    pub fn modified_at(&self) -> Result<i64> {
        self.check_open()?;
        self.table.modified_at(self.inode)
    }

    /// Bytes remaining between the cursor and the end of the file.
    pub fn available(&self) -> Result<u64> {
        self.check_open()?;
        Ok(self.size()?.saturating_sub(self.pos))
    }

    /// Resets the cursor to the start of the file.
    pub fn reset(&mut self) -> Result<()> {
        self.check_open()?;
        self.pos = 0;
        Ok(())
    }

    pub fn pos(&self) -> u64 {
        self.pos
    }

    pub fn seek(&mut self, pos: u64) -> Result<()> {
        self.check_open()?;
        let size = self.size()?;
        if pos > size {
            return Err(FsError::InvalidArgument(format!(
                "seek position {pos} is past end of file ({size} bytes)"
            )));
        }
        self.pos = pos;
        Ok(())
    }

    /// Reads into `buf` starting at the cursor, returning the number of
    /// bytes actually copied (which may be less than `buf.len()` at EOF;
    /// this never pads the return count up to the request).
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.check_open()?;
        if self.is_dir() {
            return Err(FsError::Unsupported("cannot read a directory as a file".into()));
        }
        let n = self.table.read(self.inode, self.pos, buf)?;
        self.pos += n as u64;
        Ok(n)
    }

    pub fn write(&mut self, buf: &[u8]) -> Result<usize> {
        self.check_open()?;
        if !self.can_write() {
            return Err(FsError::Unsupported("handle is not open for writing".into()));
        }
        let n = self.table.write(self.inode, self.pos, buf)?;
        self.pos += n as u64;
        Ok(n)
    }

    /// Truncates the file to zero length and resets the cursor.
    pub fn truncate(&mut self) -> Result<()> {
        self.check_open()?;
        if !self.can_write() {
            return Err(FsError::Unsupported("handle is not open for writing".into()));
        }
        self.table.truncate(self.inode)?;
        self.table.set_size_and_stamp(self.inode, 0)?;
        self.pos = 0;
        Ok(())
    }

    /// Releases this handle's own per-inode lock, its runtime reference,
    /// and every ancestor-path lock acquired during `open`.
    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Err(FsError::Closed);
        }
        self.check_open()?;
        self.closed = true;

        match self.mode {
            HandleMode::ReadWrite => self.table.unlock_rw(self.inode)?,
            HandleMode::ReadOnly | HandleMode::Directory => self.table.unlock_ro(self.inode)?,
        }
        self.table.remove_ref(self.inode)?;

        for &ancestor in self.ancestor_locks.iter().rev() {
            self.table.unlock_ro(ancestor)?;
        }
        Ok(())
    }

    pub(crate) fn inode(&self) -> InodeIndex {
        self.inode
    }
}

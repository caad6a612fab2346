//! Block device: presents the container file as addressable, fixed-size
//! pages backed by a single memory mapping.

use std::fs::{File, OpenOptions};
use std::path::Path;

use memmap2::MmapMut;

use crate::error::{FsError, Result};
use crate::header::PAGE_SIZE;

/// Maps a container file into addressable `PAGE_SIZE` pages.
///
/// Durability on crash is not promised (spec non-goal): [`BlockDevice::close`]
/// flushes the mapping but there is no write-ahead log backing it.
pub struct BlockDevice {
    file: File,
    map: MmapMut,
    page_count: u64,
}

impl BlockDevice {
    /// Creates a fresh container of `page_count` pages, all zeroed.
    pub fn create(path: &Path, page_count: u64) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.set_len(page_count * PAGE_SIZE as u64)?;
        let map = unsafe { MmapMut::map_mut(&file)? };
        Ok(Self {
            file,
            map,
            page_count,
        })
    }

    /// Opens an existing container file without truncating it. The caller
    /// is responsible for validating the header before trusting `page_count`.
    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let len = file.metadata()?.len();
        if len < PAGE_SIZE as u64 {
            return Err(FsError::Format("container smaller than one page".into()));
        }
        let map = unsafe { MmapMut::map_mut(&file)? };
        Ok(Self {
            file,
            map,
            page_count: len / PAGE_SIZE as u64,
        })
    }

    /// Total number of pages backing the container.
    pub fn page_count(&self) -> u64 {
        self.page_count
    }

    /// Returns a mutable view of page `n`.
    ///
    /// Concurrent views of the same page are allowed (the backing mapping
    /// has no notion of cursor on its own) but callers must respect the
    /// crate's own locking discipline above this layer; this method itself
    /// performs no serialisation.
    pub fn page_mut(&mut self, n: u64) -> Result<&mut [u8]> {
        self.bounds_check(n)?;
        let start = (n as usize) * PAGE_SIZE;
        Ok(&mut self.map[start..start + PAGE_SIZE])
    }

    /// Overwrites page `n` with zeros.
    pub fn zero_page(&mut self, n: u64) -> Result<()> {
        self.page_mut(n)?.fill(0);
        Ok(())
    }

    /// Flushes the mapping and releases it.
    pub fn close(mut self) -> Result<()> {
        self.map.flush()?;
        self.file.sync_all()?;
        Ok(())
    }

    fn bounds_check(&self, n: u64) -> Result<()> {
        if n >= self.page_count {
            return Err(FsError::InvalidArgument(format!(
                "page {n} out of range (container has {} pages)",
                self.page_count
            )));
        }
        Ok(())
    }
}

impl Drop for BlockDevice {
    fn drop(&mut self) {
        let _ = self.map.flush();
    }
}

//! The crate's entry point: [`Filesystem`] wires together the page cache,
//! block allocator, inode table, and namespace behind the single host file
//! that backs the whole container.

use std::path::Path;
use std::sync::Arc;

use crate::bitmap::BlockAllocator;
use crate::cache::{PageCache, DEFAULT_CACHE_SLOTS};
use crate::error::{FsError, Result};
use crate::handle::{Handle, OpenRequest};
use crate::header::Header;
use crate::inode::{InodeTable, InodeType, ROOT_INODE};
use crate::namespace::Namespace;

/// Default number of inodes a freshly created container reserves.
pub const DEFAULT_INODE_COUNT: u64 = 512;

/// Default number of addressable data blocks a freshly created container
/// reserves.
pub const DEFAULT_MAX_BLOCKS: u64 = 4096;

/// A single-file, Unix-v6-style block filesystem.
///
/// One `Filesystem` owns one host file end to end: the page cache, the
/// block allocator, the inode table, and the directory namespace all share
/// the same underlying mapping. Everything above [`Handle`] reads and
/// writes through paths; nothing below it is exposed.
pub struct Filesystem {
    cache: Arc<PageCache>,
    inodes: Arc<InodeTable>,
    namespace: Namespace,
}

impl Filesystem {
    /// Formats a brand-new container at `path`, with an empty root
    /// directory, `inode_count` inode slots, and room for `max_blocks` data
    /// blocks.
    pub fn create(path: &Path, inode_count: u64, max_blocks: u64) -> Result<Self> {
        let header = Header::new(inode_count, max_blocks);
        let cache = Arc::new(PageCache::create(path, header.total_pages(), DEFAULT_CACHE_SLOTS)?);
        cache.with_page(0, |page| header.encode(page))?;

        let fs = Self::wire(cache, &header)?;

        let root = fs.inodes.alloc(InodeType::Dir)?;
        debug_assert_eq!(root, ROOT_INODE);
        fs.inodes.link(ROOT_INODE)?;

        log::info!(
            "formatted container at {} ({inode_count} inodes, {max_blocks} blocks)",
            path.display()
        );
        Ok(fs)
    }

    /// Formats a brand-new container at `path` using [`DEFAULT_INODE_COUNT`]
    /// and [`DEFAULT_MAX_BLOCKS`].
    pub fn create_default(path: &Path) -> Result<Self> {
        Self::create(path, DEFAULT_INODE_COUNT, DEFAULT_MAX_BLOCKS)
    }

    /// Opens an existing container, validating its header before trusting
    /// any of its layout.
    pub fn open(path: &Path) -> Result<Self> {
        let cache = Arc::new(PageCache::open(path, DEFAULT_CACHE_SLOTS)?);
        let header = cache.with_page_ref(0, |page| Header::decode(page))??;

        if cache.page_count() < header.total_pages() {
            return Err(FsError::Format(format!(
                "container has {} pages, header requires {}",
                cache.page_count(),
                header.total_pages()
            )));
        }

        log::info!("opened container at {}", path.display());
        Self::wire(cache, &header)
    }

    fn wire(cache: Arc<PageCache>, header: &Header) -> Result<Self> {
        let allocator = Arc::new(BlockAllocator::new(
            cache.clone(),
            header.bitmap_page(),
            header.first_data_block(),
            header.max_blocks,
        ));
        let inodes = Arc::new(InodeTable::new(
            cache.clone(),
            allocator,
            Header::first_inode_page(),
            header.inode_count as u32,
        ));
        let namespace = Namespace::new(inodes.clone());
        Ok(Self {
            cache,
            inodes,
            namespace,
        })
    }

    /// Drops every reference this `Filesystem` holds on the backing
    /// mapping. Pages already written through are already durable in the
    /// host file (there is no write-ahead log); any handle still open at
    /// this point keeps the mapping alive through its own `Arc` until it
    /// too is closed.
    ///
    /// Marks the underlying inode table closed first, so every handle
    /// obtained from this `Filesystem` (even ones still open, whose own
    /// `Arc` keeps the table alive past this call) starts failing with
    /// [`FsError::Closed`] on its next operation.
    pub fn close(self) -> Result<()> {
        self.inodes.mark_closed();
        log::info!("closing container");
        Ok(())
    }

    /// Opens `path`, creating a new file if it doesn't exist and `create`
    /// is set. Opening a directory for `ReadWrite` fails; directories may
    /// only ever be opened `ReadOnly`.
    pub fn open_path(&self, path: &str, mode: OpenRequest, create: bool) -> Result<Handle> {
        self.namespace.open(path, mode, create)
    }

    /// Creates a new, empty directory at `path`. Fails if `path` already
    /// names a live entry.
    pub fn make_dir(&self, path: &str) -> Result<()> {
        self.namespace.make_dir(path)
    }

    /// Removes the entry at `path`. For a directory, this recursively
    /// unlinks every live child once the directory's own link count and
    /// reference count both reach zero.
    pub fn remove(&self, path: &str) -> Result<()> {
        self.namespace.remove_entry(path)
    }

    /// Renames/moves the entry at `src` to `dest`. Fails if `dest` already
    /// names a live entry.
    pub fn move_entry(&self, src: &str, dest: &str) -> Result<()> {
        self.namespace.move_entry(src, dest)
    }

    /// Copies the entry at `src` to `dest`, recursively for directories.
    /// The copy is fully independent of the source: no blocks are shared.
    pub fn copy(&self, src: &str, dest: &str) -> Result<()> {
        self.namespace.copy_entry(src, dest)
    }

    /// Lists the fully qualified paths of `dir`'s live children, optionally
    /// restricted to those for which `filter` returns `true`.
    pub fn read_dir(&self, dir: &str, filter: Option<&dyn Fn(&str) -> bool>) -> Result<Vec<String>> {
        let mut handle = self.namespace.open(dir, OpenRequest::ReadOnly, false)?;
        if !handle.is_dir() {
            let _ = handle.close();
            return Err(FsError::Unsupported(format!("{dir} is not a directory")));
        }

        let entries = self.namespace.read_dir_entries(handle.inode());
        handle.close()?;
        let entries = entries?;

        let base = if dir == "/" { "" } else { dir.trim_end_matches('/') };
        Ok(entries
            .into_iter()
            .map(|e| format!("{base}/{}", e.name))
            .filter(|p| filter.map(|f| f(p)).unwrap_or(true))
            .collect())
    }

    /// Total number of pages backing the container, header included.
    pub fn total_pages(&self) -> u64 {
        self.cache.page_count()
    }
}

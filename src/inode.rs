//! Inode table: typed inode records, indirect-block mapping, the
//! write-through in-memory cache, dual reference counting, and the
//! per-inode read/write lock protocol.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::{Mutex, RwLock};

use crate::bitmap::{BlockAllocator, BlockIndex};
use crate::cache::PageCache;
use crate::dirent;
use crate::error::{FsError, Result};
use crate::header::PAGE_SIZE;

/// Index of an inode within the inode table.
pub type InodeIndex = u32;

/// Size in bytes of one on-disk inode record.
pub const INODE_RECORD_SIZE: usize = 32;

/// Number of block-index entries one meta-page can hold.
pub const ENTRIES_PER_META_PAGE: u64 = (PAGE_SIZE / 4) as u64;

/// Maximum file size addressable through a single (non-double) indirect
/// meta-page.
pub const MAX_FILE_SIZE: u64 = ENTRIES_PER_META_PAGE * PAGE_SIZE as u64;

pub const ROOT_INODE: InodeIndex = 0;

/// Type tag stored in an inode record.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InodeType {
    Unused = 0,
    File = 1,
    Dir = 2,
}

impl InodeType {
    fn from_tag(tag: u32) -> Result<Self> {
        match tag {
            0 => Ok(Self::Unused),
            1 => Ok(Self::File),
            2 => Ok(Self::Dir),
            other => Err(FsError::Format(format!("unknown inode type tag {other}"))),
        }
    }

    fn tag(self) -> u32 {
        self as u32
    }
}

/// The on-disk portion of one inode: exactly [`INODE_RECORD_SIZE`] bytes,
/// big-endian.
#[derive(Clone, Copy, Debug, Default)]
struct OnDiskInode {
    kind: u32,
    link_count: i32,
    size: i32,
    indirect: u32,
    created_at: i64,
    modified_at: i64,
}

impl OnDiskInode {
    fn decode(bytes: &[u8]) -> Self {
        Self {
            kind: u32::from_be_bytes(bytes[0..4].try_into().unwrap()),
            link_count: i32::from_be_bytes(bytes[4..8].try_into().unwrap()),
            size: i32::from_be_bytes(bytes[8..12].try_into().unwrap()),
            indirect: u32::from_be_bytes(bytes[12..16].try_into().unwrap()),
            created_at: i64::from_be_bytes(bytes[16..24].try_into().unwrap()),
            modified_at: i64::from_be_bytes(bytes[24..32].try_into().unwrap()),
        }
    }

    fn encode(&self, bytes: &mut [u8]) {
        bytes[0..4].copy_from_slice(&self.kind.to_be_bytes());
        bytes[4..8].copy_from_slice(&self.link_count.to_be_bytes());
        bytes[8..12].copy_from_slice(&self.size.to_be_bytes());
        bytes[12..16].copy_from_slice(&self.indirect.to_be_bytes());
        bytes[16..24].copy_from_slice(&self.created_at.to_be_bytes());
        bytes[24..32].copy_from_slice(&self.modified_at.to_be_bytes());
    }
}

/// In-memory-only fields, never persisted.
#[derive(Default)]
struct RuntimeState {
    ref_count: u32,
    write_locked: bool,
    read_lock_count: u32,
}

struct InMemoryInode {
    disk: OnDiskInode,
    runtime: RuntimeState,
}

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before epoch")
        .as_millis() as i64
}

pub struct InodeTable {
    cache: Arc<PageCache>,
    allocator: Arc<BlockAllocator>,
    first_inode_page: u64,
    inode_count: u32,
    entries: Vec<RwLock<Option<InMemoryInode>>>,
    table_lock: Mutex<()>,
    closed: AtomicBool,
}

impl InodeTable {
    pub fn new(
        cache: Arc<PageCache>,
        allocator: Arc<BlockAllocator>,
        first_inode_page: u64,
        inode_count: u32,
    ) -> Self {
        let entries = (0..inode_count).map(|_| RwLock::new(None)).collect();
        Self {
            cache,
            allocator,
            first_inode_page,
            inode_count,
            entries,
            table_lock: Mutex::new(()),
            closed: AtomicBool::new(false),
        }
    }

    /// Marks the table closed: every subsequent operation through it (via
    /// any [`crate::handle::Handle`] or [`crate::namespace::Namespace`]
    /// call still holding a reference) fails with [`FsError::Closed`].
    /// Does not itself wait for, or invalidate, outstanding locks.
    pub fn mark_closed(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub(crate) fn check_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(FsError::Closed);
        }
        Ok(())
    }

    fn location(&self, i: InodeIndex) -> (u64, usize) {
        let inodes_per_page = (PAGE_SIZE / INODE_RECORD_SIZE) as u32;
        let page = self.first_inode_page + (i / inodes_per_page) as u64;
        let offset = (i % inodes_per_page) as usize * INODE_RECORD_SIZE;
        (page, offset)
    }

    fn check_index(&self, i: InodeIndex) -> Result<()> {
        if i >= self.inode_count {
            return Err(FsError::InvalidArgument(format!(
                "inode index {i} out of range"
            )));
        }
        Ok(())
    }

    /// Loads `i` from disk into the in-memory table if it isn't resident
    /// yet, then runs `f` against it under a read lock.
    fn with_loaded<R>(&self, i: InodeIndex, f: impl FnOnce(&InMemoryInode) -> R) -> Result<R> {
        self.check_index(i)?;
        self.ensure_loaded(i)?;
        let guard = self.entries[i as usize].read();
        Ok(f(guard.as_ref().expect("just loaded")))
    }

    fn with_loaded_mut<R>(
        &self,
        i: InodeIndex,
        f: impl FnOnce(&mut InMemoryInode) -> R,
    ) -> Result<R> {
        self.check_index(i)?;
        self.ensure_loaded(i)?;
        let mut guard = self.entries[i as usize].write();
        Ok(f(guard.as_mut().expect("just loaded")))
    }

    fn ensure_loaded(&self, i: InodeIndex) -> Result<()> {
        {
            let guard = self.entries[i as usize].read();
            if guard.is_some() {
                return Ok(());
            }
        }
        let mut guard = self.entries[i as usize].write();
        if guard.is_some() {
            return Ok(());
        }
        let (page, offset) = self.location(i);
        let disk = self
            .cache
            .with_page_ref(page, |p| OnDiskInode::decode(&p[offset..offset + INODE_RECORD_SIZE]))?;
        *guard = Some(InMemoryInode {
            disk,
            runtime: RuntimeState::default(),
        });
        Ok(())
    }

    fn write_through(&self, i: InodeIndex, disk: &OnDiskInode) -> Result<()> {
        let (page, offset) = self.location(i);
        self.cache.with_page(page, |p| {
            disk.encode(&mut p[offset..offset + INODE_RECORD_SIZE]);
        })
    }

    // ---- lifecycle ----------------------------------------------------

    /// Scans for the first `Unused` slot, allocates a meta-page for it,
    /// stamps timestamps, and installs it in the in-memory table.
    pub fn alloc(&self, kind: InodeType) -> Result<InodeIndex> {
        let _guard = self.table_lock.lock();

        for i in 0..self.inode_count {
            self.ensure_loaded(i)?;
            let is_unused = self
                .entries[i as usize]
                .read()
                .as_ref()
                .map(|e| e.disk.kind == InodeType::Unused.tag())
                .unwrap_or(false);
            if !is_unused {
                continue;
            }

            let meta_page = self.allocator.allocate()?;
            let now = now_millis();
            let disk = OnDiskInode {
                kind: kind.tag(),
                link_count: 0,
                size: 0,
                indirect: meta_page as u32,
                created_at: now,
                modified_at: now,
            };
            self.write_through(i, &disk)?;

            let mut guard = self.entries[i as usize].write();
            *guard = Some(InMemoryInode {
                disk,
                runtime: RuntimeState::default(),
            });
            log::debug!("allocated inode {i} (type {:?}, meta-page {meta_page})", kind);
            return Ok(i);
        }

        Err(FsError::OutOfInodes)
    }

    pub fn kind(&self, i: InodeIndex) -> Result<InodeType> {
        self.with_loaded(i, |e| InodeType::from_tag(e.disk.kind))?
    }

    pub fn size(&self, i: InodeIndex) -> Result<u64> {
        self.with_loaded(i, |e| e.disk.size.max(0) as u64)
    }

    pub fn created_at(&self, i: InodeIndex) -> Result<i64> {
        self.with_loaded(i, |e| e.disk.created_at)
    }

    pub fn modified_at(&self, i: InodeIndex) -> Result<i64> {
        self.with_loaded(i, |e| e.disk.modified_at)
    }

    pub fn link_count(&self, i: InodeIndex) -> Result<i32> {
        self.with_loaded(i, |e| e.disk.link_count)
    }

    // ---- reference counting -------------------------------------------

    pub fn link(&self, i: InodeIndex) -> Result<()> {
        self.with_loaded_mut(i, |e| e.disk.link_count += 1)?;
        self.persist(i)
    }

    pub fn unlink(&self, i: InodeIndex) -> Result<()> {
        self.with_loaded_mut(i, |e| e.disk.link_count -= 1)?;
        self.persist(i)?;
        self.reclaim_check(i)
    }

    pub fn add_ref(&self, i: InodeIndex) -> Result<()> {
        self.with_loaded_mut(i, |e| e.runtime.ref_count += 1)
    }

    pub fn remove_ref(&self, i: InodeIndex) -> Result<()> {
        self.with_loaded_mut(i, |e| e.runtime.ref_count = e.runtime.ref_count.saturating_sub(1))?;
        self.reclaim_check(i)
    }

    fn persist(&self, i: InodeIndex) -> Result<()> {
        let disk = self.with_loaded(i, |e| e.disk)?;
        self.write_through(i, &disk)
    }

    /// Runs the reclaim check: when `link == 0 && ref == 0`, recursively
    /// unlinks a directory's children, frees all data/meta pages, and marks
    /// the inode `Unused`.
    fn reclaim_check(&self, i: InodeIndex) -> Result<()> {
        let (link, refc, kind, size, indirect) = self.with_loaded(i, |e| {
            (
                e.disk.link_count,
                e.runtime.ref_count,
                e.disk.kind,
                e.disk.size.max(0) as u64,
                e.disk.indirect,
            )
        })?;

        if link > 0 || refc > 0 {
            return Ok(());
        }

        let kind = InodeType::from_tag(kind)?;
        if kind == InodeType::Unused {
            return Ok(());
        }

        log::info!("reclaiming inode {i}");

        if kind == InodeType::Dir {
            let mut content = vec![0u8; size as usize];
            self.read(i, 0, &mut content)?;
            for entry in dirent::decode_entries(&content) {
                if entry.inode != 0 {
                    self.unlink(entry.inode)?;
                }
            }
        }

        self.free_content_blocks(indirect, size)?;
        self.allocator.free(indirect as u64)?;

        self.with_loaded_mut(i, |e| {
            e.disk.kind = InodeType::Unused.tag();
            e.disk.link_count = 0;
            e.disk.size = 0;
            e.disk.indirect = 0;
        })?;
        self.persist(i)
    }

    fn free_content_blocks(&self, meta_page: u32, size: u64) -> Result<()> {
        let page_count = size.div_ceil(PAGE_SIZE as u64);
        for k in 0..page_count {
            let entry = self
                .cache
                .with_page_ref(meta_page as u64, |p| read_meta_entry(p, k))?;
            if entry != 0 {
                self.allocator.free(entry as u64)?;
            }
        }
        Ok(())
    }

    // ---- per-inode open-mode locking -----------------------------------

    pub fn lock_ro(&self, i: InodeIndex) -> Result<()> {
        self.with_loaded_mut(i, |e| {
            if e.runtime.write_locked {
                return Err(FsError::Busy(format!("inode {i} is open for writing")));
            }
            e.runtime.read_lock_count += 1;
            Ok(())
        })?
    }

    pub fn unlock_ro(&self, i: InodeIndex) -> Result<()> {
        self.with_loaded_mut(i, |e| {
            e.runtime.read_lock_count = e.runtime.read_lock_count.saturating_sub(1)
        })
    }

    pub fn lock_rw(&self, i: InodeIndex) -> Result<()> {
        self.with_loaded_mut(i, |e| {
            if e.runtime.write_locked || e.runtime.read_lock_count > 0 {
                return Err(FsError::Busy(format!("inode {i} is already open")));
            }
            e.runtime.write_locked = true;
            Ok(())
        })?
    }

    pub fn unlock_rw(&self, i: InodeIndex) -> Result<()> {
        self.with_loaded_mut(i, |e| e.runtime.write_locked = false)
    }

    // ---- data access ----------------------------------------------------

    fn meta_page(&self, i: InodeIndex) -> Result<u32> {
        self.with_loaded(i, |e| e.disk.indirect)
    }

    /// Resolves the `k`-th content page of inode `i`. When `allocate` is
    /// `true` and the slot is a hole, a fresh block is allocated and the
    /// meta-page is updated; reads never allocate, per the spec's note that
    /// a zero meta-page entry must produce zeros without side effects.
    fn resolve_page(&self, i: InodeIndex, k: u64, allocate: bool) -> Result<BlockIndex> {
        let meta_page = self.meta_page(i)?;
        let entry = self
            .cache
            .with_page_ref(meta_page as u64, |p| read_meta_entry(p, k))?;

        if entry != 0 {
            return Ok(entry as BlockIndex);
        }
        if !allocate {
            return Ok(0);
        }

        let block = self.allocator.allocate()?;
        self.cache
            .with_page(meta_page as u64, |p| write_meta_entry(p, k, block as u32))?;
        Ok(block)
    }

    pub fn read(&self, i: InodeIndex, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let size = self.size(i)?;
        if offset >= size || buf.is_empty() {
            return Ok(0);
        }
        let len = buf.len().min((size - offset) as usize);

        let mut done = 0usize;
        while done < len {
            let pos = offset + done as u64;
            let page_idx = pos / PAGE_SIZE as u64;
            let in_page = (pos % PAGE_SIZE as u64) as usize;
            let chunk = (PAGE_SIZE - in_page).min(len - done);

            let block = self.resolve_page(i, page_idx, false)?;
            if block == 0 {
                buf[done..done + chunk].fill(0);
            } else {
                self.cache.with_page_ref(block, |p| {
                    buf[done..done + chunk].copy_from_slice(&p[in_page..in_page + chunk]);
                })?;
            }
            done += chunk;
        }
        Ok(done)
    }

    pub fn write(&self, i: InodeIndex, offset: u64, buf: &[u8]) -> Result<usize> {
        let size = self.size(i)?;
        if offset > size {
            return Err(FsError::InvalidArgument(format!(
                "write offset {offset} exceeds current size {size}"
            )));
        }
        if offset + buf.len() as u64 > MAX_FILE_SIZE {
            return Err(FsError::InvalidArgument(format!(
                "write would exceed maximum file size of {MAX_FILE_SIZE} bytes"
            )));
        }

        let mut done = 0usize;
        while done < buf.len() {
            let pos = offset + done as u64;
            let page_idx = pos / PAGE_SIZE as u64;
            let in_page = (pos % PAGE_SIZE as u64) as usize;
            let chunk = (PAGE_SIZE - in_page).min(buf.len() - done);

            let block = self.resolve_page(i, page_idx, true)?;
            self.cache.with_page(block, |p| {
                p[in_page..in_page + chunk].copy_from_slice(&buf[done..done + chunk]);
            })?;
            done += chunk;
        }

        let new_size = size.max(offset + buf.len() as u64);
        self.with_loaded_mut(i, |e| {
            e.disk.size = new_size as i32;
            e.disk.modified_at = now_millis();
        })?;
        self.persist(i)?;
        Ok(done)
    }

    /// Frees every content block and zeroes the meta-page. Per the spec,
    /// the persisted `size` is untouched here; the read/write handle that
    /// drives a user-facing truncate is responsible for resetting it (and
    /// its own cursor) afterwards.
    pub fn truncate(&self, i: InodeIndex) -> Result<()> {
        let (indirect, size) = self.with_loaded(i, |e| (e.disk.indirect, e.disk.size.max(0) as u64))?;
        self.free_content_blocks(indirect, size)?;
        self.cache.zero_page(indirect as u64)?;
        Ok(())
    }

    /// Sets the persisted size and stamps `modified_at`; used by the
    /// read/write handle after [`InodeTable::truncate`].
    pub fn set_size_and_stamp(&self, i: InodeIndex, size: u64) -> Result<()> {
        self.with_loaded_mut(i, |e| {
            e.disk.size = size as i32;
            e.disk.modified_at = now_millis();
        })?;
        self.persist(i)
    }

    /// Allocates a fresh inode of the same type as `i` and streams its
    /// content across page by page.
    pub fn copy(&self, i: InodeIndex) -> Result<InodeIndex> {
        let kind = self.kind(i)?;
        let size = self.size(i)?;
        let dest = self.alloc(kind)?;

        let mut buf = vec![0u8; PAGE_SIZE];
        let mut offset = 0u64;
        while offset < size {
            let chunk = (size - offset).min(PAGE_SIZE as u64) as usize;
            let n = self.read(i, offset, &mut buf[..chunk])?;
            self.write(dest, offset, &buf[..n])?;
            offset += n as u64;
            if n == 0 {
                break;
            }
        }
        Ok(dest)
    }

    /// Test-only accessor: `i`'s meta-page index and every non-zero content
    /// block it currently references. Lets bitmap-consistency tests (§8
    /// invariant 8) check that a set bitmap bit is always covered by a
    /// meta-page or one of its entries, without exposing block layout as
    /// part of the public API.
    #[cfg(test)]
    pub(crate) fn debug_block_refs(&self, i: InodeIndex) -> Result<(u32, Vec<u32>)> {
        let (meta_page, size) =
            self.with_loaded(i, |e| (e.disk.indirect, e.disk.size.max(0) as u64))?;
        let page_count = size.div_ceil(PAGE_SIZE as u64);
        let mut blocks = Vec::new();
        for k in 0..page_count {
            let entry = self
                .cache
                .with_page_ref(meta_page as u64, |p| read_meta_entry(p, k))?;
            if entry != 0 {
                blocks.push(entry);
            }
        }
        Ok((meta_page, blocks))
    }
}

fn read_meta_entry(page: &[u8], k: u64) -> u32 {
    let off = (k as usize) * 4;
    u32::from_be_bytes(page[off..off + 4].try_into().unwrap())
}

fn write_meta_entry(page: &mut [u8], k: u64, value: u32) {
    let off = (k as usize) * 4;
    page[off..off + 4].copy_from_slice(&value.to_be_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    fn fixture(inodes: u32, max_blocks: u64) -> (Arc<PageCache>, Arc<BlockAllocator>, InodeTable) {
        let tmp = NamedTempFile::new().unwrap();
        let total_pages = 1 + inodes as u64 + 1 + max_blocks;
        let cache = Arc::new(PageCache::create(tmp.path(), total_pages, 64).unwrap());
        let allocator = Arc::new(BlockAllocator::new(cache.clone(), 1 + inodes as u64, 2 + inodes as u64, max_blocks));
        let table = InodeTable::new(cache.clone(), allocator.clone(), 0, inodes);
        (cache, allocator, table)
    }

    #[test]
    fn alloc_link_unlink_reclaims() {
        let (_cache, allocator, table) = fixture(8, 16);
        let i = table.alloc(InodeType::File).unwrap();
        table.link(i).unwrap();
        table.add_ref(i).unwrap();
        assert_eq!(table.kind(i).unwrap(), InodeType::File);

        table.write(i, 0, b"hello world").unwrap();
        assert_eq!(table.size(i).unwrap(), 11);

        table.unlink(i).unwrap();
        // still referenced, not reclaimed
        assert_eq!(table.kind(i).unwrap(), InodeType::File);

        table.remove_ref(i).unwrap();
        assert_eq!(table.kind(i).unwrap(), InodeType::Unused);
        let _ = allocator; // sanity: allocator shared correctly
    }

    #[test]
    fn write_then_read_roundtrip() {
        let (_cache, _allocator, table) = fixture(4, 16);
        let i = table.alloc(InodeType::File).unwrap();
        let data = b"the quick brown fox jumps over the lazy dog";
        table.write(i, 0, data).unwrap();

        let mut buf = vec![0u8; data.len()];
        let n = table.read(i, 0, &mut buf).unwrap();
        assert_eq!(n, data.len());
        assert_eq!(&buf, data);
    }

    #[test]
    fn write_rejects_stale_offset() {
        let (_cache, _allocator, table) = fixture(4, 16);
        let i = table.alloc(InodeType::File).unwrap();
        table.write(i, 0, b"12345").unwrap();
        assert!(matches!(
            table.write(i, 10, b"x"),
            Err(FsError::InvalidArgument(_))
        ));
    }

    #[test]
    fn out_of_inodes() {
        let (_cache, _allocator, table) = fixture(1, 16);
        table.alloc(InodeType::File).unwrap();
        assert!(matches!(table.alloc(InodeType::File), Err(FsError::OutOfInodes)));
    }

    #[test]
    fn lock_protocol_excludes_writer_from_readers() {
        let (_cache, _allocator, table) = fixture(4, 16);
        let i = table.alloc(InodeType::File).unwrap();
        table.lock_rw(i).unwrap();
        assert!(matches!(table.lock_ro(i), Err(FsError::Busy(_))));
        table.unlock_rw(i).unwrap();
        table.lock_ro(i).unwrap();
        table.lock_ro(i).unwrap();
        assert!(matches!(table.lock_rw(i), Err(FsError::Busy(_))));
    }
}

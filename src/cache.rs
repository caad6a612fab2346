//! Clock-replacement page cache over the memory-mapped container.
//!
//! A bounded set of `C` slots tracks which pages are currently resident.
//! Lookup, pinning, and eviction are serialised behind one lock; the
//! caller-supplied closure passed to [`PageCache::with_page`] runs *outside*
//! that critical section, so pages already resident can be consumed
//! concurrently by independent callers. A pinned slot can never be evicted.

use std::path::Path;
use std::slice;

use parking_lot::Mutex;

use crate::device::BlockDevice;
use crate::error::Result;
use crate::header::PAGE_SIZE;

/// Default slot count. Comfortably larger than the number of pages any
/// single operation in this crate pins at once (a handful: the inode's
/// meta-page plus one content page, or the bitmap page during allocation).
pub const DEFAULT_CACHE_SLOTS: usize = 512;

struct Slot {
    key: Option<u64>,
    ptr: Option<*mut u8>,
    pinned: u32,
    used: bool,
}

impl Slot {
    fn empty() -> Self {
        Self {
            key: None,
            ptr: None,
            pinned: 0,
            used: false,
        }
    }
}

struct ClockState {
    slots: Vec<Slot>,
    hand: usize,
}

impl ClockState {
    /// Finds a slot already holding `key`, pins it, and returns its index.
    fn find_and_pin(&mut self, key: u64) -> Option<usize> {
        for (i, slot) in self.slots.iter_mut().enumerate() {
            if slot.key == Some(key) {
                slot.used = true;
                slot.pinned += 1;
                return Some(i);
            }
        }
        None
    }

    /// Finds a slot to install a new page into: an empty slot, or one
    /// evicted by the clock sweep. Returns `None` if every slot is pinned.
    fn find_victim(&mut self) -> Option<usize> {
        let n = self.slots.len();

        if let Some(i) = self.slots.iter().position(|s| s.key.is_none()) {
            return Some(i);
        }

        for _ in 0..(2 * n) {
            let i = self.hand;
            self.hand = (self.hand + 1) % n;

            if self.slots[i].pinned > 0 {
                continue;
            }
            if self.slots[i].used {
                self.slots[i].used = false;
                continue;
            }
            self.slots[i].key = None;
            self.slots[i].ptr = None;
            return Some(i);
        }

        None
    }
}

/// A clock-replacement page cache backed by a single memory mapping.
pub struct PageCache {
    device: Mutex<BlockDevice>,
    clock: Mutex<ClockState>,
}

// SAFETY: raw pointers stashed in `Slot` always point inside the mapping
// owned by `device`, which outlives every slot entry; access to the pointed
// memory is disjoint between concurrently pinned *different* pages because
// pages never overlap. Within one page, `with_page` hands out `&mut [u8]`
// and must only be used on paths the layers above serialise against every
// other access to that same page (the per-inode exclusive lock for content
// and meta-pages, the allocator lock for the bitmap page, the per-inode
// table lock for inode-record pages). `with_page_ref` hands out `&[u8]` and
// is the only acquisition safe to call concurrently from multiple callers
// on the same page — which is what scenario S4 (several read-only handles
// on one file) requires: several `&[u8]` over the same bytes are legal,
// several `&mut [u8]` (or a mix of `&mut` and `&`) are not.
unsafe impl Send for PageCache {}
unsafe impl Sync for PageCache {}

impl PageCache {
    pub fn create(path: &Path, page_count: u64, slots: usize) -> Result<Self> {
        let device = BlockDevice::create(path, page_count)?;
        Ok(Self::new(device, slots))
    }

    pub fn open(path: &Path, slots: usize) -> Result<Self> {
        let device = BlockDevice::open(path)?;
        Ok(Self::new(device, slots))
    }

    fn new(device: BlockDevice, slots: usize) -> Self {
        Self {
            device: Mutex::new(device),
            clock: Mutex::new(ClockState {
                slots: (0..slots).map(|_| Slot::empty()).collect(),
                hand: 0,
            }),
        }
    }

    pub fn page_count(&self) -> u64 {
        self.device.lock().page_count()
    }

    /// Ensures a slot exists for page `n`, pins it, invokes `f` with a
    /// mutable view of the page's bytes, then unpins.
    ///
    /// Reserved for paths the layers above serialise against every other
    /// concurrent access to this same page (writes, allocator bitmap
    /// updates, inode-record write-through). Pure reads should use
    /// [`PageCache::with_page_ref`] instead, which several callers may hold
    /// on the same page at once.
    pub fn with_page<R>(&self, n: u64, f: impl FnOnce(&mut [u8]) -> R) -> Result<R> {
        let ptr = self.pin(n)?;

        // SAFETY: see the `unsafe impl Send/Sync for PageCache` note above.
        let page = unsafe { slice::from_raw_parts_mut(ptr, PAGE_SIZE) };
        let result = f(page);

        self.unpin(n);
        Ok(result)
    }

    /// Ensures a slot exists for page `n`, pins it, invokes `f` with a
    /// read-only view of the page's bytes, then unpins.
    ///
    /// Safe to call concurrently from multiple callers on the same page
    /// (scenario S4: several read-only handles on one file), unlike
    /// [`PageCache::with_page`].
    pub fn with_page_ref<R>(&self, n: u64, f: impl FnOnce(&[u8]) -> R) -> Result<R> {
        let ptr = self.pin(n)?;

        // SAFETY: see the `unsafe impl Send/Sync for PageCache` note above.
        let page = unsafe { slice::from_raw_parts(ptr, PAGE_SIZE) };
        let result = f(page);

        self.unpin(n);
        Ok(result)
    }

    /// Overwrites page `n` with zeros through the cache.
    pub fn zero_page(&self, n: u64) -> Result<()> {
        self.with_page(n, |page| page.fill(0))
    }

    fn pin(&self, n: u64) -> Result<*mut u8> {
        loop {
            let mut clock = self.clock.lock();

            if let Some(i) = clock.find_and_pin(n) {
                return Ok(clock.slots[i].ptr.expect("pinned slot has no pointer"));
            }

            if let Some(i) = clock.find_victim() {
                let mut device = self.device.lock();
                let ptr = device.page_mut(n)?.as_mut_ptr();
                drop(device);

                let slot = &mut clock.slots[i];
                slot.key = Some(n);
                slot.ptr = Some(ptr);
                slot.used = true;
                slot.pinned = 1;
                return Ok(ptr);
            }

            // Every slot is pinned; spin until one frees up. Acceptable per
            // the reference design as long as `C` exceeds the maximum
            // number of concurrently in-flight operations.
            drop(clock);
            std::thread::yield_now();
        }
    }

    fn unpin(&self, n: u64) {
        let mut clock = self.clock.lock();
        if let Some(slot) = clock.slots.iter_mut().find(|s| s.key == Some(n)) {
            slot.pinned = slot.pinned.saturating_sub(1);
        }
    }

    pub fn close(self) -> Result<()> {
        self.device.into_inner().close()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn write_then_read_same_page() {
        let tmp = NamedTempFile::new().unwrap();
        let cache = PageCache::create(tmp.path(), 8, 4).unwrap();

        cache.with_page(3, |page| page[0..5].copy_from_slice(b"hello")).unwrap();
        let read_back = cache.with_page(3, |page| page[0..5].to_vec()).unwrap();
        assert_eq!(&read_back, b"hello");
    }

    #[test]
    fn eviction_does_not_lose_data_on_revisit() {
        let tmp = NamedTempFile::new().unwrap();
        // Only 2 slots for 8 pages: forces eviction.
        let cache = PageCache::create(tmp.path(), 8, 2).unwrap();

        for i in 0..8u64 {
            cache
                .with_page(i, |page| page[0] = i as u8)
                .unwrap();
        }
        for i in 0..8u64 {
            let v = cache.with_page(i, |page| page[0]).unwrap();
            assert_eq!(v, i as u8);
        }
    }
}

//! Directory-entry operations and the filesystem-wide namespace lock.
//!
//! A directory's content is just a sequence of [`dirent`] records read and
//! written through the same [`InodeTable::read`]/[`InodeTable::write`] any
//! file uses — there's no separate directory storage format. This module
//! owns the coarse lock that serializes every namespace mutation (`open`
//! with `create`, `make_dir`, `move_entry`, `copy_entry`, `remove_entry`)
//! and the ancestor-path shared-locking discipline that keeps a directory
//! from being removed out from under a handle still resolving through it.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::dirent::{self, RawDirEntry, DIR_ENTRY_SIZE, NAME_PAYLOAD_SIZE};
use crate::error::{FsError, Result};
use crate::handle::{Handle, HandleMode, OpenRequest};
use crate::inode::{InodeIndex, InodeTable, InodeType, ROOT_INODE};
use crate::path;

pub struct Namespace {
    table: Arc<InodeTable>,
    coarse: Mutex<()>,
}

impl Namespace {
    pub fn new(table: Arc<InodeTable>) -> Self {
        Self {
            table,
            coarse: Mutex::new(()),
        }
    }

    // ---- directory-content primitives ----------------------------------

    fn read_content(&self, dir: InodeIndex) -> Result<Vec<u8>> {
        let size = self.table.size(dir)?;
        let mut content = vec![0u8; size as usize];
        self.table.read(dir, 0, &mut content)?;
        Ok(content)
    }

    fn lookup_dir(&self, dir: InodeIndex, name: &str) -> Result<InodeIndex> {
        let content = self.read_content(dir)?;
        dirent::decode_entries(&content)
            .into_iter()
            .find(|e| e.inode != 0 && e.name == name)
            .map(|e| e.inode)
            .ok_or_else(|| FsError::NoSuchFile(name.to_string()))
    }

    /// Writes a new live entry for `name` -> `child`, reusing a tombstone
    /// slot when one exists, and links `child`. Fails if `name` already
    /// names a live entry.
    fn insert_dir(&self, dir: InodeIndex, name: &str, child: InodeIndex) -> Result<()> {
        if name.is_empty() || name.as_bytes().len() > NAME_PAYLOAD_SIZE {
            return Err(FsError::InvalidArgument(format!(
                "name {name:?} does not fit in a directory entry"
            )));
        }

        let content = self.read_content(dir)?;
        let mut tombstone_offset = None;
        for (idx, entry) in dirent::decode_entries(&content).into_iter().enumerate() {
            if entry.inode != 0 {
                if entry.name == name {
                    return Err(FsError::AlreadyExists(name.to_string()));
                }
            } else if tombstone_offset.is_none() {
                tombstone_offset = Some(idx * DIR_ENTRY_SIZE);
            }
        }

        let offset = tombstone_offset.unwrap_or(content.len()) as u64;
        self.table.write(dir, offset, &dirent::encode_entry(child, name))?;
        self.table.link(child)?;
        Ok(())
    }

    /// Overwrites the live entry named `name` with a tombstone and returns
    /// the inode it pointed to. Does not unlink: per the locking protocol
    /// the caller releases its (typically exclusive) lock on `dir` before
    /// calling [`InodeTable::unlink`], so that unlink's own reclaim check
    /// never runs while `dir` itself is held.
    fn tombstone_entry(&self, dir: InodeIndex, name: &str) -> Result<InodeIndex> {
        let content = self.read_content(dir)?;
        for (idx, entry) in dirent::decode_entries(&content).into_iter().enumerate() {
            if entry.inode != 0 && entry.name == name {
                let offset = (idx * DIR_ENTRY_SIZE) as u64;
                self.table.write(dir, offset, &dirent::encode_tombstone())?;
                return Ok(entry.inode);
            }
        }
        Err(FsError::NoSuchFile(name.to_string()))
    }

    /// Live (non-tombstone) entries of a directory, in on-disk order.
    pub fn read_dir_entries(&self, dir: InodeIndex) -> Result<Vec<RawDirEntry>> {
        let content = self.read_content(dir)?;
        Ok(dirent::decode_entries(&content)
            .into_iter()
            .filter(|e| e.inode != 0)
            .collect())
    }

    // ---- ancestor-path locking ------------------------------------------

    fn unlock_all(&self, locks: &[InodeIndex]) {
        for &i in locks.iter().rev() {
            let _ = self.table.unlock_ro(i);
        }
    }

    /// Descends from the root through `components`, taking a shared lock on
    /// every directory traversed (root included), and returns the final
    /// component's inode alongside the full chain of locks taken. On any
    /// failure, every lock already taken is released before returning the
    /// error.
    fn resolve_ancestors(&self, components: &[&str]) -> Result<(InodeIndex, Vec<InodeIndex>)> {
        let mut locks = Vec::new();
        if components.is_empty() {
            return Ok((ROOT_INODE, locks));
        }

        if let Err(e) = self.table.lock_ro(ROOT_INODE) {
            return Err(e);
        }
        locks.push(ROOT_INODE);

        let mut current = ROOT_INODE;
        for (idx, name) in components.iter().enumerate() {
            let is_last = idx + 1 == components.len();
            let child = match self.lookup_dir(current, name) {
                Ok(c) => c,
                Err(e) => {
                    self.unlock_all(&locks);
                    return Err(e);
                }
            };
            if !is_last {
                if let Err(e) = self.table.lock_ro(child) {
                    self.unlock_all(&locks);
                    return Err(e);
                }
                locks.push(child);
            }
            current = child;
        }

        Ok((current, locks))
    }

    // ---- public operations -----------------------------------------------

    /// Resolves `path`, optionally creating a new file when it's missing,
    /// and returns an open [`Handle`]. Ancestor locks taken during
    /// resolution are transferred into the handle and released on close.
    pub fn open(&self, path: &str, mode: OpenRequest, create: bool) -> Result<Handle> {
        let _coarse = self.coarse.lock();
        self.table.check_open()?;
        let components = path::split_absolute(path)?;

        if components.is_empty() {
            if mode == OpenRequest::ReadWrite {
                return Err(FsError::InvalidArgument(
                    "cannot open the root directory for writing".into(),
                ));
            }
            self.table.lock_ro(ROOT_INODE)?;
            if let Err(e) = self.table.add_ref(ROOT_INODE) {
                let _ = self.table.unlock_ro(ROOT_INODE);
                return Err(e);
            }
            return Ok(Handle::new(self.table.clone(), ROOT_INODE, HandleMode::Directory, Vec::new()));
        }

        let mut components = components;
        let name = components.pop().expect("non-empty checked above");

        let (parent, mut locks) = self.resolve_ancestors(&components)?;
        if let Err(e) = self.table.lock_ro(parent) {
            self.unlock_all(&locks);
            return Err(e);
        }
        locks.push(parent);

        let target = match self.lookup_dir(parent, name) {
            Ok(t) => t,
            Err(FsError::NoSuchFile(_)) if create => {
                let child = match self.table.alloc(InodeType::File) {
                    Ok(c) => c,
                    Err(e) => {
                        self.unlock_all(&locks);
                        return Err(e);
                    }
                };
                if let Err(e) = self.insert_dir(parent, name, child) {
                    self.unlock_all(&locks);
                    return Err(e);
                }
                child
            }
            Err(e) => {
                self.unlock_all(&locks);
                return Err(e);
            }
        };

        let kind = match self.table.kind(target) {
            Ok(k) => k,
            Err(e) => {
                self.unlock_all(&locks);
                return Err(e);
            }
        };

        let handle_mode = match (kind, mode) {
            (InodeType::Dir, OpenRequest::ReadWrite) => {
                self.unlock_all(&locks);
                return Err(FsError::InvalidArgument(
                    "cannot open a directory for writing".into(),
                ));
            }
            (InodeType::Dir, OpenRequest::ReadOnly) => HandleMode::Directory,
            (InodeType::File, OpenRequest::ReadOnly) => HandleMode::ReadOnly,
            (InodeType::File, OpenRequest::ReadWrite) => HandleMode::ReadWrite,
            (InodeType::Unused, _) => {
                self.unlock_all(&locks);
                return Err(FsError::NoSuchFile(name.to_string()));
            }
        };

        let lock_result = match handle_mode {
            HandleMode::ReadWrite => self.table.lock_rw(target),
            HandleMode::ReadOnly | HandleMode::Directory => self.table.lock_ro(target),
        };
        if let Err(e) = lock_result {
            self.unlock_all(&locks);
            return Err(e);
        }

        if let Err(e) = self.table.add_ref(target) {
            match handle_mode {
                HandleMode::ReadWrite => {
                    let _ = self.table.unlock_rw(target);
                }
                HandleMode::ReadOnly | HandleMode::Directory => {
                    let _ = self.table.unlock_ro(target);
                }
            }
            self.unlock_all(&locks);
            return Err(e);
        }

        Ok(Handle::new(self.table.clone(), target, handle_mode, locks))
    }

    pub fn make_dir(&self, path: &str) -> Result<()> {
        let _coarse = self.coarse.lock();
        self.table.check_open()?;
        let (parent_components, name) = path::split_parent(path)?;
        let (parent, locks) = self.resolve_ancestors(&parent_components)?;

        let result = (|| {
            if self.lookup_dir(parent, name).is_ok() {
                return Err(FsError::AlreadyExists(name.to_string()));
            }
            let child = self.table.alloc(InodeType::Dir)?;
            self.insert_dir(parent, name, child)
        })();

        self.unlock_all(&locks);
        result
    }

    /// Removes the directory entry named by `path` and unlinks the inode
    /// it pointed to. Takes an exclusive lock on the immediate parent,
    /// which is what makes this conflict with any handle whose
    /// ancestor-path lock chain still includes that parent.
    pub fn remove_entry(&self, path: &str) -> Result<()> {
        let _coarse = self.coarse.lock();
        self.table.check_open()?;
        let (parent_components, name) = path::split_parent(path)?;
        let (parent, ancestor_locks) = self.resolve_ancestors(&parent_components)?;

        if let Err(e) = self.table.lock_rw(parent) {
            self.unlock_all(&ancestor_locks);
            return Err(e);
        }

        let child = self.tombstone_entry(parent, name);
        let _ = self.table.unlock_rw(parent);
        self.unlock_all(&ancestor_locks);

        let child = child?;
        self.table.unlink(child)
    }

    /// Moves the entry at `src` to `dest`. Both parent directories are
    /// locked exclusively, in a fixed order (lowest inode index first) so
    /// that two concurrent moves crossing each other's parents can't
    /// deadlock. Net link count on the moved inode is unchanged: `insert`
    /// links, `tombstone` only un-names, and the final unlink after both
    /// locks are released cancels that link back out.
    pub fn move_entry(&self, src: &str, dest: &str) -> Result<()> {
        let _coarse = self.coarse.lock();
        self.table.check_open()?;
        let (src_parent_components, src_name) = path::split_parent(src)?;
        let (dest_parent_components, dest_name) = path::split_parent(dest)?;

        let (src_parent, src_ancestors) = self.resolve_ancestors(&src_parent_components)?;
        let (dest_parent, dest_ancestors) = match self.resolve_ancestors(&dest_parent_components) {
            Ok(v) => v,
            Err(e) => {
                self.unlock_all(&src_ancestors);
                return Err(e);
            }
        };

        // The ancestor chains served only to protect the resolution walk
        // itself; drop them before taking the exclusive parent locks below,
        // since either parent may itself be one of the other side's
        // ancestors (e.g. both src and dest hang off root) and a shared
        // lock this call already holds must not be left outstanding when
        // this same call asks for an exclusive one on the same inode. The
        // coarse lock still excludes other mutators, and a directory named
        // by a live entry can't be reclaimed out from under us in the gap.
        self.unlock_all(&src_ancestors);
        self.unlock_all(&dest_ancestors);

        let (first, second) = if src_parent <= dest_parent {
            (src_parent, dest_parent)
        } else {
            (dest_parent, src_parent)
        };

        self.table.lock_rw(first)?;
        if second != first {
            if let Err(e) = self.table.lock_rw(second) {
                let _ = self.table.unlock_rw(first);
                return Err(e);
            }
        }

        let result = (|| {
            let child = self.lookup_dir(src_parent, src_name)?;
            if self.lookup_dir(dest_parent, dest_name).is_ok() {
                return Err(FsError::AlreadyExists(dest_name.to_string()));
            }
            self.insert_dir(dest_parent, dest_name, child)?;
            self.tombstone_entry(src_parent, src_name)?;
            Ok(child)
        })();

        if second != first {
            let _ = self.table.unlock_rw(second);
        }
        let _ = self.table.unlock_rw(first);

        let child = result?;
        self.table.unlink(child)
    }

    /// Copies `src` to `dest`. Files are duplicated page-by-page through
    /// [`InodeTable::copy`]; directories are recreated and their live
    /// children copied recursively. The filesystem-wide lock is held for
    /// the whole recursive call so concurrent namespace mutations can't
    /// observe a partially built copy.
    pub fn copy_entry(&self, src: &str, dest: &str) -> Result<()> {
        let _coarse = self.coarse.lock();
        self.table.check_open()?;
        self.copy_recursive(src, dest)
    }

    fn copy_recursive(&self, src: &str, dest: &str) -> Result<()> {
        let (src_parent_components, src_name) = path::split_parent(src)?;
        let (src_parent, src_ancestors) = self.resolve_ancestors(&src_parent_components)?;
        if let Err(e) = self.table.lock_ro(src_parent) {
            self.unlock_all(&src_ancestors);
            return Err(e);
        }
        let mut src_locks = src_ancestors;
        src_locks.push(src_parent);

        let result = (|| {
            let child = self.lookup_dir(src_parent, src_name)?;
            let kind = self.table.kind(child)?;

            let (dest_parent_components, dest_name) = path::split_parent(dest)?;
            let (dest_parent, dest_ancestors) = self.resolve_ancestors(&dest_parent_components)?;

            let inner = (|| {
                if self.lookup_dir(dest_parent, dest_name).is_ok() {
                    return Err(FsError::AlreadyExists(dest_name.to_string()));
                }
                match kind {
                    InodeType::File => {
                        let copy = self.table.copy(child)?;
                        self.insert_dir(dest_parent, dest_name, copy)?;
                    }
                    InodeType::Dir => {
                        let new_dir = self.table.alloc(InodeType::Dir)?;
                        self.insert_dir(dest_parent, dest_name, new_dir)?;
                        for entry in self.read_dir_entries(child)? {
                            let child_src = join_path(src, &entry.name);
                            let child_dest = join_path(dest, &entry.name);
                            self.copy_recursive(&child_src, &child_dest)?;
                        }
                    }
                    InodeType::Unused => unreachable!("resolved to an unused inode"),
                }
                Ok(())
            })();

            self.unlock_all(&dest_ancestors);
            inner
        })();

        self.unlock_all(&src_locks);
        result
    }
}

fn join_path(parent: &str, name: &str) -> String {
    if parent == "/" {
        format!("/{name}")
    } else {
        format!("{parent}/{name}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bitmap::BlockAllocator;
    use crate::cache::PageCache;
    use tempfile::NamedTempFile;

    fn fixture() -> (Arc<InodeTable>, Namespace) {
        let tmp = NamedTempFile::new().unwrap();
        let inodes = 32u32;
        let max_blocks = 128u64;
        let total_pages = 1 + inodes as u64 + 1 + max_blocks;
        let cache = Arc::new(PageCache::create(tmp.path(), total_pages, 64).unwrap());
        let allocator = Arc::new(BlockAllocator::new(
            cache.clone(),
            1 + inodes as u64,
            2 + inodes as u64,
            max_blocks,
        ));
        let table = Arc::new(InodeTable::new(cache, allocator, 0, inodes));
        table.alloc(InodeType::Dir).unwrap(); // root, inode 0
        table.link(ROOT_INODE).unwrap();
        let ns = Namespace::new(table.clone());
        (table, ns)
    }

    #[test]
    fn create_write_read_roundtrip() {
        let (_table, ns) = fixture();
        let mut h = ns.open("/f", OpenRequest::ReadWrite, true).unwrap();
        h.write(b"hello").unwrap();
        h.close().unwrap();

        let mut h = ns.open("/f", OpenRequest::ReadOnly, false).unwrap();
        let mut buf = [0u8; 5];
        let n = h.read(&mut buf).unwrap();
        assert_eq!(n, 5);
        assert_eq!(&buf, b"hello");
        h.close().unwrap();
    }

    #[test]
    fn open_missing_without_create_fails() {
        let (_table, ns) = fixture();
        assert!(matches!(
            ns.open("/missing", OpenRequest::ReadOnly, false),
            Err(FsError::NoSuchFile(_))
        ));
    }

    #[test]
    fn make_dir_and_nested_file() {
        let (_table, ns) = fixture();
        ns.make_dir("/a").unwrap();
        let mut h = ns.open("/a/f", OpenRequest::ReadWrite, true).unwrap();
        h.write(b"x").unwrap();
        h.close().unwrap();

        let listing: Vec<String> = ns
            .read_dir_entries(ns.lookup_dir(ROOT_INODE, "a").unwrap())
            .unwrap()
            .into_iter()
            .map(|e| e.name)
            .collect();
        assert_eq!(listing, vec!["f".to_string()]);
    }

    #[test]
    fn exclusive_open_conflicts() {
        let (_table, ns) = fixture();
        let _h1 = ns.open("/f", OpenRequest::ReadWrite, true).unwrap();
        assert!(matches!(
            ns.open("/f", OpenRequest::ReadOnly, false),
            Err(FsError::Busy(_))
        ));
    }

    #[test]
    fn remove_then_reclaim() {
        let (table, ns) = fixture();
        let mut h = ns.open("/f", OpenRequest::ReadWrite, true).unwrap();
        h.write(b"data").unwrap();
        h.close().unwrap();

        ns.remove_entry("/f").unwrap();
        assert!(matches!(
            ns.open("/f", OpenRequest::ReadOnly, false),
            Err(FsError::NoSuchFile(_))
        ));
        let _ = table;
    }

    #[test]
    fn move_to_new_parent() {
        let (_table, ns) = fixture();
        ns.make_dir("/a").unwrap();
        ns.make_dir("/b").unwrap();
        let mut h = ns.open("/a/f", OpenRequest::ReadWrite, true).unwrap();
        h.write(b"x").unwrap();
        h.close().unwrap();

        ns.move_entry("/a/f", "/b/g").unwrap();
        assert!(matches!(
            ns.open("/a/f", OpenRequest::ReadOnly, false),
            Err(FsError::NoSuchFile(_))
        ));
        let mut h = ns.open("/b/g", OpenRequest::ReadOnly, false).unwrap();
        let mut buf = [0u8; 1];
        h.read(&mut buf).unwrap();
        assert_eq!(&buf, b"x");
        h.close().unwrap();
    }

    #[test]
    fn move_directory_hanging_off_root_into_another_root_child() {
        // Regression test: resolving "/c"'s ancestor chain shares-locks root,
        // and src_parent here *is* root — the exclusive parent lock taken
        // below must not conflict with that already-released ancestor lock.
        let (_table, ns) = fixture();
        ns.make_dir("/a").unwrap();
        ns.make_dir("/c").unwrap();
        let mut h = ns.open("/a/f", OpenRequest::ReadWrite, true).unwrap();
        h.write(b"x").unwrap();
        h.close().unwrap();

        ns.move_entry("/a", "/c/a_moved").unwrap();

        assert!(matches!(
            ns.open("/a/f", OpenRequest::ReadOnly, false),
            Err(FsError::NoSuchFile(_))
        ));
        let mut h = ns.open("/c/a_moved/f", OpenRequest::ReadOnly, false).unwrap();
        let mut buf = [0u8; 1];
        h.read(&mut buf).unwrap();
        assert_eq!(&buf, b"x");
        h.close().unwrap();
    }

    #[test]
    fn copy_is_independent_of_source() {
        let (_table, ns) = fixture();
        let mut h = ns.open("/f", OpenRequest::ReadWrite, true).unwrap();
        h.write(b"original").unwrap();
        h.close().unwrap();

        ns.copy_entry("/f", "/g").unwrap();
        let mut src = ns.open("/f", OpenRequest::ReadWrite, false).unwrap();
        src.truncate().unwrap();
        src.write(b"changed").unwrap();
        src.close().unwrap();

        let mut dst = ns.open("/g", OpenRequest::ReadOnly, false).unwrap();
        let mut buf = [0u8; 8];
        let n = dst.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"original");
        dst.close().unwrap();
    }
}

//! End-to-end scenarios against a real temp-file-backed container.

use std::thread;

use sixfs::{FsError, Filesystem, OpenRequest};
use tempfile::NamedTempFile;

const HELLO: &[u8] = b"Hello, World!\n";

fn init_logger() {
    let _ = env_logger::Builder::new()
        .is_test(true)
        .filter_level(log::LevelFilter::Debug)
        .try_init();
}

fn fresh(inodes: u64, blocks: u64) -> (NamedTempFile, Filesystem) {
    init_logger();
    let tmp = NamedTempFile::new().unwrap();
    let fs = Filesystem::create(tmp.path(), inodes, blocks).unwrap();
    (tmp, fs)
}

#[test]
fn s1_open_write_read_close() {
    let (_tmp, fs) = fresh(32, 64);
    fs.make_dir("/a").unwrap();

    let mut w = fs.open_path("/a/f", OpenRequest::ReadWrite, true).unwrap();
    w.write(HELLO).unwrap();
    w.close().unwrap();

    let mut r = fs.open_path("/a/f", OpenRequest::ReadOnly, false).unwrap();
    let mut buf = [0u8; 14];
    let n = r.read(&mut buf).unwrap();
    assert_eq!(n, 14);
    assert_eq!(&buf, HELLO);
    r.close().unwrap();
}

#[test]
fn s2_append_and_mtime_advances() {
    let (_tmp, fs) = fresh(32, 64);
    fs.make_dir("/a").unwrap();
    let mut w = fs.open_path("/a/f", OpenRequest::ReadWrite, true).unwrap();
    w.write(HELLO).unwrap();
    w.close().unwrap();

    let mut w = fs.open_path("/a/f", OpenRequest::ReadWrite, false).unwrap();
    let created = w.created_at().unwrap();
    let size = w.size().unwrap();
    w.seek(size).unwrap();
    w.write(HELLO).unwrap();
    w.reset().unwrap();

    let mut buf = [0u8; 28];
    let n = w.read(&mut buf).unwrap();
    assert_eq!(n, 28);
    assert_eq!(&buf[..14], HELLO);
    assert_eq!(&buf[14..], HELLO);

    let modified = w.modified_at().unwrap();
    assert!(modified >= created);
    w.close().unwrap();
}

#[test]
fn s3_exclusive_conflict_then_close_releases() {
    let (_tmp, fs) = fresh(32, 64);
    let mut w = fs.open_path("/f", OpenRequest::ReadWrite, true).unwrap();

    assert!(matches!(
        fs.open_path("/f", OpenRequest::ReadOnly, false),
        Err(FsError::Busy(_))
    ));

    w.close().unwrap();
    let mut r = fs.open_path("/f", OpenRequest::ReadOnly, false).unwrap();
    r.close().unwrap();
}

#[test]
fn s4_concurrent_reads_all_agree() {
    let (_tmp, fs) = fresh(32, 64);
    let mut w = fs.open_path("/f", OpenRequest::ReadWrite, true).unwrap();
    w.write(HELLO).unwrap();
    w.close().unwrap();

    thread::scope(|scope| {
        for _ in 0..3 {
            scope.spawn(|| {
                let mut h = fs.open_path("/f", OpenRequest::ReadOnly, false).unwrap();
                let mut buf = [0u8; 14];
                let n = h.read(&mut buf).unwrap();
                assert_eq!(n, 14);
                assert_eq!(&buf, HELLO);
                h.close().unwrap();
            });
        }
    });
}

#[test]
fn s5_copy_is_isolated_from_later_writes() {
    let (_tmp, fs) = fresh(32, 64);
    fs.make_dir("/a").unwrap();
    fs.make_dir("/c").unwrap();
    let mut w = fs.open_path("/a/f", OpenRequest::ReadWrite, true).unwrap();
    w.write(HELLO).unwrap();
    w.close().unwrap();

    fs.copy("/a", "/c/a_copy").unwrap();

    let reversed: Vec<u8> = HELLO.iter().rev().copied().collect();
    let mut w = fs.open_path("/a/f", OpenRequest::ReadWrite, false).unwrap();
    w.truncate().unwrap();
    w.write(&reversed).unwrap();
    w.close().unwrap();

    let mut original = fs.open_path("/c/a_copy/f", OpenRequest::ReadOnly, false).unwrap();
    let mut buf = [0u8; 14];
    original.read(&mut buf).unwrap();
    assert_eq!(&buf, HELLO);
    original.close().unwrap();

    let mut changed = fs.open_path("/a/f", OpenRequest::ReadOnly, false).unwrap();
    let mut buf = [0u8; 14];
    changed.read(&mut buf).unwrap();
    assert_eq!(buf.as_slice(), reversed.as_slice());
    changed.close().unwrap();
}

#[test]
fn s6_move_updates_namespace_not_content() {
    let (_tmp, fs) = fresh(32, 64);
    fs.make_dir("/a").unwrap();
    fs.make_dir("/c").unwrap();
    let mut w = fs.open_path("/a/f", OpenRequest::ReadWrite, true).unwrap();
    w.write(HELLO).unwrap();
    w.close().unwrap();

    fs.move_entry("/a", "/c/a_moved").unwrap();

    assert!(matches!(
        fs.open_path("/a/f", OpenRequest::ReadOnly, false),
        Err(FsError::NoSuchFile(_))
    ));

    let mut moved = fs.open_path("/c/a_moved/f", OpenRequest::ReadOnly, false).unwrap();
    let mut buf = [0u8; 14];
    moved.read(&mut buf).unwrap();
    assert_eq!(&buf, HELLO);
    moved.close().unwrap();
}

#[test]
fn s7_remove_recursion_reclaims_space() {
    // Deliberately tight on blocks: if `/a` and `/a/f`'s pages weren't
    // freed, the second write of this size would run out of space.
    let (_tmp, fs) = fresh(32, 8);
    fs.make_dir("/a").unwrap();
    let mut w = fs.open_path("/a/f", OpenRequest::ReadWrite, true).unwrap();
    w.write(HELLO).unwrap();
    w.close().unwrap();

    fs.remove("/a").unwrap();

    assert!(matches!(
        fs.open_path("/a", OpenRequest::ReadOnly, false),
        Err(FsError::NoSuchFile(_))
    ));
    assert!(matches!(
        fs.open_path("/a/f", OpenRequest::ReadOnly, false),
        Err(FsError::NoSuchFile(_))
    ));

    fs.make_dir("/b").unwrap();
    let mut w = fs.open_path("/b/g", OpenRequest::ReadWrite, true).unwrap();
    w.write(HELLO).unwrap();
    w.close().unwrap();
}

#[test]
fn s8_reopen_then_outer_close_invalidates_handles() {
    let tmp = NamedTempFile::new().unwrap();
    {
        let fs = Filesystem::create(tmp.path(), 32, 64).unwrap();
        fs.make_dir("/test").unwrap();
        fs.close().unwrap();
    }

    let fs = Filesystem::open(tmp.path()).unwrap();
    let mut dir = fs.open_path("/test", OpenRequest::ReadOnly, false).unwrap();
    assert!(dir.is_dir());

    fs.close().unwrap();

    assert!(matches!(dir.close(), Err(FsError::Closed)));
}

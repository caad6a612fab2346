//! Directory entry encoding: a fixed-width (inode-index, name) record.
//!
//! A directory inode's content is a tightly packed sequence of
//! [`DIR_ENTRY_SIZE`]-byte entries. An entry whose inode field is 0 is a
//! tombstone: skipped on read, reusable on insert.

use crate::inode::InodeIndex;

/// Bytes reserved for the name payload (zero-padded).
pub const NAME_PAYLOAD_SIZE: usize = 255;

/// Total on-disk size of one directory entry: 4-byte inode index + 8-byte
/// name length + 255-byte zero-padded name payload.
pub const DIR_ENTRY_SIZE: usize = 4 + 8 + NAME_PAYLOAD_SIZE;

/// A decoded directory entry. `inode == 0` denotes a tombstone, in which
/// case `name` is meaningless.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RawDirEntry {
    pub inode: InodeIndex,
    pub name: String,
}

/// Encodes `(inode, name)` into exactly [`DIR_ENTRY_SIZE`] bytes.
///
/// Panics if `name` doesn't fit in [`NAME_PAYLOAD_SIZE`] bytes; callers
/// validate name length before ever reaching here (see
/// [`crate::namespace`]).
pub fn encode_entry(inode: InodeIndex, name: &str) -> [u8; DIR_ENTRY_SIZE] {
    let name_bytes = name.as_bytes();
    assert!(
        name_bytes.len() <= NAME_PAYLOAD_SIZE,
        "directory entry name too long"
    );

    let mut buf = [0u8; DIR_ENTRY_SIZE];
    buf[0..4].copy_from_slice(&inode.to_be_bytes());
    buf[4..12].copy_from_slice(&(name_bytes.len() as u64).to_be_bytes());
    buf[12..12 + name_bytes.len()].copy_from_slice(name_bytes);
    buf
}

/// Encodes a tombstone entry (inode index 0).
pub fn encode_tombstone() -> [u8; DIR_ENTRY_SIZE] {
    [0u8; DIR_ENTRY_SIZE]
}

/// Decodes one [`DIR_ENTRY_SIZE`]-byte record.
pub fn decode_entry(bytes: &[u8]) -> RawDirEntry {
    debug_assert_eq!(bytes.len(), DIR_ENTRY_SIZE);
    let inode = u32::from_be_bytes(bytes[0..4].try_into().unwrap());
    let name_len = u64::from_be_bytes(bytes[4..12].try_into().unwrap()) as usize;
    let name_len = name_len.min(NAME_PAYLOAD_SIZE);
    let name = String::from_utf8_lossy(&bytes[12..12 + name_len]).into_owned();
    RawDirEntry { inode, name }
}

/// Returns `true` if this record is a tombstone (not a live entry).
pub fn is_tombstone(bytes: &[u8]) -> bool {
    u32::from_be_bytes(bytes[0..4].try_into().unwrap()) == 0
}

/// Decodes every [`DIR_ENTRY_SIZE`]-byte record in `content`, tombstones
/// included. Trailing bytes shorter than one entry are ignored.
pub fn decode_entries(content: &[u8]) -> Vec<RawDirEntry> {
    content
        .chunks_exact(DIR_ENTRY_SIZE)
        .map(decode_entry)
        .collect()
}

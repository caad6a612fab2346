//! A single-file, Unix-v6-style block filesystem embedded in one host file.
//!
//! [`Filesystem::create`] formats a fresh container; [`Filesystem::open`]
//! reopens one, validating its header first. Everything else is reached
//! through paths: [`Filesystem::open_path`] returns a [`Handle`] for
//! reading, writing, seeking, and truncating a file, or for listing a
//! directory's own metadata; [`Filesystem::make_dir`], [`Filesystem::move_entry`],
//! [`Filesystem::copy`], and [`Filesystem::remove`] mutate the namespace
//! directly.

mod bitmap;
mod cache;
mod device;
mod dirent;
mod error;
mod handle;
mod header;
mod inode;
mod namespace;
mod path;

mod fs;

pub use error::{FsError, Result};
pub use fs::{Filesystem, DEFAULT_INODE_COUNT, DEFAULT_MAX_BLOCKS};
pub use handle::{Handle, OpenRequest};

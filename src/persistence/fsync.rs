//! fsync helpers for durable snapshot writes.
//!
//! A rename only survives power loss once the directory holding it has been
//! synced, so snapshot writes sync both the temp file and its directory.

use std::fs::{File, OpenOptions};
use std::io;
use std::path::Path;

/// Syncs a file's contents and metadata to disk.
pub fn fsync_file(file: &File) -> io::Result<()> {
    file.sync_all()
}

/// Syncs a directory so that entries created or renamed in it are durable.
///
/// Only pass directory paths. Opening read-only is enough for the sync.
pub fn fsync_dir(dir_path: &Path) -> io::Result<()> {
    OpenOptions::new().read(true).open(dir_path)?.sync_all()
}

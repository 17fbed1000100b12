//! Durability helpers for the flat-file stores.
//!
//! Durable writes are either appends followed by a flush, or a whole-file
//! replacement via write-then-rename. A rename only survives power loss once
//! the containing directory has been synced as well, so [`replace_file`]
//! syncs both.

use std::fs::{File, OpenOptions};
use std::io;
use std::path::Path;

use tracing::{debug, warn};

/// Syncs a file's contents and metadata to disk.
pub fn sync_file(file: &File) -> io::Result<()> {
    file.sync_all()
}

/// Syncs a directory so entries created, renamed or removed in it are durable.
pub fn sync_dir(dir: &Path) -> io::Result<()> {
    OpenOptions::new().read(true).open(dir)?.sync_all()
}

/// Syncs the directory containing `path`.
pub fn sync_parent_dir(path: &Path) -> io::Result<()> {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => sync_dir(parent),
        _ => sync_dir(Path::new(".")),
    }
}

/// Atomically replaces `dst` with `src` and makes the rename durable.
///
/// This is the commit point for every whole-file rewrite: before it returns,
/// readers see the old `dst`; after, the new one.
pub fn replace_file(src: &Path, dst: &Path) -> io::Result<()> {
    std::fs::rename(src, dst)?;
    sync_parent_dir(dst)
}

/// Removes a file, logging instead of failing.
///
/// A missing file is not worth a warning. Returns whether a file was removed.
pub fn remove_file_best_effort(path: &Path) -> bool {
    match std::fs::remove_file(path) {
        Ok(()) => true,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            debug!(path = %path.display(), "nothing to remove");
            false
        }
        Err(e) => {
            warn!(path = %path.display(), error = %e, "did not unlink");
            false
        }
    }
}

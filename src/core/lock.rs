//! Advisory file locks
//!
//! Guards cache entries and package directories against a second srcfetch
//! process working on the same item at the same time.

use crate::error::{Error, IoContext, Result};
use fs2::FileExt;
use std::fs::File;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Attempts before giving up on a lock file that keeps being replaced
const RELINK_ATTEMPTS: usize = 8;

/// Take an exclusive, non-blocking lock on `lock_path`.
///
/// `what` names the locked item in the error message. Returns a guard that
/// releases the lock and deletes the lock file when dropped. A lock taken on
/// a file that was unlinked (or replaced) in the meantime is discarded and
/// retried, so the deletion on drop cannot let two holders in.
pub fn acquire_lock(lock_path: &Path, what: &str) -> Result<FileLock> {
    if let Some(parent) = lock_path.parent() {
        std::fs::create_dir_all(parent)
            .io_context(|| format!("cannot create directory {}", parent.display()))?;
    }

    for _ in 0..RELINK_ATTEMPTS {
        let lock_file = File::create(lock_path)
            .io_context(|| format!("cannot create lock file {}", lock_path.display()))?;

        if lock_file.try_lock_exclusive().is_err() {
            return Err(Error::Locked {
                what: what.to_string(),
                path: lock_path.to_path_buf(),
            });
        }

        if still_linked(&lock_file, lock_path) {
            return Ok(FileLock {
                _file: lock_file,
                path: lock_path.to_path_buf(),
            });
        }
        debug!(path = %lock_path.display(), "lock file replaced while locking, retrying");
    }

    Err(Error::Locked {
        what: what.to_string(),
        path: lock_path.to_path_buf(),
    })
}

/// Whether `path` still names the file behind `file`.
#[cfg(unix)]
fn still_linked(file: &File, path: &Path) -> bool {
    use std::os::unix::fs::MetadataExt;
    match (file.metadata(), std::fs::metadata(path)) {
        (Ok(held), Ok(named)) => held.dev() == named.dev() && held.ino() == named.ino(),
        _ => false,
    }
}

#[cfg(not(unix))]
fn still_linked(_file: &File, path: &Path) -> bool {
    path.exists()
}

/// RAII guard for an advisory lock
#[derive(Debug)]
pub struct FileLock {
    _file: File,
    path: PathBuf,
}

impl FileLock {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

use std::fs::{File, OpenOptions};
use std::path::Path;

use fs2::FileExt;

use crate::error::StorageError;

/// Advisory lock (`flock(2)`) on a database's `.lock` file.
///
/// One open handle per database. Released when dropped.
#[derive(Debug)]
pub struct FileLock {
    _file: File,
}

impl FileLock {
    /// Take the lock without blocking.
    ///
    /// Creates the lock file if needed. Returns `StorageError::FileLocked` if
    /// another handle already owns it.
    pub fn acquire(path: &Path) -> Result<Self, StorageError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        file.try_lock_exclusive()
            .map_err(|_| StorageError::FileLocked)?;

        Ok(Self { _file: file })
    }
}

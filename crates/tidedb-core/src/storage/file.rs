use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;

use crate::error::StorageError;
use crate::types::{PAGE_SIZE, PageNo};

/// Low-level file I/O for the `.db` page file.
///
/// Provides page-granularity reads and writes using `pread`/`pwrite`
/// (via `FileExt::read_at` / `write_at`), so it can be shared across threads
/// without a seek lock. Page numbers are 1-based: page `n` lives at byte
/// offset `(n - 1) * PAGE_SIZE`.
pub struct FileManager {
    file: File,
}

impl FileManager {
    /// Create a new, empty page file at `path`. Fails if the file exists.
    pub fn create(path: &Path) -> Result<Self, StorageError> {
        if path.exists() {
            return Err(StorageError::FileExists(path.display().to_string()));
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)?;
        Ok(Self { file })
    }

    /// Open an existing page file at `path`.
    pub fn open(path: &Path) -> Result<Self, StorageError> {
        if !path.exists() {
            return Err(StorageError::FileMissing(path.display().to_string()));
        }
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        Ok(Self { file })
    }

    /// Number of whole pages currently in the file.
    pub fn page_count(&self) -> Result<PageNo, StorageError> {
        let len = self.file.metadata()?.len();
        Ok((len / PAGE_SIZE as u64) as PageNo)
    }

    /// Read a full page from disk.
    pub fn read_page(&self, pgno: PageNo) -> Result<Box<[u8; PAGE_SIZE]>, StorageError> {
        let mut buf = Box::new([0u8; PAGE_SIZE]);
        self.file.read_exact_at(&mut buf[..], page_offset(pgno))?;
        Ok(buf)
    }

    /// Write a full page to disk (not synced).
    pub fn write_page(&self, pgno: PageNo, data: &[u8; PAGE_SIZE]) -> Result<(), StorageError> {
        self.file.write_all_at(data, page_offset(pgno))?;
        Ok(())
    }

    /// Shrink (or grow) the file to exactly `pages` pages.
    pub fn set_page_count(&self, pages: PageNo) -> Result<(), StorageError> {
        self.file.set_len(pages as u64 * PAGE_SIZE as u64)?;
        Ok(())
    }

    /// Fsync the data of the underlying file.
    pub fn sync(&self) -> Result<(), StorageError> {
        self.file.sync_data()?;
        Ok(())
    }
}

fn page_offset(pgno: PageNo) -> u64 {
    debug_assert!(pgno >= 1, "page numbers are 1-based");
    (pgno as u64 - 1) * PAGE_SIZE as u64
}

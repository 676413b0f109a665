use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use tracing::debug;

use crate::cache::{CacheLoader, ResourceCache};
use crate::error::{ConfigError, Error, StorageError};
use crate::types::{MIN_CACHE_PAGES, PAGE_SIZE, PageNo};

use super::file::FileManager;
use super::page::Page;

/// Reads pages from the `.db` file on a miss and writes dirty pages back on
/// eviction.
pub struct PageLoader {
    file: Arc<FileManager>,
    page_count: Arc<AtomicU32>,
}

impl CacheLoader for PageLoader {
    type Resource = Page;

    fn load(&self, key: u64) -> Result<Option<Page>, Error> {
        let pgno = key as PageNo;
        if pgno == 0 || pgno > self.page_count.load(Ordering::Acquire) {
            return Ok(None);
        }
        let buf = self.file.read_page(pgno)?;
        Ok(Some(Page::new(pgno, buf)))
    }

    fn evict(&self, page: &Page) -> Result<(), Error> {
        if page.is_dirty() {
            let buf = page.snapshot();
            self.file.write_page(page.pgno(), &buf)?;
            self.file.sync()?;
            page.set_dirty(false);
        }
        Ok(())
    }
}

/// Page store: fixed-size pages of the `.db` file behind a bounded
/// [`ResourceCache`].
///
/// Every [`fetch`](Self::fetch) must be paired with a [`release`](Self::release);
/// a page is written back when its last reference is released.
pub struct PageCache {
    cache: ResourceCache<PageLoader>,
    file: Arc<FileManager>,
    page_count: Arc<AtomicU32>,
}

impl PageCache {
    /// Create a new page file holding at most `capacity` pages in memory.
    pub fn create(path: &Path, capacity: usize) -> Result<Self, Error> {
        check_capacity(capacity)?;
        let file = FileManager::create(path)?;
        Ok(Self::with_file(file, 0, capacity))
    }

    /// Open an existing page file.
    pub fn open(path: &Path, capacity: usize) -> Result<Self, Error> {
        check_capacity(capacity)?;
        let file = FileManager::open(path)?;
        let pages = file.page_count()?;
        Ok(Self::with_file(file, pages, capacity))
    }

    fn with_file(file: FileManager, pages: PageNo, capacity: usize) -> Self {
        let file = Arc::new(file);
        let page_count = Arc::new(AtomicU32::new(pages));
        let loader = PageLoader {
            file: Arc::clone(&file),
            page_count: Arc::clone(&page_count),
        };
        Self {
            cache: ResourceCache::new(loader, capacity),
            file,
            page_count,
        }
    }

    /// Append a new page with `init` as its content, written through to disk
    /// immediately. Returns the new page number.
    pub fn allocate(&self, init: &[u8; PAGE_SIZE]) -> Result<PageNo, Error> {
        let pgno = self.page_count.fetch_add(1, Ordering::AcqRel) + 1;
        self.file.write_page(pgno, init)?;
        self.file.sync()?;
        debug!(pgno, "allocated page");
        Ok(pgno)
    }

    /// Pin page `pgno`, reading it from disk on a miss.
    pub fn fetch(&self, pgno: PageNo) -> Result<Arc<Page>, Error> {
        self.cache.acquire(pgno as u64)?.ok_or_else(|| {
            StorageError::PageOutOfBounds {
                pgno,
                page_count: self.page_count(),
            }
            .into()
        })
    }

    /// Unpin a page previously returned by [`fetch`](Self::fetch).
    pub fn release(&self, page: &Page) -> Result<(), Error> {
        self.cache.release(page.pgno() as u64)
    }

    /// Write `page` to disk now, dirty or not.
    pub fn flush(&self, page: &Page) -> Result<(), Error> {
        let buf = page.snapshot();
        self.file.write_page(page.pgno(), &buf)?;
        self.file.sync()?;
        Ok(())
    }

    /// Cut the file down to exactly `max_pgno` pages. Recovery only.
    pub fn truncate(&self, max_pgno: PageNo) -> Result<(), Error> {
        self.file.set_page_count(max_pgno)?;
        self.page_count.store(max_pgno, Ordering::Release);
        debug!(max_pgno, "truncated page file");
        Ok(())
    }

    /// Number of pages in the file.
    pub fn page_count(&self) -> PageNo {
        self.page_count.load(Ordering::Acquire)
    }

    /// Number of pages currently resident in memory.
    pub fn resident(&self) -> usize {
        self.cache.len()
    }

    /// Write back and drop every cached page.
    pub fn close(&self) -> Result<(), Error> {
        self.cache.shutdown()?;
        self.file.sync()?;
        Ok(())
    }
}

fn check_capacity(capacity: usize) -> Result<(), ConfigError> {
    if capacity < MIN_CACHE_PAGES {
        return Err(ConfigError::MemoryTooSmall {
            pages: capacity,
            min_pages: MIN_CACHE_PAGES,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::page::{self, init_data_page};
    use tempfile::tempdir;

    #[test]
    fn test_allocate_and_fetch() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.db");
        let pc = PageCache::create(&path, 16).unwrap();

        let mut init = [0u8; PAGE_SIZE];
        init[10] = 42;
        assert_eq!(pc.allocate(&init).unwrap(), 1);
        assert_eq!(pc.allocate(&init).unwrap(), 2);
        assert_eq!(pc.page_count(), 2);

        let page = pc.fetch(2).unwrap();
        assert_eq!(page.pgno(), 2);
        assert_eq!(page.lock()[10], 42);
        pc.release(&page).unwrap();
    }

    #[test]
    fn test_fetch_out_of_bounds() {
        let dir = tempdir().unwrap();
        let pc = PageCache::create(&dir.path().join("test.db"), 16).unwrap();
        match pc.fetch(3) {
            Err(Error::Storage(StorageError::PageOutOfBounds {
                pgno: 3,
                page_count: 0,
            })) => {}
            other => panic!("expected PageOutOfBounds, got {:?}", other.err()),
        }
    }

    #[test]
    fn test_dirty_page_flushed_on_release() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.db");
        {
            let pc = PageCache::create(&path, 16).unwrap();
            let pgno = pc.allocate(&init_data_page()).unwrap();
            let pg = pc.fetch(pgno).unwrap();
            page::insert(&pg, b"persisted").unwrap();
            pc.release(&pg).unwrap();
            assert!(!pg.is_dirty());
            assert_eq!(pc.resident(), 0);
        }

        let pc = PageCache::open(&path, 16).unwrap();
        assert_eq!(pc.page_count(), 1);
        let pg = pc.fetch(1).unwrap();
        assert_eq!(&pg.lock()[2..11], b"persisted");
        pc.release(&pg).unwrap();
    }

    #[test]
    fn test_close_flushes_pinned_pages() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.db");
        {
            let pc = PageCache::create(&path, 16).unwrap();
            let pgno = pc.allocate(&init_data_page()).unwrap();
            let pg = pc.fetch(pgno).unwrap();
            page::insert(&pg, b"pinned").unwrap();
            // Never released: close must still write it back.
            pc.close().unwrap();
        }

        let pc = PageCache::open(&path, 16).unwrap();
        let pg = pc.fetch(1).unwrap();
        assert_eq!(&pg.lock()[2..8], b"pinned");
    }

    #[test]
    fn test_truncate() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.db");
        let pc = PageCache::create(&path, 16).unwrap();
        for _ in 0..5 {
            pc.allocate(&init_data_page()).unwrap();
        }
        pc.truncate(2).unwrap();
        assert_eq!(pc.page_count(), 2);
        assert!(pc.fetch(3).is_err());
        assert_eq!(pc.allocate(&init_data_page()).unwrap(), 3);
    }

    #[test]
    fn test_capacity_floor() {
        let dir = tempdir().unwrap();
        match PageCache::create(&dir.path().join("test.db"), 9) {
            Err(Error::Config(ConfigError::MemoryTooSmall { pages: 9, .. })) => {}
            other => panic!("expected MemoryTooSmall, got {:?}", other.err()),
        }
    }

    #[test]
    fn test_cache_full_when_all_pinned() {
        let dir = tempdir().unwrap();
        let pc = PageCache::create(&dir.path().join("test.db"), 10).unwrap();
        let mut pinned = Vec::new();
        for _ in 0..11 {
            pc.allocate(&init_data_page()).unwrap();
        }
        for pgno in 1..=10 {
            pinned.push(pc.fetch(pgno).unwrap());
        }
        match pc.fetch(11) {
            Err(Error::Storage(StorageError::CacheFull)) => {}
            other => panic!("expected CacheFull, got {:?}", other.err()),
        }
        pc.release(&pinned[0]).unwrap();
        assert!(pc.fetch(11).is_ok());
    }
}

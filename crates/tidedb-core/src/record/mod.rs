//! Record layer: variable-length records addressed by uid, with every
//! mutation logged before it can reach disk.

pub mod item;

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info};

use crate::cache::{CacheLoader, ResourceCache};
use crate::error::{Result, StorageError};
use crate::storage::freelist::FreeSpaceIndex;
use crate::storage::header;
use crate::storage::page::{self, DATA_OFFSET, MAX_FREE_SPACE, Page, init_data_page};
use crate::storage::page_cache::PageCache;
use crate::txn::TransactionManager;
use crate::types::{PageNo, Uid, Xid, address_to_uid, uid_to_address};
use crate::wal::{LogRecord, RecoveryStats, WriteAheadLog, recover};

pub use item::{DataItem, RecordGuard};

/// Attempts at finding (or making) a page with room before giving up.
const INSERT_RETRIES: usize = 5;

/// Pins the owning page while a record is cached.
pub struct RecordLoader {
    pages: Arc<PageCache>,
    wal: Arc<WriteAheadLog>,
}

impl CacheLoader for RecordLoader {
    type Resource = DataItem;

    fn load(&self, uid: u64) -> Result<Option<DataItem>> {
        let (pgno, offset) = uid_to_address(uid);
        if pgno < 2 || pgno > self.pages.page_count() || (offset as usize) < DATA_OFFSET {
            return Ok(None);
        }
        let pg = self.pages.fetch(pgno)?;
        if offset >= page::free_space_offset(&pg.lock()) {
            self.pages.release(&pg)?;
            return Ok(None);
        }
        match DataItem::parse(uid, Arc::clone(&pg), offset as usize, Arc::clone(&self.wal)) {
            Ok(item) => Ok(Some(item)),
            Err(e) => {
                self.pages.release(&pg)?;
                Err(e)
            }
        }
    }

    fn evict(&self, item: &DataItem) -> Result<()> {
        self.pages.release(item.page())
    }
}

/// Inserts, reads and pins records on top of the page cache.
///
/// Page 1 stays pinned from open to close so the shutdown marker can be
/// written at the end.
pub struct RecordStore {
    cache: ResourceCache<RecordLoader>,
    pages: Arc<PageCache>,
    wal: Arc<WriteAheadLog>,
    free: FreeSpaceIndex,
    page_one: Mutex<Option<Arc<Page>>>,
}

impl RecordStore {
    /// Set up a brand-new database: page 1 is allocated and written out.
    pub fn create(pages: Arc<PageCache>, wal: Arc<WriteAheadLog>) -> Result<Self> {
        let pgno = pages.allocate(&header::init_page_one())?;
        let page_one = pages.fetch(pgno)?;
        pages.flush(&page_one)?;
        info!("record store created");
        Ok(Self::new(pages, wal, page_one))
    }

    /// Open an existing database, running recovery first if the previous
    /// process did not close it.
    pub fn open(
        pages: Arc<PageCache>,
        wal: Arc<WriteAheadLog>,
        tm: &TransactionManager,
    ) -> Result<(Self, Option<RecoveryStats>)> {
        let page_one = pages.fetch(1)?;
        let stats = if header::was_closed_cleanly(&page_one) {
            None
        } else {
            info!("unclean shutdown detected");
            Some(recover(tm, &wal, &pages)?)
        };

        let store = Self::new(pages, wal, Arc::clone(&page_one));
        store.fill_free_space()?;

        header::set_open(&page_one);
        store.pages.flush(&page_one)?;
        info!(
            pages = store.pages.page_count(),
            indexed = store.free.len(),
            "record store opened"
        );
        Ok((store, stats))
    }

    fn new(pages: Arc<PageCache>, wal: Arc<WriteAheadLog>, page_one: Arc<Page>) -> Self {
        let loader = RecordLoader {
            pages: Arc::clone(&pages),
            wal: Arc::clone(&wal),
        };
        Self {
            cache: ResourceCache::new(loader, 0),
            pages,
            wal,
            free: FreeSpaceIndex::new(),
            page_one: Mutex::new(Some(page_one)),
        }
    }

    fn fill_free_space(&self) -> Result<()> {
        for pgno in 2..=self.pages.page_count() {
            let pg = self.pages.fetch(pgno)?;
            self.free.add(pgno, page::free_space(&pg));
            self.pages.release(&pg)?;
        }
        Ok(())
    }

    /// Store `payload` as a new record under `xid` and return its uid.
    ///
    /// The insert is logged before the page is touched.
    pub fn insert(&self, xid: Xid, payload: &[u8]) -> Result<Uid> {
        let raw = item::wrap_raw(payload);
        if raw.len() > MAX_FREE_SPACE {
            return Err(StorageError::DataTooLarge {
                max: MAX_FREE_SPACE,
                actual: raw.len(),
            }
            .into());
        }

        let mut selected = None;
        for _ in 0..INSERT_RETRIES {
            if let Some(info) = self.free.select(raw.len()) {
                selected = Some(info.pgno);
                break;
            }
            let pgno = self.pages.allocate(&init_data_page())?;
            self.free.add(pgno, MAX_FREE_SPACE);
        }
        let pgno = selected.ok_or(StorageError::DatabaseBusy)?;

        let pg = match self.pages.fetch(pgno) {
            Ok(pg) => pg,
            Err(e) => {
                self.free.add(pgno, 0);
                return Err(e);
            }
        };
        let inserted = self.write_insert(xid, &pg, &raw);
        self.free.add(pgno, page::free_space(&pg));
        self.pages.release(&pg)?;

        let offset = inserted?;
        debug!(xid, pgno, offset, len = raw.len(), "record inserted");
        Ok(address_to_uid(pgno, offset))
    }

    fn write_insert(&self, xid: Xid, pg: &Page, raw: &[u8]) -> Result<u16> {
        let offset = page::free_space_offset(&pg.lock());
        let free = page::free_space(pg);
        if free < raw.len() {
            return Err(StorageError::CorruptedPage(format!(
                "page {} has {free} free bytes, record needs {}",
                pg.pgno(),
                raw.len()
            ))
            .into());
        }
        let record = LogRecord::Insert {
            xid,
            pgno: pg.pgno(),
            offset,
            raw: raw.to_vec(),
        };
        self.wal.append(&record.encode())?;
        Ok(page::insert(pg, raw)?)
    }

    /// Pin the live record at `uid`. Tombstoned and nonexistent records are
    /// `None`. A returned record must be given back with
    /// [`release`](Self::release).
    pub fn read(&self, uid: Uid) -> Result<Option<Arc<DataItem>>> {
        let Some(item) = self.cache.acquire(uid)? else {
            return Ok(None);
        };
        if !item.is_valid() {
            self.cache.release(uid)?;
            return Ok(None);
        }
        Ok(Some(item))
    }

    /// Unpin a record returned by [`read`](Self::read).
    pub fn release(&self, item: &DataItem) -> Result<()> {
        self.cache.release(item.uid())
    }

    /// Number of pages in the page file, page 1 included.
    pub fn page_count(&self) -> PageNo {
        self.pages.page_count()
    }

    /// Data pages currently offered for inserts.
    pub fn indexed_pages(&self) -> usize {
        self.free.len()
    }

    /// Drop every cached record, mark the shutdown clean and write every page
    /// back. Calling it again is a no-op.
    pub fn close(&self) -> Result<()> {
        let Some(page_one) = self.page_one.lock().take() else {
            return Ok(());
        };
        self.cache.shutdown()?;
        header::set_closed(&page_one);
        self.pages.release(&page_one)?;
        self.pages.close()?;
        info!("record store closed");
        Ok(())
    }
}

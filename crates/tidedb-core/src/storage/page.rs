use std::ops::Range;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::{Mutex, MutexGuard};

use crate::error::StorageError;
use crate::types::{PAGE_SIZE, PageNo};

/// Byte range of the free-space offset header on data pages.
const FSO_OFFSET: usize = 0;

/// First byte available for records on a data page.
pub const DATA_OFFSET: usize = 2;

/// Largest record a single data page can hold.
pub const MAX_FREE_SPACE: usize = PAGE_SIZE - DATA_OFFSET;

/// Raw page bytes.
pub type PageBuf = Box<[u8; PAGE_SIZE]>;

/// A cached page.
///
/// The buffer sits behind a mutex that is the page's exclusive mutation lock;
/// holders should keep it only for the duration of a copy in or out. The
/// dirty flag tells the page cache whether eviction must write the page back.
pub struct Page {
    pgno: PageNo,
    buf: Mutex<PageBuf>,
    dirty: AtomicBool,
}

impl Page {
    /// Wrap a buffer read from disk (clean).
    pub fn new(pgno: PageNo, buf: PageBuf) -> Self {
        Self {
            pgno,
            buf: Mutex::new(buf),
            dirty: AtomicBool::new(false),
        }
    }

    pub fn pgno(&self) -> PageNo {
        self.pgno
    }

    /// Lock the page buffer for reading or mutation.
    pub fn lock(&self) -> MutexGuard<'_, PageBuf> {
        self.buf.lock()
    }

    /// Copy the current page contents.
    pub fn snapshot(&self) -> PageBuf {
        self.buf.lock().clone()
    }

    /// Mark this page as modified (or clean after a write-back).
    pub fn set_dirty(&self, dirty: bool) {
        self.dirty.store(dirty, Ordering::Release);
    }

    /// Check whether this page has been modified since it was last written.
    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }
}

// ---------------------------------------------------------------------------
// Data page layout
//
// [0..2]  free space offset: u16 big-endian, first unused byte
// [2..]   records, appended back to back
// ---------------------------------------------------------------------------

/// A fresh, empty data page.
pub fn init_data_page() -> PageBuf {
    let mut buf = Box::new([0u8; PAGE_SIZE]);
    set_free_space_offset(&mut buf, DATA_OFFSET as u16);
    buf
}

pub fn free_space_offset(buf: &[u8; PAGE_SIZE]) -> u16 {
    u16::from_be_bytes([buf[FSO_OFFSET], buf[FSO_OFFSET + 1]])
}

fn set_free_space_offset(buf: &mut [u8; PAGE_SIZE], offset: u16) {
    buf[FSO_OFFSET..FSO_OFFSET + 2].copy_from_slice(&offset.to_be_bytes());
}

/// Bytes still free on a data page.
pub fn free_space(page: &Page) -> usize {
    PAGE_SIZE.saturating_sub(free_space_offset(&page.lock()) as usize)
}

/// Byte range `raw` would occupy at `offset`, or `CorruptedPage` if it runs
/// off the page.
fn record_range(pgno: PageNo, offset: u16, len: usize) -> Result<Range<usize>, StorageError> {
    let start = offset as usize;
    if start < DATA_OFFSET || start + len > PAGE_SIZE {
        return Err(StorageError::CorruptedPage(format!(
            "page {pgno}: record of {len} bytes at offset {offset} overruns the page"
        )));
    }
    Ok(start..start + len)
}

/// Append `raw` at the page's free-space offset and return that offset.
///
/// Fails with `CorruptedPage`, leaving the page untouched, if `raw` does not
/// fit.
pub fn insert(page: &Page, raw: &[u8]) -> Result<u16, StorageError> {
    let mut buf = page.lock();
    let offset = free_space_offset(&buf);
    let range = record_range(page.pgno(), offset, raw.len())?;
    page.set_dirty(true);
    let end = range.end as u16;
    buf[range].copy_from_slice(raw);
    set_free_space_offset(&mut buf, end);
    Ok(offset)
}

/// Replay an insert at a fixed offset. The free-space offset only ever moves
/// forward, so replaying the same insert twice is harmless.
pub fn recover_insert(page: &Page, raw: &[u8], offset: u16) -> Result<(), StorageError> {
    let range = record_range(page.pgno(), offset, raw.len())?;
    let mut buf = page.lock();
    page.set_dirty(true);
    let end = range.end as u16;
    buf[range].copy_from_slice(raw);
    if free_space_offset(&buf) < end {
        set_free_space_offset(&mut buf, end);
    }
    Ok(())
}

/// Replay an in-place update at a fixed offset.
pub fn recover_update(page: &Page, raw: &[u8], offset: u16) -> Result<(), StorageError> {
    let range = record_range(page.pgno(), offset, raw.len())?;
    let mut buf = page.lock();
    page.set_dirty(true);
    buf[range].copy_from_slice(raw);
    Ok(())
}

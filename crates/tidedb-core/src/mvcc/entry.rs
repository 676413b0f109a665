//! Version entries.
//!
//! Binary format (the payload of one record):
//! ```text
//! [0..8]   xmin: u64 big-endian, creating transaction
//! [8..16]  xmax: u64 big-endian, deleting transaction, 0 while live
//! [16..]   user data
//! ```
//!
//! Only xmax ever changes after insert, and only through the record's
//! before/after protocol, so every deletion is logged.

use std::sync::Arc;

use crate::cache::CacheLoader;
use crate::error::{Result, StorageError};
use crate::record::{DataItem, RecordStore};
use crate::types::{Uid, Xid};

const OF_XMIN: usize = 0;
const OF_XMAX: usize = 8;
const OF_DATA: usize = 16;

/// Encode a fresh entry created by `xid`.
pub fn wrap_entry(xid: Xid, data: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(OF_DATA + data.len());
    buf.extend_from_slice(&xid.to_be_bytes());
    buf.extend_from_slice(&0u64.to_be_bytes());
    buf.extend_from_slice(data);
    buf
}

/// A version entry backed by a pinned record.
pub struct Entry {
    item: Arc<DataItem>,
}

impl Entry {
    fn new(item: Arc<DataItem>) -> Result<Self> {
        if item.payload_len() < OF_DATA {
            return Err(StorageError::CorruptedPage(format!(
                "record {:#x} is too short for a version entry ({} bytes)",
                item.uid(),
                item.payload_len()
            ))
            .into());
        }
        Ok(Self { item })
    }

    pub fn uid(&self) -> Uid {
        self.item.uid()
    }

    pub fn xmin(&self) -> Xid {
        self.item.with_data(|d| read_xid(&d[OF_XMIN..OF_XMAX]))
    }

    pub fn xmax(&self) -> Xid {
        self.item.with_data(|d| read_xid(&d[OF_XMAX..OF_DATA]))
    }

    /// Copy of the user data.
    pub fn data(&self) -> Vec<u8> {
        self.item.with_data(|d| d[OF_DATA..].to_vec())
    }

    /// Stamp the entry as deleted by `xid`, logging the change under `xid`.
    pub fn set_xmax(&self, xid: Xid) -> Result<()> {
        let mut guard = self.item.before();
        guard.with_payload_mut(|p| p[OF_XMAX..OF_DATA].copy_from_slice(&xid.to_be_bytes()));
        guard.after(xid)
    }
}

fn read_xid(b: &[u8]) -> Xid {
    let mut out = [0u8; 8];
    out.copy_from_slice(b);
    u64::from_be_bytes(out)
}

/// Loads entries through the record layer and unpins the record on eviction.
pub struct EntryLoader {
    store: Arc<RecordStore>,
}

impl EntryLoader {
    pub fn new(store: Arc<RecordStore>) -> Self {
        Self { store }
    }
}

impl CacheLoader for EntryLoader {
    type Resource = Entry;

    fn load(&self, uid: u64) -> Result<Option<Entry>> {
        let Some(item) = self.store.read(uid)? else {
            return Ok(None);
        };
        match Entry::new(Arc::clone(&item)) {
            Ok(entry) => Ok(Some(entry)),
            Err(e) => {
                self.store.release(&item)?;
                Err(e)
            }
        }
    }

    fn evict(&self, entry: &Entry) -> Result<()> {
        self.store.release(&entry.item)
    }
}

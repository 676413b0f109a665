//! A single record inside a data page.
//!
//! Raw layout:
//! ```text
//! [0]     valid flag: 0 = live, anything else = tombstoned
//! [1..3]  payload size: u16 big-endian
//! [3..]   payload
//! ```

use std::sync::Arc;

use parking_lot::{RwLock, RwLockWriteGuard};

use crate::error::{Result, StorageError};
use crate::storage::page::Page;
use crate::types::{PAGE_SIZE, Uid, Xid};
use crate::wal::{LogRecord, WriteAheadLog};

const OF_VALID: usize = 0;
const OF_SIZE: usize = 1;
pub const OF_DATA: usize = 3;

/// Frame `payload` as a live record.
pub fn wrap_raw(payload: &[u8]) -> Vec<u8> {
    let mut raw = Vec::with_capacity(OF_DATA + payload.len());
    raw.push(0);
    raw.extend_from_slice(&(payload.len() as u16).to_be_bytes());
    raw.extend_from_slice(payload);
    raw
}

/// Tombstone a raw record in place.
pub fn mark_invalid(raw: &mut [u8]) {
    raw[OF_VALID] = 1;
}

/// A record pinned in memory together with the page that holds it.
///
/// Reads share the record lock; a mutation holds it exclusively through a
/// [`RecordGuard`] from [`before`](Self::before) until
/// [`after`](RecordGuard::after) or [`rollback`](RecordGuard::rollback).
pub struct DataItem {
    uid: Uid,
    page: Arc<Page>,
    /// Offset of the raw record in the page.
    offset: usize,
    /// Raw length, header included.
    len: usize,
    lock: RwLock<()>,
    wal: Arc<WriteAheadLog>,
}

impl DataItem {
    /// Parse the record at `offset` of `page`.
    pub(crate) fn parse(
        uid: Uid,
        page: Arc<Page>,
        offset: usize,
        wal: Arc<WriteAheadLog>,
    ) -> Result<Self> {
        let len = {
            let buf = page.lock();
            if offset + OF_DATA > PAGE_SIZE {
                return Err(corrupt(uid, offset, 0).into());
            }
            let size = u16::from_be_bytes([buf[offset + OF_SIZE], buf[offset + OF_SIZE + 1]]);
            OF_DATA + size as usize
        };
        if offset + len > PAGE_SIZE {
            return Err(corrupt(uid, offset, len).into());
        }
        Ok(Self {
            uid,
            page,
            offset,
            len,
            lock: RwLock::new(()),
            wal,
        })
    }

    pub fn uid(&self) -> Uid {
        self.uid
    }

    pub(crate) fn page(&self) -> &Arc<Page> {
        &self.page
    }

    pub fn payload_len(&self) -> usize {
        self.len - OF_DATA
    }

    pub fn is_valid(&self) -> bool {
        let _read = self.lock.read();
        self.page.lock()[self.offset + OF_VALID] == 0
    }

    /// Run `f` over the payload under the shared record lock.
    pub fn with_data<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        let _read = self.lock.read();
        let buf = self.page.lock();
        f(&buf[self.offset + OF_DATA..self.offset + self.len])
    }

    /// Copy of the payload.
    pub fn data(&self) -> Vec<u8> {
        self.with_data(|d| d.to_vec())
    }

    fn raw(&self) -> Vec<u8> {
        self.page.lock()[self.offset..self.offset + self.len].to_vec()
    }

    /// Take the write lock and remember the current bytes.
    ///
    /// The returned guard must end in [`after`](RecordGuard::after) once the
    /// change is made; dropping it any other way restores the old bytes.
    pub fn before(&self) -> RecordGuard<'_> {
        let lock = self.lock.write();
        self.page.set_dirty(true);
        let old = self.raw();
        RecordGuard {
            item: self,
            _lock: lock,
            old,
            finished: false,
        }
    }
}

fn corrupt(uid: Uid, offset: usize, len: usize) -> StorageError {
    StorageError::CorruptedPage(format!(
        "record {uid:#x} at offset {offset} (len {len}) overruns its page"
    ))
}

/// An in-progress mutation of a [`DataItem`].
pub struct RecordGuard<'a> {
    item: &'a DataItem,
    _lock: RwLockWriteGuard<'a, ()>,
    old: Vec<u8>,
    finished: bool,
}

impl RecordGuard<'_> {
    /// Mutate the payload in place.
    pub fn with_payload_mut<R>(&mut self, f: impl FnOnce(&mut [u8]) -> R) -> R {
        let item = self.item;
        let mut buf = item.page.lock();
        f(&mut buf[item.offset + OF_DATA..item.offset + item.len])
    }

    /// Log the change under `xid` and release the write lock.
    ///
    /// If the log append fails the old bytes are put back.
    pub fn after(mut self, xid: Xid) -> Result<()> {
        let record = LogRecord::Update {
            xid,
            uid: self.item.uid,
            old: std::mem::take(&mut self.old),
            new: self.item.raw(),
        };
        match self.item.wal.append(&record.encode()) {
            Ok(()) => {
                self.finished = true;
                Ok(())
            }
            Err(e) => {
                if let LogRecord::Update { old, .. } = record {
                    self.old = old;
                }
                Err(e.into())
            }
        }
    }

    /// Put the old bytes back and release the write lock.
    pub fn rollback(self) {}

    fn restore(&mut self) {
        let item = self.item;
        let mut buf = item.page.lock();
        buf[item.offset..item.offset + item.len].copy_from_slice(&self.old);
    }
}

impl Drop for RecordGuard<'_> {
    fn drop(&mut self) {
        if !self.finished {
            self.restore();
        }
    }
}

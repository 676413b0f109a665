//! Crash recovery: redo finished transactions, undo unfinished ones.
//!
//! Runs once at open, before any transaction is admitted, whenever page 1
//! shows the previous process did not close cleanly.

use std::collections::BTreeMap;

use tracing::info;

use crate::error::{Result, StorageError};
use crate::record::item;
use crate::storage::page::{self, Page};
use crate::storage::page_cache::PageCache;
use crate::txn::TransactionManager;
use crate::types::{PageNo, Xid, address_to_uid, uid_to_address};

use super::log::WriteAheadLog;
use super::record::LogRecord;

/// What a recovery run did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryStats {
    /// Page count the page file was truncated to.
    pub page_count: PageNo,
    pub redone: usize,
    pub undone: usize,
    /// Transactions found active and marked aborted, in xid order.
    pub aborted: Vec<Xid>,
}

/// Bring the page file in line with the log.
///
/// 1. Truncate the page file to the highest page any record references.
/// 2. Redo every record of a transaction that is no longer active.
/// 3. Undo, newest first, every record of a transaction still active, then
///    mark it aborted.
///
/// Each undo step is itself logged as an UPDATE under the undone xid, so a
/// crash during or after recovery replays to the same bytes.
pub fn recover(
    tm: &TransactionManager,
    wal: &WriteAheadLog,
    pages: &PageCache,
) -> Result<RecoveryStats> {
    info!("recovery started");
    let mut stats = RecoveryStats::default();

    let mut max_pgno: PageNo = 0;
    wal.rewind();
    while let Some(payload) = wal.next()? {
        max_pgno = max_pgno.max(LogRecord::decode(&payload)?.pgno());
    }
    if max_pgno == 0 {
        max_pgno = 1;
    }
    pages.truncate(max_pgno)?;
    stats.page_count = max_pgno;
    info!(page_count = max_pgno, "recovery truncated page file");

    stats.redone = redo(tm, wal, pages)?;
    info!(records = stats.redone, "redo finished");

    let (undone, aborted) = undo(tm, wal, pages)?;
    stats.undone = undone;
    stats.aborted = aborted;
    info!(
        records = stats.undone,
        transactions = stats.aborted.len(),
        "undo finished"
    );

    Ok(stats)
}

fn redo(tm: &TransactionManager, wal: &WriteAheadLog, pages: &PageCache) -> Result<usize> {
    let mut redone = 0;
    wal.rewind();
    while let Some(payload) = wal.next()? {
        let record = LogRecord::decode(&payload)?;
        if tm.is_active(record.xid())? {
            continue;
        }
        match &record {
            LogRecord::Insert {
                pgno, offset, raw, ..
            } => with_page(pages, *pgno, |pg| page::recover_insert(pg, raw, *offset))?,
            LogRecord::Update { uid, new, .. } => {
                let (pgno, offset) = uid_to_address(*uid);
                with_page(pages, pgno, |pg| page::recover_update(pg, new, offset))?
            }
        }
        redone += 1;
    }
    Ok(redone)
}

fn undo(
    tm: &TransactionManager,
    wal: &WriteAheadLog,
    pages: &PageCache,
) -> Result<(usize, Vec<Xid>)> {
    let mut pending: BTreeMap<Xid, Vec<LogRecord>> = BTreeMap::new();
    wal.rewind();
    while let Some(payload) = wal.next()? {
        let record = LogRecord::decode(&payload)?;
        if tm.is_active(record.xid())? {
            pending.entry(record.xid()).or_default().push(record);
        }
    }

    let mut undone = 0;
    for (&xid, records) in &pending {
        for record in records.iter().rev() {
            let compensation = match record {
                LogRecord::Insert {
                    pgno, offset, raw, ..
                } => {
                    let mut dead = raw.clone();
                    item::mark_invalid(&mut dead);
                    with_page(pages, *pgno, |pg| page::recover_insert(pg, &dead, *offset))?;
                    LogRecord::Update {
                        xid,
                        uid: address_to_uid(*pgno, *offset),
                        old: raw.clone(),
                        new: dead,
                    }
                }
                LogRecord::Update { uid, old, new, .. } => {
                    let (pgno, offset) = uid_to_address(*uid);
                    with_page(pages, pgno, |pg| page::recover_update(pg, old, offset))?;
                    LogRecord::Update {
                        xid,
                        uid: *uid,
                        old: new.clone(),
                        new: old.clone(),
                    }
                }
            };
            wal.append(&compensation.encode())?;
            undone += 1;
        }
        tm.abort(xid)?;
    }
    Ok((undone, pending.into_keys().collect()))
}

fn with_page(
    pages: &PageCache,
    pgno: PageNo,
    f: impl FnOnce(&Page) -> std::result::Result<(), StorageError>,
) -> Result<()> {
    let pg = pages.fetch(pgno)?;
    let applied = f(&pg);
    pages.release(&pg)?;
    Ok(applied?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::page::init_data_page;
    use tempfile::{TempDir, tempdir};

    struct Fixture {
        _dir: TempDir,
        tm: TransactionManager,
        wal: WriteAheadLog,
        pages: PageCache,
    }

    fn fixture() -> Fixture {
        let dir = tempdir().unwrap();
        let tm = TransactionManager::create(&dir.path().join("r.xid")).unwrap();
        let wal = WriteAheadLog::create(&dir.path().join("r.log")).unwrap();
        let pages = PageCache::create(&dir.path().join("r.db"), 16).unwrap();
        pages.allocate(&[0u8; crate::types::PAGE_SIZE]).unwrap();
        pages.allocate(&init_data_page()).unwrap();
        Fixture {
            _dir: dir,
            tm,
            wal,
            pages,
        }
    }

    fn log(wal: &WriteAheadLog, record: LogRecord) {
        wal.append(&record.encode()).unwrap();
    }

    fn bytes_at(pages: &PageCache, pgno: PageNo, offset: usize, len: usize) -> Vec<u8> {
        let pg = pages.fetch(pgno).unwrap();
        let out = pg.lock()[offset..offset + len].to_vec();
        pages.release(&pg).unwrap();
        out
    }

    #[test]
    fn test_redo_committed_insert() {
        let f = fixture();
        let xid = f.tm.begin().unwrap();
        let raw = item::wrap_raw(b"hello");
        log(
            &f.wal,
            LogRecord::Insert {
                xid,
                pgno: 2,
                offset: 2,
                raw: raw.clone(),
            },
        );
        f.tm.commit(xid).unwrap();

        let stats = recover(&f.tm, &f.wal, &f.pages).unwrap();
        assert_eq!(stats.redone, 1);
        assert_eq!(stats.undone, 0);
        assert_eq!(bytes_at(&f.pages, 2, 2, raw.len()), raw);
        let pg = f.pages.fetch(2).unwrap();
        assert_eq!(page::free_space_offset(&pg.lock()) as usize, 2 + raw.len());
        f.pages.release(&pg).unwrap();
    }

    #[test]
    fn test_undo_active_insert_and_update() {
        let f = fixture();
        let committed = f.tm.begin().unwrap();
        let raw = item::wrap_raw(b"AAAA");
        log(
            &f.wal,
            LogRecord::Insert {
                xid: committed,
                pgno: 2,
                offset: 2,
                raw: raw.clone(),
            },
        );
        f.tm.commit(committed).unwrap();

        let active = f.tm.begin().unwrap();
        let mut updated = raw.clone();
        updated[3..].copy_from_slice(b"BBBB");
        log(
            &f.wal,
            LogRecord::Update {
                xid: active,
                uid: address_to_uid(2, 2),
                old: raw.clone(),
                new: updated,
            },
        );
        let second = item::wrap_raw(b"CC");
        log(
            &f.wal,
            LogRecord::Insert {
                xid: active,
                pgno: 2,
                offset: (2 + raw.len()) as u16,
                raw: second.clone(),
            },
        );

        let stats = recover(&f.tm, &f.wal, &f.pages).unwrap();
        assert_eq!(stats.redone, 1);
        assert_eq!(stats.undone, 2);
        assert_eq!(stats.aborted, vec![active]);
        assert!(f.tm.is_aborted(active).unwrap());

        assert_eq!(bytes_at(&f.pages, 2, 2, raw.len()), raw);
        let tail = bytes_at(&f.pages, 2, 2 + raw.len(), second.len());
        assert_ne!(tail[0], 0, "undone insert must be tombstoned");
        assert_eq!(&tail[1..], &second[1..]);
    }

    #[test]
    fn test_truncates_unreferenced_pages() {
        let f = fixture();
        f.pages.allocate(&init_data_page()).unwrap();
        f.pages.allocate(&init_data_page()).unwrap();
        assert_eq!(f.pages.page_count(), 4);

        let xid = f.tm.begin().unwrap();
        log(
            &f.wal,
            LogRecord::Insert {
                xid,
                pgno: 3,
                offset: 2,
                raw: item::wrap_raw(b"x"),
            },
        );
        f.tm.commit(xid).unwrap();

        let stats = recover(&f.tm, &f.wal, &f.pages).unwrap();
        assert_eq!(stats.page_count, 3);
        assert_eq!(f.pages.page_count(), 3);
    }

    #[test]
    fn test_empty_log_keeps_page_one() {
        let f = fixture();
        let stats = recover(&f.tm, &f.wal, &f.pages).unwrap();
        assert_eq!(stats.page_count, 1);
        assert_eq!(f.pages.page_count(), 1);
    }

    #[test]
    fn test_second_recovery_is_stable() {
        let f = fixture();
        let active = f.tm.begin().unwrap();
        let raw = item::wrap_raw(b"gone");
        log(
            &f.wal,
            LogRecord::Insert {
                xid: active,
                pgno: 2,
                offset: 2,
                raw: raw.clone(),
            },
        );

        recover(&f.tm, &f.wal, &f.pages).unwrap();
        let first = bytes_at(&f.pages, 2, 0, 64);

        // The xid is now aborted: the second run only redoes, including the
        // compensation record, and lands on the same bytes.
        let stats = recover(&f.tm, &f.wal, &f.pages).unwrap();
        assert_eq!(stats.undone, 0);
        assert_eq!(stats.redone, 2);
        assert_eq!(bytes_at(&f.pages, 2, 0, 64), first);
    }
}

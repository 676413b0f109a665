//! MVCC visibility rules.
//!
//! Read-committed: an entry is visible if the reader created it and has not
//! deleted it, or if its creator committed and it is either live or deleted by
//! someone else who has not committed.
//!
//! Repeatable-read: as above, but the creator must also have committed before
//! the reader began (lower xid, not in the reader's snapshot), and a deletion
//! by someone else only hides the entry if that deleter committed before the
//! reader began.

use crate::error::Result;
use crate::txn::TransactionManager;
use crate::types::{IsolationLevel, Xid};

use super::transaction::Transaction;

/// Is the version `(xmin, xmax)` visible to `txn`?
pub fn is_visible(tm: &TransactionManager, txn: &Transaction, xmin: Xid, xmax: Xid) -> Result<bool> {
    match txn.level() {
        IsolationLevel::ReadCommitted => read_committed(tm, txn, xmin, xmax),
        IsolationLevel::RepeatableRead => repeatable_read(tm, txn, xmin, xmax),
    }
}

fn read_committed(tm: &TransactionManager, txn: &Transaction, xmin: Xid, xmax: Xid) -> Result<bool> {
    let xid = txn.xid();
    if xmin == xid && xmax == 0 {
        return Ok(true);
    }
    if tm.is_committed(xmin)? {
        if xmax == 0 {
            return Ok(true);
        }
        if xmax != xid && !tm.is_committed(xmax)? {
            return Ok(true);
        }
    }
    Ok(false)
}

fn repeatable_read(
    tm: &TransactionManager,
    txn: &Transaction,
    xmin: Xid,
    xmax: Xid,
) -> Result<bool> {
    let xid = txn.xid();
    if xmin == xid && xmax == 0 {
        return Ok(true);
    }
    if tm.is_committed(xmin)? && xmin < xid && !txn.is_in_snapshot(xmin) {
        if xmax == 0 {
            return Ok(true);
        }
        if xmax != xid
            && (!tm.is_committed(xmax)? || xmax > xid || txn.is_in_snapshot(xmax))
        {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Would deleting a version last stamped with `xmax` skip over a committed
/// change `txn` cannot see? Always `false` under read-committed.
pub fn is_version_skip(tm: &TransactionManager, txn: &Transaction, xmax: Xid) -> Result<bool> {
    if txn.level() == IsolationLevel::ReadCommitted {
        return Ok(false);
    }
    Ok(tm.is_committed(xmax)? && (xmax > txn.xid() || txn.is_in_snapshot(xmax)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SUPER_XID;
    use tempfile::{TempDir, tempdir};

    /// Xids 1..=n; `committed` and `aborted` get their final status, the rest
    /// stay active.
    fn tm_with(n: Xid, committed: &[Xid], aborted: &[Xid]) -> (TempDir, TransactionManager) {
        let dir = tempdir().unwrap();
        let tm = TransactionManager::create(&dir.path().join("v.xid")).unwrap();
        for _ in 0..n {
            tm.begin().unwrap();
        }
        for &x in committed {
            tm.commit(x).unwrap();
        }
        for &x in aborted {
            tm.abort(x).unwrap();
        }
        (dir, tm)
    }

    fn rc(xid: Xid) -> Transaction {
        Transaction::new(xid, IsolationLevel::ReadCommitted, std::iter::empty())
    }

    fn rr(xid: Xid, active: &[Xid]) -> Transaction {
        Transaction::new(xid, IsolationLevel::RepeatableRead, active.iter().copied())
    }

    #[test]
    fn test_own_insert_visible_until_own_delete() {
        let (_dir, tm) = tm_with(3, &[], &[]);
        for txn in [rc(2), rr(2, &[1])] {
            assert!(is_visible(&tm, &txn, 2, 0).unwrap());
            assert!(!is_visible(&tm, &txn, 2, 2).unwrap());
        }
    }

    #[test]
    fn test_read_committed() {
        // 1 committed, 2 active, 3 aborted, 4 is the reader.
        let (_dir, tm) = tm_with(4, &[1], &[3]);
        let txn = rc(4);
        assert!(is_visible(&tm, &txn, 1, 0).unwrap());
        assert!(is_visible(&tm, &txn, SUPER_XID, 0).unwrap());
        assert!(!is_visible(&tm, &txn, 2, 0).unwrap());
        assert!(!is_visible(&tm, &txn, 3, 0).unwrap());
        // Deleted by an uncommitted or aborted transaction: still visible.
        assert!(is_visible(&tm, &txn, 1, 2).unwrap());
        assert!(is_visible(&tm, &txn, 1, 3).unwrap());
        // Deleted by the reader itself, or by a committed transaction.
        assert!(!is_visible(&tm, &txn, 1, 4).unwrap());
        assert!(!is_visible(&tm, &txn, 1, 1).unwrap());
    }

    #[test]
    fn test_repeatable_read_ignores_later_commits() {
        // Reader 3 began while 2 was active; 2 and 4 committed since.
        let (_dir, tm) = tm_with(4, &[1, 2, 4], &[]);
        let txn = rr(3, &[SUPER_XID, 2]);

        assert!(is_visible(&tm, &txn, 1, 0).unwrap());
        assert!(is_visible(&tm, &txn, SUPER_XID, 0).unwrap());
        // Creator was in the snapshot, or began after the reader.
        assert!(!is_visible(&tm, &txn, 2, 0).unwrap());
        assert!(!is_visible(&tm, &txn, 4, 0).unwrap());
        // Deletions the reader cannot see yet.
        assert!(is_visible(&tm, &txn, 1, 2).unwrap());
        assert!(is_visible(&tm, &txn, 1, 4).unwrap());
    }

    #[test]
    fn test_repeatable_read_sees_earlier_delete() {
        let (_dir, tm) = tm_with(3, &[1, 2], &[]);
        let txn = rr(3, &[SUPER_XID]);
        assert!(!is_visible(&tm, &txn, 1, 2).unwrap());
    }

    #[test]
    fn test_version_skip() {
        let (_dir, tm) = tm_with(5, &[2, 4], &[]);
        let rr_txn = rr(3, &[2]);
        // Committed in the snapshot, or committed after the reader began.
        assert!(is_version_skip(&tm, &rr_txn, 2).unwrap());
        assert!(is_version_skip(&tm, &rr_txn, 4).unwrap());
        // Still active, or never deleted.
        assert!(!is_version_skip(&tm, &rr_txn, 5).unwrap());
        assert!(!is_version_skip(&tm, &rr_txn, 1).unwrap());

        assert!(!is_version_skip(&tm, &rc(3), 4).unwrap());
    }
}

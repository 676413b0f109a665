use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::cache::ResourceCache;
use crate::error::{Result, TxnError};
use crate::record::RecordStore;
use crate::txn::TransactionManager;
use crate::types::{IsolationLevel, SUPER_XID, Uid, Xid};

use super::entry::{Entry, EntryLoader, wrap_entry};
use super::lock_table::{LockTable, WaitOutcome};
use super::transaction::Transaction;
use super::visibility;

/// Multi-version records with two isolation levels.
///
/// Every transaction started here lives in the active table until
/// [`commit`](Self::commit) or [`abort`](Self::abort). The super transaction
/// (xid 0) is always present, read-committed, and never finishes.
pub struct VersionManager {
    tm: Arc<TransactionManager>,
    store: Arc<RecordStore>,
    entries: ResourceCache<EntryLoader>,
    locks: LockTable,
    active: Mutex<HashMap<Xid, Arc<Transaction>>>,
}

impl VersionManager {
    /// Build the version manager and take over timeout aborts from `tm`.
    pub fn new(tm: Arc<TransactionManager>, store: Arc<RecordStore>) -> Arc<Self> {
        let mut active = HashMap::new();
        active.insert(
            SUPER_XID,
            Arc::new(Transaction::new(
                SUPER_XID,
                IsolationLevel::ReadCommitted,
                std::iter::empty(),
            )),
        );
        let vm = Arc::new(Self {
            tm: Arc::clone(&tm),
            entries: ResourceCache::new(EntryLoader::new(Arc::clone(&store)), 0),
            store,
            locks: LockTable::new(),
            active: Mutex::new(active),
        });

        let weak = Arc::downgrade(&vm);
        tm.set_timeout_hook(Arc::new(move |xid| {
            if let Some(vm) = weak.upgrade() {
                vm.time_out(xid);
            }
        }));
        vm
    }

    pub fn begin(&self, level: IsolationLevel) -> Result<Xid> {
        let mut active = self.active.lock();
        let xid = self.tm.begin()?;
        let txn = Transaction::new(xid, level, active.keys().copied());
        active.insert(xid, Arc::new(txn));
        debug!(xid, ?level, "transaction begun");
        Ok(xid)
    }

    fn transaction(&self, xid: Xid) -> Result<Arc<Transaction>> {
        self.active
            .lock()
            .get(&xid)
            .cloned()
            .ok_or_else(|| TxnError::UnknownTransaction(xid).into())
    }

    /// The data of `uid` as `xid` sees it, or `None` if there is no version
    /// visible to `xid`.
    pub fn read(&self, xid: Xid, uid: Uid) -> Result<Option<Vec<u8>>> {
        let txn = self.transaction(xid)?;
        txn.check()?;
        let Some(entry) = self.entries.acquire(uid)? else {
            return Ok(None);
        };
        let data = visibility::is_visible(&self.tm, &txn, entry.xmin(), entry.xmax())
            .map(|visible| visible.then(|| entry.data()));
        self.entries.release(uid)?;
        data
    }

    /// Store `data` as a new version created by `xid`.
    pub fn insert(&self, xid: Xid, data: &[u8]) -> Result<Uid> {
        let txn = self.transaction(xid)?;
        txn.check()?;
        self.store.insert(xid, &wrap_entry(xid, data))
    }

    /// Mark `uid` deleted by `xid`.
    ///
    /// Returns `false` if `xid` cannot see the version or already deleted it.
    /// Blocks while another transaction holds the version's lock. A deadlock
    /// or (under repeatable-read) a conflicting committed deletion aborts
    /// `xid` and is returned as an error.
    ///
    /// Deletes under the super transaction return `false` without touching
    /// the version or the lock table: an `xmax` of 0 marks a live version.
    pub fn delete(&self, xid: Xid, uid: Uid) -> Result<bool> {
        let txn = self.transaction(xid)?;
        txn.check()?;
        if xid == SUPER_XID {
            return Ok(false);
        }
        let Some(entry) = self.entries.acquire(uid)? else {
            return Ok(false);
        };
        let deleted = self.delete_entry(&txn, &entry);
        self.entries.release(uid)?;
        deleted
    }

    fn delete_entry(&self, txn: &Transaction, entry: &Entry) -> Result<bool> {
        let xid = txn.xid();
        if !visibility::is_visible(&self.tm, txn, entry.xmin(), entry.xmax())? {
            return Ok(false);
        }

        match self.locks.acquire(xid, entry.uid()) {
            Ok(None) => {}
            Ok(Some(waiter)) => {
                if waiter.wait() == WaitOutcome::Abandoned {
                    let err = txn.error().unwrap_or(TxnError::UnknownTransaction(xid));
                    return Err(err.into());
                }
            }
            Err(err) => {
                self.auto_abort(txn, err.clone())?;
                return Err(err.into());
            }
        }

        let xmax = entry.xmax();
        if xmax == xid {
            return Ok(false);
        }
        if visibility::is_version_skip(&self.tm, txn, xmax)? {
            warn!(xid, uid = entry.uid(), xmax, "concurrent update, aborting");
            self.auto_abort(txn, TxnError::ConcurrentUpdate)?;
            return Err(TxnError::ConcurrentUpdate.into());
        }

        entry.set_xmax(xid)?;
        Ok(true)
    }

    /// Abort `txn` on behalf of the engine. The transaction stays in the
    /// active table, so every later call under its xid returns `err`, until
    /// the caller ends it with [`abort`](Self::abort).
    fn auto_abort(&self, txn: &Transaction, err: TxnError) -> Result<()> {
        if !txn.fail(err) {
            return Ok(());
        }
        self.locks.release(txn.xid());
        self.tm.abort(txn.xid())
    }

    fn time_out(&self, xid: Xid) {
        let Some(txn) = self.active.lock().get(&xid).cloned() else {
            return;
        };
        if let Err(e) = self.auto_abort(&txn, TxnError::TimedOut) {
            warn!(xid, error = %e, "timeout abort failed");
        }
    }

    /// Commit `xid`, or return the failure it captured earlier.
    pub fn commit(&self, xid: Xid) -> Result<()> {
        if xid == SUPER_XID {
            return Ok(());
        }
        let txn = self.transaction(xid)?;
        txn.check()?;
        if !txn.finish() {
            txn.check()?;
            return Err(TxnError::UnknownTransaction(xid).into());
        }
        self.active.lock().remove(&xid);
        let committed = self.tm.commit(xid);
        self.locks.release(xid);
        debug!(xid, "transaction committed");
        committed
    }

    /// Abort `xid` and forget it. Aborting a transaction the engine already
    /// aborted only removes it from the active table.
    pub fn abort(&self, xid: Xid) -> Result<()> {
        if xid == SUPER_XID {
            return Ok(());
        }
        let txn = self
            .active
            .lock()
            .remove(&xid)
            .ok_or(TxnError::UnknownTransaction(xid))?;
        if !txn.finish() {
            return Ok(());
        }
        self.locks.release(xid);
        self.tm.abort(xid)?;
        debug!(xid, "transaction aborted");
        Ok(())
    }

    /// Transactions currently in the active table, the super transaction
    /// included.
    pub fn active_count(&self) -> usize {
        self.active.lock().len()
    }

    /// Unpin every cached entry.
    pub fn close(&self) -> Result<()> {
        self.entries.shutdown()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::storage::page_cache::PageCache;
    use crate::wal::WriteAheadLog;
    use std::thread;
    use std::time::Duration;
    use tempfile::{TempDir, tempdir};

    fn setup() -> (TempDir, Arc<VersionManager>) {
        let dir = tempdir().unwrap();
        let p = dir.path();
        let tm = Arc::new(TransactionManager::create(&p.join("m.xid")).unwrap());
        let wal = Arc::new(WriteAheadLog::create(&p.join("m.log")).unwrap());
        let pages = Arc::new(PageCache::create(&p.join("m.db"), 32).unwrap());
        let store = Arc::new(RecordStore::create(pages, wal).unwrap());
        (dir, VersionManager::new(tm, store))
    }

    /// Spin until `n` transactions are queued on the lock table.
    fn wait_for_blocked(vm: &VersionManager, n: usize) {
        for _ in 0..1000 {
            if vm.locks.waiting() == n {
                return;
            }
            thread::sleep(Duration::from_millis(2));
        }
        panic!("expected {n} blocked transactions");
    }

    fn txn_err(result: Result<impl std::fmt::Debug>) -> TxnError {
        match result {
            Err(Error::Transaction(e)) => e,
            other => panic!("expected a transaction error, got {other:?}"),
        }
    }

    #[test]
    fn test_uncommitted_insert_hidden_until_commit() {
        let (_dir, vm) = setup();
        let t1 = vm.begin(IsolationLevel::ReadCommitted).unwrap();
        let uid = vm.insert(t1, b"A").unwrap();
        assert_eq!(vm.read(t1, uid).unwrap(), Some(b"A".to_vec()));

        let t2 = vm.begin(IsolationLevel::ReadCommitted).unwrap();
        assert_eq!(vm.read(t2, uid).unwrap(), None);
        vm.commit(t1).unwrap();
        assert_eq!(vm.read(t2, uid).unwrap(), Some(b"A".to_vec()));
    }

    #[test]
    fn test_aborted_insert_never_visible() {
        let (_dir, vm) = setup();
        let t1 = vm.begin(IsolationLevel::RepeatableRead).unwrap();
        let uid = vm.insert(t1, b"B").unwrap();
        vm.abort(t1).unwrap();

        let t2 = vm.begin(IsolationLevel::ReadCommitted).unwrap();
        assert_eq!(vm.read(t2, uid).unwrap(), None);
        assert_eq!(vm.read(SUPER_XID, uid).unwrap(), None);
    }

    #[test]
    fn test_delete_and_own_delete() {
        let (_dir, vm) = setup();
        let uid = vm.insert(SUPER_XID, b"row").unwrap();
        let t1 = vm.begin(IsolationLevel::ReadCommitted).unwrap();
        assert!(vm.delete(t1, uid).unwrap());
        assert!(!vm.delete(t1, uid).unwrap());
        assert_eq!(vm.read(t1, uid).unwrap(), None);

        let t2 = vm.begin(IsolationLevel::ReadCommitted).unwrap();
        assert_eq!(vm.read(t2, uid).unwrap(), Some(b"row".to_vec()));
        vm.commit(t1).unwrap();
        assert_eq!(vm.read(t2, uid).unwrap(), None);
        assert!(!vm.delete(t2, uid).unwrap());
    }

    #[test]
    fn test_repeatable_read_snapshot() {
        let (_dir, vm) = setup();
        let t1 = vm.begin(IsolationLevel::ReadCommitted).unwrap();
        let uid = vm.insert(t1, b"late").unwrap();
        let t2 = vm.begin(IsolationLevel::RepeatableRead).unwrap();
        vm.commit(t1).unwrap();
        assert_eq!(vm.read(t2, uid).unwrap(), None);

        let t3 = vm.begin(IsolationLevel::RepeatableRead).unwrap();
        assert_eq!(vm.read(t3, uid).unwrap(), Some(b"late".to_vec()));
    }

    #[test]
    fn test_repeatable_read_write_conflict() {
        let (_dir, vm) = setup();
        let uid = vm.insert(SUPER_XID, b"x").unwrap();
        let t1 = vm.begin(IsolationLevel::RepeatableRead).unwrap();
        let t2 = vm.begin(IsolationLevel::RepeatableRead).unwrap();
        assert!(vm.delete(t1, uid).unwrap());

        let vm2 = Arc::clone(&vm);
        let blocked = thread::spawn(move || vm2.delete(t2, uid));
        wait_for_blocked(&vm, 1);
        vm.commit(t1).unwrap();

        assert_eq!(txn_err(blocked.join().unwrap()), TxnError::ConcurrentUpdate);
        // Sticky until the caller ends it.
        assert_eq!(txn_err(vm.read(t2, uid)), TxnError::ConcurrentUpdate);
        assert_eq!(txn_err(vm.commit(t2)), TxnError::ConcurrentUpdate);
        vm.abort(t2).unwrap();
        assert_eq!(
            txn_err(vm.read(t2, uid)),
            TxnError::UnknownTransaction(t2)
        );
    }

    #[test]
    fn test_read_committed_has_no_write_conflict() {
        let (_dir, vm) = setup();
        let uid = vm.insert(SUPER_XID, b"x").unwrap();
        let t1 = vm.begin(IsolationLevel::ReadCommitted).unwrap();
        let t2 = vm.begin(IsolationLevel::ReadCommitted).unwrap();
        assert!(vm.delete(t1, uid).unwrap());

        let vm2 = Arc::clone(&vm);
        let blocked = thread::spawn(move || vm2.delete(t2, uid));
        wait_for_blocked(&vm, 1);
        vm.commit(t1).unwrap();

        // The second deleter proceeds once the lock is handed over.
        assert!(blocked.join().unwrap().unwrap());
        vm.commit(t2).unwrap();
    }

    #[test]
    fn test_deadlock_aborts_requester() {
        let (_dir, vm) = setup();
        let a = vm.insert(SUPER_XID, b"a").unwrap();
        let b = vm.insert(SUPER_XID, b"b").unwrap();
        let t1 = vm.begin(IsolationLevel::ReadCommitted).unwrap();
        let t2 = vm.begin(IsolationLevel::ReadCommitted).unwrap();
        assert!(vm.delete(t1, a).unwrap());
        assert!(vm.delete(t2, b).unwrap());

        let vm1 = Arc::clone(&vm);
        let waiting = thread::spawn(move || vm1.delete(t1, b));
        wait_for_blocked(&vm, 1);

        assert_eq!(txn_err(vm.delete(t2, a)), TxnError::Deadlock);
        // t2's locks went with it, so t1 gets `b`.
        assert!(waiting.join().unwrap().unwrap());
        vm.abort(t2).unwrap();
        vm.commit(t1).unwrap();

        let t3 = vm.begin(IsolationLevel::ReadCommitted).unwrap();
        assert_eq!(vm.read(t3, a).unwrap(), None);
        assert_eq!(vm.read(t3, b).unwrap(), None);
    }

    #[test]
    fn test_timeout_wakes_blocked_delete() {
        let (_dir, vm) = setup();
        let uid = vm.insert(SUPER_XID, b"x").unwrap();
        let t1 = vm.begin(IsolationLevel::ReadCommitted).unwrap();
        let t2 = vm.begin(IsolationLevel::ReadCommitted).unwrap();
        assert!(vm.delete(t1, uid).unwrap());

        let vm2 = Arc::clone(&vm);
        let blocked = thread::spawn(move || vm2.delete(t2, uid));
        wait_for_blocked(&vm, 1);

        vm.time_out(t2);
        assert_eq!(txn_err(blocked.join().unwrap()), TxnError::TimedOut);
        assert!(vm.tm.is_aborted(t2).unwrap());
        vm.abort(t2).unwrap();
        vm.commit(t1).unwrap();
    }

    #[test]
    fn test_unknown_transaction() {
        let (_dir, vm) = setup();
        assert_eq!(txn_err(vm.insert(42, b"x")), TxnError::UnknownTransaction(42));
        assert_eq!(txn_err(vm.abort(42)), TxnError::UnknownTransaction(42));
    }

    #[test]
    fn test_super_transaction_is_permanent() {
        let (_dir, vm) = setup();
        assert_eq!(vm.active_count(), 1);
        vm.commit(SUPER_XID).unwrap();
        vm.abort(SUPER_XID).unwrap();
        assert_eq!(vm.active_count(), 1);

        let uid = vm.insert(SUPER_XID, b"root").unwrap();
        let t = vm.begin(IsolationLevel::RepeatableRead).unwrap();
        assert_eq!(vm.read(t, uid).unwrap(), Some(b"root".to_vec()));
    }

    #[test]
    fn test_super_transaction_cannot_delete() {
        let (_dir, vm) = setup();
        let a = vm.insert(SUPER_XID, b"a").unwrap();
        let b = vm.insert(SUPER_XID, b"b").unwrap();
        assert!(!vm.delete(SUPER_XID, a).unwrap());

        let t1 = vm.begin(IsolationLevel::ReadCommitted).unwrap();
        let t2 = vm.begin(IsolationLevel::ReadCommitted).unwrap();
        assert!(vm.delete(t1, a).unwrap());
        assert!(vm.delete(t2, b).unwrap());

        // Versions whose deleters are still running stay untouched and
        // their locks stay with the deleters.
        assert!(!vm.delete(SUPER_XID, a).unwrap());
        assert!(!vm.delete(SUPER_XID, b).unwrap());
        assert_eq!(vm.locks.holder(a), Some(t1));
        assert_eq!(vm.locks.holder(b), Some(t2));
        assert_eq!(vm.locks.waiting(), 0);

        vm.commit(t1).unwrap();
        vm.commit(t2).unwrap();
        assert!(!vm.delete(SUPER_XID, a).unwrap());

        let reader = vm.begin(IsolationLevel::ReadCommitted).unwrap();
        assert_eq!(vm.read(reader, a).unwrap(), None);
        assert_eq!(vm.read(reader, b).unwrap(), None);
    }
}

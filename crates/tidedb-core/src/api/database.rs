use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::info;

use crate::config::EngineConfig;
use crate::error::{Error, StorageError};
use crate::mvcc::VersionManager;
use crate::record::RecordStore;
use crate::storage::lock::FileLock;
use crate::storage::page_cache::PageCache;
use crate::txn::TransactionManager;
use crate::types::{IsolationLevel, Uid, Xid};
use crate::wal::{RecoveryStats, WriteAheadLog};

/// The four files backing a database named `base`.
struct DatabaseFiles {
    xid: PathBuf,
    log: PathBuf,
    db: PathBuf,
    lock: PathBuf,
}

impl DatabaseFiles {
    fn new(base: &Path) -> Self {
        Self {
            xid: with_suffix(base, ".xid"),
            log: with_suffix(base, ".log"),
            db: with_suffix(base, ".db"),
            lock: with_suffix(base, ".lock"),
        }
    }

    fn data_files(&self) -> [&Path; 3] {
        [&self.xid, &self.log, &self.db]
    }
}

fn with_suffix(base: &Path, suffix: &str) -> PathBuf {
    let mut name = OsString::from(base.as_os_str());
    name.push(suffix);
    PathBuf::from(name)
}

struct DatabaseInner {
    vm: Arc<VersionManager>,
    store: Arc<RecordStore>,
    tm: Arc<TransactionManager>,
    recovery: Option<RecoveryStats>,
    closed: AtomicBool,
    _file_lock: FileLock,
    base: PathBuf,
}

/// The main database handle.
///
/// `Database` is cheaply clonable (`Arc`-based) and `Send + Sync`. Call
/// [`close`](Self::close) to shut down cleanly; dropping the last handle
/// without closing leaves the files as a crash would, and the next
/// [`open`](Self::open) recovers them.
#[derive(Clone)]
pub struct Database {
    inner: Arc<DatabaseInner>,
}

impl Database {
    /// Create a new database at `<base>.xid`, `<base>.log` and `<base>.db`.
    pub fn create(base: impl AsRef<Path>, config: EngineConfig) -> Result<Self, Error> {
        let base = base.as_ref();
        let capacity = config.page_capacity()?;
        let files = DatabaseFiles::new(base);

        let file_lock = FileLock::acquire(&files.lock)?;
        if let Some(existing) = files.data_files().into_iter().find(|p| p.exists()) {
            return Err(StorageError::FileExists(existing.display().to_string()).into());
        }

        let tm = Arc::new(TransactionManager::create(&files.xid)?);
        let wal = Arc::new(WriteAheadLog::create(&files.log)?);
        let pages = Arc::new(PageCache::create(&files.db, capacity)?);
        let store = Arc::new(RecordStore::create(pages, wal)?);

        info!(base = %base.display(), capacity, "database created");
        Self::start(base, config, tm, store, None, file_lock)
    }

    /// Open an existing database, recovering it first if it was not closed.
    pub fn open(base: impl AsRef<Path>, config: EngineConfig) -> Result<Self, Error> {
        let base = base.as_ref();
        let capacity = config.page_capacity()?;
        let files = DatabaseFiles::new(base);

        let file_lock = FileLock::acquire(&files.lock)?;
        if let Some(missing) = files.data_files().into_iter().find(|p| !p.exists()) {
            return Err(StorageError::FileMissing(missing.display().to_string()).into());
        }

        let tm = Arc::new(TransactionManager::open(&files.xid)?);
        let wal = Arc::new(WriteAheadLog::open(&files.log)?);
        let pages = Arc::new(PageCache::open(&files.db, capacity)?);
        let (store, recovery) = RecordStore::open(pages, wal, &tm)?;

        info!(
            base = %base.display(),
            capacity,
            recovered = recovery.is_some(),
            "database opened"
        );
        Self::start(base, config, tm, Arc::new(store), recovery, file_lock)
    }

    fn start(
        base: &Path,
        config: EngineConfig,
        tm: Arc<TransactionManager>,
        store: Arc<RecordStore>,
        recovery: Option<RecoveryStats>,
        file_lock: FileLock,
    ) -> Result<Self, Error> {
        let vm = VersionManager::new(Arc::clone(&tm), Arc::clone(&store));
        if let Some(timeout) = config.txn_timeout() {
            tm.start_sweeper(timeout, config.sweep_interval())?;
        }
        Ok(Self {
            inner: Arc::new(DatabaseInner {
                vm,
                store,
                tm,
                recovery,
                closed: AtomicBool::new(false),
                _file_lock: file_lock,
                base: base.to_path_buf(),
            }),
        })
    }

    fn check_open(&self) -> Result<(), Error> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(StorageError::Closed.into());
        }
        Ok(())
    }

    /// Start a transaction at `level`.
    pub fn begin(&self, level: IsolationLevel) -> Result<Xid, Error> {
        self.check_open()?;
        self.inner.vm.begin(level)
    }

    pub fn commit(&self, xid: Xid) -> Result<(), Error> {
        self.check_open()?;
        self.inner.vm.commit(xid)
    }

    pub fn abort(&self, xid: Xid) -> Result<(), Error> {
        self.check_open()?;
        self.inner.vm.abort(xid)
    }

    /// Insert `data` under `xid`. Returns the new record's uid.
    pub fn insert(&self, xid: Xid, data: &[u8]) -> Result<Uid, Error> {
        self.check_open()?;
        self.inner.vm.insert(xid, data)
    }

    /// Read `uid` as `xid` sees it.
    pub fn read(&self, xid: Xid, uid: Uid) -> Result<Option<Vec<u8>>, Error> {
        self.check_open()?;
        self.inner.vm.read(xid, uid)
    }

    /// Delete `uid` under `xid`. Returns `false` if there was nothing
    /// visible to delete.
    pub fn delete(&self, xid: Xid, uid: Uid) -> Result<bool, Error> {
        self.check_open()?;
        self.inner.vm.delete(xid, uid)
    }

    /// The record layer underneath the version manager, for structures that
    /// manage their own records (index nodes, schema roots).
    pub fn records(&self) -> &RecordStore {
        &self.inner.store
    }

    /// What recovery did when this handle was opened, if it ran.
    pub fn recovery(&self) -> Option<&RecoveryStats> {
        self.inner.recovery.as_ref()
    }

    /// Base path the database files are named after.
    pub fn path(&self) -> &Path {
        &self.inner.base
    }

    /// Shut down cleanly: stop the timeout sweeper, unpin every record, mark
    /// page 1 clean and write every page back. Later calls are no-ops.
    pub fn close(&self) -> Result<(), Error> {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.inner.tm.close();
        self.inner.vm.close()?;
        self.inner.store.close()?;
        info!(base = %self.inner.base.display(), "database closed");
        Ok(())
    }
}

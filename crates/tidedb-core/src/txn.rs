//! Persistent transaction status table (the `.xid` file).
//!
//! Layout:
//! ```text
//! [0..8]        xid counter: u64 big-endian, the last xid handed out
//! [8 + xid - 1] status byte of `xid`: 0 = active, 1 = committed, 2 = aborted
//! ```
//!
//! Xid 0 is the reserved super transaction. It has no status byte and is
//! always reported committed.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, info, warn};

use crate::error::{Result, StorageError, TxnError};
use crate::types::{SUPER_XID, Xid};

const HEADER_LEN: u64 = 8;

const ACTIVE: u8 = 0;
const COMMITTED: u8 = 1;
const ABORTED: u8 = 2;

/// Called by the sweeper for each transaction that exceeded its timeout.
pub type TimeoutHook = Arc<dyn Fn(Xid) + Send + Sync>;

struct TmState {
    counter: Xid,
    /// Begin time of every transaction still active in this process.
    started: HashMap<Xid, Instant>,
}

pub struct TransactionManager {
    file: File,
    state: Mutex<TmState>,
    hook: Mutex<Option<TimeoutHook>>,
    sweeper: Mutex<Option<Sweeper>>,
}

impl TransactionManager {
    /// Create an empty status table. Fails if the file exists.
    pub fn create(path: &Path) -> Result<Self> {
        if path.exists() {
            return Err(StorageError::FileExists(path.display().to_string()).into());
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)?;
        file.write_all_at(&0u64.to_be_bytes(), 0)?;
        file.sync_data()?;
        Ok(Self::with_file(file, 0))
    }

    /// Open an existing status table.
    ///
    /// The file length must be exactly the header plus one byte per xid up to
    /// the stored counter; anything else is `StorageError::BadXidFile`.
    pub fn open(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(StorageError::FileMissing(path.display().to_string()).into());
        }
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let len = file.metadata()?.len();
        if len < HEADER_LEN {
            return Err(StorageError::BadXidFile(format!("file too short: {len} bytes")).into());
        }
        let mut header = [0u8; 8];
        file.read_exact_at(&mut header, 0)?;
        let counter = u64::from_be_bytes(header);
        if len != HEADER_LEN + counter {
            return Err(StorageError::BadXidFile(format!(
                "counter {counter} does not match file length {len}"
            ))
            .into());
        }
        Ok(Self::with_file(file, counter))
    }

    fn with_file(file: File, counter: Xid) -> Self {
        Self {
            file,
            state: Mutex::new(TmState {
                counter,
                started: HashMap::new(),
            }),
            hook: Mutex::new(None),
            sweeper: Mutex::new(None),
        }
    }

    /// Start a new transaction and return its xid.
    pub fn begin(&self) -> Result<Xid> {
        let mut state = self.state.lock();
        let xid = state.counter + 1;
        self.write_status(xid, ACTIVE)?;
        self.file.write_all_at(&xid.to_be_bytes(), 0)?;
        self.file.sync_data()?;
        state.counter = xid;
        state.started.insert(xid, Instant::now());
        debug!(xid, "transaction started");
        Ok(xid)
    }

    pub fn commit(&self, xid: Xid) -> Result<()> {
        self.finish(xid, COMMITTED)
    }

    pub fn abort(&self, xid: Xid) -> Result<()> {
        self.finish(xid, ABORTED)
    }

    fn finish(&self, xid: Xid, status: u8) -> Result<()> {
        if xid == SUPER_XID {
            return Ok(());
        }
        let mut state = self.state.lock();
        if xid > state.counter {
            return Err(TxnError::UnknownTransaction(xid).into());
        }
        self.write_status(xid, status)?;
        state.started.remove(&xid);
        Ok(())
    }

    pub fn is_active(&self, xid: Xid) -> Result<bool> {
        if xid == SUPER_XID {
            return Ok(false);
        }
        Ok(self.read_status(xid)? == ACTIVE)
    }

    pub fn is_committed(&self, xid: Xid) -> Result<bool> {
        if xid == SUPER_XID {
            return Ok(true);
        }
        Ok(self.read_status(xid)? == COMMITTED)
    }

    pub fn is_aborted(&self, xid: Xid) -> Result<bool> {
        if xid == SUPER_XID {
            return Ok(false);
        }
        Ok(self.read_status(xid)? == ABORTED)
    }

    /// The last xid handed out.
    pub fn counter(&self) -> Xid {
        self.state.lock().counter
    }

    fn write_status(&self, xid: Xid, status: u8) -> Result<()> {
        self.file.write_all_at(&[status], HEADER_LEN + xid - 1)?;
        self.file.sync_data()?;
        Ok(())
    }

    fn read_status(&self, xid: Xid) -> Result<u8> {
        if xid > self.state.lock().counter {
            return Err(TxnError::UnknownTransaction(xid).into());
        }
        let mut status = [0u8; 1];
        self.file.read_exact_at(&mut status, HEADER_LEN + xid - 1)?;
        Ok(status[0])
    }

    /// Route timeout aborts through `hook` instead of aborting directly.
    pub fn set_timeout_hook(&self, hook: TimeoutHook) {
        *self.hook.lock() = Some(hook);
    }

    /// Abort every transaction of this process that has been active for
    /// longer than `timeout`. Returns the xids that were timed out.
    pub fn sweep_expired(&self, timeout: Duration) -> Result<Vec<Xid>> {
        let expired: Vec<Xid> = {
            let mut state = self.state.lock();
            let now = Instant::now();
            let expired: Vec<Xid> = state
                .started
                .iter()
                .filter(|(_, start)| now.duration_since(**start) > timeout)
                .map(|(xid, _)| *xid)
                .collect();
            for xid in &expired {
                state.started.remove(xid);
            }
            expired
        };

        let hook = self.hook.lock().clone();
        for &xid in &expired {
            warn!(xid, timeout_ms = timeout.as_millis() as u64, "transaction timed out");
            match &hook {
                Some(hook) => hook(xid),
                None => self.abort_if_active(xid)?,
            }
        }
        Ok(expired)
    }

    fn abort_if_active(&self, xid: Xid) -> Result<()> {
        let _state = self.state.lock();
        if self.read_status_unlocked(xid)? == ACTIVE {
            self.write_status(xid, ABORTED)?;
        }
        Ok(())
    }

    fn read_status_unlocked(&self, xid: Xid) -> Result<u8> {
        let mut status = [0u8; 1];
        self.file.read_exact_at(&mut status, HEADER_LEN + xid - 1)?;
        Ok(status[0])
    }

    /// Start the background thread that times out long-running transactions.
    ///
    /// The thread holds only a weak reference and exits once the manager is
    /// dropped or [`close`](Self::close) is called.
    pub fn start_sweeper(self: &Arc<Self>, timeout: Duration, interval: Duration) -> Result<()> {
        let mut slot = self.sweeper.lock();
        if slot.is_some() {
            return Ok(());
        }
        let signal = Arc::new(StopSignal::default());
        let weak = Arc::downgrade(self);
        let thread_signal = Arc::clone(&signal);
        let handle = thread::Builder::new()
            .name("tidedb-txn-sweeper".into())
            .spawn(move || sweep_loop(weak, thread_signal, timeout, interval))?;
        info!(
            timeout_ms = timeout.as_millis() as u64,
            interval_ms = interval.as_millis() as u64,
            "transaction sweeper started"
        );
        *slot = Some(Sweeper {
            signal,
            handle: Some(handle),
        });
        Ok(())
    }

    /// Stop the sweeper and wait for it to exit.
    pub fn close(&self) {
        let sweeper = self.sweeper.lock().take();
        if let Some(mut sweeper) = sweeper {
            sweeper.signal.stop();
            if let Some(handle) = sweeper.handle.take() {
                if handle.thread().id() != thread::current().id() {
                    let _ = handle.join();
                }
            }
        }
    }
}

impl Drop for TransactionManager {
    fn drop(&mut self) {
        if let Some(sweeper) = self.sweeper.get_mut().as_ref() {
            sweeper.signal.stop();
        }
    }
}

#[derive(Default)]
struct StopSignal {
    stopped: Mutex<bool>,
    cond: Condvar,
}

impl StopSignal {
    fn stop(&self) {
        *self.stopped.lock() = true;
        self.cond.notify_all();
    }
}

struct Sweeper {
    signal: Arc<StopSignal>,
    handle: Option<JoinHandle<()>>,
}

fn sweep_loop(
    tm: Weak<TransactionManager>,
    signal: Arc<StopSignal>,
    timeout: Duration,
    interval: Duration,
) {
    loop {
        {
            let mut stopped = signal.stopped.lock();
            if !*stopped {
                signal.cond.wait_for(&mut stopped, interval);
            }
            if *stopped {
                break;
            }
        }
        let Some(tm) = tm.upgrade() else { break };
        if let Err(e) = tm.sweep_expired(timeout) {
            warn!(error = %e, "transaction sweep failed");
        }
    }
    debug!("transaction sweeper stopped");
}

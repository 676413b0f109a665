use std::collections::HashSet;

use parking_lot::Mutex;

use crate::error::TxnError;
use crate::types::{IsolationLevel, SUPER_XID, Xid};

#[derive(Default)]
struct TxnState {
    /// First failure; re-raised by every later operation.
    error: Option<TxnError>,
    /// Locks released and final status written.
    finished: bool,
}

/// In-memory state of one running transaction.
pub struct Transaction {
    xid: Xid,
    level: IsolationLevel,
    /// Transactions active at begin. Only kept for repeatable-read.
    snapshot: HashSet<Xid>,
    state: Mutex<TxnState>,
}

impl Transaction {
    pub fn new(xid: Xid, level: IsolationLevel, active: impl IntoIterator<Item = Xid>) -> Self {
        let snapshot = match level {
            IsolationLevel::RepeatableRead => active.into_iter().collect(),
            IsolationLevel::ReadCommitted => HashSet::new(),
        };
        Self {
            xid,
            level,
            snapshot,
            state: Mutex::new(TxnState::default()),
        }
    }

    pub fn xid(&self) -> Xid {
        self.xid
    }

    pub fn level(&self) -> IsolationLevel {
        self.level
    }

    /// Was `xid` running when this transaction began? The super transaction
    /// never counts.
    pub fn is_in_snapshot(&self, xid: Xid) -> bool {
        xid != SUPER_XID && self.snapshot.contains(&xid)
    }

    pub fn error(&self) -> Option<TxnError> {
        self.state.lock().error.clone()
    }

    /// Err with the captured failure, if any.
    pub fn check(&self) -> Result<(), TxnError> {
        match self.error() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Record `err` (unless an earlier one is kept) and claim the right to
    /// finish. Returns `false` if the transaction was already finished.
    pub(crate) fn fail(&self, err: TxnError) -> bool {
        let mut state = self.state.lock();
        state.error.get_or_insert(err);
        !std::mem::replace(&mut state.finished, true)
    }

    /// Claim the right to finish. Returns `false` if already finished.
    pub(crate) fn finish(&self) -> bool {
        !std::mem::replace(&mut self.state.lock().finished, true)
    }

    pub fn is_finished(&self) -> bool {
        self.state.lock().finished
    }
}

//! Record locks held until transaction end, with deadlock detection.
//!
//! The table tracks two kinds of edges: "xid holds uid" (one holder per uid)
//! and "xid waits for uid" (at most one uid per xid). Following wait edges to
//! the holder of the awaited uid gives a wait-for chain; a request that would
//! close a chain into a cycle is rejected before it is queued.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, warn};

use crate::error::TxnError;
use crate::types::{Uid, Xid};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WaitState {
    Pending,
    Granted,
    Abandoned,
}

struct WaitSignal {
    state: Mutex<WaitState>,
    cond: Condvar,
}

impl WaitSignal {
    fn new() -> Self {
        Self {
            state: Mutex::new(WaitState::Pending),
            cond: Condvar::new(),
        }
    }

    fn set(&self, to: WaitState) {
        *self.state.lock() = to;
        self.cond.notify_all();
    }
}

/// How a blocked lock request ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// The resource was handed over; the caller now holds it.
    Granted,
    /// The waiting transaction was released while still queued.
    Abandoned,
}

/// Handle for a queued lock request. [`wait`](Self::wait) blocks until the
/// resource is handed over or the request is abandoned.
pub struct LockWaiter {
    signal: Arc<WaitSignal>,
}

impl LockWaiter {
    pub fn wait(self) -> WaitOutcome {
        let mut state = self.signal.state.lock();
        while *state == WaitState::Pending {
            self.signal.cond.wait(&mut state);
        }
        match *state {
            WaitState::Granted => WaitOutcome::Granted,
            _ => WaitOutcome::Abandoned,
        }
    }
}

#[derive(Default)]
struct LockGraph {
    /// Resources each transaction holds.
    held: HashMap<Xid, Vec<Uid>>,
    /// Holder of each locked resource.
    holder: HashMap<Uid, Xid>,
    /// Transactions queued on each resource, oldest first.
    queue: HashMap<Uid, VecDeque<Xid>>,
    /// The resource each blocked transaction waits for.
    waiting_for: HashMap<Xid, Uid>,
    /// Wake-up handle of each blocked transaction.
    signals: HashMap<Xid, Arc<WaitSignal>>,
}

impl LockGraph {
    fn holds(&self, xid: Xid, uid: Uid) -> bool {
        self.holder.get(&uid) == Some(&xid)
    }

    fn grant(&mut self, xid: Xid, uid: Uid) {
        self.holder.insert(uid, xid);
        self.held.entry(xid).or_default().push(uid);
    }

    fn dequeue(&mut self, xid: Xid, uid: Uid) {
        if let Some(queue) = self.queue.get_mut(&uid) {
            queue.retain(|&x| x != xid);
            if queue.is_empty() {
                self.queue.remove(&uid);
            }
        }
    }

    /// Hand `uid` to the oldest waiter still interested in it.
    fn grant_next(&mut self, uid: Uid) {
        while let Some(next) = self.queue.get_mut(&uid).and_then(VecDeque::pop_front) {
            let Some(signal) = self.signals.remove(&next) else {
                continue;
            };
            self.waiting_for.remove(&next);
            self.grant(next, uid);
            signal.set(WaitState::Granted);
            debug!(xid = next, uid, "lock handed over");
            break;
        }
        if self.queue.get(&uid).is_some_and(VecDeque::is_empty) {
            self.queue.remove(&uid);
        }
    }

    fn has_deadlock(&self) -> bool {
        let mut stamps: HashMap<Xid, u64> = HashMap::new();
        let mut stamp = 1;
        for &xid in self.held.keys() {
            if stamps.contains_key(&xid) {
                continue;
            }
            stamp += 1;
            if self.walk(xid, stamp, &mut stamps) {
                return true;
            }
        }
        false
    }

    /// Follow the wait-for chain from `xid`, stamping every node. Meeting the
    /// current stamp again is a cycle; meeting an older stamp joins a chain
    /// already known to end.
    fn walk(&self, mut xid: Xid, stamp: u64, stamps: &mut HashMap<Xid, u64>) -> bool {
        loop {
            match stamps.get(&xid) {
                Some(&s) if s == stamp => return true,
                Some(_) => return false,
                None => {}
            }
            stamps.insert(xid, stamp);
            let Some(uid) = self.waiting_for.get(&xid) else {
                return false;
            };
            let Some(&holder) = self.holder.get(uid) else {
                return false;
            };
            xid = holder;
        }
    }
}

pub struct LockTable {
    graph: Mutex<LockGraph>,
}

impl LockTable {
    pub fn new() -> Self {
        Self {
            graph: Mutex::new(LockGraph::default()),
        }
    }

    /// Lock `uid` for `xid` until [`release`](Self::release).
    ///
    /// Returns `Ok(None)` if the lock is held now, `Ok(Some(waiter))` if the
    /// caller must block on the waiter, and `Err(TxnError::Deadlock)` if
    /// waiting would deadlock. A rejected request leaves no trace.
    pub fn acquire(&self, xid: Xid, uid: Uid) -> Result<Option<LockWaiter>, TxnError> {
        let mut graph = self.graph.lock();
        if graph.holds(xid, uid) {
            return Ok(None);
        }
        if !graph.holder.contains_key(&uid) {
            graph.grant(xid, uid);
            return Ok(None);
        }

        graph.waiting_for.insert(xid, uid);
        graph.queue.entry(uid).or_default().push_back(xid);
        if graph.has_deadlock() {
            graph.waiting_for.remove(&xid);
            graph.dequeue(xid, uid);
            warn!(xid, uid, "deadlock detected, lock request rejected");
            return Err(TxnError::Deadlock);
        }

        let signal = Arc::new(WaitSignal::new());
        graph.signals.insert(xid, Arc::clone(&signal));
        debug!(xid, uid, holder = graph.holder.get(&uid).copied(), "waiting for lock");
        Ok(Some(LockWaiter { signal }))
    }

    /// Release everything `xid` holds, handing each resource to its next
    /// waiter, and abandon `xid`'s own pending request if it has one.
    pub fn release(&self, xid: Xid) {
        let mut graph = self.graph.lock();
        if let Some(uids) = graph.held.remove(&xid) {
            for uid in uids {
                graph.holder.remove(&uid);
                graph.grant_next(uid);
            }
        }
        if let Some(uid) = graph.waiting_for.remove(&xid) {
            graph.dequeue(xid, uid);
        }
        if let Some(signal) = graph.signals.remove(&xid) {
            signal.set(WaitState::Abandoned);
        }
    }

    /// Current holder of `uid`.
    pub fn holder(&self, uid: Uid) -> Option<Xid> {
        self.graph.lock().holder.get(&uid).copied()
    }

    /// Number of transactions blocked on some resource.
    pub fn waiting(&self) -> usize {
        self.graph.lock().waiting_for.len()
    }
}

impl Default for LockTable {
    fn default() -> Self {
        Self::new()
    }
}

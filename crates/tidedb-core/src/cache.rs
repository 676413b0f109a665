//! Reference-counted resource cache.
//!
//! [`ResourceCache`] holds at most `capacity` resources keyed by a `u64`. A
//! resource stays resident while its reference count is above zero; the last
//! [`release`](ResourceCache::release) hands it to the loader's eviction hook
//! (for pages: flush if dirty) and frees its slot. There is no background
//! eviction: residency is entirely driven by acquire/release pairs.
//!
//! Only one caller loads a given key at a time. Other callers asking for a key
//! that is mid-load poll until the loader finishes or fails.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;

use crate::error::{Error, StorageError};

/// Poll period while another caller is loading the same key.
const LOAD_POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Loads resources on a cache miss and writes them back on eviction.
pub trait CacheLoader: Send + Sync {
    type Resource: Send + Sync;

    /// Load the resource for `key`. `Ok(None)` means "no such resource" and is
    /// reported to the caller as a miss, not an error.
    fn load(&self, key: u64) -> Result<Option<Self::Resource>, Error>;

    /// Called once when the resource leaves the cache.
    fn evict(&self, resource: &Self::Resource) -> Result<(), Error>;
}

struct CacheSlot<T> {
    resource: Arc<T>,
    refs: usize,
}

struct CacheState<T> {
    entries: HashMap<u64, CacheSlot<T>>,
    loading: HashSet<u64>,
    /// Slots in use, including keys currently being loaded.
    count: usize,
}

pub struct ResourceCache<L: CacheLoader> {
    loader: L,
    capacity: usize,
    state: Mutex<CacheState<L::Resource>>,
}

impl<L: CacheLoader> ResourceCache<L> {
    /// Create a cache holding at most `capacity` resources (0 = unbounded).
    pub fn new(loader: L, capacity: usize) -> Self {
        Self {
            loader,
            capacity,
            state: Mutex::new(CacheState {
                entries: HashMap::new(),
                loading: HashSet::new(),
                count: 0,
            }),
        }
    }

    pub fn loader(&self) -> &L {
        &self.loader
    }

    /// Take a reference to the resource for `key`, loading it on a miss.
    ///
    /// Returns `Ok(None)` if the loader reports the resource does not exist,
    /// and `StorageError::CacheFull` if every slot is taken.
    pub fn acquire(&self, key: u64) -> Result<Option<Arc<L::Resource>>, Error> {
        loop {
            let mut state = self.state.lock();
            if state.loading.contains(&key) {
                drop(state);
                thread::sleep(LOAD_POLL_INTERVAL);
                continue;
            }
            if let Some(slot) = state.entries.get_mut(&key) {
                slot.refs += 1;
                return Ok(Some(Arc::clone(&slot.resource)));
            }
            if self.capacity > 0 && state.count >= self.capacity {
                return Err(StorageError::CacheFull.into());
            }
            state.count += 1;
            state.loading.insert(key);
            break;
        }

        let loaded = self.loader.load(key);

        let mut state = self.state.lock();
        state.loading.remove(&key);
        match loaded {
            Ok(Some(resource)) => {
                let resource = Arc::new(resource);
                state.entries.insert(
                    key,
                    CacheSlot {
                        resource: Arc::clone(&resource),
                        refs: 1,
                    },
                );
                Ok(Some(resource))
            }
            Ok(None) => {
                state.count -= 1;
                Ok(None)
            }
            Err(e) => {
                state.count -= 1;
                Err(e)
            }
        }
    }

    /// Drop one reference to `key`. The last reference evicts the resource.
    pub fn release(&self, key: u64) -> Result<(), Error> {
        let mut state = self.state.lock();
        let Some(slot) = state.entries.get_mut(&key) else {
            return Ok(());
        };
        slot.refs -= 1;
        if slot.refs > 0 {
            return Ok(());
        }
        let slot = state.entries.remove(&key).map(|s| s.resource);
        state.count -= 1;
        // Evict under the lock so a concurrent acquire cannot reload the key
        // before the write-back lands.
        match slot {
            Some(resource) => self.loader.evict(&resource),
            None => Ok(()),
        }
    }

    /// Evict every resident resource regardless of its reference count.
    ///
    /// All resources are evicted even if some evictions fail; the first
    /// failure is returned.
    pub fn shutdown(&self) -> Result<(), Error> {
        let mut state = self.state.lock();
        let mut first_err = None;
        let keys: Vec<u64> = state.entries.keys().copied().collect();
        for key in keys {
            if let Some(slot) = state.entries.remove(&key) {
                state.count -= 1;
                if let Err(e) = self.loader.evict(&slot.resource) {
                    first_err.get_or_insert(e);
                }
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Number of resident resources.
    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Current reference count of `key`, or 0 if it is not resident.
    pub fn ref_count(&self, key: u64) -> usize {
        self.state.lock().entries.get(&key).map_or(0, |s| s.refs)
    }
}

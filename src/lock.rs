//! Per-key build locks
//!
//! Serializes concurrent builders of the same cache artifact: at most one
//! holder per key, unrelated keys never block each other. Entries are
//! refcounted and removed when the last waiter leaves, so the table never
//! accumulates dead keys. Release happens on guard drop, which covers error
//! and panic paths in the critical section.

use crate::{Result, TableError};
use ahash::AHashMap;
use parking_lot::{Condvar, Mutex};
use std::time::{Duration, Instant};

#[derive(Default)]
struct Entry {
    /// Holder plus blocked acquirers; the entry lives while this is nonzero
    waiters: usize,
    busy: bool,
}

/// Keyed mutual-exclusion table
#[derive(Default)]
pub struct KeyedLock {
    entries: Mutex<AHashMap<String, Entry>>,
    cond: Condvar,
}

impl KeyedLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Block until the key is free, then hold it. The guard releases on drop.
    pub fn acquire(&self, key: &str) -> KeyedGuard<'_> {
        self.acquire_inner(key, None)
            .expect("untimed acquire cannot time out")
    }

    /// Like [`acquire`](Self::acquire), but gives up after `timeout`.
    pub fn acquire_timeout(&self, key: &str, timeout: Duration) -> Result<KeyedGuard<'_>> {
        self.acquire_inner(key, Some(timeout))
    }

    fn acquire_inner(&self, key: &str, timeout: Option<Duration>) -> Result<KeyedGuard<'_>> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut entries = self.entries.lock();
        entries.entry(key.to_string()).or_default().waiters += 1;

        loop {
            let entry = entries.get_mut(key).expect("entry pinned by waiter count");
            if !entry.busy {
                entry.busy = true;
                return Ok(KeyedGuard {
                    lock: self,
                    key: key.to_string(),
                });
            }
            match deadline {
                None => self.cond.wait(&mut entries),
                Some(deadline) => {
                    if self.cond.wait_until(&mut entries, deadline).timed_out() {
                        Self::leave(&mut entries, key);
                        return Err(TableError::LockTimeout {
                            key: key.to_string(),
                        });
                    }
                }
            }
        }
    }

    /// Drop a waiter's claim on the entry, removing it when unreferenced.
    fn leave(entries: &mut AHashMap<String, Entry>, key: &str) {
        if let Some(entry) = entries.get_mut(key) {
            entry.waiters -= 1;
            if entry.waiters == 0 {
                entries.remove(key);
            }
        }
    }

    /// Number of live lock entries; zero once every guard is gone.
    pub fn entry_count(&self) -> usize {
        self.entries.lock().len()
    }
}

/// Exclusive hold on one key; releases on drop.
#[must_use = "the key is released as soon as the guard is dropped"]
pub struct KeyedGuard<'a> {
    lock: &'a KeyedLock,
    key: String,
}

impl Drop for KeyedGuard<'_> {
    fn drop(&mut self) {
        let mut entries = self.lock.entries.lock();
        if let Some(entry) = entries.get_mut(&self.key) {
            entry.busy = false;
        }
        KeyedLock::leave(&mut entries, &self.key);
        self.lock.cond.notify_all();
    }
}

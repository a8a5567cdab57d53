//! Per-key async mutual exclusion
//!
//! Identity resolution takes a lock named after the base candidate UDI, so
//! two probes of the same kind of device run one after the other while
//! unrelated devices resolve in parallel. Entries are dropped from the table
//! as soon as nobody holds or waits for them.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// One table entry: the mutex and how many callers hold or wait for it
#[derive(Debug, Default)]
struct Slot {
    mutex: Arc<AsyncMutex<()>>,
    users: usize,
}

#[derive(Debug, Default)]
pub struct KeyedLocks {
    locks: Mutex<HashMap<String, Slot>>,
}

impl KeyedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn table(&self) -> MutexGuard<'_, HashMap<String, Slot>> {
        self.locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Wait until `key` is free and take it.
    ///
    /// Dropping the returned future while it waits gives up the place in
    /// line and releases the table entry like a dropped guard would.
    pub async fn lock(&self, key: &str) -> KeyedGuard<'_> {
        let mutex = {
            let mut table = self.table();
            let slot = table.entry(key.to_string()).or_default();
            slot.users += 1;
            slot.mutex.clone()
        };
        let mut guard = KeyedGuard {
            locks: self,
            key: key.to_string(),
            guard: None,
        };
        guard.guard = Some(mutex.lock_owned().await);
        guard
    }

    /// Number of keys currently held or waited on
    pub fn active_keys(&self) -> usize {
        self.table().len()
    }
}

/// Held lock on one key; released on drop
#[derive(Debug)]
pub struct KeyedGuard<'a> {
    locks: &'a KeyedLocks,
    key: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl KeyedGuard<'_> {
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Drop for KeyedGuard<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        let mut table = self.locks.table();
        let idle = match table.get_mut(&self.key) {
            Some(slot) => {
                slot.users = slot.users.saturating_sub(1);
                slot.users == 0
            }
            None => false,
        };
        if idle {
            table.remove(&self.key);
        }
    }
}

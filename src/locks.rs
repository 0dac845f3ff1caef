//! Keyed async lock table.
//!
//! Hands out one exclusive section per key (file id, path, chunk
//! fingerprint). Entries are weak, so the table only holds keys that are
//! currently locked or waited on.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex, PoisonError, Weak};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// Held for the duration of a per-key exclusive section.
pub type KeyGuard = OwnedMutexGuard<()>;

/// Prune dead entries once the table grows past this many keys.
const PRUNE_THRESHOLD: usize = 256;

pub struct KeyedLocks<K> {
    inner: Mutex<HashMap<K, Weak<AsyncMutex<()>>>>,
}

impl<K> std::fmt::Debug for KeyedLocks<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyedLocks").finish_non_exhaustive()
    }
}

impl<K: Eq + Hash + Clone> Default for KeyedLocks<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Eq + Hash + Clone> KeyedLocks<K> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
        }
    }

    fn mutex_for(&self, key: &K) -> Arc<AsyncMutex<()>> {
        let mut map = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(existing) = map.get(key).and_then(Weak::upgrade) {
            return existing;
        }
        if map.len() >= PRUNE_THRESHOLD {
            map.retain(|_, weak| weak.strong_count() > 0);
        }
        let mutex = Arc::new(AsyncMutex::new(()));
        map.insert(key.clone(), Arc::downgrade(&mutex));
        mutex
    }

    /// Wait for the exclusive section of `key`.
    pub async fn lock(&self, key: &K) -> KeyGuard {
        self.mutex_for(key).lock_owned().await
    }

    /// Take the exclusive section of `key` if nobody holds it.
    pub fn try_lock(&self, key: &K) -> Option<KeyGuard> {
        self.mutex_for(key).try_lock_owned().ok()
    }

    /// Number of keys with a live lock.
    pub fn active(&self) -> usize {
        let map = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        map.values().filter(|weak| weak.strong_count() > 0).count()
    }
}

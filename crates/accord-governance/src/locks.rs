//! Keyed async locks.
//!
//! Serializes every mutation of one assignment triple or one attribute cell
//! while letting unrelated keys proceed concurrently. [`KeyedRwLocks`] lets
//! many writers that reference an instance run together while excluding the
//! retirement of that instance.

use std::hash::Hash;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{
    Mutex, OwnedMutexGuard, OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock,
};

/// Entries beyond which idle locks are pruned on acquisition.
const PRUNE_THRESHOLD: usize = 1024;

/// A table of per-key mutexes.
#[derive(Debug)]
pub struct KeyedLocks<K: Eq + Hash> {
    locks: DashMap<K, Arc<Mutex<()>>>,
}

impl<K: Eq + Hash + Clone> Default for KeyedLocks<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Eq + Hash + Clone> KeyedLocks<K> {
    /// Create an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self {
            locks: DashMap::new(),
        }
    }

    /// Wait for exclusive access to `key`. Released when the guard drops.
    pub async fn lock(&self, key: K) -> OwnedMutexGuard<()> {
        if self.locks.len() > PRUNE_THRESHOLD {
            self.prune();
        }
        // Clone the Arc out so no map shard stays locked across the await.
        let mutex = self.locks.entry(key).or_default().value().clone();
        mutex.lock_owned().await
    }

    /// Drop entries nobody holds or waits on.
    pub fn prune(&self) {
        self.locks.retain(|_, mutex| Arc::strong_count(mutex) > 1);
    }

    /// Number of tracked keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    /// Whether no keys are tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

/// A table of per-key read/write locks.
#[derive(Debug)]
pub struct KeyedRwLocks<K: Eq + Hash> {
    locks: DashMap<K, Arc<RwLock<()>>>,
}

impl<K: Eq + Hash + Clone> Default for KeyedRwLocks<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Eq + Hash + Clone> KeyedRwLocks<K> {
    /// Create an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self {
            locks: DashMap::new(),
        }
    }

    fn entry(&self, key: K) -> Arc<RwLock<()>> {
        if self.locks.len() > PRUNE_THRESHOLD {
            self.locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        }
        self.locks.entry(key).or_default().value().clone()
    }

    /// Shared access to `key`.
    pub async fn read(&self, key: K) -> OwnedRwLockReadGuard<()> {
        self.entry(key).read_owned().await
    }

    /// Shared access to several keys, acquired in sorted order.
    pub async fn read_all(&self, mut keys: Vec<K>) -> Vec<OwnedRwLockReadGuard<()>>
    where
        K: Ord,
    {
        keys.sort();
        keys.dedup();
        let mut guards = Vec::with_capacity(keys.len());
        for key in keys {
            guards.push(self.read(key).await);
        }
        guards
    }

    /// Exclusive access to `key`.
    pub async fn write(&self, key: K) -> OwnedRwLockWriteGuard<()> {
        self.entry(key).write_owned().await
    }

    /// Number of tracked keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    /// Whether no keys are tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

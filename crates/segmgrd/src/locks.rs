//! Keyed async mutual exclusion
//!
//! One `tokio::sync::Mutex` per key, created on first use. Guards are owned
//! so they can be held across `.await` points for the whole of a request.

use std::hash::Hash;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Lock table keyed by node id or subnet
#[derive(Debug)]
pub struct KeyedLocks<K: Eq + Hash> {
    locks: DashMap<K, Arc<Mutex<()>>>,
}

impl<K: Eq + Hash + Clone + Ord> KeyedLocks<K> {
    pub fn new() -> Self {
        Self {
            locks: DashMap::new(),
        }
    }

    fn entry(&self, key: &K) -> Arc<Mutex<()>> {
        self.locks
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Waits for exclusive access to `key`
    pub async fn lock(&self, key: &K) -> OwnedMutexGuard<()> {
        // The DashMap shard guard is released before awaiting.
        let mutex = self.entry(key);
        mutex.lock_owned().await
    }

    /// Locks several keys in sorted order; duplicates are locked once
    pub async fn lock_many(&self, keys: &[K]) -> Vec<OwnedMutexGuard<()>> {
        let mut keys = keys.to_vec();
        keys.sort();
        keys.dedup();

        let mut guards = Vec::with_capacity(keys.len());
        for key in &keys {
            guards.push(self.lock(key).await);
        }
        guards
    }

    /// Number of keys seen so far
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

impl<K: Eq + Hash + Clone + Ord> Default for KeyedLocks<K> {
    fn default() -> Self {
        Self::new()
    }
}

//! Keyed exclusivity primitives.
//!
//! - [`KeyedExclusion`]: fail-fast, at most one holder per key. A second
//!   `try_acquire` for a held key returns `None` instead of waiting.
//! - [`KeyedMutex`]: waiting async mutex per key, for serialized
//!   read-modify-write sections.
//!
//! Both release on guard drop, so a cancelled or timed-out task never leaves
//! a key permanently held.

use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::hash::Hash;
use std::sync::Arc;
use tokio::sync::OwnedMutexGuard;

#[derive(Debug)]
pub struct KeyedExclusion<K: Eq + Hash> {
    held: Arc<Mutex<HashSet<K>>>,
}

impl<K: Eq + Hash + Clone> Default for KeyedExclusion<K> {
    fn default() -> Self { Self::new() }
}

impl<K: Eq + Hash + Clone> KeyedExclusion<K> {
    pub fn new() -> Self { Self { held: Arc::new(Mutex::new(HashSet::new())) } }

    pub fn try_acquire(&self, key: K) -> Option<ExclusionGuard<K>> {
        let mut held = self.held.lock();
        if !held.insert(key.clone()) { return None; }
        Some(ExclusionGuard { key, held: self.held.clone() })
    }

    pub fn is_held(&self, key: &K) -> bool { self.held.lock().contains(key) }

    pub fn held_count(&self) -> usize { self.held.lock().len() }
}

#[derive(Debug)]
pub struct ExclusionGuard<K: Eq + Hash> {
    key: K,
    held: Arc<Mutex<HashSet<K>>>,
}

impl<K: Eq + Hash> ExclusionGuard<K> {
    pub fn key(&self) -> &K { &self.key }
}

impl<K: Eq + Hash> Drop for ExclusionGuard<K> {
    fn drop(&mut self) { self.held.lock().remove(&self.key); }
}

#[derive(Debug)]
pub struct KeyedMutex<K: Eq + Hash> {
    locks: Mutex<HashMap<K, Arc<tokio::sync::Mutex<()>>>>,
}

impl<K: Eq + Hash + Clone> Default for KeyedMutex<K> {
    fn default() -> Self { Self::new() }
}

impl<K: Eq + Hash + Clone> KeyedMutex<K> {
    pub fn new() -> Self { Self { locks: Mutex::new(HashMap::new()) } }

    pub async fn lock(&self, key: K) -> OwnedMutexGuard<()> {
        let slot = {
            let mut locks = self.locks.lock();
            // entries only referenced by the map have no holder and no waiter
            locks.retain(|_, m| Arc::strong_count(m) > 1);
            locks.entry(key).or_insert_with(|| Arc::new(tokio::sync::Mutex::new(()))).clone()
        };
        slot.lock_owned().await
    }

    pub fn len(&self) -> usize { self.locks.lock().len() }

    pub fn is_empty(&self) -> bool { self.len() == 0 }
}

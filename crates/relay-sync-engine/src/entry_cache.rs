// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! TTL and capacity bounded key/value store
//!
//! TTL is checked lazily on read; capacity eagerly on write.

use std::hash::Hash;
use std::time::Duration;

use ahash::AHashMap;
use parking_lot::Mutex;
use relay_sync_config::EntryCacheConfig;
use tokio::time::Instant;
use tracing::debug;

#[derive(Debug, Clone)]
struct CacheEntry<V> {
    value: V,
    stored_at: Instant,
}

#[derive(Debug)]
pub struct EntryCache<K, V> {
    ttl: Duration,
    capacity: usize,
    evict_fraction: f64,
    entries: Mutex<AHashMap<K, CacheEntry<V>>>,
}

impl<K, V> EntryCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new(ttl: Duration, capacity: usize, evict_fraction: f64) -> Self {
        Self {
            ttl,
            capacity: capacity.max(1),
            evict_fraction: evict_fraction.clamp(f64::MIN_POSITIVE, 1.0),
            entries: Mutex::new(AHashMap::new()),
        }
    }

    pub fn from_config(config: &EntryCacheConfig) -> Self {
        Self::new(config.ttl(), config.capacity, config.evict_fraction)
    }

    /// Fresh value for `key`; a stale entry is removed
    pub fn get(&self, key: &K) -> Option<V> {
        let mut entries = self.entries.lock();
        match entries.get(key) {
            Some(entry) if entry.stored_at.elapsed() < self.ttl => Some(entry.value.clone()),
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    /// Store `value`, evicting the oldest share of entries if full
    pub fn set(&self, key: K, value: V) {
        let mut entries = self.entries.lock();
        if !entries.contains_key(&key) && entries.len() >= self.capacity {
            let evict = ((entries.len() as f64 * self.evict_fraction).ceil() as usize).max(1);
            let mut by_age: Vec<(K, Instant)> = entries
                .iter()
                .map(|(k, e)| (k.clone(), e.stored_at))
                .collect();
            by_age.sort_by_key(|(_, stored_at)| *stored_at);
            for (k, _) in by_age.into_iter().take(evict) {
                entries.remove(&k);
            }
            debug!("[ENTRY-CACHE] at capacity {}, evicted {} oldest", self.capacity, evict);
        }
        entries.insert(
            key,
            CacheEntry {
                value,
                stored_at: Instant::now(),
            },
        );
    }

    pub fn invalidate(&self, key: &K) -> bool {
        self.entries.lock().remove(key).is_some()
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    /// Remove every expired entry; returns how many were removed
    pub fn purge_expired(&self) -> usize {
        let mut entries = self.entries.lock();
        let before = entries.len();
        let ttl = self.ttl;
        entries.retain(|_, e| e.stored_at.elapsed() < ttl);
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! Application-wide result cache with periodic and triggered sweeps
//!
//! Entries carry a last-updated timestamp. Sweeps enforce a maximum entry
//! count by evicting the oldest-updated entries first; memory-pressure sweeps
//! use a stricter cap (half the normal limit).
//!
//! Side effects on writes go through [`WriteHook`] implementations registered
//! with the cache. The cache itself invokes them after every insert.

use std::sync::{Arc, Weak};
use std::time::Duration;

use ahash::AHashMap;
use parking_lot::{Mutex, RwLock};
use relay_sync_config::QueryCacheConfig;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Why a sweep runs; decides the cap applied
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SweepMode {
    Periodic,
    /// Visibility regained
    Visible,
    /// Requested by a write hook
    OnWrite,
    /// Memory pressure: half the normal cap
    Pressure,
}

/// Hook invoked by the cache after each insert
pub trait WriteHook: Send + Sync {
    /// Return a sweep mode to have the cache sweep right away
    fn after_write(&self, key: &str, entry_count: usize, max_entries: usize) -> Option<SweepMode>;
}

/// Requests a sweep as soon as a write pushes the cache past its cap
#[derive(Debug, Default, Clone, Copy)]
pub struct PruneOnWrite;

impl WriteHook for PruneOnWrite {
    fn after_write(&self, _key: &str, entry_count: usize, max_entries: usize) -> Option<SweepMode> {
        (entry_count > max_entries).then_some(SweepMode::OnWrite)
    }
}

#[derive(Debug, Clone)]
struct QueryEntry<V> {
    value: V,
    updated_at: Instant,
}

pub struct ApplicationQueryCache<V> {
    max_entries: usize,
    pressure_max_entries: usize,
    entries: Mutex<AHashMap<String, QueryEntry<V>>>,
    hooks: RwLock<Vec<Arc<dyn WriteHook>>>,
}

impl<V: Clone + Send + 'static> ApplicationQueryCache<V> {
    pub fn new(max_entries: usize) -> Self {
        let max_entries = max_entries.max(1);
        Self {
            max_entries,
            pressure_max_entries: (max_entries / 2).max(1),
            entries: Mutex::new(AHashMap::new()),
            hooks: RwLock::new(Vec::new()),
        }
    }

    pub fn from_config(config: &QueryCacheConfig) -> Self {
        Self::new(config.max_entries)
    }

    pub fn add_write_hook(&self, hook: Arc<dyn WriteHook>) {
        self.hooks.write().push(hook);
    }

    pub fn get(&self, key: &str) -> Option<V> {
        self.entries.lock().get(key).map(|e| e.value.clone())
    }

    /// Store a result and run the write hooks
    pub fn insert(&self, key: impl Into<String>, value: V) {
        let key = key.into();
        let count = {
            let mut entries = self.entries.lock();
            entries.insert(
                key.clone(),
                QueryEntry {
                    value,
                    updated_at: Instant::now(),
                },
            );
            entries.len()
        };

        let requested = {
            let hooks = self.hooks.read();
            hooks
                .iter()
                .filter_map(|hook| hook.after_write(&key, count, self.max_entries))
                .max_by_key(|mode| self.cap_for(*mode) == self.pressure_max_entries)
        };
        if let Some(mode) = requested {
            self.sweep(mode);
        }
    }

    pub fn remove(&self, key: &str) -> Option<V> {
        self.entries.lock().remove(key).map(|e| e.value)
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn max_entries(&self) -> usize {
        self.max_entries
    }

    fn cap_for(&self, mode: SweepMode) -> usize {
        match mode {
            SweepMode::Pressure => self.pressure_max_entries,
            SweepMode::Periodic | SweepMode::Visible | SweepMode::OnWrite => self.max_entries,
        }
    }

    /// Evict oldest-updated entries down to the cap for `mode`
    pub fn sweep(&self, mode: SweepMode) -> usize {
        let cap = self.cap_for(mode);
        let mut entries = self.entries.lock();
        if entries.len() <= cap {
            return 0;
        }

        let excess = entries.len() - cap;
        let mut by_age: Vec<(String, Instant)> = entries
            .iter()
            .map(|(k, e)| (k.clone(), e.updated_at))
            .collect();
        by_age.sort_by_key(|(_, updated_at)| *updated_at);
        for (key, _) in by_age.into_iter().take(excess) {
            entries.remove(&key);
        }

        debug!(
            "[QUERY-CACHE] {:?} sweep evicted {} entries (cap {})",
            mode, excess, cap
        );
        excess
    }

    /// Sweep every `interval` until `token` is cancelled or the cache is dropped
    pub fn start_periodic_sweep(
        self: &Arc<Self>,
        interval: Duration,
        token: CancellationToken,
    ) -> JoinHandle<()> {
        let weak: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // First tick completes immediately
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let Some(cache) = weak.upgrade() else { break };
                        cache.sweep(SweepMode::Periodic);
                    }
                }
            }
            info!("[QUERY-CACHE] periodic sweep stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn filled(max: usize, count: usize) -> ApplicationQueryCache<usize> {
        let cache = ApplicationQueryCache::new(max);
        for i in 0..count {
            cache.insert(format!("q{}", i), i);
            tokio::time::advance(Duration::from_millis(5)).await;
        }
        cache
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_evicts_oldest_updated_first() {
        let cache = filled(4, 6).await;
        assert_eq!(cache.sweep(SweepMode::Periodic), 2);
        assert_eq!(cache.len(), 4);
        assert!(cache.get("q0").is_none());
        assert!(cache.get("q1").is_none());
        assert_eq!(cache.get("q5"), Some(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rewrite_refreshes_age() {
        let cache = filled(2, 2).await;
        cache.insert("q0", 10);
        tokio::time::advance(Duration::from_millis(5)).await;
        cache.insert("q2", 2);

        cache.sweep(SweepMode::Visible);
        assert_eq!(cache.get("q0"), Some(10));
        assert!(cache.get("q1").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_pressure_sweep_uses_half_cap() {
        let cache = filled(10, 10).await;
        assert_eq!(cache.sweep(SweepMode::Periodic), 0);
        assert_eq!(cache.sweep(SweepMode::Pressure), 5);
        assert_eq!(cache.len(), 5);
        assert_eq!(cache.get("q9"), Some(9));
    }

    #[tokio::test(start_paused = true)]
    async fn test_prune_on_write_hook() {
        let cache = ApplicationQueryCache::new(3);
        cache.add_write_hook(Arc::new(PruneOnWrite));
        for i in 0..5 {
            cache.insert(format!("q{}", i), i);
            tokio::time::advance(Duration::from_millis(5)).await;
            assert!(cache.len() <= 3);
        }
        assert_eq!(cache.get("q4"), Some(4));
    }

    #[tokio::test(start_paused = true)]
    async fn test_without_hooks_writes_do_not_sweep() {
        let cache = filled(2, 4).await;
        assert_eq!(cache.len(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_sweep_task() {
        let cache = Arc::new(filled(2, 4).await);
        let token = CancellationToken::new();
        let task = cache.start_periodic_sweep(Duration::from_secs(60), token.clone());

        tokio::time::sleep(Duration::from_secs(61)).await;
        assert_eq!(cache.len(), 2);

        token.cancel();
        task.await.unwrap();
    }
}

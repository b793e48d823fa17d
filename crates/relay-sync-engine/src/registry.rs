// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! Subscription registry
//!
//! Sole owner of every live relay subscription. Tracks handles by id and
//! supports:
//! - pausing (stop every handle, keep bookkeeping, stop new ones on arrival)
//! - resuming (clears the paused flag only)
//! - full teardown and age-based orphan reclamation
//!
//! Teardown is best effort: stop and cleanup failures are logged, never
//! returned. Handles are stopped and cleanups run outside the registry lock.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use ahash::AHashMap;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::event::Filter;
use crate::relay::SubscriptionHandle;

/// Runs once when a subscription is unregistered or torn down
pub type CleanupFn = Box<dyn FnOnce() -> Result<()> + Send + 'static>;

/// Generate a fresh subscription id
pub fn new_subscription_id() -> String {
    uuid::Uuid::now_v7().to_string()
}

struct RegistryEntry {
    filters: Vec<Filter>,
    handle: Arc<dyn SubscriptionHandle>,
    created_at: Instant,
    cleanup: Option<CleanupFn>,
    stopped: bool,
}

/// Read-only view of one registered subscription
#[derive(Debug, Clone, Serialize)]
pub struct SubscriptionInfo {
    pub id: String,
    pub filters: Vec<Filter>,
    pub age: Duration,
    pub stopped: bool,
}

#[derive(Default)]
struct RegistryState {
    entries: AHashMap<String, RegistryEntry>,
    paused: bool,
}

#[derive(Default)]
pub struct SubscriptionRegistry {
    state: Mutex<RegistryState>,
}

impl fmt::Debug for SubscriptionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("SubscriptionRegistry")
            .field("entries", &state.entries.len())
            .field("paused", &state.paused)
            .finish()
    }
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a subscription under `id`
    ///
    /// An existing entry with the same id is torn down first. While paused
    /// the handle is stopped immediately but still tracked.
    pub fn register(
        &self,
        id: impl Into<String>,
        filters: Vec<Filter>,
        handle: Arc<dyn SubscriptionHandle>,
        cleanup: Option<CleanupFn>,
    ) {
        let id = id.into();
        let (replaced, paused) = {
            let mut state = self.state.lock();
            let paused = state.paused;
            let replaced = state.entries.insert(
                id.clone(),
                RegistryEntry {
                    filters,
                    handle: Arc::clone(&handle),
                    created_at: Instant::now(),
                    cleanup,
                    stopped: paused,
                },
            );
            (replaced, paused)
        };

        if let Some(previous) = replaced {
            debug!("[REGISTRY] replacing subscription {}", id);
            teardown(&id, previous);
        }
        if paused {
            debug!("[REGISTRY] registry paused, stopping {} on arrival", id);
            stop_handle(&id, handle.as_ref());
        } else {
            debug!("[REGISTRY] registered subscription {}", id);
        }
    }

    /// Run cleanup, stop the handle and forget `id`; false if unknown
    pub fn unregister(&self, id: &str) -> bool {
        let removed = self.state.lock().entries.remove(id);
        match removed {
            Some(entry) => {
                teardown(id, entry);
                debug!("[REGISTRY] unregistered subscription {}", id);
                true
            }
            None => false,
        }
    }

    /// Stop every live handle, keep every entry, and stop future arrivals
    ///
    /// Returns the number of handles stopped.
    pub fn pause_all(&self) -> usize {
        let to_stop: Vec<(String, Arc<dyn SubscriptionHandle>)> = {
            let mut state = self.state.lock();
            state.paused = true;
            state
                .entries
                .iter_mut()
                .filter(|(_, entry)| !entry.stopped)
                .map(|(id, entry)| {
                    entry.stopped = true;
                    (id.clone(), Arc::clone(&entry.handle))
                })
                .collect()
        };

        for (id, handle) in &to_stop {
            stop_handle(id, handle.as_ref());
        }
        info!("[REGISTRY] paused, stopped {} live subscriptions", to_stop.len());
        to_stop.len()
    }

    /// Clear the paused flag; stopped handles stay stopped
    pub fn resume(&self) {
        self.state.lock().paused = false;
        info!("[REGISTRY] resumed");
    }

    pub fn is_paused(&self) -> bool {
        self.state.lock().paused
    }

    /// Tear down and forget every entry
    pub fn stop_all(&self) -> usize {
        let drained: Vec<(String, RegistryEntry)> = self.state.lock().entries.drain().collect();
        let count = drained.len();
        for (id, entry) in drained {
            teardown(&id, entry);
        }
        if count > 0 {
            info!("[REGISTRY] stopped all {} subscriptions", count);
        }
        count
    }

    /// Tear down entries at least `max_age` old; returns how many
    pub fn cleanup_old(&self, max_age: Duration) -> usize {
        let expired: Vec<(String, RegistryEntry)> = {
            let mut state = self.state.lock();
            let ids: Vec<String> = state
                .entries
                .iter()
                .filter(|(_, entry)| entry.created_at.elapsed() >= max_age)
                .map(|(id, _)| id.clone())
                .collect();
            ids.into_iter()
                .filter_map(|id| state.entries.remove(&id).map(|entry| (id, entry)))
                .collect()
        };

        let count = expired.len();
        for (id, entry) in expired {
            teardown(&id, entry);
        }
        if count > 0 {
            info!("[REGISTRY] reclaimed {} orphaned subscriptions older than {:?}", count, max_age);
        }
        count
    }

    pub fn contains(&self, id: &str) -> bool {
        self.state.lock().entries.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().entries.is_empty()
    }

    /// Entries whose handle has not been stopped
    pub fn live_count(&self) -> usize {
        self.state
            .lock()
            .entries
            .values()
            .filter(|entry| !entry.stopped)
            .count()
    }

    pub fn snapshot(&self) -> Vec<SubscriptionInfo> {
        let state = self.state.lock();
        let mut infos: Vec<SubscriptionInfo> = state
            .entries
            .iter()
            .map(|(id, entry)| SubscriptionInfo {
                id: id.clone(),
                filters: entry.filters.clone(),
                age: entry.created_at.elapsed(),
                stopped: entry.stopped,
            })
            .collect();
        infos.sort_by(|a, b| b.age.cmp(&a.age));
        infos
    }
}

fn stop_handle(id: &str, handle: &dyn SubscriptionHandle) {
    if let Err(e) = handle.stop() {
        warn!("[REGISTRY] failed to stop subscription {}: {}", id, e);
    }
}

fn teardown(id: &str, mut entry: RegistryEntry) {
    if let Some(cleanup) = entry.cleanup.take() {
        if let Err(e) = cleanup() {
            warn!("[REGISTRY] cleanup for subscription {} failed: {}", id, e);
        }
    }
    stop_handle(id, entry.handle.as_ref());
}

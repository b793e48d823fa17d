// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! Service container wiring every component from one [`SyncConfig`]

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use relay_sync_config::SyncConfig;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::batch::{AuthorBatchPlan, BatchPlan, DebouncedBatchCoordinator};
use crate::entry_cache::EntryCache;
use crate::environment::{EnvironmentSignalBus, LifecycleParticipant, MemoryProbe, Visibility};
use crate::event::{Event, Filter};
use crate::fetch::{
    AggregateFetcher, AggregateQuery, CounterSnapshot, FetchRequest, SettleReason,
    StreamingFetchController,
};
use crate::limiter::LimiterPool;
use crate::query_cache::{ApplicationQueryCache, PruneOnWrite};
use crate::registry::SubscriptionRegistry;
use crate::relay::RelayClient;

/// Event kind carrying actor metadata, batched by the profile coordinator
pub const PROFILE_KIND: u32 = 0;

pub struct SyncEngine {
    config: SyncConfig,
    relay: Arc<dyn RelayClient>,
    registry: Arc<SubscriptionRegistry>,
    limiters: Arc<LimiterPool>,
    controller: Arc<StreamingFetchController>,
    entry_cache: Arc<EntryCache<String, CounterSnapshot>>,
    counters: AggregateFetcher,
    query_cache: Arc<ApplicationQueryCache<Vec<Event>>>,
    profiles: Arc<DebouncedBatchCoordinator>,
    environment: Arc<EnvironmentSignalBus>,
    background: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    shut_down: AtomicBool,
}

impl fmt::Debug for SyncEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncEngine")
            .field("relay", &self.relay.name())
            .field("device", &self.config.device.class)
            .field("subscriptions", &self.registry.len())
            .field("shut_down", &self.shut_down.load(Ordering::SeqCst))
            .finish()
    }
}

impl SyncEngine {
    pub fn new(config: SyncConfig, relay: Arc<dyn RelayClient>) -> Self {
        Self::with_visibility(config, relay, Visibility::Visible)
    }

    pub fn with_visibility(
        config: SyncConfig,
        relay: Arc<dyn RelayClient>,
        initial: Visibility,
    ) -> Self {
        let registry = Arc::new(SubscriptionRegistry::new());
        let limiters = Arc::new(LimiterPool::new(&config.concurrency));
        let controller = Arc::new(StreamingFetchController::new(
            Arc::clone(&relay),
            Arc::clone(&registry),
            Arc::clone(&limiters),
            config.fetch.clone(),
        ));
        let entry_cache = Arc::new(EntryCache::from_config(&config.entry_cache));
        let counters = AggregateFetcher::new(Arc::clone(&controller), Arc::clone(&entry_cache));

        let query_cache = Arc::new(ApplicationQueryCache::from_config(&config.query_cache));
        query_cache.add_write_hook(Arc::new(PruneOnWrite));

        let profiles = DebouncedBatchCoordinator::new(
            "profiles",
            Arc::clone(&controller),
            Arc::new(AuthorBatchPlan::new([PROFILE_KIND])),
            &config.batch,
        );

        let environment = EnvironmentSignalBus::new(config.environment.clone(), initial);
        // Teardown order follows registration order
        environment.register(profiles.clone());
        environment.register(controller.clone());
        environment.register(registry.clone());
        environment.register(entry_cache.clone());
        environment.register(query_cache.clone());
        environment.register(limiters.clone());

        info!(
            "[ENGINE] created for {} ({} device profile)",
            relay.name(),
            config.device.class
        );

        Self {
            config,
            relay,
            registry,
            limiters,
            controller,
            entry_cache,
            counters,
            query_cache,
            profiles,
            environment,
            background: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
            shut_down: AtomicBool::new(false),
        }
    }

    /// Start the periodic query-cache sweep and, with a probe, the memory monitor
    pub fn start_background_tasks(&self, probe: Option<Arc<dyn MemoryProbe>>) {
        if self.is_shut_down() {
            return;
        }
        let mut tasks = self.tasks.lock();
        tasks.push(self.query_cache.start_periodic_sweep(
            self.config.query_cache.sweep_interval(),
            self.background.child_token(),
        ));
        if let Some(probe) = probe {
            tasks.push(
                self.environment
                    .start_memory_monitor(probe, self.background.child_token()),
            );
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn relay(&self) -> &Arc<dyn RelayClient> {
        &self.relay
    }

    pub fn registry(&self) -> &Arc<SubscriptionRegistry> {
        &self.registry
    }

    pub fn limiters(&self) -> &Arc<LimiterPool> {
        &self.limiters
    }

    pub fn controller(&self) -> &Arc<StreamingFetchController> {
        &self.controller
    }

    pub fn entry_cache(&self) -> &Arc<EntryCache<String, CounterSnapshot>> {
        &self.entry_cache
    }

    pub fn query_cache(&self) -> &Arc<ApplicationQueryCache<Vec<Event>>> {
        &self.query_cache
    }

    pub fn profiles(&self) -> &Arc<DebouncedBatchCoordinator> {
        &self.profiles
    }

    pub fn environment(&self) -> &Arc<EnvironmentSignalBus> {
        &self.environment
    }

    /// New batch coordinator sharing this engine's controller and lifecycle
    pub fn batcher(
        &self,
        name: impl Into<String>,
        plan: Arc<dyn BatchPlan>,
    ) -> Arc<DebouncedBatchCoordinator> {
        let batcher = DebouncedBatchCoordinator::new(
            name,
            Arc::clone(&self.controller),
            plan,
            &self.config.batch,
        );
        self.environment.register(batcher.clone());
        batcher
    }

    /// Register an additional participant for environment transitions
    pub fn register_participant(&self, participant: Arc<dyn LifecycleParticipant>) {
        self.environment.register(participant);
    }

    /// List fetch served from the application query cache when present
    ///
    /// Results that ran to completion or the deadline are cached under the
    /// filter's cache key.
    pub async fn fetch_cached(&self, filter: Filter) -> Vec<Event> {
        let key = filter.cache_key();
        if let Some(hit) = self.query_cache.get(&key) {
            return hit;
        }

        let settlement = self.controller.fetch(FetchRequest::list(filter)).await;
        if matches!(
            settlement.reason,
            SettleReason::Completed | SettleReason::Timeout
        ) {
            self.query_cache.insert(key, settlement.items.clone());
        }
        settlement.items
    }

    pub async fn counts(&self, query: &AggregateQuery) -> CounterSnapshot {
        self.counters.counts(query).await
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    /// Stop background tasks and tear every component down; idempotent
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        self.background.cancel();
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        self.environment.teardown();
        info!("[ENGINE] shut down");
    }
}

impl Drop for SyncEngine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::MemoryRelay;

    fn engine(relay: Arc<MemoryRelay>) -> SyncEngine {
        SyncEngine::new(SyncConfig::default(), relay)
    }

    #[tokio::test(start_paused = true)]
    async fn test_fetch_cached_reuses_result() {
        let relay = Arc::new(MemoryRelay::new("mem"));
        relay.store(Event::new("a", "alice", 1, 1));
        let engine = engine(relay.clone());

        let first = engine.fetch_cached(Filter::new().kind(1)).await;
        let second = engine.fetch_cached(Filter::new().kind(1)).await;

        assert_eq!(first, second);
        assert_eq!(first.len(), 1);
        assert_eq!(relay.subscription_count(), 1);
    }

    #[tokio::test]
    async fn test_every_component_is_a_participant() {
        let engine = engine(Arc::new(MemoryRelay::new("mem")));
        assert_eq!(
            engine.environment().participant_names(),
            vec![
                "profiles",
                "fetch-controller",
                "registry",
                "entry-cache",
                "query-cache",
                "limiters"
            ]
        );
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent() {
        let engine = engine(Arc::new(MemoryRelay::new("mem")));
        engine.start_background_tasks(None);

        engine.shutdown();
        assert!(engine.is_shut_down());
        assert!(engine.environment().is_torn_down());
        engine.shutdown();
    }
}

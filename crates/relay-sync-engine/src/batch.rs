// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! Debounced request batching
//!
//! Keys added within the debounce window are drained together into a single
//! fetch. Keys that were already requested recently are skipped unless a
//! subscriber asked for them through [`DebouncedBatchCoordinator::request`];
//! that memory is cleared every `requested_reset`. Events are routed to
//! per-key subscribers as the batch streams, not at settlement.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;

use ahash::{AHashMap, AHashSet};
use parking_lot::Mutex;
use relay_sync_config::BatchConfig;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::event::{Event, Filter};
use crate::fetch::{FetchHandle, FetchRequest, Settlement, StreamingFetchController};
use crate::limiter::ResourceClass;

/// Maps batched keys to filters and events back to keys
pub trait BatchPlan: Send + Sync {
    fn filters_for(&self, keys: &[String]) -> Vec<Filter>;

    /// Key an arriving event belongs to, if any
    fn route_key(&self, event: &Event) -> Option<String>;
}

/// Batches actor identifiers into one `authors` filter (e.g. profile metadata)
#[derive(Debug, Clone, Default)]
pub struct AuthorBatchPlan {
    kinds: Vec<u32>,
}

impl AuthorBatchPlan {
    pub fn new(kinds: impl IntoIterator<Item = u32>) -> Self {
        Self {
            kinds: kinds.into_iter().collect(),
        }
    }
}

impl BatchPlan for AuthorBatchPlan {
    fn filters_for(&self, keys: &[String]) -> Vec<Filter> {
        let mut filter = Filter::new().authors(keys.iter().cloned());
        if !self.kinds.is_empty() {
            filter = filter.kinds(self.kinds.iter().copied());
        }
        vec![filter]
    }

    fn route_key(&self, event: &Event) -> Option<String> {
        Some(event.pubkey.clone())
    }
}

struct BatchState {
    pending: BTreeSet<String>,
    requested: AHashSet<String>,
    /// Fetched on the next flush even if already requested
    forced: AHashSet<String>,
    requested_since: Instant,
    /// Bumped on every add and cancel; a timer only flushes its own generation
    generation: u64,
    timer: Option<JoinHandle<()>>,
    in_flight: Vec<FetchHandle>,
    subscribers: AHashMap<String, Vec<mpsc::UnboundedSender<Event>>>,
    batches_issued: u64,
}

pub struct DebouncedBatchCoordinator {
    name: String,
    controller: Arc<StreamingFetchController>,
    plan: Arc<dyn BatchPlan>,
    debounce: Duration,
    requested_reset: Duration,
    state: Mutex<BatchState>,
    me: Weak<Self>,
}

impl fmt::Debug for DebouncedBatchCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("DebouncedBatchCoordinator")
            .field("name", &self.name)
            .field("pending", &state.pending.len())
            .field("in_flight", &state.in_flight.len())
            .field("batches_issued", &state.batches_issued)
            .finish()
    }
}

impl DebouncedBatchCoordinator {
    pub fn new(
        name: impl Into<String>,
        controller: Arc<StreamingFetchController>,
        plan: Arc<dyn BatchPlan>,
        config: &BatchConfig,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            name: name.into(),
            controller,
            plan,
            debounce: config.debounce(),
            requested_reset: config.requested_reset(),
            state: Mutex::new(BatchState {
                pending: BTreeSet::new(),
                requested: AHashSet::new(),
                forced: AHashSet::new(),
                requested_since: Instant::now(),
                generation: 0,
                timer: None,
                in_flight: Vec::new(),
                subscribers: AHashMap::new(),
                batches_issued: 0,
            }),
            me: me.clone(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Queue `key` and restart the debounce timer
    pub fn add(&self, key: impl Into<String>) {
        let mut state = self.state.lock();
        state.pending.insert(key.into());
        state.generation += 1;
        let generation = state.generation;

        if let Some(timer) = state.timer.take() {
            timer.abort();
        }
        let me = self.me.clone();
        let debounce = self.debounce;
        state.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(debounce).await;
            if let Some(coordinator) = me.upgrade() {
                coordinator.flush(generation);
            }
        }));
    }

    /// Receive events for `key` from batches issued from now on
    pub fn subscribe(&self, key: impl Into<String>) -> mpsc::UnboundedReceiver<Event> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.state
            .lock()
            .subscribers
            .entry(key.into())
            .or_default()
            .push(tx);
        rx
    }

    /// Subscribe to `key` and queue it
    ///
    /// The key is fetched again even if a recent batch already covered it,
    /// so a late subscriber still receives its events.
    pub fn request(&self, key: impl Into<String>) -> mpsc::UnboundedReceiver<Event> {
        let key = key.into();
        let rx = self.subscribe(key.clone());
        self.state.lock().forced.insert(key.clone());
        self.add(key);
        rx
    }

    /// Stop in-flight batches and drop the timer and pending keys
    pub fn cancel(&self) {
        let (timer, in_flight, dropped) = {
            let mut state = self.state.lock();
            state.generation += 1;
            let dropped = state.pending.len();
            state.pending.clear();
            state.requested.clear();
            state.forced.clear();
            prune_closed(&mut state.subscribers);
            (state.timer.take(), std::mem::take(&mut state.in_flight), dropped)
        };

        if let Some(timer) = timer {
            timer.abort();
        }
        let stopped = in_flight.len();
        for handle in in_flight {
            handle.cancel();
        }
        if stopped > 0 || dropped > 0 {
            info!(
                "[BATCH] {} cancelled: {} in-flight batches stopped, {} pending keys dropped",
                self.name, stopped, dropped
            );
        }
    }

    pub fn pending_len(&self) -> usize {
        self.state.lock().pending.len()
    }

    pub fn batches_issued(&self) -> u64 {
        self.state.lock().batches_issued
    }

    pub fn in_flight(&self) -> usize {
        self.state
            .lock()
            .in_flight
            .iter()
            .filter(|h| !h.is_finished())
            .count()
    }

    pub fn is_requested(&self, key: &str) -> bool {
        self.state.lock().requested.contains(key)
    }

    /// Keys with at least one live subscriber
    pub fn subscribed_keys(&self) -> usize {
        self.state.lock().subscribers.len()
    }

    fn flush(&self, generation: u64) {
        let keys: Vec<String> = {
            let mut state = self.state.lock();
            if state.generation != generation {
                return;
            }
            state.timer = None;

            if state.requested_since.elapsed() >= self.requested_reset {
                state.requested.clear();
                state.requested_since = Instant::now();
            }
            let state = &mut *state;
            let drained = std::mem::take(&mut state.pending);
            drained
                .into_iter()
                .filter(|key| {
                    let forced = state.forced.remove(key);
                    let fresh = state.requested.insert(key.clone());
                    forced || fresh
                })
                .collect()
        };

        if keys.is_empty() {
            debug!("[BATCH] {} flush found only already-requested keys", self.name);
            return;
        }
        self.issue(keys);
    }

    fn issue(&self, keys: Vec<String>) {
        let request =
            FetchRequest::list_many(self.plan.filters_for(&keys)).with_class(ResourceClass::Batch);

        let on_event = self.me.clone();
        let on_settle = self.me.clone();
        let mut routed: AHashSet<String> = AHashSet::new();
        let batch_keys = keys.clone();
        let handle = self.controller.start(
            request,
            move |snapshot: &[Event]| {
                let Some(coordinator) = on_event.upgrade() else {
                    return;
                };
                for event in snapshot {
                    if routed.insert(event.id.clone()) {
                        coordinator.route(event);
                    }
                }
            },
            move |settlement: Settlement| {
                if let Some(coordinator) = on_settle.upgrade() {
                    coordinator.batch_settled(&settlement, &batch_keys);
                }
            },
        );

        let mut state = self.state.lock();
        state.batches_issued += 1;
        state.in_flight.retain(|h| !h.is_finished());
        if !handle.is_finished() {
            state.in_flight.push(handle);
        }
        info!("[BATCH] {} issued batch of {} keys", self.name, keys.len());
    }

    fn route(&self, event: &Event) {
        let Some(key) = self.plan.route_key(event) else {
            return;
        };
        let mut state = self.state.lock();
        let emptied = match state.subscribers.get_mut(&key) {
            Some(senders) => {
                senders.retain(|tx| tx.send(event.clone()).is_ok());
                senders.is_empty()
            }
            None => false,
        };
        if emptied {
            state.subscribers.remove(&key);
        }
    }

    fn batch_settled(&self, settlement: &Settlement, keys: &[String]) {
        debug!(
            "[BATCH] {} batch {} settled {:?} with {} events",
            self.name,
            settlement.fetch_id,
            settlement.reason,
            settlement.items.len()
        );
        let mut state = self.state.lock();
        state.in_flight.retain(|h| h.id() != settlement.fetch_id);
        for key in keys {
            let emptied = match state.subscribers.get_mut(key) {
                Some(senders) => {
                    senders.retain(|tx| !tx.is_closed());
                    senders.is_empty()
                }
                None => false,
            };
            if emptied {
                state.subscribers.remove(key);
            }
        }
    }
}

/// Forget senders whose receivers are gone
fn prune_closed(subscribers: &mut AHashMap<String, Vec<mpsc::UnboundedSender<Event>>>) {
    subscribers.retain(|_, senders| {
        senders.retain(|tx| !tx.is_closed());
        !senders.is_empty()
    });
}

impl Drop for DebouncedBatchCoordinator {
    fn drop(&mut self) {
        if let Some(timer) = self.state.get_mut().timer.take() {
            timer.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::limiter::LimiterPool;
    use crate::registry::SubscriptionRegistry;
    use crate::relay::MemoryRelay;
    use relay_sync_config::{ConcurrencyConfig, FetchConfig};

    fn coordinator(relay: Arc<MemoryRelay>) -> Arc<DebouncedBatchCoordinator> {
        let controller = Arc::new(StreamingFetchController::new(
            relay,
            Arc::new(SubscriptionRegistry::new()),
            Arc::new(LimiterPool::new(&ConcurrencyConfig::default())),
            FetchConfig::default(),
        ));
        DebouncedBatchCoordinator::new(
            "profiles",
            controller,
            Arc::new(AuthorBatchPlan::new([0])),
            &BatchConfig::default(),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_each_add_restarts_the_timer() {
        let relay = Arc::new(MemoryRelay::new("mem"));
        let batcher = coordinator(relay.clone());

        batcher.add("a");
        tokio::time::sleep(Duration::from_millis(80)).await;
        batcher.add("b");
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(relay.subscription_count(), 0);
        assert_eq!(batcher.pending_len(), 2);

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(relay.subscription_count(), 1);
        assert_eq!(batcher.pending_len(), 0);
        assert_eq!(batcher.batches_issued(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_already_requested_keys_are_skipped() {
        let relay = Arc::new(MemoryRelay::new("mem"));
        let batcher = coordinator(relay.clone());

        batcher.add("a");
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(batcher.is_requested("a"));

        batcher.add("a");
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(relay.subscription_count(), 1);

        batcher.add("a");
        batcher.add("d");
        tokio::time::sleep(Duration::from_millis(150)).await;
        let opened = relay.opened_subscriptions();
        assert_eq!(opened.len(), 2);
        assert_eq!(opened[1][0].authors, Some(vec!["d".to_string()]));
    }

    #[tokio::test(start_paused = true)]
    async fn test_requested_set_is_reset_periodically() {
        let relay = Arc::new(MemoryRelay::new("mem"));
        let batcher = coordinator(relay.clone());

        batcher.add("a");
        tokio::time::sleep(Duration::from_millis(150)).await;
        tokio::time::sleep(BatchConfig::default().requested_reset()).await;

        batcher.add("a");
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(relay.subscription_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_events_routed_to_key_subscribers() {
        let relay = Arc::new(MemoryRelay::new("mem"));
        relay.store_all([
            Event::new("pa", "a", 1, 0),
            Event::new("pb", "b", 1, 0),
        ]);
        let batcher = coordinator(relay);

        let mut rx_a = batcher.request("a");
        batcher.add("b");
        tokio::time::sleep(Duration::from_millis(150)).await;

        // Delivered while the batch is still in its grace period
        assert_eq!(batcher.in_flight(), 1);
        assert_eq!(rx_a.try_recv().map(|e| e.id).ok(), Some("pa".to_string()));
        assert!(rx_a.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_request_refetches_already_requested_key() {
        let relay = Arc::new(MemoryRelay::new("mem"));
        relay.store(Event::new("pa", "a", 1, 0));
        let batcher = coordinator(relay.clone());

        let mut first = batcher.request("a");
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(first.try_recv().map(|e| e.id).ok(), Some("pa".to_string()));
        assert_eq!(batcher.in_flight(), 0);
        assert!(batcher.is_requested("a"));

        let mut second = batcher.request("a");
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(second.try_recv().map(|e| e.id).ok(), Some("pa".to_string()));
        assert_eq!(relay.subscription_count(), 2);

        // Plain adds still respect the requested set
        batcher.add("a");
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(relay.subscription_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_subscribers_are_forgotten_after_settle() {
        let relay = Arc::new(MemoryRelay::new("mem"));
        let batcher = coordinator(relay);

        for i in 0..500 {
            drop(batcher.request(format!("unknown-{}", i)));
        }
        let _kept = batcher.request("kept");
        assert_eq!(batcher.subscribed_keys(), 501);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(batcher.in_flight(), 0);
        assert_eq!(batcher.subscribed_keys(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_forgets_dropped_subscribers() {
        let relay = Arc::new(MemoryRelay::new("mem"));
        let batcher = coordinator(relay);

        drop(batcher.request("gone"));
        let _kept = batcher.request("kept");
        batcher.cancel();

        assert_eq!(batcher.subscribed_keys(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_clears_pending_and_in_flight() {
        let relay = Arc::new(MemoryRelay::new("mem"));
        let batcher = coordinator(relay.clone());

        batcher.add("a");
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(relay.active_count(), 1);

        batcher.add("b");
        batcher.cancel();
        assert_eq!(batcher.pending_len(), 0);
        assert_eq!(relay.active_count(), 0);

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(relay.subscription_count(), 1);
    }
}

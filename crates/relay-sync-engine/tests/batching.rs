// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! Debounced batching and concurrency gating end to end

use std::sync::Arc;
use std::time::Duration;

use relay_sync_config::{BatchConfig, ConcurrencyConfig, FetchConfig};
use relay_sync_engine::{
    AuthorBatchPlan, ConcurrencyLimiter, DebouncedBatchCoordinator, Event, LimiterPool,
    MemoryRelay, QueueOutcome, ResourceClass, StreamingFetchController, SubscriptionRegistry,
};

fn setup(relay: Arc<MemoryRelay>, concurrency: ConcurrencyConfig) -> (Arc<DebouncedBatchCoordinator>, Arc<LimiterPool>) {
    let limiters = Arc::new(LimiterPool::new(&concurrency));
    let controller = Arc::new(StreamingFetchController::new(
        relay,
        Arc::new(SubscriptionRegistry::new()),
        Arc::clone(&limiters),
        FetchConfig::default(),
    ));
    let batcher = DebouncedBatchCoordinator::new(
        "profiles",
        controller,
        Arc::new(AuthorBatchPlan::new([0])),
        &BatchConfig::default(),
    );
    (batcher, limiters)
}

#[tokio::test(start_paused = true)]
async fn test_five_adds_produce_one_batch_with_the_union() {
    let relay = Arc::new(MemoryRelay::new("mem"));
    let (batcher, _) = setup(relay.clone(), ConcurrencyConfig::default());

    for key in ["carol", "alice", "bob", "alice", "carol"] {
        batcher.add(key);
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    tokio::time::sleep(Duration::from_millis(200)).await;

    let opened = relay.opened_subscriptions();
    assert_eq!(opened.len(), 1);
    assert_eq!(
        opened[0][0].authors,
        Some(vec!["alice".to_string(), "bob".to_string(), "carol".to_string()])
    );
    assert_eq!(batcher.batches_issued(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_keys_added_during_a_batch_start_a_new_cycle() {
    let relay = Arc::new(MemoryRelay::new("mem"));
    let (batcher, _) = setup(relay.clone(), ConcurrencyConfig::default());

    batcher.add("alice");
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(batcher.in_flight(), 1);

    batcher.add("bob");
    tokio::time::sleep(Duration::from_millis(150)).await;

    assert_eq!(relay.subscription_count(), 2);
    assert_eq!(batcher.in_flight(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_batches_queue_behind_the_batch_limiter() {
    let relay = Arc::new(MemoryRelay::new("mem"));
    relay.store(Event::new("p1", "alice", 1, 0));
    let (batcher, limiters) = setup(
        relay.clone(),
        ConcurrencyConfig {
            batch: 1,
            ..ConcurrencyConfig::default()
        },
    );

    batcher.add("alice");
    tokio::time::sleep(Duration::from_millis(150)).await;
    batcher.add("bob");
    tokio::time::sleep(Duration::from_millis(150)).await;

    // Second batch waits for the first one's slot
    assert_eq!(relay.subscription_count(), 1);
    assert_eq!(limiters.get(ResourceClass::Batch).stats().queued, 1);

    // First batch settles after its grace period and hands over the slot
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(relay.subscription_count(), 2);
}

#[test]
fn test_limiter_queue_drops_oldest_without_running_it() {
    let limiter = ConcurrencyLimiter::new("list", 1, 2);
    let ran = Arc::new(parking_lot::Mutex::new(Vec::new()));
    let record = |label: &'static str| {
        let ran = Arc::clone(&ran);
        Box::new(move || ran.lock().push(label)) as Box<dyn FnOnce() + Send>
    };

    assert_eq!(limiter.queue(record("first")), QueueOutcome::Started);
    assert_eq!(limiter.queue(record("second")), QueueOutcome::Queued);
    assert_eq!(limiter.queue(record("third")), QueueOutcome::Queued);
    assert_eq!(limiter.queue(record("fourth")), QueueOutcome::QueuedDroppedOldest);

    limiter.end();
    limiter.end();
    assert_eq!(*ran.lock(), vec!["first", "third", "fourth"]);
    assert_eq!(limiter.stats().dropped, 1);
}

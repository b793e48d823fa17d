// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! Streaming fetch behaviour against in-process relays

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use relay_sync_config::{ConcurrencyConfig, FetchConfig};
use relay_sync_engine::{
    Event, FetchHandle, FetchRequest, FetchState, Filter, LimiterPool, MemoryRelay, RacingRelay,
    RelayClient, SettleReason, Settlement, StreamingFetchController, SubscriptionRegistry,
};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

#[derive(Default)]
struct Recorder {
    increments: Mutex<Vec<Vec<String>>>,
    settlements: Mutex<Vec<Settlement>>,
}

impl Recorder {
    fn increment_count(&self) -> usize {
        self.increments.lock().len()
    }

    fn settle_count(&self) -> usize {
        self.settlements.lock().len()
    }

    fn settlement(&self) -> Settlement {
        self.settlements.lock()[0].clone()
    }
}

fn ids(events: &[Event]) -> Vec<String> {
    events.iter().map(|e| e.id.clone()).collect()
}

fn controller_with(relay: Arc<dyn RelayClient>, config: FetchConfig) -> StreamingFetchController {
    StreamingFetchController::new(
        relay,
        Arc::new(SubscriptionRegistry::new()),
        Arc::new(LimiterPool::new(&ConcurrencyConfig::default())),
        config,
    )
}

fn controller(relay: Arc<dyn RelayClient>) -> StreamingFetchController {
    controller_with(relay, FetchConfig::default())
}

fn start(
    controller: &StreamingFetchController,
    request: FetchRequest,
    recorder: &Arc<Recorder>,
) -> FetchHandle {
    let on_increment = Arc::clone(recorder);
    let on_settle = Arc::clone(recorder);
    controller.start(
        request,
        move |snapshot| on_increment.increments.lock().push(ids(snapshot)),
        move |settlement| on_settle.settlements.lock().push(settlement),
    )
}

fn sources(fast: Arc<MemoryRelay>, slow: Arc<MemoryRelay>) -> Vec<Arc<dyn RelayClient>> {
    vec![fast as Arc<dyn RelayClient>, slow]
}

fn note(id: &str, at: u64) -> Event {
    Event::new(id, "alice", at, 1)
}

#[tokio::test(start_paused = true)]
async fn test_list_settles_newest_first() {
    let relay = Arc::new(MemoryRelay::new("mem"));
    relay.store_all([note("A", 10), note("B", 5)]);
    let controller = controller(relay);
    let recorder = Arc::new(Recorder::default());

    start(&controller, FetchRequest::list(Filter::new().author("alice")), &recorder);
    tokio::time::sleep(Duration::from_secs(2)).await;

    let settlement = recorder.settlement();
    assert_eq!(settlement.reason, SettleReason::Completed);
    assert_eq!(ids(&settlement.items), vec!["A", "B"]);
    // Every increment carries the full snapshot
    assert_eq!(
        *recorder.increments.lock(),
        vec![vec!["A".to_string()], vec!["A".to_string(), "B".to_string()]]
    );
}

#[tokio::test(start_paused = true)]
async fn test_oldest_first_ordering() {
    let relay = Arc::new(MemoryRelay::new("mem"));
    relay.store_all([note("A", 10), note("B", 5), note("C", 7)]);
    let controller = controller(relay);

    let settlement = controller
        .fetch(FetchRequest::list(Filter::new().author("alice")).oldest_first())
        .await;
    assert_eq!(ids(&settlement.items), vec!["B", "C", "A"]);
}

#[tokio::test(start_paused = true)]
async fn test_single_item_times_out_after_single_timeout() {
    let relay = Arc::new(MemoryRelay::new("mem"));
    relay.store(note("other", 1));
    let controller = controller(relay);

    let started = Instant::now();
    let settlement = controller
        .fetch(FetchRequest::single(Filter::new().id("missing")))
        .await;

    assert_eq!(settlement.reason, SettleReason::Timeout);
    assert!(settlement.first().is_none());
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_secs(2));
    assert!(elapsed < Duration::from_secs(3));
}

#[tokio::test(start_paused = true)]
async fn test_cancel_suppresses_settle_and_increments() {
    let relay = Arc::new(MemoryRelay::new("mem").without_end_signal());
    relay.store(note("A", 10));
    let controller = controller(relay.clone());
    let recorder = Arc::new(Recorder::default());

    let handle = start(&controller, FetchRequest::list(Filter::new().kind(1)), &recorder);
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(recorder.increment_count(), 1);

    handle.cancel();
    relay.publish(note("B", 20));
    tokio::time::sleep(Duration::from_secs(15)).await;

    assert_eq!(handle.state(), FetchState::Cancelled);
    assert_eq!(recorder.increment_count(), 1);
    assert_eq!(recorder.settle_count(), 0);
    assert_eq!(relay.active_count(), 0);
    assert!(controller.registry().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_external_abort_delivers_partial_result() {
    let relay = Arc::new(MemoryRelay::new("mem").without_end_signal());
    relay.store(note("A", 10));
    let controller = controller(relay.clone());
    let recorder = Arc::new(Recorder::default());
    let abort = CancellationToken::new();

    let handle = start(
        &controller,
        FetchRequest::list(Filter::new().kind(1)).with_abort(abort.clone()),
        &recorder,
    );
    tokio::time::sleep(Duration::from_millis(10)).await;
    abort.cancel();
    tokio::time::sleep(Duration::from_millis(10)).await;

    assert_eq!(recorder.settle_count(), 1);
    let settlement = recorder.settlement();
    assert_eq!(settlement.reason, SettleReason::Aborted);
    assert_eq!(ids(&settlement.items), vec!["A"]);
    assert_eq!(handle.state(), FetchState::Cancelled);
    assert_eq!(relay.active_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_racing_sources_merge_without_duplicates() {
    let fast = Arc::new(MemoryRelay::new("cache"));
    fast.store_all([note("A", 10), note("B", 5)]);
    let slow = Arc::new(MemoryRelay::new("network").with_delay(Duration::from_millis(500)));
    slow.store_all([note("A", 10), note("B", 5), note("C", 7)]);
    let racing = Arc::new(RacingRelay::new("racing", sources(fast, slow)));
    let controller = controller(racing);
    let recorder = Arc::new(Recorder::default());

    let started = Instant::now();
    start(&controller, FetchRequest::list(Filter::new().kind(1)), &recorder);
    tokio::time::sleep(Duration::from_secs(3)).await;

    let settlement = recorder.settlement();
    assert_eq!(settlement.reason, SettleReason::Completed);
    assert_eq!(ids(&settlement.items), vec!["A", "C", "B"]);
    // Re-delivered A and B produce no increments
    assert_eq!(recorder.increment_count(), 3);
    assert_eq!(recorder.settle_count(), 1);
    assert!(started.elapsed() >= Duration::from_secs(1));
}

#[tokio::test(start_paused = true)]
async fn test_source_slower_than_grace_is_left_out() {
    let fast = Arc::new(MemoryRelay::new("cache"));
    fast.store(note("A", 10));
    let slow = Arc::new(MemoryRelay::new("network").with_delay(Duration::from_millis(1500)));
    slow.store(note("late", 20));
    let racing = Arc::new(RacingRelay::new("racing", sources(fast, slow)));
    let controller = controller(racing);

    let settlement = controller.fetch(FetchRequest::list(Filter::new().kind(1))).await;
    assert_eq!(ids(&settlement.items), vec!["A"]);
}

#[tokio::test(start_paused = true)]
async fn test_small_seen_set_never_duplicates_results() {
    let fast = Arc::new(MemoryRelay::new("cache"));
    let slow = Arc::new(MemoryRelay::new("network").with_delay(Duration::from_millis(200)));
    for i in 0..5 {
        fast.store(note(&format!("n{}", i), i));
        slow.store(note(&format!("n{}", i), i));
    }
    let racing = Arc::new(RacingRelay::new("racing", sources(fast, slow)));
    let controller = controller_with(
        racing,
        FetchConfig {
            seen_cap: 2,
            ..FetchConfig::default()
        },
    );

    let settlement = controller.fetch(FetchRequest::list(Filter::new().kind(1))).await;
    assert_eq!(ids(&settlement.items), vec!["n4", "n3", "n2", "n1", "n0"]);
}

#[tokio::test(start_paused = true)]
async fn test_settles_exactly_once_despite_late_cancel_and_abort() {
    let relay = Arc::new(MemoryRelay::new("mem"));
    relay.store(note("A", 10));
    let controller = controller(relay);
    let recorder = Arc::new(Recorder::default());

    let handle = start(&controller, FetchRequest::list(Filter::new().kind(1)), &recorder);
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(handle.state(), FetchState::Settled);

    handle.abort();
    handle.cancel();
    tokio::time::sleep(Duration::from_secs(2)).await;

    assert_eq!(recorder.settle_count(), 1);
    assert_eq!(handle.state(), FetchState::Settled);
}

#[tokio::test(start_paused = true)]
async fn test_invalid_filter_never_reaches_relay() {
    let relay = Arc::new(MemoryRelay::new("mem"));
    let controller = controller(relay.clone());

    let settlement = controller
        .fetch(FetchRequest::list(Filter::new().kind(1).limit(0)))
        .await;

    assert_eq!(settlement.reason, SettleReason::Invalid);
    assert!(settlement.items.is_empty());
    assert_eq!(relay.subscription_count(), 0);
    assert_eq!(relay.connect_attempts(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_failed_list_reports_could_not_load() {
    let relay = Arc::new(MemoryRelay::new("down"));
    relay.set_offline(true);
    let controller = controller_with(
        relay,
        FetchConfig {
            connect_retries: 0,
            ..FetchConfig::default()
        },
    );

    let settlement = controller.fetch(FetchRequest::list(Filter::new().kind(1))).await;
    assert!(settlement.could_not_load());
}

#[tokio::test(start_paused = true)]
async fn test_one_active_subscription_per_key() {
    let relay = Arc::new(MemoryRelay::new("mem").without_end_signal());
    let controller = controller(relay.clone());
    let recorder = Arc::new(Recorder::default());

    for author in ["alice", "bob", "carol"] {
        let on_settle = Arc::clone(&recorder);
        controller.start_keyed(
            "profile-feed",
            FetchRequest::list(Filter::new().author(author)),
            |_| {},
            move |s| on_settle.settlements.lock().push(s),
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(relay.active_count(), 1);
    }

    assert_eq!(relay.subscription_count(), 3);
    assert_eq!(recorder.settle_count(), 0);
    assert_eq!(controller.registry().len(), 1);
}

// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! In-process relay
//!
//! Each subscription replays stored matches newest first (honouring every
//! filter's `limit`), sends an end-signal, then forwards live events passed
//! to [`MemoryRelay::publish`]. Delivery delay, connection failures and
//! failing stops can be injected, and every subscription opened is recorded.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use ahash::AHashSet;
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{RelayClient, RelayMessage, RelaySubscription, SubscriptionHandle};
use crate::error::{EngineError, Result};
use crate::event::{any_matches, Event, Filter};

const LIVE_CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Default)]
struct RelayCounters {
    connect_attempts: AtomicUsize,
    stops: AtomicUsize,
}

pub struct MemoryRelay {
    name: String,
    stored: RwLock<Vec<Event>>,
    live: broadcast::Sender<Event>,
    delay: Duration,
    send_end_signal: bool,
    offline: AtomicBool,
    failing_connects: AtomicUsize,
    failing_stops: Arc<AtomicBool>,
    opened: Mutex<Vec<Vec<Filter>>>,
    counters: Arc<RelayCounters>,
}

impl std::fmt::Debug for MemoryRelay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryRelay")
            .field("name", &self.name)
            .field("stored", &self.stored.read().len())
            .field("delay", &self.delay)
            .finish()
    }
}

impl MemoryRelay {
    pub fn new(name: impl Into<String>) -> Self {
        let (live, _) = broadcast::channel(LIVE_CHANNEL_CAPACITY);
        Self {
            name: name.into(),
            stored: RwLock::new(Vec::new()),
            live,
            delay: Duration::ZERO,
            send_end_signal: true,
            offline: AtomicBool::new(false),
            failing_connects: AtomicUsize::new(0),
            failing_stops: Arc::new(AtomicBool::new(false)),
            opened: Mutex::new(Vec::new()),
            counters: Arc::new(RelayCounters::default()),
        }
    }

    /// Wait this long before replaying stored events
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Never send an end-signal (a source that cannot tell when it is done)
    pub fn without_end_signal(mut self) -> Self {
        self.send_end_signal = false;
        self
    }

    pub fn store(&self, event: Event) {
        self.stored.write().push(event);
    }

    pub fn store_all<I: IntoIterator<Item = Event>>(&self, events: I) {
        self.stored.write().extend(events);
    }

    /// Store `event` and deliver it to every open subscription it matches
    pub fn publish(&self, event: Event) {
        self.stored.write().push(event.clone());
        // No receivers is fine
        let _ = self.live.send(event);
    }

    /// Refuse every connection until set back to false
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Fail the next `count` connection attempts
    pub fn fail_next_connects(&self, count: usize) {
        self.failing_connects.store(count, Ordering::SeqCst);
    }

    /// Make `stop()` on subscription handles report an error
    pub fn set_failing_stops(&self, failing: bool) {
        self.failing_stops.store(failing, Ordering::SeqCst);
    }

    /// Filter sets of every subscription opened so far
    pub fn opened_subscriptions(&self) -> Vec<Vec<Filter>> {
        self.opened.lock().clone()
    }

    pub fn subscription_count(&self) -> usize {
        self.opened.lock().len()
    }

    pub fn stop_count(&self) -> usize {
        self.counters.stops.load(Ordering::SeqCst)
    }

    pub fn connect_attempts(&self) -> usize {
        self.counters.connect_attempts.load(Ordering::SeqCst)
    }

    /// Subscriptions opened and not yet stopped
    pub fn active_count(&self) -> usize {
        self.subscription_count().saturating_sub(self.stop_count())
    }

    /// Stored matches, newest first, each filter's limit applied separately
    fn replay_set(&self, filters: &[Filter]) -> Vec<Event> {
        let stored = self.stored.read();
        let mut seen: AHashSet<&str> = AHashSet::new();
        let mut selected: Vec<Event> = Vec::new();

        for filter in filters {
            let mut matches: Vec<&Event> = stored.iter().filter(|e| filter.matches(e)).collect();
            matches.sort_by(|a, b| b.created_at.cmp(&a.created_at));
            let limit = filter.limit.unwrap_or(usize::MAX);
            for event in matches.into_iter().take(limit) {
                if seen.insert(event.id.as_str()) {
                    selected.push(event.clone());
                }
            }
        }

        selected.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        selected
    }
}

#[async_trait]
impl RelayClient for MemoryRelay {
    fn name(&self) -> &str {
        &self.name
    }

    async fn ensure_connected(&self) -> Result<()> {
        self.counters.connect_attempts.fetch_add(1, Ordering::SeqCst);
        if self.offline.load(Ordering::SeqCst) {
            return Err(EngineError::Connection(format!("{} is offline", self.name)));
        }
        let remaining = self.failing_connects.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failing_connects.store(remaining - 1, Ordering::SeqCst);
            return Err(EngineError::Connection(format!(
                "{} refused connection",
                self.name
            )));
        }
        Ok(())
    }

    async fn subscribe(&self, filters: Vec<Filter>) -> Result<RelaySubscription> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(EngineError::Connection(format!("{} is offline", self.name)));
        }

        // Subscribe to live events before taking the replay snapshot so
        // nothing published in between is missed
        let mut live_rx = self.live.subscribe();
        let replay = self.replay_set(&filters);
        self.opened.lock().push(filters.clone());

        let (tx, rx) = mpsc::unbounded_channel();
        let token = CancellationToken::new();
        let handle = Arc::new(MemoryHandle {
            token: token.clone(),
            stopped: AtomicBool::new(false),
            failing: Arc::clone(&self.failing_stops),
            counters: Arc::clone(&self.counters),
        });

        let delay = self.delay;
        let send_end_signal = self.send_end_signal;
        let name = self.name.clone();

        tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::select! {
                    _ = token.cancelled() => return,
                    _ = tokio::time::sleep(delay) => {}
                }
            }

            for event in replay {
                if token.is_cancelled() || tx.send(RelayMessage::Event(event)).is_err() {
                    return;
                }
            }
            if send_end_signal && tx.send(RelayMessage::EndOfStoredEvents).is_err() {
                return;
            }

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    received = live_rx.recv() => match received {
                        Ok(event) => {
                            if any_matches(&filters, &event)
                                && tx.send(RelayMessage::Event(event)).is_err()
                            {
                                break;
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            debug!("[RELAY] {} subscriber lagged, skipped {} live events", name, skipped);
                        }
                        Err(broadcast::error::RecvError::Closed) => {
                            let _ = tx.send(RelayMessage::Closed(format!("{} shut down", name)));
                            break;
                        }
                    }
                }
            }
        });

        Ok(RelaySubscription {
            messages: rx,
            handle,
        })
    }
}

struct MemoryHandle {
    token: CancellationToken,
    stopped: AtomicBool,
    failing: Arc<AtomicBool>,
    counters: Arc<RelayCounters>,
}

impl SubscriptionHandle for MemoryHandle {
    fn stop(&self) -> Result<()> {
        if !self.stopped.swap(true, Ordering::SeqCst) {
            self.token.cancel();
            self.counters.stops.fetch_add(1, Ordering::SeqCst);
            if self.failing.load(Ordering::SeqCst) {
                return Err(EngineError::Teardown("relay rejected close".to_string()));
            }
        }
        Ok(())
    }

    fn is_active(&self) -> bool {
        !self.stopped.load(Ordering::SeqCst)
    }
}

// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! Streaming fetch controller
//!
//! Every fetch follows the same pattern: gate on a concurrency slot, connect,
//! open one subscription through the registry, merge arriving events into an
//! ordered accumulator (dropping duplicates), and settle exactly once when
//! the grace period after the first end-signal elapses, a match is found, a
//! deadline passes, or the stream ends.
//!
//! Two ways to stop a fetch early:
//! - [`FetchHandle::cancel`] is caller teardown: the settle callback is
//!   suppressed.
//! - [`FetchHandle::abort`] (or the request's external abort token) delivers
//!   the partial result with [`SettleReason::Aborted`].

use std::fmt;
use std::sync::{Arc, Weak};

use ahash::AHashMap;
use parking_lot::Mutex;
use relay_sync_config::FetchConfig;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::accumulator::{SortOrder, StreamResult};
use super::state::{FetchKind, FetchState, SettleReason, Settlement, StateCell};
use crate::dedupe::BoundedDedupeSet;
use crate::error::{EngineError, Result};
use crate::event::{any_matches, Event, Filter};
use crate::limiter::{ConcurrencyLimiter, LimiterPool, ResourceClass};
use crate::registry::{new_subscription_id, SubscriptionRegistry};
use crate::relay::{
    retry_with_backoff, ReconnectionStrategy, RelayClient, RelayMessage, RelaySubscription,
};

/// Receives the full current snapshot after every accepted event
pub type IncrementFn = Box<dyn FnMut(&[Event]) + Send + 'static>;

/// Receives the settlement; called at most once
pub type SettleFn = Box<dyn FnOnce(Settlement) + Send + 'static>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchMode {
    /// Incremental list delivery; settles after end-signal plus grace
    List { order: SortOrder },
    /// Settles on the first match, or empty after the single-item timeout
    Single,
    /// No increments; settles after end-signal plus grace or the aggregate timeout
    Lookup,
}

impl FetchMode {
    pub fn kind(&self) -> FetchKind {
        match self {
            FetchMode::List { .. } => FetchKind::List,
            FetchMode::Single => FetchKind::Single,
            FetchMode::Lookup => FetchKind::Lookup,
        }
    }

    fn default_class(&self) -> ResourceClass {
        match self {
            FetchMode::List { .. } => ResourceClass::List,
            FetchMode::Single => ResourceClass::Single,
            FetchMode::Lookup => ResourceClass::Aggregate,
        }
    }

    fn order(&self) -> SortOrder {
        match self {
            FetchMode::List { order } => *order,
            FetchMode::Single | FetchMode::Lookup => SortOrder::NewestFirst,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchRequest {
    pub filters: Vec<Filter>,
    pub mode: FetchMode,
    pub class: ResourceClass,
    pub max_items: Option<usize>,
    abort: Option<CancellationToken>,
}

impl FetchRequest {
    fn new(filters: Vec<Filter>, mode: FetchMode) -> Self {
        Self {
            filters,
            class: mode.default_class(),
            mode,
            max_items: None,
            abort: None,
        }
    }

    /// Newest-first list fetch
    pub fn list(filter: Filter) -> Self {
        Self::list_many(vec![filter])
    }

    pub fn list_many(filters: Vec<Filter>) -> Self {
        Self::new(
            filters,
            FetchMode::List {
                order: SortOrder::NewestFirst,
            },
        )
    }

    pub fn single(filter: Filter) -> Self {
        Self::new(vec![filter], FetchMode::Single)
    }

    pub fn lookup(filters: Vec<Filter>) -> Self {
        Self::new(filters, FetchMode::Lookup)
    }

    /// Switch a list fetch to oldest-first ordering
    pub fn oldest_first(mut self) -> Self {
        if let FetchMode::List { order } = &mut self.mode {
            *order = SortOrder::OldestFirst;
        }
        self
    }

    pub fn with_class(mut self, class: ResourceClass) -> Self {
        self.class = class;
        self
    }

    pub fn with_max_items(mut self, max_items: usize) -> Self {
        self.max_items = Some(max_items);
        self
    }

    /// External abort signal; cancelling it delivers the partial result
    pub fn with_abort(mut self, token: CancellationToken) -> Self {
        self.abort = Some(token);
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.filters.is_empty() {
            return Err(EngineError::Validation("no filters".to_string()));
        }
        self.filters.iter().try_for_each(Filter::validate)
    }
}

/// Control handle for one fetch
///
/// Dropping the handle does not stop the fetch.
#[derive(Clone)]
pub struct FetchHandle {
    id: String,
    state: Arc<StateCell>,
    cancel: CancellationToken,
    abort: CancellationToken,
    registry: Weak<SubscriptionRegistry>,
}

impl fmt::Debug for FetchHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FetchHandle")
            .field("id", &self.id)
            .field("state", &self.state.get())
            .finish()
    }
}

impl FetchHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> FetchState {
        self.state.get()
    }

    pub fn is_finished(&self) -> bool {
        self.state.is_terminal()
    }

    /// Caller teardown: stop the subscription and suppress the settle callback
    ///
    /// The fetch task stops delivering increments once it observes the
    /// cancellation; an increment already running on another worker thread
    /// may still complete.
    pub fn cancel(&self) {
        if self.state.advance(FetchState::Cancelled) {
            debug!("[FETCH] {} cancelled by caller", self.id);
        }
        self.cancel.cancel();
        if let Some(registry) = self.registry.upgrade() {
            registry.unregister(&self.id);
        }
    }

    /// External abort: settle now with whatever has arrived
    pub fn abort(&self) {
        self.abort.cancel();
    }
}

struct CancelOnDrop(FetchHandle);

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        self.0.cancel();
    }
}

type KeyedFetches = Arc<Mutex<AHashMap<String, FetchHandle>>>;

pub struct StreamingFetchController {
    relay: Arc<dyn RelayClient>,
    registry: Arc<SubscriptionRegistry>,
    limiters: Arc<LimiterPool>,
    config: FetchConfig,
    keyed: KeyedFetches,
    shutdown: CancellationToken,
}

impl fmt::Debug for StreamingFetchController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamingFetchController")
            .field("relay", &self.relay.name())
            .field("keyed", &self.keyed.lock().len())
            .finish()
    }
}

impl StreamingFetchController {
    pub fn new(
        relay: Arc<dyn RelayClient>,
        registry: Arc<SubscriptionRegistry>,
        limiters: Arc<LimiterPool>,
        config: FetchConfig,
    ) -> Self {
        Self {
            relay,
            registry,
            limiters,
            config,
            keyed: Arc::new(Mutex::new(AHashMap::new())),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn config(&self) -> &FetchConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<SubscriptionRegistry> {
        &self.registry
    }

    /// Start a fetch
    ///
    /// An invalid request settles with [`SettleReason::Invalid`] before this
    /// returns, without touching the relay. Otherwise the fetch runs on the
    /// current tokio runtime.
    pub fn start<I, S>(&self, request: FetchRequest, on_increment: I, on_settle: S) -> FetchHandle
    where
        I: FnMut(&[Event]) + Send + 'static,
        S: FnOnce(Settlement) + Send + 'static,
    {
        self.start_inner(None, request, Box::new(on_increment), Box::new(on_settle))
    }

    /// Start a fetch for a logical key, cancelling any previous fetch for it
    pub fn start_keyed<I, S>(
        &self,
        key: impl Into<String>,
        request: FetchRequest,
        on_increment: I,
        on_settle: S,
    ) -> FetchHandle
    where
        I: FnMut(&[Event]) + Send + 'static,
        S: FnOnce(Settlement) + Send + 'static,
    {
        let key = key.into();
        let previous = self.keyed.lock().remove(&key);
        if let Some(previous) = previous {
            debug!("[FETCH] key {} restarted, cancelling {}", key, previous.id);
            previous.cancel();
        }

        let handle = self.start_inner(
            Some(key.clone()),
            request,
            Box::new(on_increment),
            Box::new(on_settle),
        );
        if !handle.is_finished() {
            self.keyed.lock().insert(key, handle.clone());
        }
        handle
    }

    /// Cancel the fetch running under `key`; false if there is none
    pub fn cancel_keyed(&self, key: &str) -> bool {
        let previous = self.keyed.lock().remove(key);
        match previous {
            Some(handle) => {
                handle.cancel();
                true
            }
            None => false,
        }
    }

    /// Keys with a fetch that has not finished yet
    pub fn active_keys(&self) -> Vec<String> {
        self.keyed
            .lock()
            .iter()
            .filter(|(_, handle)| !handle.is_finished())
            .map(|(key, _)| key.clone())
            .collect()
    }

    /// Run a fetch to completion and return its settlement
    ///
    /// Dropping the future cancels the fetch.
    pub async fn fetch(&self, request: FetchRequest) -> Settlement {
        let kind = request.mode.kind();
        let (tx, rx) = oneshot::channel();
        let handle = self.start(request, |_| {}, move |settlement| {
            let _ = tx.send(settlement);
        });
        let guard = CancelOnDrop(handle);

        match rx.await {
            Ok(settlement) => settlement,
            // Suppressed by shutdown
            Err(_) => Settlement::empty(guard.0.id(), kind, SettleReason::Closed),
        }
    }

    /// Fetch one event matching `filter`
    pub async fn fetch_one(&self, filter: Filter) -> Option<Event> {
        self.fetch(FetchRequest::single(filter))
            .await
            .items
            .into_iter()
            .next()
    }

    /// Cancel every running fetch without settling it
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        let handles: Vec<FetchHandle> = self.keyed.lock().drain().map(|(_, h)| h).collect();
        for handle in handles {
            handle.cancel();
        }
    }

    fn start_inner(
        &self,
        key: Option<String>,
        request: FetchRequest,
        on_increment: IncrementFn,
        on_settle: SettleFn,
    ) -> FetchHandle {
        let id = new_subscription_id();
        let state = Arc::new(StateCell::default());
        let cancel = self.shutdown.child_token();
        let abort = match &request.abort {
            Some(external) => external.child_token(),
            None => CancellationToken::new(),
        };
        let handle = FetchHandle {
            id: id.clone(),
            state: Arc::clone(&state),
            cancel: cancel.clone(),
            abort: abort.clone(),
            registry: Arc::downgrade(&self.registry),
        };

        if let Err(e) = request.validate() {
            debug!("[FETCH] {} settled empty: {}", id, e);
            if state.advance(FetchState::Settled) {
                on_settle(Settlement::empty(id, request.mode.kind(), SettleReason::Invalid));
            }
            return handle;
        }
        if self.shutdown.is_cancelled() {
            state.advance(FetchState::Cancelled);
            return handle;
        }

        let task = FetchTask {
            id,
            limiter: Arc::clone(self.limiters.get(request.class)),
            request,
            relay: Arc::clone(&self.relay),
            registry: Arc::clone(&self.registry),
            config: self.config.clone(),
            state,
            cancel,
            abort,
            on_increment,
            finisher: Finisher {
                on_settle: Some(on_settle),
                key,
                keyed: Arc::clone(&self.keyed),
            },
        };
        tokio::spawn(task.run());
        handle
    }
}

#[derive(Debug, Clone, Copy)]
enum Interrupt {
    Cancelled,
    Aborted,
}

enum Step {
    Interrupted(Interrupt),
    Deadline,
    Message(Option<RelayMessage>),
}

enum Outcome {
    Interrupted(Interrupt),
    Settle(SettleReason),
}

struct Finisher {
    on_settle: Option<SettleFn>,
    key: Option<String>,
    keyed: KeyedFetches,
}

impl Finisher {
    fn finish(&mut self, id: &str, kind: FetchKind, state: &StateCell, outcome: Outcome, items: Vec<Event>) {
        self.forget_key(id);

        let (target, reason) = match outcome {
            Outcome::Settle(reason) => (FetchState::Settled, Some(reason)),
            Outcome::Interrupted(Interrupt::Aborted) => {
                (FetchState::Cancelled, Some(SettleReason::Aborted))
            }
            Outcome::Interrupted(Interrupt::Cancelled) => (FetchState::Cancelled, None),
        };

        if !state.advance(target) {
            // Already cancelled by the caller
            return;
        }
        let (Some(reason), Some(on_settle)) = (reason, self.on_settle.take()) else {
            return;
        };
        debug!("[FETCH] {} settled {:?} with {} items", id, reason, items.len());
        on_settle(Settlement {
            fetch_id: id.to_string(),
            kind,
            reason,
            items,
        });
    }

    fn forget_key(&self, id: &str) {
        if let Some(key) = &self.key {
            let mut keyed = self.keyed.lock();
            if keyed.get(key).is_some_and(|h| h.id == id) {
                keyed.remove(key);
            }
        }
    }
}

struct FetchTask {
    id: String,
    request: FetchRequest,
    relay: Arc<dyn RelayClient>,
    registry: Arc<SubscriptionRegistry>,
    limiter: Arc<ConcurrencyLimiter>,
    config: FetchConfig,
    state: Arc<StateCell>,
    cancel: CancellationToken,
    abort: CancellationToken,
    on_increment: IncrementFn,
    finisher: Finisher,
}

impl FetchTask {
    async fn run(self) {
        let FetchTask {
            id,
            request,
            relay,
            registry,
            limiter,
            config,
            state,
            cancel,
            abort,
            mut on_increment,
            mut finisher,
        } = self;
        let mode = request.mode;
        let kind = mode.kind();

        state.advance(FetchState::Connecting);

        let acquired = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(Interrupt::Cancelled),
            _ = abort.cancelled() => Err(Interrupt::Aborted),
            slot = limiter.acquire() => Ok(slot),
        };
        let slot = match acquired {
            Err(interrupt) => {
                return finisher.finish(&id, kind, &state, Outcome::Interrupted(interrupt), Vec::new())
            }
            Ok(Err(e)) => {
                debug!("[FETCH] {} shed by {} limiter: {}", id, limiter.name(), e);
                return finisher.finish(&id, kind, &state, Outcome::Settle(SettleReason::Shed), Vec::new());
            }
            Ok(Ok(slot)) => slot,
        };

        let opened = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(Interrupt::Cancelled),
            _ = abort.cancelled() => Err(Interrupt::Aborted),
            result = open_subscription(relay.as_ref(), &request.filters, &config, &cancel) => Ok(result),
        };
        let RelaySubscription {
            mut messages,
            handle,
        } = match opened {
            Err(interrupt) => {
                return finisher.finish(&id, kind, &state, Outcome::Interrupted(interrupt), Vec::new())
            }
            Ok(Err(e)) => {
                warn!("[FETCH] {} could not reach {}: {}", id, relay.name(), e);
                return finisher.finish(
                    &id,
                    kind,
                    &state,
                    Outcome::Settle(SettleReason::ConnectionFailed),
                    Vec::new(),
                );
            }
            Ok(Ok(subscription)) => subscription,
        };

        registry.register(id.clone(), request.filters.clone(), handle, None);
        if cancel.is_cancelled() {
            registry.unregister(&id);
            return finisher.finish(&id, kind, &state, Outcome::Interrupted(Interrupt::Cancelled), Vec::new());
        }
        state.advance(FetchState::Streaming);

        let mut seen = BoundedDedupeSet::new(config.seen_cap);
        let mut accumulated = StreamResult::new(mode.order());
        if let Some(max_items) = request.max_items {
            accumulated = accumulated.with_max_len(max_items);
        }

        let mut deadline = Instant::now()
            + match mode {
                FetchMode::List { .. } => config.list_timeout(),
                FetchMode::Single => config.single_timeout(),
                FetchMode::Lookup => config.aggregate_timeout(),
            };
        let mut end_signal_seen = false;

        let outcome = loop {
            let step = tokio::select! {
                biased;
                _ = cancel.cancelled() => Step::Interrupted(Interrupt::Cancelled),
                _ = abort.cancelled() => Step::Interrupted(Interrupt::Aborted),
                _ = tokio::time::sleep_until(deadline) => Step::Deadline,
                message = messages.recv() => Step::Message(message),
            };

            match step {
                Step::Interrupted(interrupt) => break Outcome::Interrupted(interrupt),
                Step::Deadline => {
                    break Outcome::Settle(if end_signal_seen {
                        SettleReason::Completed
                    } else {
                        SettleReason::Timeout
                    })
                }
                Step::Message(None) | Step::Message(Some(RelayMessage::Closed(_))) => {
                    break Outcome::Settle(SettleReason::Closed)
                }
                Step::Message(Some(RelayMessage::EndOfStoredEvents)) => {
                    if mode != FetchMode::Single && !end_signal_seen {
                        end_signal_seen = true;
                        deadline = deadline.min(Instant::now() + config.grace());
                        state.advance(FetchState::Grace);
                        debug!("[FETCH] {} end-signal, grace {:?}", id, config.grace());
                    }
                }
                Step::Message(Some(RelayMessage::Event(event))) => {
                    if !any_matches(&request.filters, &event) || !seen.insert(event.id.clone()) {
                        continue;
                    }
                    if !accumulated.insert(event) || state.is_terminal() {
                        continue;
                    }
                    match mode {
                        FetchMode::List { .. } => on_increment(accumulated.items()),
                        FetchMode::Single => {
                            on_increment(accumulated.items());
                            break Outcome::Settle(SettleReason::Found);
                        }
                        FetchMode::Lookup => {}
                    }
                }
            }
        };

        registry.unregister(&id);
        drop(slot);
        finisher.finish(&id, kind, &state, outcome, accumulated.into_items());
    }
}

async fn open_subscription(
    relay: &dyn RelayClient,
    filters: &[Filter],
    config: &FetchConfig,
    cancel: &CancellationToken,
) -> Result<RelaySubscription> {
    if config.connect_retries == 0 {
        relay.ensure_connected().await?;
    } else {
        let mut strategy = ReconnectionStrategy::new(config.retry_backoff_ms, config.connect_retries);
        retry_with_backoff(|| relay.ensure_connected(), &mut strategy, relay.name(), cancel).await?;
    }
    relay.subscribe(filters.to_vec()).await
}

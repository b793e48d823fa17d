// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! # relay-sync-engine
//!
//! Streaming synchronization and resource-bounded subscriptions for clients
//! of a pub/sub relay network.
//!
//! ## Components
//!
//! - [`BoundedDedupeSet`]: fixed-capacity identity set, FIFO eviction
//! - [`ConcurrencyLimiter`]: slot gate with a bounded, drop-oldest queue
//! - [`EntryCache`]: TTL and capacity bounded key/value store
//! - [`SubscriptionRegistry`]: owner of every live subscription handle
//! - [`StreamingFetchController`]: live queries that settle exactly once
//! - [`DebouncedBatchCoordinator`]: many small requests, one fetch
//! - [`ApplicationQueryCache`]: result cache with periodic and triggered sweeps
//! - [`EnvironmentSignalBus`]: visibility and memory-pressure orchestration
//!
//! [`SyncEngine`] wires all of them from one
//! [`SyncConfig`](relay_sync_config::SyncConfig).
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use relay_sync_config::SyncConfig;
//! use relay_sync_engine::{Filter, MemoryRelay, SyncEngine};
//!
//! # async fn run() {
//! let relay = Arc::new(MemoryRelay::new("local"));
//! let engine = SyncEngine::new(SyncConfig::default(), relay);
//! let notes = engine.fetch_cached(Filter::new().author("alice").kind(1)).await;
//! println!("{} notes", notes.len());
//! engine.shutdown();
//! # }
//! ```

pub mod batch;
pub mod dedupe;
pub mod engine;
pub mod entry_cache;
pub mod environment;
pub mod error;
pub mod event;
pub mod fetch;
pub mod limiter;
pub mod query_cache;
pub mod registry;
pub mod relay;

pub use batch::{AuthorBatchPlan, BatchPlan, DebouncedBatchCoordinator};
pub use dedupe::BoundedDedupeSet;
pub use engine::{SyncEngine, PROFILE_KIND};
pub use entry_cache::EntryCache;
pub use environment::{
    EnvironmentSignal, EnvironmentSignalBus, HeapSample, LifecycleParticipant, ListenerGuard,
    MemoryProbe, Visibility,
};
pub use error::{EngineError, Result};
pub use event::{any_matches, Event, Filter, StreamItem};
pub use fetch::{
    AggregateFetcher, AggregateQuery, CounterSnapshot, CounterSpec, FetchHandle, FetchKind,
    FetchMode, FetchRequest, FetchState, SettleReason, Settlement, SortOrder, StreamResult,
    StreamingFetchController,
};
pub use limiter::{
    ConcurrencyLimiter, LimiterPool, LimiterStats, QueueOutcome, QueuedStart, ResourceClass,
    SlotGuard,
};
pub use query_cache::{ApplicationQueryCache, PruneOnWrite, SweepMode, WriteHook};
pub use registry::{new_subscription_id, CleanupFn, SubscriptionInfo, SubscriptionRegistry};
pub use relay::{
    MemoryRelay, RacingRelay, ReconnectionStrategy, RelayClient, RelayMessage, RelaySubscription,
    SubscriptionHandle,
};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

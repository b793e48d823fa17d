// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! Summary counters over several event kinds
//!
//! One lookup subscription covers every counter; results are split into
//! named counts locally and cached in an [`EntryCache`].

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::controller::{FetchRequest, StreamingFetchController};
use super::state::SettleReason;
use crate::entry_cache::EntryCache;
use crate::event::{Event, Filter};

/// Counter name to number of matching events
pub type CounterSnapshot = BTreeMap<String, usize>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterSpec {
    pub name: String,
    pub kinds: Vec<u32>,
}

impl CounterSpec {
    pub fn new(name: impl Into<String>, kinds: impl IntoIterator<Item = u32>) -> Self {
        Self {
            name: name.into(),
            kinds: kinds.into_iter().collect(),
        }
    }
}

/// Counters sharing one base filter, e.g. everything tagged with a post id
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregateQuery {
    pub key: String,
    pub base: Filter,
    pub counters: Vec<CounterSpec>,
}

impl AggregateQuery {
    pub fn new(key: impl Into<String>, base: Filter) -> Self {
        Self {
            key: key.into(),
            base,
            counters: Vec::new(),
        }
    }

    pub fn counter(mut self, spec: CounterSpec) -> Self {
        self.counters.push(spec);
        self
    }

    /// The base filter with its kinds replaced by the union of counter kinds
    pub fn filter(&self) -> Filter {
        let kinds: BTreeSet<u32> = self
            .counters
            .iter()
            .flat_map(|c| c.kinds.iter().copied())
            .collect();
        let mut filter = self.base.clone();
        filter.kinds = Some(kinds.into_iter().collect());
        filter
    }

    /// Count `events` per counter; a kind listed by two counters counts for both
    pub fn demux(&self, events: &[Event]) -> CounterSnapshot {
        self.counters
            .iter()
            .map(|spec| {
                let count = events.iter().filter(|e| spec.kinds.contains(&e.kind)).count();
                (spec.name.clone(), count)
            })
            .collect()
    }
}

pub struct AggregateFetcher {
    controller: Arc<StreamingFetchController>,
    cache: Arc<EntryCache<String, CounterSnapshot>>,
}

impl AggregateFetcher {
    pub fn new(
        controller: Arc<StreamingFetchController>,
        cache: Arc<EntryCache<String, CounterSnapshot>>,
    ) -> Self {
        Self { controller, cache }
    }

    /// Counts for `query`, from cache while fresh
    ///
    /// Only results that ran to the end-signal or the deadline are cached;
    /// failed, shed or aborted lookups are returned but not stored.
    pub async fn counts(&self, query: &AggregateQuery) -> CounterSnapshot {
        if let Some(hit) = self.cache.get(&query.key) {
            return hit;
        }

        let settlement = self
            .controller
            .fetch(FetchRequest::lookup(vec![query.filter()]))
            .await;
        let snapshot = query.demux(&settlement.items);

        match settlement.reason {
            SettleReason::Completed | SettleReason::Timeout => {
                self.cache.set(query.key.clone(), snapshot.clone());
            }
            other => debug!("[FETCH] counters for {} not cached ({:?})", query.key, other),
        }
        snapshot
    }

    /// Drop the cached counts for `key`
    pub fn invalidate(&self, key: &str) -> bool {
        self.cache.invalidate(&key.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::limiter::LimiterPool;
    use crate::registry::SubscriptionRegistry;
    use crate::relay::MemoryRelay;
    use relay_sync_config::{ConcurrencyConfig, FetchConfig};
    use std::time::Duration;

    fn reactions_query() -> AggregateQuery {
        AggregateQuery::new("post-1", Filter::new().tag("e", ["post-1"]))
            .counter(CounterSpec::new("replies", [1]))
            .counter(CounterSpec::new("reposts", [6]))
            .counter(CounterSpec::new("reactions", [7]))
    }

    #[test]
    fn test_filter_uses_union_of_kinds() {
        let filter = reactions_query().filter();
        assert_eq!(filter.kinds, Some(vec![1, 6, 7]));
        assert_eq!(filter.tags.get("e"), Some(&vec!["post-1".to_string()]));
    }

    #[test]
    fn test_demux_counts_per_counter() {
        let events = vec![
            Event::new("a", "x", 1, 7),
            Event::new("b", "y", 2, 7),
            Event::new("c", "z", 3, 1),
        ];
        let counts = reactions_query().demux(&events);
        assert_eq!(counts["reactions"], 2);
        assert_eq!(counts["replies"], 1);
        assert_eq!(counts["reposts"], 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_counts_use_one_subscription_and_cache() {
        let relay = Arc::new(MemoryRelay::new("mem"));
        relay.store_all([
            Event::new("r1", "x", 1, 7).with_tag("e", "post-1"),
            Event::new("r2", "y", 2, 1).with_tag("e", "post-1"),
            Event::new("other", "y", 2, 7).with_tag("e", "post-2"),
        ]);
        let controller = Arc::new(StreamingFetchController::new(
            relay.clone(),
            Arc::new(SubscriptionRegistry::new()),
            Arc::new(LimiterPool::new(&ConcurrencyConfig::default())),
            FetchConfig::default(),
        ));
        let fetcher = AggregateFetcher::new(
            controller,
            Arc::new(EntryCache::new(Duration::from_secs(60), 16, 0.2)),
        );

        let counts = fetcher.counts(&reactions_query()).await;
        assert_eq!(counts["reactions"], 1);
        assert_eq!(counts["replies"], 1);
        assert_eq!(relay.subscription_count(), 1);

        let cached = fetcher.counts(&reactions_query()).await;
        assert_eq!(cached, counts);
        assert_eq!(relay.subscription_count(), 1);

        assert!(fetcher.invalidate("post-1"));
        fetcher.counts(&reactions_query()).await;
        assert_eq!(relay.subscription_count(), 2);
    }
}

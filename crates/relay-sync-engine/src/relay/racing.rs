// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! Several relays raced behind one subscription
//!
//! Messages from every source are interleaved in arrival order. Each source's
//! end-signal is forwarded, so the first one starts the fetch's grace period
//! while slower sources can still contribute. Per-source `Closed` messages are
//! swallowed; the merged stream ends once every source has ended.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::{RelayClient, RelayMessage, RelaySubscription, SubscriptionHandle};
use crate::error::{EngineError, Result};
use crate::event::Filter;

pub struct RacingRelay {
    name: String,
    sources: Vec<Arc<dyn RelayClient>>,
}

impl RacingRelay {
    pub fn new(name: impl Into<String>, sources: Vec<Arc<dyn RelayClient>>) -> Self {
        Self {
            name: name.into(),
            sources,
        }
    }

    pub fn sources(&self) -> &[Arc<dyn RelayClient>] {
        &self.sources
    }
}

#[async_trait]
impl RelayClient for RacingRelay {
    fn name(&self) -> &str {
        &self.name
    }

    /// Connected if at least one source is
    async fn ensure_connected(&self) -> Result<()> {
        let mut last_error = None;
        let mut connected = 0usize;
        for source in &self.sources {
            match source.ensure_connected().await {
                Ok(()) => connected += 1,
                Err(e) => {
                    debug!("[RELAY] {}: source {} not connected: {}", self.name, source.name(), e);
                    last_error = Some(e);
                }
            }
        }
        if connected > 0 {
            return Ok(());
        }
        Err(last_error.unwrap_or_else(|| {
            EngineError::Connection(format!("{} has no sources", self.name))
        }))
    }

    async fn subscribe(&self, filters: Vec<Filter>) -> Result<RelaySubscription> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut handles: Vec<Arc<dyn SubscriptionHandle>> = Vec::new();

        for source in &self.sources {
            let mut sub = match source.subscribe(filters.clone()).await {
                Ok(sub) => sub,
                Err(e) => {
                    warn!("[RELAY] {}: source {} failed to subscribe: {}", self.name, source.name(), e);
                    continue;
                }
            };
            handles.push(Arc::clone(&sub.handle));

            let tx = tx.clone();
            tokio::spawn(async move {
                while let Some(message) = sub.messages.recv().await {
                    if matches!(message, RelayMessage::Closed(_)) {
                        break;
                    }
                    if tx.send(message).is_err() {
                        break;
                    }
                }
            });
        }

        if handles.is_empty() {
            return Err(EngineError::Connection(format!(
                "{}: no source accepted the subscription",
                self.name
            )));
        }

        Ok(RelaySubscription {
            messages: rx,
            handle: Arc::new(RacingHandle {
                handles,
                stopped: AtomicBool::new(false),
            }),
        })
    }
}

struct RacingHandle {
    handles: Vec<Arc<dyn SubscriptionHandle>>,
    stopped: AtomicBool,
}

impl SubscriptionHandle for RacingHandle {
    /// Stops every source; reports the first failure after trying them all
    fn stop(&self) -> Result<()> {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let mut first_error = None;
        for handle in &self.handles {
            if let Err(e) = handle.stop() {
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn is_active(&self) -> bool {
        !self.stopped.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Event;
    use crate::relay::MemoryRelay;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn test_interleaves_sources_and_forwards_each_end_signal() {
        let cache = Arc::new(MemoryRelay::new("cache"));
        let remote = Arc::new(MemoryRelay::new("remote").with_delay(Duration::from_millis(300)));
        cache.store(Event::new("a", "alice", 10, 1));
        remote.store(Event::new("a", "alice", 10, 1));
        remote.store(Event::new("b", "alice", 5, 1));

        let racing = RacingRelay::new("racing", vec![cache.clone() as Arc<dyn RelayClient>, remote.clone()]);
        let mut sub = racing.subscribe(vec![Filter::new().author("alice")]).await.unwrap();

        let mut log = Vec::new();
        for _ in 0..5 {
            match sub.messages.recv().await.unwrap() {
                RelayMessage::Event(e) => log.push(e.id),
                RelayMessage::EndOfStoredEvents => log.push("EOSE".to_string()),
                RelayMessage::Closed(_) => unreachable!(),
            }
        }
        assert_eq!(log, vec!["a", "EOSE", "a", "b", "EOSE"]);

        sub.handle.stop().unwrap();
        assert_eq!(cache.stop_count(), 1);
        assert_eq!(remote.stop_count(), 1);
    }

    #[tokio::test]
    async fn test_one_offline_source_is_tolerated() {
        let up = Arc::new(MemoryRelay::new("up"));
        let down = Arc::new(MemoryRelay::new("down"));
        down.set_offline(true);

        let racing = RacingRelay::new("racing", vec![up.clone() as Arc<dyn RelayClient>, down.clone()]);
        assert!(racing.ensure_connected().await.is_ok());
        assert!(racing.subscribe(vec![Filter::new().kind(1)]).await.is_ok());

        up.set_offline(true);
        assert!(racing.ensure_connected().await.is_err());
        assert!(racing.subscribe(vec![Filter::new().kind(1)]).await.is_err());
    }
}

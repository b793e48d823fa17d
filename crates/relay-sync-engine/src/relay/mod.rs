// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! Relay client abstraction
//!
//! The engine consumes relays through [`RelayClient`]. A subscription yields a
//! message stream plus a handle used to stop it. Local caches that race a
//! remote network are modelled as additional relays combined with
//! [`RacingRelay`].

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::Result;
use crate::event::{Event, Filter};

pub mod memory;
pub mod racing;
pub mod reconnect;

pub use memory::MemoryRelay;
pub use racing::RacingRelay;
pub use reconnect::{retry_with_backoff, ReconnectionStrategy};

/// Message delivered on a subscription stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayMessage {
    Event(Event),
    /// The source has delivered every stored match
    EndOfStoredEvents,
    /// The source closed the subscription
    Closed(String),
}

/// Stops the underlying subscription
pub trait SubscriptionHandle: Send + Sync {
    /// Stopping twice is a no-op
    fn stop(&self) -> Result<()>;
    fn is_active(&self) -> bool;
}

/// Live subscription returned by [`RelayClient::subscribe`]
pub struct RelaySubscription {
    pub messages: mpsc::UnboundedReceiver<RelayMessage>,
    pub handle: Arc<dyn SubscriptionHandle>,
}

impl std::fmt::Debug for RelaySubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelaySubscription")
            .field("active", &self.handle.is_active())
            .finish()
    }
}

#[async_trait]
pub trait RelayClient: Send + Sync {
    /// Human-readable name for logs
    fn name(&self) -> &str;

    /// Make sure a connection exists; may be called before every subscribe
    async fn ensure_connected(&self) -> Result<()>;

    async fn subscribe(&self, filters: Vec<Filter>) -> Result<RelaySubscription>;
}

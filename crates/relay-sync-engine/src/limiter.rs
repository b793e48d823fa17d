// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! Capacity-gated slot allocation with a bounded, lossy pending queue
//!
//! A started operation owns one slot until it calls [`ConcurrencyLimiter::end`]
//! (or drops its [`SlotGuard`]). Queued callbacks run in FIFO order as slots
//! free up. When the queue is full the oldest waiter is dropped without ever
//! running, so fresh requests win over stale ones.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use relay_sync_config::ConcurrencyConfig;
use serde::Serialize;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::error::{EngineError, Result};

/// Deferred start callback; it owns a slot once invoked
pub type QueuedStart = Box<dyn FnOnce() + Send + 'static>;

/// What [`ConcurrencyLimiter::queue`] did with a callback
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueOutcome {
    /// Capacity was free; the callback already ran
    Started,
    Queued,
    /// Queued, and the oldest waiter was discarded to make room
    QueuedDroppedOldest,
}

/// Point-in-time limiter counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LimiterStats {
    pub capacity: usize,
    pub active: usize,
    pub queued: usize,
    pub dropped: u64,
}

struct LimiterState {
    active: usize,
    queue: VecDeque<QueuedStart>,
    dropped: u64,
    /// Bumped by `reset` so slots granted before it are not released twice
    epoch: u64,
}

pub struct ConcurrencyLimiter {
    name: String,
    capacity: usize,
    max_queue: usize,
    state: Mutex<LimiterState>,
}

impl fmt::Debug for ConcurrencyLimiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConcurrencyLimiter")
            .field("name", &self.name)
            .field("stats", &self.stats())
            .finish()
    }
}

impl ConcurrencyLimiter {
    /// Capacities of zero are raised to one
    pub fn new(name: impl Into<String>, capacity: usize, max_queue: usize) -> Self {
        Self {
            name: name.into(),
            capacity: capacity.max(1),
            max_queue: max_queue.max(1),
            state: Mutex::new(LimiterState {
                active: 0,
                queue: VecDeque::new(),
                dropped: 0,
                epoch: 0,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Non-mutating capacity check
    pub fn can_start(&self) -> bool {
        self.state.lock().active < self.capacity
    }

    /// Reserve a slot; false if all slots are taken
    pub fn start(&self) -> bool {
        let mut state = self.state.lock();
        if state.active < self.capacity {
            state.active += 1;
            true
        } else {
            false
        }
    }

    /// Release a slot and hand it to the oldest queued callback, if any
    pub fn end(&self) {
        let next = {
            let mut state = self.state.lock();
            state.active = state.active.saturating_sub(1);
            let next = state.queue.pop_front();
            if next.is_some() {
                state.active += 1;
            }
            next
        };

        if let Some(callback) = next {
            debug!("[LIMITER] {} handing released slot to queued start", self.name);
            callback();
        }
    }

    /// Run `callback` now if a slot is free, otherwise queue it
    pub fn queue(&self, callback: QueuedStart) -> QueueOutcome {
        let mut state = self.state.lock();
        if state.active < self.capacity {
            state.active += 1;
            drop(state);
            callback();
            return QueueOutcome::Started;
        }

        state.queue.push_back(callback);
        if state.queue.len() > self.max_queue {
            let dropped = state.queue.pop_front();
            state.dropped += 1;
            let total = state.dropped;
            drop(state);
            // Dropping may wake an async waiter; keep it outside the lock
            drop(dropped);
            warn!(
                "[LIMITER] {} queue full ({}), dropped oldest pending start ({} dropped so far)",
                self.name, self.max_queue, total
            );
            return QueueOutcome::QueuedDroppedOldest;
        }
        QueueOutcome::Queued
    }

    /// Drop every slot and queued callback
    pub fn reset(&self) {
        let drained = {
            let mut state = self.state.lock();
            state.active = 0;
            state.epoch += 1;
            std::mem::take(&mut state.queue)
        };
        if !drained.is_empty() {
            debug!(
                "[LIMITER] {} reset, discarded {} queued starts",
                self.name,
                drained.len()
            );
        }
        drop(drained);
    }

    pub fn stats(&self) -> LimiterStats {
        let state = self.state.lock();
        LimiterStats {
            capacity: self.capacity,
            active: state.active,
            queued: state.queue.len(),
            dropped: state.dropped,
        }
    }

    fn epoch(&self) -> u64 {
        self.state.lock().epoch
    }

    /// Wait for a slot
    ///
    /// # Errors
    ///
    /// `EngineError::QueueOverflow` if the waiter was discarded by the queue
    /// policy or by [`reset`](Self::reset).
    pub async fn acquire(self: &Arc<Self>) -> Result<SlotGuard> {
        let (tx, rx) = oneshot::channel::<u64>();
        let weak: Weak<Self> = Arc::downgrade(self);

        self.queue(Box::new(move || {
            let Some(limiter) = weak.upgrade() else {
                return;
            };
            let epoch = limiter.epoch();
            if tx.send(epoch).is_err() {
                // Waiter gave up before its turn came
                limiter.end();
            }
        }));

        match rx.await {
            Ok(epoch) => Ok(SlotGuard {
                limiter: Arc::clone(self),
                epoch,
            }),
            Err(_) => Err(EngineError::QueueOverflow),
        }
    }
}

/// Slot held by an async caller; released on drop
pub struct SlotGuard {
    limiter: Arc<ConcurrencyLimiter>,
    epoch: u64,
}

impl fmt::Debug for SlotGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SlotGuard")
            .field("limiter", &self.limiter.name)
            .field("epoch", &self.epoch)
            .finish()
    }
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        // Slots granted before a reset were already reclaimed
        if self.limiter.epoch() == self.epoch {
            self.limiter.end();
        }
    }
}

/// Resource classes with independent concurrency budgets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ResourceClass {
    List,
    Single,
    Aggregate,
    Batch,
}

impl ResourceClass {
    pub const ALL: [ResourceClass; 4] = [
        ResourceClass::List,
        ResourceClass::Single,
        ResourceClass::Aggregate,
        ResourceClass::Batch,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceClass::List => "list",
            ResourceClass::Single => "single",
            ResourceClass::Aggregate => "aggregate",
            ResourceClass::Batch => "batch",
        }
    }
}

/// One limiter per resource class
#[derive(Debug)]
pub struct LimiterPool {
    list: Arc<ConcurrencyLimiter>,
    single: Arc<ConcurrencyLimiter>,
    aggregate: Arc<ConcurrencyLimiter>,
    batch: Arc<ConcurrencyLimiter>,
}

impl LimiterPool {
    pub fn new(config: &ConcurrencyConfig) -> Self {
        let make = |class: ResourceClass, capacity: usize| {
            Arc::new(ConcurrencyLimiter::new(
                class.as_str(),
                capacity,
                config.max_queue,
            ))
        };
        Self {
            list: make(ResourceClass::List, config.list),
            single: make(ResourceClass::Single, config.single),
            aggregate: make(ResourceClass::Aggregate, config.aggregate),
            batch: make(ResourceClass::Batch, config.batch),
        }
    }

    pub fn get(&self, class: ResourceClass) -> &Arc<ConcurrencyLimiter> {
        match class {
            ResourceClass::List => &self.list,
            ResourceClass::Single => &self.single,
            ResourceClass::Aggregate => &self.aggregate,
            ResourceClass::Batch => &self.batch,
        }
    }

    pub fn reset_all(&self) {
        for class in ResourceClass::ALL {
            self.get(class).reset();
        }
    }
}

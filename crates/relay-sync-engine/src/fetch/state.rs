// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! Per-fetch state machine and settlement types
//!
//! `Idle → Connecting → Streaming → (Grace) → Settled`, with `Cancelled`
//! reachable from every non-terminal state. Both `Settled` and `Cancelled` are
//! terminal, so whichever transition wins decides the outcome and the settle
//! callback can fire at most once.

use parking_lot::Mutex;
use serde::Serialize;

use crate::event::Event;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FetchState {
    Idle,
    Connecting,
    Streaming,
    /// First end-signal seen; waiting for slower sources
    Grace,
    Settled,
    Cancelled,
}

impl FetchState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, FetchState::Settled | FetchState::Cancelled)
    }

    pub fn can_advance_to(&self, next: FetchState) -> bool {
        use FetchState::*;
        match (self, next) {
            (from, _) if from.is_terminal() => false,
            (_, Cancelled) | (_, Settled) => true,
            (Idle, Connecting) => true,
            (Connecting, Streaming) => true,
            (Streaming, Grace) => true,
            _ => false,
        }
    }
}

/// Guarded holder of a fetch's state
#[derive(Debug)]
pub struct StateCell {
    state: Mutex<FetchState>,
}

impl Default for StateCell {
    fn default() -> Self {
        Self {
            state: Mutex::new(FetchState::Idle),
        }
    }
}

impl StateCell {
    pub fn get(&self) -> FetchState {
        *self.state.lock()
    }

    /// Apply `next` if the transition is legal
    pub fn advance(&self, next: FetchState) -> bool {
        let mut state = self.state.lock();
        if state.can_advance_to(next) {
            *state = next;
            true
        } else {
            false
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.get().is_terminal()
    }
}

/// Why a fetch settled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SettleReason {
    /// End-signal received and the grace period elapsed
    Completed,
    /// Single-item fetch matched
    Found,
    /// No end-signal (or no match) before the deadline
    Timeout,
    /// Empty or degenerate filter; nothing was submitted
    Invalid,
    /// Relay unreachable
    ConnectionFailed,
    /// External abort; carries the partial result
    Aborted,
    /// Dropped by the concurrency limiter's queue policy
    Shed,
    /// Subscription stream ended before settlement
    Closed,
}

/// Broad shape of a fetch, carried on its settlement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FetchKind {
    List,
    Single,
    Lookup,
}

/// Final result of a fetch, delivered exactly once
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Settlement {
    pub fetch_id: String,
    pub kind: FetchKind,
    pub reason: SettleReason,
    pub items: Vec<Event>,
}

impl Settlement {
    pub fn empty(fetch_id: impl Into<String>, kind: FetchKind, reason: SettleReason) -> Self {
        Self {
            fetch_id: fetch_id.into(),
            kind,
            reason,
            items: Vec::new(),
        }
    }

    /// The generic "could not load" case: a list query that failed to
    /// connect and received nothing
    pub fn could_not_load(&self) -> bool {
        self.kind == FetchKind::List
            && self.reason == SettleReason::ConnectionFailed
            && self.items.is_empty()
    }

    pub fn first(&self) -> Option<&Event> {
        self.items.first()
    }
}

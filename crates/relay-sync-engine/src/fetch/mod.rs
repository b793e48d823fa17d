// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! Streaming fetches: state machine, accumulator, controller and counters

pub mod accumulator;
pub mod aggregate;
pub mod controller;
pub mod state;

pub use accumulator::{SortOrder, StreamResult};
pub use aggregate::{AggregateFetcher, AggregateQuery, CounterSnapshot, CounterSpec};
pub use controller::{
    FetchHandle, FetchMode, FetchRequest, IncrementFn, SettleFn, StreamingFetchController,
};
pub use state::{FetchKind, FetchState, SettleReason, Settlement, StateCell};

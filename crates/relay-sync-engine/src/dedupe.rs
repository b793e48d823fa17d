// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! Fixed-capacity identity set with FIFO eviction

use std::collections::VecDeque;
use std::hash::Hash;

use ahash::AHashSet;

/// Set of identities that never grows past `capacity`
///
/// Inserting a new identity into a full set evicts exactly one entry, the
/// oldest inserted.
#[derive(Debug, Clone)]
pub struct BoundedDedupeSet<T = String> {
    capacity: usize,
    members: AHashSet<T>,
    order: VecDeque<T>,
    evicted: u64,
}

impl<T: Eq + Hash + Clone> BoundedDedupeSet<T> {
    /// A capacity of zero is raised to one
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            members: AHashSet::with_capacity(capacity),
            order: VecDeque::with_capacity(capacity),
            evicted: 0,
        }
    }

    /// Returns true if `item` was not already present
    pub fn insert(&mut self, item: T) -> bool {
        if self.members.contains(&item) {
            return false;
        }
        if self.order.len() >= self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.members.remove(&oldest);
                self.evicted += 1;
            }
        }
        self.members.insert(item.clone());
        self.order.push_back(item);
        true
    }

    pub fn contains(&self, item: &T) -> bool {
        self.members.contains(item)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Total evictions since creation
    pub fn evicted(&self) -> u64 {
        self.evicted
    }

    pub fn clear(&mut self) {
        self.members.clear();
        self.order.clear();
    }
}

// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! Ordered accumulator with identity dedup

use ahash::AHashSet;
use serde::Serialize;

use crate::event::StreamItem;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum SortOrder {
    #[default]
    NewestFirst,
    OldestFirst,
}

/// Items kept sorted by timestamp as they arrive
///
/// Equal timestamps keep arrival order. Ids are tracked exactly, so an item
/// re-delivered by a slower source never appears twice.
#[derive(Debug, Clone)]
pub struct StreamResult<T> {
    order: SortOrder,
    items: Vec<T>,
    ids: AHashSet<String>,
    max_len: Option<usize>,
}

impl<T: StreamItem> StreamResult<T> {
    pub fn new(order: SortOrder) -> Self {
        Self {
            order,
            items: Vec::new(),
            ids: AHashSet::new(),
            max_len: None,
        }
    }

    /// Keep at most `max_len` items, dropping from the tail of the order
    pub fn with_max_len(mut self, max_len: usize) -> Self {
        self.max_len = Some(max_len.max(1));
        self
    }

    /// True if the item was added and survived truncation
    pub fn insert(&mut self, item: T) -> bool {
        if self.ids.contains(item.item_id()) {
            return false;
        }

        let ts = item.timestamp();
        let position = match self.order {
            SortOrder::NewestFirst => self.items.partition_point(|x| x.timestamp() >= ts),
            SortOrder::OldestFirst => self.items.partition_point(|x| x.timestamp() <= ts),
        };
        self.ids.insert(item.item_id().to_string());
        self.items.insert(position, item);

        if let Some(max_len) = self.max_len {
            if self.items.len() > max_len {
                if let Some(cut) = self.items.pop() {
                    self.ids.remove(cut.item_id());
                }
                return position < max_len;
            }
        }
        true
    }

    pub fn items(&self) -> &[T] {
        &self.items
    }

    pub fn into_items(self) -> Vec<T> {
        self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Event;

    fn ev(id: &str, at: u64) -> Event {
        Event::new(id, "alice", at, 1)
    }

    fn ids(result: &StreamResult<Event>) -> Vec<&str> {
        result.items().iter().map(|e| e.id.as_str()).collect()
    }

    #[test]
    fn test_newest_first_ordering() {
        let mut result = StreamResult::new(SortOrder::NewestFirst);
        result.insert(ev("b", 5));
        result.insert(ev("a", 10));
        result.insert(ev("c", 7));
        assert_eq!(ids(&result), vec!["a", "c", "b"]);
    }

    #[test]
    fn test_oldest_first_keeps_arrival_order_for_ties() {
        let mut result = StreamResult::new(SortOrder::OldestFirst);
        result.insert(ev("x", 3));
        result.insert(ev("y", 3));
        result.insert(ev("w", 1));
        assert_eq!(ids(&result), vec!["w", "x", "y"]);
    }

    #[test]
    fn test_duplicate_ids_rejected() {
        let mut result = StreamResult::new(SortOrder::NewestFirst);
        assert!(result.insert(ev("a", 10)));
        assert!(!result.insert(ev("a", 10)));
        assert_eq!(result.len(), 1);
    }

    #[test]
    fn test_max_len_drops_tail() {
        let mut result = StreamResult::new(SortOrder::NewestFirst).with_max_len(2);
        assert!(result.insert(ev("a", 10)));
        assert!(result.insert(ev("b", 5)));
        // Older than everything kept
        assert!(!result.insert(ev("c", 1)));
        assert!(result.insert(ev("d", 20)));
        assert_eq!(ids(&result), vec!["d", "a"]);
    }
}

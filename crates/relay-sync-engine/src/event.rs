// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! Events delivered by relays and the filters that select them
//!
//! Only the fields the engine needs for matching, ordering and dedup are
//! modelled. Signatures and wire encoding belong to the relay client.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};

/// Anything the streaming accumulator can order and dedup
pub trait StreamItem: Clone + Send + 'static {
    /// Stable identity used for dedup
    fn item_id(&self) -> &str;
    /// Ordering key (seconds since epoch for events)
    fn timestamp(&self) -> u64;
}

/// An event published on the network
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    /// Actor identifier of the author
    pub pubkey: String,
    pub created_at: u64,
    pub kind: u32,
    #[serde(default)]
    pub tags: Vec<Vec<String>>,
    #[serde(default)]
    pub content: String,
}

impl Event {
    pub fn new(id: impl Into<String>, pubkey: impl Into<String>, created_at: u64, kind: u32) -> Self {
        Self {
            id: id.into(),
            pubkey: pubkey.into(),
            created_at,
            kind,
            tags: Vec::new(),
            content: String::new(),
        }
    }

    pub fn with_tag(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.push(vec![name.into(), value.into()]);
        self
    }

    pub fn with_content(mut self, content: impl Into<String>) -> Self {
        self.content = content.into();
        self
    }

    /// Values of every tag named `name`
    pub fn tag_values<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.tags
            .iter()
            .filter(move |tag| tag.first().map(String::as_str) == Some(name))
            .filter_map(|tag| tag.get(1).map(String::as_str))
    }
}

impl StreamItem for Event {
    fn item_id(&self) -> &str {
        &self.id
    }

    fn timestamp(&self) -> u64 {
        self.created_at
    }
}

/// Query descriptor sent to relays
///
/// `None` means "no constraint"; `Some(vec![])` matches nothing and is
/// rejected by [`Filter::validate`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Filter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ids: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authors: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kinds: Option<Vec<u32>>,
    /// Tag name to accepted values
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub tags: BTreeMap<String, Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub since: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub until: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn id(self, id: impl Into<String>) -> Self {
        self.ids([id.into()])
    }

    pub fn ids<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.ids
            .get_or_insert_with(Vec::new)
            .extend(ids.into_iter().map(Into::into));
        self
    }

    pub fn author(self, author: impl Into<String>) -> Self {
        self.authors([author.into()])
    }

    pub fn authors<I, S>(mut self, authors: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.authors
            .get_or_insert_with(Vec::new)
            .extend(authors.into_iter().map(Into::into));
        self
    }

    pub fn kind(self, kind: u32) -> Self {
        self.kinds([kind])
    }

    pub fn kinds<I: IntoIterator<Item = u32>>(mut self, kinds: I) -> Self {
        self.kinds.get_or_insert_with(Vec::new).extend(kinds);
        self
    }

    pub fn tag<I, S>(mut self, name: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags
            .entry(name.into())
            .or_default()
            .extend(values.into_iter().map(Into::into));
        self
    }

    pub fn since(mut self, since: u64) -> Self {
        self.since = Some(since);
        self
    }

    pub fn until(mut self, until: u64) -> Self {
        self.until = Some(until);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    fn has_criterion(&self) -> bool {
        self.ids.is_some()
            || self.authors.is_some()
            || self.kinds.is_some()
            || !self.tags.is_empty()
            || self.since.is_some()
            || self.until.is_some()
    }

    /// Reject filters that would either match everything or nothing
    pub fn validate(&self) -> Result<()> {
        if !self.has_criterion() {
            return Err(EngineError::Validation("filter has no criteria".to_string()));
        }
        if matches!(&self.ids, Some(v) if v.is_empty()) {
            return Err(EngineError::Validation("empty id list".to_string()));
        }
        if matches!(&self.authors, Some(v) if v.is_empty()) {
            return Err(EngineError::Validation("empty author list".to_string()));
        }
        if matches!(&self.kinds, Some(v) if v.is_empty()) {
            return Err(EngineError::Validation("empty kind list".to_string()));
        }
        if let Some((name, _)) = self.tags.iter().find(|(_, values)| values.is_empty()) {
            return Err(EngineError::Validation(format!("tag '{}' has no values", name)));
        }
        if self.limit == Some(0) {
            return Err(EngineError::Validation("limit is zero".to_string()));
        }
        if let (Some(since), Some(until)) = (self.since, self.until) {
            if since > until {
                return Err(EngineError::Validation(format!(
                    "since {} is after until {}",
                    since, until
                )));
            }
        }
        Ok(())
    }

    /// Local re-check of relay output; `limit` is not applied here
    pub fn matches(&self, event: &Event) -> bool {
        if let Some(ids) = &self.ids {
            if !ids.iter().any(|id| *id == event.id) {
                return false;
            }
        }
        if let Some(authors) = &self.authors {
            if !authors.iter().any(|a| *a == event.pubkey) {
                return false;
            }
        }
        if let Some(kinds) = &self.kinds {
            if !kinds.contains(&event.kind) {
                return false;
            }
        }
        for (name, values) in &self.tags {
            let mut event_values = event.tag_values(name);
            if !event_values.any(|v| values.iter().any(|wanted| wanted == v)) {
                return false;
            }
        }
        if matches!(self.since, Some(since) if event.created_at < since) {
            return false;
        }
        if matches!(self.until, Some(until) if event.created_at > until) {
            return false;
        }
        true
    }

    /// Deterministic key for caching results of this filter
    pub fn cache_key(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| format!("{:?}", self))
    }
}

/// True if any filter in the set matches
pub fn any_matches(filters: &[Filter], event: &Event) -> bool {
    filters.iter().any(|f| f.matches(event))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn note(id: &str, author: &str, at: u64) -> Event {
        Event::new(id, author, at, 1)
    }

    #[test]
    fn test_empty_filter_is_invalid() {
        assert!(matches!(Filter::new().validate(), Err(EngineError::Validation(_))));
        assert!(Filter::new().limit(10).validate().is_err());
    }

    #[test]
    fn test_degenerate_filters_rejected() {
        assert!(Filter::new().ids(Vec::<String>::new()).validate().is_err());
        assert!(Filter::new().kind(1).limit(0).validate().is_err());
        assert!(Filter::new().since(10).until(5).validate().is_err());
        assert!(Filter::new().tag("p", Vec::<String>::new()).validate().is_err());
    }

    #[test]
    fn test_valid_filters() {
        assert!(Filter::new().author("alice").validate().is_ok());
        assert!(Filter::new().kind(1).since(5).until(5).limit(20).validate().is_ok());
    }

    #[test]
    fn test_matches_authors_kinds_and_time() {
        let filter = Filter::new().author("alice").kind(1).since(10).until(20);

        assert!(filter.matches(&note("a", "alice", 15)));
        assert!(!filter.matches(&note("b", "bob", 15)));
        assert!(!filter.matches(&note("c", "alice", 9)));
        assert!(!filter.matches(&note("d", "alice", 21)));
        assert!(!filter.matches(&Event::new("e", "alice", 15, 7)));
    }

    #[test]
    fn test_matches_tags() {
        let filter = Filter::new().kind(7).tag("e", ["target"]);
        let reaction = Event::new("r1", "bob", 1, 7).with_tag("e", "target");
        let other = Event::new("r2", "bob", 1, 7).with_tag("e", "elsewhere");

        assert!(filter.matches(&reaction));
        assert!(!filter.matches(&other));
    }

    #[test]
    fn test_cache_key_is_stable() {
        let a = Filter::new().tag("t", ["rust"]).tag("p", ["x"]).kind(1);
        let b = Filter::new().kind(1).tag("p", ["x"]).tag("t", ["rust"]);
        assert_eq!(a.cache_key(), b.cache_key());
    }
}

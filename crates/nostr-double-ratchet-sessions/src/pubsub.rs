use crate::{Result, Unsubscribe};
use async_trait::async_trait;
use nostr::{Filter, Kind, PublicKey, SingleLetterTag};
use std::collections::BTreeMap;
use std::sync::Arc;

pub type EventHandler = Arc<dyn Fn(nostr::Event) + Send + Sync>;

/// Publish/subscribe side of the broadcast network.
///
/// Delivery is unordered and at most once. Handlers may be invoked from
/// inside `subscribe` (replay of stored events) and from inside `publish`, so
/// implementations must not hold their own locks while calling them.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Subscribe to events matching the filter. Dropping the returned
    /// closure without calling it leaks the subscription.
    fn subscribe(&self, filter: SubscriptionFilter, on_event: EventHandler) -> Result<Unsubscribe>;

    /// Publish an already-signed event.
    async fn publish(&self, event: nostr::Event) -> Result<()>;
}

/// Author/kind/tag predicate used to locate invites and session envelopes.
///
/// Values for the same tag letter are alternatives; different letters must
/// all match (relay filter semantics).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubscriptionFilter {
    pub kinds: Vec<u32>,
    pub authors: Vec<PublicKey>,
    pub tags: BTreeMap<char, Vec<String>>,
}

impl SubscriptionFilter {
    pub fn matches(&self, event: &nostr::Event) -> bool {
        if !self.kinds.is_empty() && !self.kinds.contains(&(event.kind.as_u16() as u32)) {
            return false;
        }

        if !self.authors.is_empty() && !self.authors.contains(&event.pubkey) {
            return false;
        }

        self.tags.iter().all(|(letter, values)| {
            let name = letter.to_string();
            event.tags.iter().any(|t| {
                let parts = t.as_slice();
                parts.first().map(|s| s.as_str()) == Some(name.as_str())
                    && parts.get(1).map(|v| values.contains(v)).unwrap_or(false)
            })
        })
    }

    /// Converts to a relay filter. Tag letters that are not valid single
    /// letter tags are skipped.
    pub fn to_nostr_filter(&self) -> Filter {
        let mut filter = Filter::new();
        if !self.kinds.is_empty() {
            filter = filter.kinds(self.kinds.iter().map(|k| Kind::from(*k as u16)));
        }
        if !self.authors.is_empty() {
            filter = filter.authors(self.authors.clone());
        }
        for (letter, values) in &self.tags {
            match SingleLetterTag::from_char(*letter) {
                Ok(tag) => filter = filter.custom_tags(tag, values.iter().cloned()),
                Err(_) => tracing::debug!(%letter, "skipping non single-letter tag in filter"),
            }
        }
        filter
    }
}

/// Helper to build filters for this crate
pub fn build_filter() -> FilterBuilder {
    FilterBuilder::new()
}

#[derive(Default)]
pub struct FilterBuilder {
    filter: SubscriptionFilter,
}

impl FilterBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn kinds(mut self, kinds: Vec<u32>) -> Self {
        self.filter.kinds = kinds;
        self
    }

    pub fn authors(mut self, authors: Vec<PublicKey>) -> Self {
        self.filter.authors = authors;
        self
    }

    pub fn tag(mut self, letter: char, value: impl Into<String>) -> Self {
        self.filter
            .tags
            .entry(letter)
            .or_default()
            .push(value.into());
        self
    }

    pub fn build(self) -> SubscriptionFilter {
        self.filter
    }
}

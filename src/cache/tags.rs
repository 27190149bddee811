//! Bulk invalidation and optimistic replacement by tag.

use super::config::STREAMER_TAG;
use super::key::{Endpoint, SerializedKey};
use super::state::{QueryState, StatePatch};
use super::store::CacheStore;
use serde_json::Value;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TagClause {
    Tag(String),
    AnyOf(Vec<String>),
}

impl TagClause {
    fn holds(&self, tags: &BTreeSet<String>) -> bool {
        match self {
            Self::Tag(tag) => tags.contains(tag),
            Self::AnyOf(any) => any.iter().any(|tag| tags.contains(tag)),
        }
    }
}

impl From<&str> for TagClause {
    fn from(tag: &str) -> Self {
        Self::Tag(tag.to_string())
    }
}

impl From<String> for TagClause {
    fn from(tag: String) -> Self {
        Self::Tag(tag)
    }
}

impl<const N: usize> From<[&str; N]> for TagClause {
    fn from(any: [&str; N]) -> Self {
        Self::AnyOf(any.iter().map(|tag| (*tag).to_string()).collect())
    }
}

/// Every clause must hold and no excluded tag may be present.
///
/// ```
/// use querycache::cache::tags::TagFilter;
///
/// // "articles" AND ("featured" OR "pinned"), but never "draft"
/// let filter = TagFilter::new().tag("articles").any_of(["featured", "pinned"]).exclude("draft");
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[must_use]
pub struct TagFilter {
    all_of: Vec<TagClause>,
    none_of: Vec<String>,
}

impl TagFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.all_of.push(TagClause::Tag(tag.into()));
        self
    }

    pub fn any_of<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.all_of.push(TagClause::AnyOf(tags.into_iter().map(Into::into).collect()));
        self
    }

    pub fn clause(mut self, clause: impl Into<TagClause>) -> Self {
        self.all_of.push(clause.into());
        self
    }

    pub fn exclude(mut self, tag: impl Into<String>) -> Self {
        self.none_of.push(tag.into());
        self
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.all_of.is_empty() && self.none_of.is_empty()
    }

    /// Untagged entries never match. An empty filter matches every tagged
    /// entry.
    #[must_use]
    pub fn matches(&self, tags: &BTreeSet<String>) -> bool {
        if tags.is_empty() {
            return false;
        }
        self.all_of.iter().all(|clause| clause.holds(tags)) && !self.none_of.iter().any(|tag| tags.contains(tag))
    }
}

/// What a predicate mutator wants done with one entry.
#[derive(Debug, Clone, PartialEq)]
pub enum MutateAction {
    Keep,
    Delete,
    Replace(Value),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MutationReport {
    pub replaced: usize,
    pub deleted: usize,
}

/// Tag- and predicate-driven bulk operations over a [`CacheStore`].
///
/// Every operation works from a snapshot of the key set and re-reads each
/// entry before acting, so subscribers reacting to one deletion cannot
/// disturb the walk.
#[derive(Debug, Clone)]
pub struct TagInvalidator {
    store: Arc<CacheStore>,
}

impl TagInvalidator {
    pub const fn new(store: Arc<CacheStore>) -> Self {
        Self { store }
    }

    /// Delete every entry whose tags match. Returns how many were removed.
    pub fn remove_by_tags(&self, filter: &TagFilter) -> usize {
        let removed = self.remove_where(|_, state| filter.matches(&state.tags));
        info!("🏷️  INVALIDATE: {} entries matched {:?}", removed, filter);
        removed
    }

    pub fn mutate_by_predicate<F>(&self, mut predicate: F) -> MutationReport
    where
        F: FnMut(&SerializedKey, &QueryState) -> MutateAction,
    {
        let mut report = MutationReport::default();
        for key in self.store.keys() {
            let Some(state) = self.store.get(&key) else {
                continue;
            };
            match predicate(&key, &state) {
                MutateAction::Keep => {}
                MutateAction::Delete => {
                    self.store.delete(&key);
                    report.deleted += 1;
                }
                MutateAction::Replace(value) => {
                    self.store.update(&key, StatePatch::new().data(value));
                    report.replaced += 1;
                }
            }
        }
        debug!("🔧 MUTATE: {} replaced, {} deleted", report.replaced, report.deleted);
        report
    }

    /// Overwrite data of matching entries with whatever `replace` returns;
    /// `None` leaves an entry alone.
    pub fn replace_by_tags<F>(&self, filter: &TagFilter, mut replace: F) -> usize
    where
        F: FnMut(&SerializedKey, &QueryState) -> Option<Value>,
    {
        self.mutate_by_predicate(|key, state| {
            if !filter.matches(&state.tags) {
                return MutateAction::Keep;
            }
            replace(key, state).map_or(MutateAction::Keep, MutateAction::Replace)
        })
        .replaced
    }

    /// Delete the base keys of `endpoint`'s streamers whose tags match, which
    /// makes each of them re-aggregate.
    pub fn revalidate_streamers(&self, endpoint: &Endpoint, filter: &TagFilter) -> usize {
        let endpoint_id = endpoint.id();
        let removed = self.remove_where(|_, state| {
            state
                .key
                .as_ref()
                .is_some_and(|key| key.streamer && key.endpoint_id == endpoint_id)
                && state.has_tag(STREAMER_TAG)
                && filter.matches(&state.tags)
        });
        info!("🏷️  REVALIDATE STREAMERS: {} for {}", removed, endpoint_id);
        removed
    }

    fn remove_where(&self, mut predicate: impl FnMut(&SerializedKey, &QueryState) -> bool) -> usize {
        self.mutate_by_predicate(|key, state| {
            if predicate(key, state) {
                MutateAction::Delete
            } else {
                MutateAction::Keep
            }
        })
        .deleted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::key::QueryKey;
    use serde_json::json;

    fn tags(list: &[&str]) -> BTreeSet<String> {
        list.iter().map(|t| (*t).to_string()).collect()
    }

    fn seed(store: &CacheStore, n: u32, with: &[&str]) -> SerializedKey {
        let key = QueryKey::new(&Endpoint::get("/articles"), json!({ "n": n }))
            .serialize()
            .unwrap();
        store.update(&key, StatePatch::new().data(json!(n)).tags(with.iter().copied()));
        key
    }

    #[test]
    fn test_and_of_or_semantics() {
        let filter = TagFilter::new().tag("A").any_of(["B", "C"]);
        assert!(filter.matches(&tags(&["A", "B"])));
        assert!(filter.matches(&tags(&["A", "C", "Z"])));
        assert!(!filter.matches(&tags(&["A"])));
        assert!(!filter.matches(&tags(&["B", "C"])));
    }

    #[test]
    fn test_exclusions() {
        let filter = TagFilter::new().tag("A").exclude("draft");
        assert!(filter.matches(&tags(&["A"])));
        assert!(!filter.matches(&tags(&["A", "draft"])));

        let only_exclusion = TagFilter::new().exclude("draft");
        assert!(only_exclusion.matches(&tags(&["A"])));
        assert!(!only_exclusion.matches(&tags(&["draft"])));
    }

    #[test]
    fn test_untagged_entries_never_match() {
        assert!(!TagFilter::new().matches(&BTreeSet::new()));
        assert!(!TagFilter::new().tag("A").matches(&BTreeSet::new()));
        assert!(!TagFilter::new().exclude("x").matches(&BTreeSet::new()));
    }

    #[test]
    fn test_empty_filter_removes_every_tagged_entry() {
        let store = Arc::new(CacheStore::new());
        seed(&store, 1, &["A"]);
        seed(&store, 2, &["B", "C"]);
        let untagged = seed(&store, 3, &[]);

        assert!(TagFilter::new().is_empty());
        assert!(TagFilter::new().matches(&tags(&["A"])));
        let invalidator = TagInvalidator::new(Arc::clone(&store));
        assert_eq!(invalidator.remove_by_tags(&TagFilter::new()), 2);
        assert_eq!(store.keys(), vec![untagged]);
    }

    #[test]
    fn test_clause_conversions() {
        let filter = TagFilter::new().clause("A").clause(["B", "C"]);
        assert_eq!(filter, TagFilter::new().tag("A").any_of(["B", "C"]));
    }

    #[test]
    fn test_remove_by_tags() {
        let store = Arc::new(CacheStore::new());
        let keep = seed(&store, 1, &["users"]);
        let gone = seed(&store, 2, &["articles", "featured"]);
        let untagged = seed(&store, 3, &[]);

        let invalidator = TagInvalidator::new(Arc::clone(&store));
        assert_eq!(invalidator.remove_by_tags(&TagFilter::new().tag("articles")), 1);
        assert!(store.has(&keep));
        assert!(!store.has(&gone));
        assert!(store.has(&untagged));
    }

    #[test]
    fn test_predicate_mutation() {
        let store = Arc::new(CacheStore::new());
        let doubled = seed(&store, 2, &["n"]);
        let dropped = seed(&store, 3, &["n"]);
        let invalidator = TagInvalidator::new(Arc::clone(&store));

        let report = invalidator.mutate_by_predicate(|_, state| match state.value().and_then(Value::as_u64) {
            Some(2) => MutateAction::Replace(json!(4)),
            Some(3) => MutateAction::Delete,
            _ => MutateAction::Keep,
        });

        assert_eq!(report, MutationReport { replaced: 1, deleted: 1 });
        assert_eq!(store.get(&doubled).unwrap().value(), Some(&json!(4)));
        assert!(!store.has(&dropped));
    }

    #[test]
    fn test_replace_by_tags() {
        let store = Arc::new(CacheStore::new());
        let hit = seed(&store, 1, &["likes"]);
        let miss = seed(&store, 2, &["other"]);
        let invalidator = TagInvalidator::new(Arc::clone(&store));

        let replaced = invalidator.replace_by_tags(&TagFilter::new().tag("likes"), |_, state| {
            state.value().and_then(Value::as_u64).map(|n| json!(n + 100))
        });
        assert_eq!(replaced, 1);
        assert_eq!(store.get(&hit).unwrap().value(), Some(&json!(101)));
        assert_eq!(store.get(&miss).unwrap().value(), Some(&json!(2)));
    }

    #[test]
    fn test_revalidate_streamers_targets_base_keys() {
        let store = Arc::new(CacheStore::new());
        let endpoint = Endpoint::get("/feed");
        let base = QueryKey::new(&endpoint, json!({ "q": "rust" })).streamer_base();
        let base_key = base.serialize().unwrap();
        store.update(
            &base_key,
            StatePatch::new().key(base).tags([STREAMER_TAG, "feed"]),
        );
        let page = QueryKey::new(&endpoint, json!({ "q": "rust", "offset": 0, "limit": 10 }));
        let page_key = page.serialize().unwrap();
        store.update(&page_key, StatePatch::new().key(page).tags([STREAMER_TAG, "feed"]));

        let invalidator = TagInvalidator::new(Arc::clone(&store));
        assert_eq!(
            invalidator.revalidate_streamers(&Endpoint::get("/other"), &TagFilter::new().tag("feed")),
            0
        );
        assert_eq!(
            invalidator.revalidate_streamers(&endpoint, &TagFilter::new().tag("feed")),
            1
        );
        assert!(!store.has(&base_key));
        assert!(store.has(&page_key));
    }
}

use super::key::{QueryKey, SerializedKey};
use super::state::{FetchStatus, InFlight, QueryState, StatePatch};
use super::subscription::{SubscriberId, Subscription, SubscriptionManager};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tracing::{debug, info};

/// Keyed query state plus per-key subscribers.
///
/// The map lock is never held while subscribers run or across an `.await`.
/// When writes to one key race on different threads their notifications may
/// arrive out of order; subscribers that keep state read it back with
/// [`CacheStore::get`].
#[derive(Debug, Default)]
pub struct CacheStore {
    entries: RwLock<HashMap<SerializedKey, QueryState>>,
    pub subscription_manager: Arc<SubscriptionManager>,
}

/// Outcome of the atomic read-decide-publish step of a fetch.
#[derive(Debug)]
pub(crate) enum FetchStep {
    /// Another fetch is running for the key
    Join(InFlight),
    /// Cached data is fresh enough
    Cached(Value),
    /// The candidate handle was published; the caller must run the fetch
    Start(InFlight),
}

impl CacheStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn get(&self, key: &SerializedKey) -> Option<QueryState> {
        self.read().get(key).cloned()
    }

    #[must_use]
    pub fn has(&self, key: &SerializedKey) -> bool {
        self.read().contains_key(key)
    }

    #[must_use]
    pub fn keys(&self) -> Vec<SerializedKey> {
        self.read().keys().cloned().collect()
    }

    /// Snapshot of every entry
    #[must_use]
    pub fn scan(&self) -> Vec<(SerializedKey, QueryState)> {
        self.read()
            .iter()
            .map(|(key, state)| (key.clone(), state.clone()))
            .collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Merge `patch` into the entry (created if absent) and notify.
    pub fn update(&self, key: &SerializedKey, patch: StatePatch) -> QueryState {
        let state = {
            let mut entries = self.write();
            let state = entries.entry(key.clone()).or_default();
            patch.apply(state);
            state.clone()
        };
        self.subscription_manager.notify(key, Some(&state));
        state
    }

    /// Remove the entry. Subscribers are told even if nothing was stored.
    pub fn delete(&self, key: &SerializedKey) -> Option<QueryState> {
        let removed = self.write().remove(key);
        debug!("🗑️  Cache DELETE: {} (existed: {})", key, removed.is_some());
        self.subscription_manager.notify(key, None);
        removed
    }

    /// Delete every entry, notifying each key's subscribers.
    pub fn clear(&self) {
        let keys = self.keys();
        info!("🧹 Cache CLEAR: {} entries", keys.len());
        for key in keys {
            self.delete(&key);
        }
    }

    pub fn add_subscriber<F>(&self, key: &SerializedKey, callback: F) -> SubscriberId
    where
        F: Fn(Option<&QueryState>, usize) + Send + Sync + 'static,
    {
        self.subscription_manager.subscribe(key, Arc::new(callback))
    }

    pub fn remove_subscriber(&self, key: &SerializedKey, id: SubscriberId) -> bool {
        self.subscription_manager.unsubscribe(key, id)
    }

    /// Like [`CacheStore::add_subscriber`], removed when the guard drops.
    pub fn subscribe<F>(&self, key: &SerializedKey, callback: F) -> Subscription
    where
        F: Fn(Option<&QueryState>, usize) + Send + Sync + 'static,
    {
        let id = self.add_subscriber(key, callback);
        Subscription::new(Arc::clone(&self.subscription_manager), key.clone(), id)
    }

    /// Record the caller's identity and tags, then decide under one lock
    /// whether to join a running fetch, serve cached data or publish
    /// `candidate` as the new in-flight handle.
    pub(crate) fn begin_fetch(
        &self,
        key: &SerializedKey,
        query_key: &QueryKey,
        tags: &[String],
        force: bool,
        fresh_time: Duration,
        candidate: InFlight,
    ) -> FetchStep {
        let (step, state) = {
            let mut entries = self.write();
            let state = entries.entry(key.clone()).or_default();
            StatePatch::new()
                .key(query_key.clone())
                .tags(tags.iter().cloned())
                .apply(state);

            let fresh = !state.needs_fetch(force, fresh_time);
            let step = if let Some(running) = &state.in_flight {
                FetchStep::Join(running.clone())
            } else if let Some(value) = state.value().filter(|_| fresh) {
                FetchStep::Cached(value.clone())
            } else {
                state.in_flight = Some(candidate.clone());
                FetchStep::Start(candidate)
            };
            (step, state.clone())
        };
        self.subscription_manager.notify(key, Some(&state));
        step
    }

    #[must_use]
    pub fn stats(&self, fresh_time: Duration) -> CacheStats {
        let mut stats = CacheStats {
            subscriptions: self.subscription_manager.active_subscriptions(),
            ..CacheStats::default()
        };
        for state in self.read().values() {
            stats.total_entries += 1;
            match state.status(fresh_time) {
                FetchStatus::Fresh => stats.fresh_entries += 1,
                FetchStatus::Stale => stats.stale_entries += 1,
                FetchStatus::Fetching => stats.fetching_entries += 1,
                FetchStatus::Error(_) => stats.error_entries += 1,
                FetchStatus::Empty => {}
            }
        }
        stats
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<SerializedKey, QueryState>> {
        self.entries.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<SerializedKey, QueryState>> {
        self.entries.write().unwrap_or_else(PoisonError::into_inner)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub total_entries: usize,
    pub fresh_entries: usize,
    pub stale_entries: usize,
    pub fetching_entries: usize,
    pub error_entries: usize,
    pub subscriptions: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::errors::FetchError;
    use crate::cache::key::Endpoint;
    use serde_json::json;
    use std::sync::Mutex;

    fn key(n: u32) -> (QueryKey, SerializedKey) {
        let query = QueryKey::new(&Endpoint::get("/items"), json!({ "n": n }));
        let serialized = query.serialize().unwrap();
        (query, serialized)
    }

    #[test]
    fn test_update_merges_and_notifies() {
        let store = CacheStore::new();
        let (_, k) = key(1);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let log = Arc::clone(&seen);
        let _sub = store.subscribe(&k, move |state, ordinal| {
            log.lock().unwrap().push((state.and_then(|s| s.value().cloned()), ordinal));
        });

        store.update(&k, StatePatch::new().tags(["a"]));
        store.update(&k, StatePatch::new().data(json!([1, 2])).tags(["b"]));

        let state = store.get(&k).unwrap();
        assert_eq!(state.value(), Some(&json!([1, 2])));
        assert!(state.has_tag("a") && state.has_tag("b"));
        assert_eq!(*seen.lock().unwrap(), vec![(None, 0), (Some(json!([1, 2])), 0)]);
    }

    #[test]
    fn test_delete_always_notifies() {
        let store = CacheStore::new();
        let (_, k) = key(2);
        let deletions = Arc::new(Mutex::new(0));
        let count = Arc::clone(&deletions);
        let _sub = store.subscribe(&k, move |state, _| {
            if state.is_none() {
                *count.lock().unwrap() += 1;
            }
        });

        assert!(store.delete(&k).is_none());
        store.update(&k, StatePatch::new().data(json!(1)));
        assert!(store.delete(&k).is_some());
        assert!(!store.has(&k));
        assert_eq!(*deletions.lock().unwrap(), 2);
    }

    #[test]
    fn test_subscriber_may_reenter_store() {
        let store = Arc::new(CacheStore::new());
        let (_, k) = key(3);
        let (_, mirror) = key(4);

        let inner = Arc::clone(&store);
        let target = mirror.clone();
        let _sub = store.subscribe(&k, move |state, _| {
            if let Some(value) = state.and_then(QueryState::value) {
                inner.update(&target, StatePatch::new().data(value.clone()));
            }
        });

        store.update(&k, StatePatch::new().data(json!("copied")));
        assert_eq!(store.get(&mirror).and_then(|s| s.value().cloned()), Some(json!("copied")));
    }

    #[test]
    fn test_dropped_guard_stops_notifications() {
        let store = CacheStore::new();
        let (_, k) = key(5);
        let hits = Arc::new(Mutex::new(0));
        let count = Arc::clone(&hits);
        let sub = store.subscribe(&k, move |_, _| *count.lock().unwrap() += 1);

        store.update(&k, StatePatch::new());
        sub.unsubscribe();
        store.update(&k, StatePatch::new());
        assert_eq!(*hits.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_begin_fetch_publishes_once() {
        let store = CacheStore::new();
        let (query, k) = key(6);
        let tags = vec!["items".to_string()];
        let window = Duration::from_secs(5);

        let (_tx, first) = InFlight::channel();
        let step = store.begin_fetch(&k, &query, &tags, false, window, first.clone());
        assert!(matches!(step, FetchStep::Start(ref h) if h.id() == first.id()));

        let (_tx2, second) = InFlight::channel();
        let step = store.begin_fetch(&k, &query, &["more".to_string()], false, window, second);
        assert!(matches!(step, FetchStep::Join(ref h) if h.id() == first.id()));

        let state = store.get(&k).unwrap();
        assert!(state.has_tag("items") && state.has_tag("more"));
        assert_eq!(state.key.as_ref(), Some(&query));
    }

    #[tokio::test]
    async fn test_begin_fetch_serves_fresh_data() {
        let store = CacheStore::new();
        let (query, k) = key(7);
        store.update(&k, StatePatch::new().data(json!("cached")));

        let (_tx, candidate) = InFlight::channel();
        let step = store.begin_fetch(&k, &query, &[], false, Duration::from_secs(5), candidate.clone());
        assert!(matches!(step, FetchStep::Cached(ref v) if *v == json!("cached")));

        let step = store.begin_fetch(&k, &query, &[], true, Duration::from_secs(5), candidate);
        assert!(matches!(step, FetchStep::Start(_)));
    }

    #[test]
    fn test_stats() {
        let store = CacheStore::new();
        store.update(&key(1).1, StatePatch::new().data(json!(1)));
        store.update(&key(2).1, StatePatch::new().error(FetchError::Parse("bad".into())));
        store.update(&key(3).1, StatePatch::new().tags(["only-tags"]));

        let stats = store.stats(Duration::from_secs(5));
        assert_eq!(stats.total_entries, 3);
        assert_eq!(stats.fresh_entries, 1);
        assert_eq!(stats.error_entries, 1);

        store.clear();
        assert!(store.is_empty());
    }
}

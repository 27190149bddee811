use super::key::SerializedKey;
use super::state::QueryState;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use tracing::debug;
use uuid::Uuid;

/// Called with the new state (or `None` after a delete) and the
/// subscriber's position among the key's subscribers; 0 is the leader.
pub type Subscriber = Arc<dyn Fn(Option<&QueryState>, usize) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriberId(Uuid);

impl SubscriberId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

struct Registration {
    id: SubscriberId,
    callback: Subscriber,
}

pub struct SubscriptionManager {
    subscriptions: RwLock<HashMap<SerializedKey, Vec<Registration>>>,
}

impl Default for SubscriptionManager {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for SubscriptionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionManager")
            .field("active", &self.active_subscriptions())
            .finish()
    }
}

impl SubscriptionManager {
    #[must_use]
    pub fn new() -> Self {
        Self {
            subscriptions: RwLock::new(HashMap::new()),
        }
    }

    pub fn subscribe(&self, key: &SerializedKey, callback: Subscriber) -> SubscriberId {
        let id = SubscriberId::new();
        self.subscriptions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(key.clone())
            .or_default()
            .push(Registration { id, callback });
        debug!("📡 SUBSCRIBE: {} ({:?})", key, id);
        id
    }

    /// Returns whether the subscriber was registered.
    pub fn unsubscribe(&self, key: &SerializedKey, id: SubscriberId) -> bool {
        let mut subs = self.subscriptions.write().unwrap_or_else(PoisonError::into_inner);
        let Some(registrations) = subs.get_mut(key) else {
            return false;
        };
        let before = registrations.len();
        registrations.retain(|r| r.id != id);
        let removed = registrations.len() != before;
        if registrations.is_empty() {
            subs.remove(key);
        }
        removed
    }

    /// Call every subscriber of `key` in registration order.
    ///
    /// The list is copied out first and the lock released, so callbacks may
    /// subscribe, unsubscribe or touch the store.
    pub fn notify(&self, key: &SerializedKey, state: Option<&QueryState>) {
        let callbacks: Vec<Subscriber> = self
            .subscriptions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .map(|registrations| registrations.iter().map(|r| Arc::clone(&r.callback)).collect())
            .unwrap_or_default();

        if callbacks.is_empty() {
            return;
        }
        debug!("📣 NOTIFY: {} ({} subscribers, deleted: {})", key, callbacks.len(), state.is_none());
        for (ordinal, callback) in callbacks.iter().enumerate() {
            callback(state, ordinal);
        }
    }

    #[must_use]
    pub fn subscriber_count(&self, key: &SerializedKey) -> usize {
        self.subscriptions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .map_or(0, Vec::len)
    }

    #[must_use]
    pub fn active_subscriptions(&self) -> usize {
        self.subscriptions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(Vec::len)
            .sum()
    }
}

/// Registration that is removed when dropped.
#[must_use = "dropping a Subscription unsubscribes it"]
pub struct Subscription {
    manager: Arc<SubscriptionManager>,
    key: SerializedKey,
    id: SubscriberId,
}

impl Subscription {
    pub(crate) const fn new(manager: Arc<SubscriptionManager>, key: SerializedKey, id: SubscriberId) -> Self {
        Self { manager, key, id }
    }

    #[must_use]
    pub const fn id(&self) -> SubscriberId {
        self.id
    }

    #[must_use]
    pub const fn key(&self) -> &SerializedKey {
        &self.key
    }

    pub fn unsubscribe(self) {
        drop(self);
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.manager.unsubscribe(&self.key, self.id);
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("key", &self.key)
            .field("id", &self.id)
            .finish()
    }
}

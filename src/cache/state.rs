use super::errors::{FetchError, fetch_task_dropped_error};
use super::fetcher::ResponseMeta;
use super::key::QueryKey;
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use serde_json::Value;
use std::collections::BTreeSet;
use std::fmt;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;
use uuid::Uuid;

pub type FetchOutcome = Result<Value, FetchError>;

/// Shared handle to the fetch currently running for a key.
///
/// Every clone resolves to the same outcome. The work itself runs on its own
/// task, so dropping a handle never cancels it.
#[derive(Clone)]
pub struct InFlight {
    id: Uuid,
    outcome: Shared<BoxFuture<'static, FetchOutcome>>,
}

impl InFlight {
    /// A handle plus the sender its owner reports the outcome through.
    pub(crate) fn channel() -> (oneshot::Sender<FetchOutcome>, Self) {
        let (tx, rx) = oneshot::channel();
        let outcome = async move { rx.await.unwrap_or_else(|_| Err(fetch_task_dropped_error())) }
            .boxed()
            .shared();
        (
            tx,
            Self {
                id: Uuid::new_v4(),
                outcome,
            },
        )
    }

    #[must_use]
    pub const fn id(&self) -> Uuid {
        self.id
    }

    /// Wait for the fetch to finish.
    ///
    /// # Errors
    ///
    /// Whatever the fetch ended with.
    pub async fn wait(&self) -> FetchOutcome {
        self.outcome.clone().await
    }
}

impl fmt::Debug for InFlight {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InFlight").field("id", &self.id).finish_non_exhaustive()
    }
}

/// Stored data. `CachedValue(Value::Null)` is "the data is null",
/// as opposed to no data at all.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedValue(pub Value);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchStatus {
    Empty,
    Fresh,
    Stale,
    Fetching,
    Error(String),
}

#[derive(Debug, Clone, Default)]
pub struct QueryState {
    pub key: Option<QueryKey>,
    pub in_flight: Option<InFlight>,
    pub data: Option<CachedValue>,
    pub timestamp: Option<Instant>,
    pub error: Option<FetchError>,
    pub tags: BTreeSet<String>,
    pub response_meta: Option<ResponseMeta>,
}

impl QueryState {
    #[must_use]
    pub const fn is_fetching(&self) -> bool {
        self.in_flight.is_some()
    }

    #[must_use]
    pub fn value(&self) -> Option<&Value> {
        self.data.as_ref().map(|data| &data.0)
    }

    #[must_use]
    pub fn age(&self) -> Option<Duration> {
        self.timestamp.map(|t| t.elapsed())
    }

    /// Data exists and is no older than `fresh_time`. A zero window is
    /// never fresh.
    #[must_use]
    pub fn is_fresh(&self, fresh_time: Duration) -> bool {
        if fresh_time.is_zero() || self.data.is_none() {
            return false;
        }
        self.age().is_some_and(|age| age <= fresh_time)
    }

    #[must_use]
    pub fn needs_fetch(&self, force: bool, fresh_time: Duration) -> bool {
        force || !self.is_fresh(fresh_time)
    }

    #[must_use]
    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.contains(tag)
    }

    #[must_use]
    pub fn status(&self, fresh_time: Duration) -> FetchStatus {
        if self.is_fetching() {
            FetchStatus::Fetching
        } else if let Some(error) = &self.error {
            FetchStatus::Error(error.to_string())
        } else if self.is_fresh(fresh_time) {
            FetchStatus::Fresh
        } else if self.data.is_some() {
            FetchStatus::Stale
        } else {
            FetchStatus::Empty
        }
    }
}

#[derive(Debug, Clone)]
enum InFlightChange {
    Set(InFlight),
    Clear,
    /// Clear only if the stored handle is this one
    Release(Uuid),
}

/// A partial update merged into a [`QueryState`] by `CacheStore::update`.
///
/// Fields left untouched keep their current value; tags are always unioned.
#[derive(Debug, Clone, Default)]
#[must_use]
pub struct StatePatch {
    key: Option<QueryKey>,
    tags: Vec<String>,
    data: Option<Option<Value>>,
    in_flight: Option<InFlightChange>,
    error: Option<Option<FetchError>>,
    response_meta: Option<Option<ResponseMeta>>,
}

impl StatePatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn key(mut self, key: QueryKey) -> Self {
        self.key = Some(key);
        self
    }

    pub fn tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags.extend(tags.into_iter().map(Into::into));
        self
    }

    /// Write data and stamp it with the current time
    pub fn data(mut self, value: Value) -> Self {
        self.data = Some(Some(value));
        self
    }

    /// Drop data and its timestamp
    pub fn clear_data(mut self) -> Self {
        self.data = Some(None);
        self
    }

    pub fn in_flight(mut self, handle: InFlight) -> Self {
        self.in_flight = Some(InFlightChange::Set(handle));
        self
    }

    pub fn clear_in_flight(mut self) -> Self {
        self.in_flight = Some(InFlightChange::Clear);
        self
    }

    pub fn release_in_flight(mut self, handle: &InFlight) -> Self {
        self.in_flight = Some(InFlightChange::Release(handle.id()));
        self
    }

    pub fn error(mut self, error: FetchError) -> Self {
        self.error = Some(Some(error));
        self
    }

    pub fn clear_error(mut self) -> Self {
        self.error = Some(None);
        self
    }

    pub fn response_meta(mut self, meta: Option<ResponseMeta>) -> Self {
        self.response_meta = Some(meta);
        self
    }

    pub(crate) fn apply(self, state: &mut QueryState) {
        if let Some(key) = self.key {
            state.key = Some(key);
        }
        state.tags.extend(self.tags.into_iter().filter(|tag| !tag.is_empty()));
        match self.data {
            Some(Some(value)) => {
                state.data = Some(CachedValue(value));
                state.timestamp = Some(Instant::now());
            }
            Some(None) => {
                state.data = None;
                state.timestamp = None;
            }
            None => {}
        }
        match self.in_flight {
            Some(InFlightChange::Set(handle)) => state.in_flight = Some(handle),
            Some(InFlightChange::Clear) => state.in_flight = None,
            Some(InFlightChange::Release(id)) => {
                if state.in_flight.as_ref().is_some_and(|h| h.id() == id) {
                    state.in_flight = None;
                }
            }
            None => {}
        }
        if let Some(error) = self.error {
            state.error = error;
        }
        if let Some(meta) = self.response_meta {
            state.response_meta = meta;
        }
    }
}

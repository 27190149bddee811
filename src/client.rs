/**
Query client for `querycache`

The caller-facing surface over one cache store: one-shot fetches, live
query handles, optimistic mutation, tag invalidation and streamers. There is
no global instance; build a client and clone it wherever it is needed.
*/
use crate::cache::fetcher::{ResponseMeta, Transport};
use crate::cache::key::{Endpoint, QueryKey, SerializedKey};
use crate::cache::orchestrator::FetchOrchestrator;
use crate::cache::retry::RetryOn;
use crate::cache::spawn_detached;
use crate::cache::state::{QueryState, StatePatch};
use crate::cache::store::CacheStore;
use crate::cache::streamer::{Streamer, StreamerOptions};
use crate::cache::subscription::Subscription;
use crate::cache::tags::{MutateAction, MutationReport, TagFilter, TagInvalidator};
use crate::cache::{FetchError, QueryConfig, QueryOptions, errors::invalid_key_error};
use crate::error::Result;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::sync::{Arc, Weak};
use tokio::sync::watch;
use tokio_stream::wrappers::WatchStream;
use tracing::debug;

#[derive(Clone)]
pub struct QueryClient {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    orchestrator: FetchOrchestrator,
    defaults: QueryConfig,
}

impl std::fmt::Debug for QueryClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryClient")
            .field("defaults", &self.inner.defaults)
            .field("entries", &self.store().len())
            .finish()
    }
}

/// New data for [`QueryClient::mutate`].
pub enum DataMutation {
    Value(Value),
    /// Derive the new data from the current data, if any
    Update(Box<dyn FnOnce(Option<&Value>) -> std::result::Result<Value, String> + Send>),
}

impl DataMutation {
    pub fn value(value: impl Into<Value>) -> Self {
        Self::Value(value.into())
    }

    pub fn update<F>(f: F) -> Self
    where
        F: FnOnce(Option<&Value>) -> std::result::Result<Value, String> + Send + 'static,
    {
        Self::Update(Box::new(f))
    }
}

impl std::fmt::Debug for DataMutation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Value(value) => f.debug_tuple("Value").field(value).finish(),
            Self::Update(_) => f.write_str("Update(..)"),
        }
    }
}

impl QueryClient {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self::with_config(transport, QueryConfig::default())
    }

    pub fn with_config(transport: Arc<dyn Transport>, defaults: QueryConfig) -> Self {
        Self::with_store(Arc::new(CacheStore::new()), transport, defaults)
    }

    pub fn with_store(store: Arc<CacheStore>, transport: Arc<dyn Transport>, defaults: QueryConfig) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                orchestrator: FetchOrchestrator::new(store, transport),
                defaults,
            }),
        }
    }

    #[must_use]
    pub fn store(&self) -> &Arc<CacheStore> {
        self.inner.orchestrator.store()
    }

    #[must_use]
    pub fn defaults(&self) -> &QueryConfig {
        &self.inner.defaults
    }

    #[must_use]
    pub fn orchestrator(&self) -> &FetchOrchestrator {
        &self.inner.orchestrator
    }

    #[must_use]
    pub fn invalidator(&self) -> TagInvalidator {
        TagInvalidator::new(Arc::clone(self.store()))
    }

    /// The store key a query with these params and options would use.
    ///
    /// # Errors
    ///
    /// `InvalidKey` when the params cannot be represented as plain data.
    pub fn key_for<P: Serialize + ?Sized>(
        &self,
        endpoint: &Endpoint,
        params: &P,
        options: &QueryOptions,
    ) -> std::result::Result<SerializedKey, FetchError> {
        let namespace = options.merged_over(self.defaults()).namespace;
        QueryKey::from_params(endpoint, params)?
            .with_namespace(namespace)
            .serialize()
    }

    /// One-shot cached fetch.
    ///
    /// # Errors
    ///
    /// `ParamRequired` when `params` is `None`, `InvalidKey` for params that
    /// cannot be keyed, otherwise the fetch outcome.
    pub async fn fetch<P: Serialize + ?Sized>(
        &self,
        endpoint: &Endpoint,
        params: Option<&P>,
        options: &QueryOptions,
    ) -> std::result::Result<Value, FetchError> {
        let params = to_params(params)?;
        self.fetch_value(endpoint, params.as_ref(), options).await
    }

    /// [`QueryClient::fetch`] deserialized into `T`.
    ///
    /// # Errors
    ///
    /// `Error::Fetch` for fetch failures, `Error::Json` if the data does not
    /// have the shape of `T`.
    pub async fn fetch_as<T, P>(&self, endpoint: &Endpoint, params: Option<&P>, options: &QueryOptions) -> Result<T>
    where
        T: DeserializeOwned,
        P: Serialize + ?Sized,
    {
        let value = self.fetch(endpoint, params, options).await?;
        Ok(serde_json::from_value(value)?)
    }

    async fn fetch_value(
        &self,
        endpoint: &Endpoint,
        params: Option<&Value>,
        options: &QueryOptions,
    ) -> std::result::Result<Value, FetchError> {
        let config = options.merged_over(self.defaults());
        self.inner.orchestrator.fetch(endpoint, params, &config).await
    }

    /// Register interest in a query and start fetching it in the background.
    ///
    /// Without params the handle is disabled: it never fetches and its
    /// state stays empty. Must be called from within a tokio runtime for
    /// the background fetch to run.
    ///
    /// # Errors
    ///
    /// `InvalidKey` when the params cannot be keyed.
    pub fn query<P: Serialize + ?Sized>(
        &self,
        endpoint: &Endpoint,
        params: Option<&P>,
        options: QueryOptions,
    ) -> std::result::Result<QueryHandle, FetchError> {
        let params = to_params(params)?;
        let config = options.merged_over(self.defaults());
        let key = match &params {
            Some(params) => Some(
                QueryKey::new(endpoint, params.clone())
                    .with_namespace(config.namespace.clone())
                    .serialize()?,
            ),
            None => None,
        };

        // Handles fetch with retries on unless the caller says otherwise
        let fetch_options = refetch_options(&options, &QueryOptions::default());
        let (tx, rx) = watch::channel(key.as_ref().and_then(|key| self.store().get(key)));
        let subscription = key.as_ref().map(|key| {
            let weak = Arc::downgrade(&self.inner);
            let endpoint = endpoint.clone();
            let params = params.clone();
            let options = fetch_options.clone();
            let detach = config.detach;
            let store = Arc::downgrade(self.store());
            let watched = key.clone();
            self.store().subscribe(key, move |state, ordinal| {
                // Notifications for one key may overtake each other across
                // threads, so publish what the store holds now.
                tx.send_modify(|current| {
                    *current = match store.upgrade() {
                        Some(store) => store.get(&watched),
                        None => state.cloned(),
                    };
                });
                // Only the leading handle refetches after a delete
                if state.is_some() || ordinal != 0 || detach {
                    return;
                }
                Self::spawn_refetch(&weak, endpoint.clone(), params.clone(), options.clone());
            })
        });

        if let Some(key) = &key {
            debug!("👀 QUERY: {}", key);
            Self::spawn_refetch(&Arc::downgrade(&self.inner), endpoint.clone(), params.clone(), fetch_options);
        }

        Ok(QueryHandle {
            client: self.clone(),
            endpoint: endpoint.clone(),
            params,
            options,
            keep_previous_data: config.keep_previous_data,
            key,
            state: rx,
            _subscription: subscription,
        })
    }

    fn spawn_refetch(client: &Weak<ClientInner>, endpoint: Endpoint, params: Option<Value>, options: QueryOptions) {
        let Some(inner) = client.upgrade() else {
            return;
        };
        let client = Self { inner };
        spawn_detached("query fetch", async move {
            if let Err(e) = client.fetch_value(&endpoint, params.as_ref(), &options).await {
                debug!("query fetch for {} ended with {}", endpoint.id(), e);
            }
        });
    }

    /// Optimistically replace a query's data, or invalidate it when
    /// `mutation` is `None`. Returns the data now stored.
    ///
    /// # Errors
    ///
    /// `ParamRequired`, `InvalidKey`, or `Mutation` when the updater
    /// rejects the current data.
    pub fn mutate<P: Serialize + ?Sized>(
        &self,
        endpoint: &Endpoint,
        params: Option<&P>,
        options: &QueryOptions,
        mutation: Option<DataMutation>,
    ) -> std::result::Result<Option<Value>, FetchError> {
        let params = to_params(params)?;
        self.mutate_value(endpoint, params.as_ref(), options, mutation)
    }

    fn mutate_value(
        &self,
        endpoint: &Endpoint,
        params: Option<&Value>,
        options: &QueryOptions,
        mutation: Option<DataMutation>,
    ) -> std::result::Result<Option<Value>, FetchError> {
        let Some(params) = params else {
            return Err(FetchError::ParamRequired);
        };
        let namespace = options.merged_over(self.defaults()).namespace;
        let query_key = QueryKey::new(endpoint, params.clone()).with_namespace(namespace);
        let key = query_key.serialize()?;

        let Some(mutation) = mutation else {
            self.store().delete(&key);
            return Ok(None);
        };
        let value = match mutation {
            DataMutation::Value(value) => value,
            DataMutation::Update(update) => {
                let current = self.store().get(&key);
                update(current.as_ref().and_then(QueryState::value)).map_err(FetchError::Mutation)?
            }
        };
        self.store().update(
            &key,
            StatePatch::new()
                .key(query_key)
                .data(value.clone())
                .clear_in_flight()
                .clear_error(),
        );
        debug!("✏️  MUTATE: {}", key);
        Ok(Some(value))
    }

    /// Delete every entry whose tags match `filter`.
    pub fn invalidate_tags(&self, filter: &TagFilter) -> usize {
        self.invalidator().remove_by_tags(filter)
    }

    pub fn mutate_queries<F>(&self, predicate: F) -> MutationReport
    where
        F: FnMut(&SerializedKey, &QueryState) -> MutateAction,
    {
        self.invalidator().mutate_by_predicate(predicate)
    }

    pub fn replace_tagged<F>(&self, filter: &TagFilter, replace: F) -> usize
    where
        F: FnMut(&SerializedKey, &QueryState) -> Option<Value>,
    {
        self.invalidator().replace_by_tags(filter, replace)
    }

    pub fn revalidate_streamers(&self, endpoint: &Endpoint, filter: &TagFilter) -> usize {
        self.invalidator().revalidate_streamers(endpoint, filter)
    }

    /// A paginated aggregation over `endpoint`. Nothing is fetched until
    /// `load`, `set_size` or `next` is called.
    ///
    /// # Errors
    ///
    /// `InvalidKey` when the params cannot be keyed.
    pub fn streamer<P: Serialize + ?Sized>(
        &self,
        endpoint: &Endpoint,
        params: Option<&P>,
        options: StreamerOptions,
    ) -> std::result::Result<Streamer, FetchError> {
        let params = to_params(params)?;
        Streamer::new(self.orchestrator().clone(), endpoint, params, options, self.defaults())
    }
}

fn to_params<P: Serialize + ?Sized>(params: Option<&P>) -> std::result::Result<Option<Value>, FetchError> {
    params
        .map(|p| serde_json::to_value(p).map_err(|e| invalid_key_error(&e)))
        .transpose()
}

/// Handle fetches retry unless the handle's options or `overrides` say
/// otherwise.
fn refetch_options(base: &QueryOptions, overrides: &QueryOptions) -> QueryOptions {
    let retrying = QueryOptions {
        retry_on_error: base.retry_on_error.clone().or(Some(RetryOn::Always)),
        ..base.clone()
    };
    overrides.layered_over(&retrying)
}

/// What a query handle currently shows.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryView {
    pub data: Option<Value>,
    pub error: Option<FetchError>,
    pub is_loading: bool,
    pub is_revalidating: bool,
    pub response_meta: Option<ResponseMeta>,
}

/// Live view of one query. Dropping it unsubscribes.
pub struct QueryHandle {
    client: QueryClient,
    endpoint: Endpoint,
    params: Option<Value>,
    options: QueryOptions,
    keep_previous_data: bool,
    key: Option<SerializedKey>,
    state: watch::Receiver<Option<QueryState>>,
    _subscription: Option<Subscription>,
}

impl std::fmt::Debug for QueryHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryHandle")
            .field("endpoint", &self.endpoint)
            .field("key", &self.key)
            .finish_non_exhaustive()
    }
}

impl QueryHandle {
    #[must_use]
    pub const fn key(&self) -> Option<&SerializedKey> {
        self.key.as_ref()
    }

    #[must_use]
    pub const fn is_enabled(&self) -> bool {
        self.key.is_some()
    }

    #[must_use]
    pub fn state(&self) -> Option<QueryState> {
        self.state.borrow().clone()
    }

    #[must_use]
    pub fn view(&self) -> QueryView {
        let state = self.state.borrow();
        let Some(state) = state.as_ref() else {
            return QueryView {
                is_loading: self.is_enabled(),
                ..QueryView::default()
            };
        };
        let revalidating = state.is_fetching();
        let data = if revalidating && !self.keep_previous_data {
            None
        } else {
            state.value().cloned()
        };
        QueryView {
            is_loading: revalidating && data.is_none(),
            is_revalidating: revalidating,
            data,
            error: state.error.clone(),
            response_meta: state.response_meta.clone(),
        }
    }

    #[must_use]
    pub fn watch(&self) -> watch::Receiver<Option<QueryState>> {
        self.state.clone()
    }

    /// Every state transition from now on, starting with the current one.
    #[must_use]
    pub fn stream(&self) -> WatchStream<Option<QueryState>> {
        WatchStream::new(self.state.clone())
    }

    /// Wait until the state satisfies `predicate` and return it.
    /// `None` for a disabled handle.
    pub async fn wait_for<F>(&mut self, mut predicate: F) -> Option<QueryState>
    where
        F: FnMut(Option<&QueryState>) -> bool,
    {
        let state = self.state.wait_for(|state| predicate(state.as_ref())).await.ok()?;
        state.clone()
    }

    /// Fetch again with retries on, `overrides` layered over the handle's
    /// options.
    ///
    /// # Errors
    ///
    /// Same as [`QueryClient::fetch`].
    pub async fn refetch(&self, overrides: &QueryOptions) -> std::result::Result<Value, FetchError> {
        let options = refetch_options(&self.options, overrides);
        self.client
            .fetch_value(&self.endpoint, self.params.as_ref(), &options)
            .await
    }

    /// # Errors
    ///
    /// Same as [`QueryClient::mutate`].
    pub fn mutate(&self, mutation: Option<DataMutation>) -> std::result::Result<Option<Value>, FetchError> {
        self.client
            .mutate_value(&self.endpoint, self.params.as_ref(), &self.options, mutation)
    }
}

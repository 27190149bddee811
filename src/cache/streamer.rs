//! Offset/limit pagination aggregated into one growing list.
//!
//! Page `i` is an ordinary cached query with `limit = chunk_size` and
//! `offset = i * chunk_size` merged into the caller's params. All pages of a
//! streamer share a private `streamer_id:` tag, and the streamer watches a
//! base key (its params without pagination) so that deleting that key makes
//! it refetch every page.

use super::config::{
    DEFAULT_CHUNK_SIZE, DEFAULT_STREAMER_SIZE, QueryConfig, QueryOptions, STREAMER_ID_PREFIX, STREAMER_TAG,
};
use super::errors::{FetchError, interrupted_error};
use super::key::{Endpoint, QueryKey, SerializedKey};
use super::orchestrator::FetchOrchestrator;
use super::retry::RetryOn;
use super::spawn_detached;
use super::state::StatePatch;
use super::subscription::Subscription;
use serde_json::{Map, Value};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct StreamerOptions {
    pub chunk_size: usize,
    /// Pages fetched by `load` before any `next`
    pub size: usize,
    pub query: QueryOptions,
}

impl Default for StreamerOptions {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            size: DEFAULT_STREAMER_SIZE,
            query: QueryOptions::default(),
        }
    }
}

impl StreamerOptions {
    #[must_use]
    pub fn chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    #[must_use]
    pub const fn size(mut self, size: usize) -> Self {
        self.size = size;
        self
    }

    #[must_use]
    pub fn query(mut self, query: QueryOptions) -> Self {
        self.query = query;
        self
    }
}

/// What observers of a streamer see.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StreamerSnapshot {
    /// Items of every page, in page order; `None` before the first
    /// aggregation and after a failed one
    pub pages: Option<Vec<Value>>,
    pub last_page: Option<Value>,
    pub size: usize,
    pub is_loading: bool,
    pub is_finished: bool,
    pub error: Option<FetchError>,
}

/// Handle to one paginated aggregation. Dropping it interrupts any running
/// aggregation and stops listening for revalidation.
pub struct Streamer {
    inner: Arc<StreamerInner>,
    _subscription: Option<Subscription>,
}

struct StreamerInner {
    orchestrator: FetchOrchestrator,
    endpoint: Endpoint,
    params: Option<Value>,
    page_config: QueryConfig,
    chunk_size: usize,
    id: String,
    base: Option<(QueryKey, SerializedKey)>,
    size: AtomicUsize,
    generation: AtomicU64,
    closed: AtomicBool,
    snapshot: watch::Sender<StreamerSnapshot>,
}

impl Streamer {
    /// # Errors
    ///
    /// `FetchError::InvalidKey` if the base key cannot be built.
    pub fn new(
        orchestrator: FetchOrchestrator,
        endpoint: &Endpoint,
        params: Option<Value>,
        options: StreamerOptions,
        defaults: &QueryConfig,
    ) -> Result<Self, FetchError> {
        let id = format!("{STREAMER_ID_PREFIX}{}", Uuid::new_v4());
        let mut page_config = options.query.merged_over(defaults);
        let mut tags = vec![STREAMER_TAG.to_string(), id.clone()];
        tags.append(&mut page_config.tags);
        page_config.tags = tags;
        // Pages retry unless the caller chose otherwise
        page_config.retry_on_error = options.query.retry_on_error.clone().unwrap_or(RetryOn::Always);

        let base = match &params {
            Some(params) => {
                let base = QueryKey::new(endpoint, params.clone())
                    .with_namespace(page_config.namespace.clone())
                    .streamer_base();
                let serialized = base.serialize()?;
                Some((base, serialized))
            }
            None => None,
        };

        let inner = Arc::new(StreamerInner {
            orchestrator,
            endpoint: endpoint.clone(),
            params,
            page_config,
            chunk_size: options.chunk_size.max(1),
            id,
            base,
            size: AtomicUsize::new(options.size),
            generation: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            snapshot: watch::Sender::new(StreamerSnapshot {
                size: options.size,
                ..StreamerSnapshot::default()
            }),
        });

        inner.touch_base();
        let subscription = inner.base.as_ref().map(|(_, base_key)| {
            let weak: Weak<StreamerInner> = Arc::downgrade(&inner);
            inner.orchestrator.store().subscribe(base_key, move |state, _| {
                if state.is_some() {
                    return;
                }
                let Some(streamer) = weak.upgrade() else {
                    return;
                };
                debug!("♻️  STREAMER REVALIDATE: {}", streamer.id);
                spawn_detached("streamer revalidation", async move {
                    let size = streamer.size.load(Ordering::SeqCst);
                    let _ = streamer.aggregate(size, true).await;
                });
            })
        });
        info!("🌊 STREAMER CREATED: {} for {}", inner.id, inner.endpoint.id());

        Ok(Self {
            inner,
            _subscription: subscription,
        })
    }

    /// The private `streamer_id:` tag carried by every page
    #[must_use]
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    #[must_use]
    pub fn size(&self) -> usize {
        self.inner.size.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn chunk_size(&self) -> usize {
        self.inner.chunk_size
    }

    #[must_use]
    pub fn base_key(&self) -> Option<&SerializedKey> {
        self.inner.base.as_ref().map(|(_, key)| key)
    }

    #[must_use]
    pub fn snapshot(&self) -> StreamerSnapshot {
        self.inner.snapshot.borrow().clone()
    }

    #[must_use]
    pub fn watch(&self) -> watch::Receiver<StreamerSnapshot> {
        self.inner.snapshot.subscribe()
    }

    /// Fetch the current number of pages, using cached pages when fresh.
    ///
    /// # Errors
    ///
    /// See [`Streamer::aggregate`].
    pub async fn load(&self) -> Result<Vec<Value>, FetchError> {
        self.inner.aggregate(self.size(), false).await
    }

    /// # Errors
    ///
    /// See [`Streamer::aggregate`].
    pub async fn set_size(&self, size: usize) -> Result<Vec<Value>, FetchError> {
        self.inner.size.store(size, Ordering::SeqCst);
        self.inner.aggregate(size, false).await
    }

    /// Grow by one page unless the last aggregation came back short.
    ///
    /// # Errors
    ///
    /// See [`Streamer::aggregate`].
    pub async fn next(&self) -> Result<Vec<Value>, FetchError> {
        let current = self.snapshot();
        if current.is_finished {
            return Ok(current.pages.unwrap_or_default());
        }
        let size = self.inner.size.fetch_add(1, Ordering::SeqCst) + 1;
        self.inner.aggregate(size, false).await
    }

    /// Fetch pages `0..size` in order and publish their concatenation.
    ///
    /// # Errors
    ///
    /// The first page error (nothing partial is published), `ParamRequired`
    /// for a streamer without params, or `Aborted` when a newer aggregation
    /// superseded this one.
    pub async fn aggregate(&self, size: usize, force: bool) -> Result<Vec<Value>, FetchError> {
        self.inner.aggregate(size, force).await
    }

    /// Delete the base key; the streamer refetches every page in the
    /// background. Returns false for a streamer without params.
    pub fn revalidate(&self) -> bool {
        match &self.inner.base {
            Some((_, base_key)) => {
                self.inner.orchestrator.store().delete(base_key);
                true
            }
            None => false,
        }
    }
}

impl Drop for Streamer {
    fn drop(&mut self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        self.inner.generation.fetch_add(1, Ordering::SeqCst);
    }
}

impl std::fmt::Debug for Streamer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Streamer")
            .field("id", &self.inner.id)
            .field("endpoint", &self.inner.endpoint)
            .field("size", &self.size())
            .field("chunk_size", &self.inner.chunk_size)
            .finish_non_exhaustive()
    }
}

impl StreamerInner {
    async fn aggregate(&self, size: usize, force: bool) -> Result<Vec<Value>, FetchError> {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let Some(params) = &self.params else {
            return Err(FetchError::ParamRequired);
        };
        let keep_previous = self.page_config.keep_previous_data;
        self.snapshot.send_modify(|snapshot| {
            snapshot.is_loading = true;
            snapshot.size = size;
            if !keep_previous {
                snapshot.pages = None;
                snapshot.last_page = None;
            }
        });

        if size == 0 {
            self.publish(generation, StreamerSnapshot::default());
            return Ok(Vec::new());
        }

        let config = QueryConfig {
            force_refetch: force || self.page_config.force_refetch,
            ..self.page_config.clone()
        };
        let mut pages = Vec::with_capacity(size);
        for index in 0..size {
            if self.interrupted(generation) {
                return Err(interrupted_error(&self.id));
            }
            let page_params = page_params(params, index, self.chunk_size);
            match self.orchestrator.fetch(&self.endpoint, Some(&page_params), &config).await {
                Ok(page) => pages.push(page),
                Err(err) => {
                    if self.interrupted(generation) {
                        return Err(interrupted_error(&self.id));
                    }
                    warn!("❌ STREAMER PAGE FAILED: {} page {} - {}", self.id, index, err);
                    self.publish(
                        generation,
                        StreamerSnapshot {
                            size,
                            error: Some(err.clone()),
                            ..StreamerSnapshot::default()
                        },
                    );
                    self.touch_base();
                    return Err(err);
                }
            }
        }
        if self.interrupted(generation) {
            return Err(interrupted_error(&self.id));
        }

        let items = flatten(&pages);
        let is_finished = items.len() < size.saturating_mul(self.chunk_size);
        debug!(
            "🌊 STREAMER AGGREGATED: {} ({} pages, {} items, finished: {})",
            self.id,
            size,
            items.len(),
            is_finished
        );
        self.publish(
            generation,
            StreamerSnapshot {
                pages: Some(items.clone()),
                last_page: pages.pop(),
                size,
                is_loading: false,
                is_finished,
                error: None,
            },
        );
        self.touch_base();
        Ok(items)
    }

    fn interrupted(&self, generation: u64) -> bool {
        self.closed.load(Ordering::SeqCst) || self.generation.load(Ordering::SeqCst) != generation
    }

    fn publish(&self, generation: u64, snapshot: StreamerSnapshot) {
        if !self.interrupted(generation) {
            self.snapshot.send_replace(snapshot);
        }
    }

    /// Rewrite the base entry with the streamer tags so tag invalidation
    /// can find it.
    fn touch_base(&self) {
        if let Some((base, base_key)) = &self.base {
            self.orchestrator.store().update(
                base_key,
                StatePatch::new()
                    .key(base.clone())
                    .tags(self.page_config.tags.iter().cloned()),
            );
        }
    }
}

/// Caller params with `limit`/`offset` for page `index` written over them.
fn page_params(params: &Value, index: usize, chunk_size: usize) -> Value {
    let mut page = match params {
        Value::Object(map) => map.clone(),
        _ => Map::new(),
    };
    page.insert("limit".to_string(), Value::from(chunk_size));
    page.insert("offset".to_string(), Value::from(index.saturating_mul(chunk_size)));
    Value::Object(page)
}

/// Array pages contribute their elements; anything else contributes itself.
fn flatten(pages: &[Value]) -> Vec<Value> {
    pages
        .iter()
        .flat_map(|page| match page {
            Value::Array(items) => items.clone(),
            other => vec![other.clone()],
        })
        .collect()
}

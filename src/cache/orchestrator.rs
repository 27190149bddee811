use super::config::QueryConfig;
use super::errors::{FetchError, fetch_task_dropped_error};
use super::fetcher::{ResponseMeta, Transport};
use super::key::{Endpoint, QueryKey, SerializedKey};
use super::retry::{RetryDecision, RetryPolicy};
use super::state::{FetchOutcome, InFlight, StatePatch};
use super::store::{CacheStore, FetchStep};
use serde_json::Value;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::oneshot;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

/// Single-flight, freshness-aware fetching on top of a [`CacheStore`].
#[derive(Clone)]
pub struct FetchOrchestrator {
    store: Arc<CacheStore>,
    transport: Arc<dyn Transport>,
}

impl std::fmt::Debug for FetchOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FetchOrchestrator")
            .field("entries", &self.store.len())
            .finish_non_exhaustive()
    }
}

impl FetchOrchestrator {
    pub fn new(store: Arc<CacheStore>, transport: Arc<dyn Transport>) -> Self {
        Self { store, transport }
    }

    #[must_use]
    pub const fn store(&self) -> &Arc<CacheStore> {
        &self.store
    }

    /// Resolve a query: join a running fetch, serve fresh data, or fetch.
    ///
    /// A started fetch runs on its own task and always writes its outcome to
    /// the store, even if every caller stops waiting.
    ///
    /// # Errors
    ///
    /// `ParamRequired` without params, `InvalidKey` if the key cannot be
    /// built, otherwise the outcome of the (possibly joined) fetch.
    pub async fn fetch(&self, endpoint: &Endpoint, params: Option<&Value>, config: &QueryConfig) -> FetchOutcome {
        let Some(params) = params else {
            return Err(FetchError::ParamRequired);
        };
        let query_key = QueryKey::new(endpoint, params.clone()).with_namespace(config.namespace.clone());
        let key = query_key.serialize()?;

        let (tx, candidate) = InFlight::channel();
        match self.store.begin_fetch(
            &key,
            &query_key,
            &config.tags,
            config.force_refetch,
            config.fresh_time,
            candidate,
        ) {
            FetchStep::Cached(value) => {
                debug!("🎯 Cache HIT: {}", key);
                Ok(value)
            }
            FetchStep::Join(running) => {
                debug!("⏳ Cache JOIN: {} (in flight)", key);
                running.wait().await
            }
            FetchStep::Start(handle) => {
                let job = FetchJob {
                    store: Arc::clone(&self.store),
                    transport: Arc::clone(&self.transport),
                    endpoint: endpoint.clone(),
                    params: params.clone(),
                    query_key,
                    key,
                    config: config.clone(),
                    handle: handle.clone(),
                };
                let reporter = Reporter {
                    store: Arc::clone(&self.store),
                    key: job.key.clone(),
                    handle: job.handle.clone(),
                    tx: Some(tx),
                };
                tokio::spawn(async move {
                    let outcome = job.run().await;
                    reporter.report(outcome);
                });
                handle.wait().await
            }
        }
    }
}

/// Hands the outcome of a fetch task to its waiters. Dropped without
/// reporting (the task panicked or its runtime shut down), it releases the
/// key's in-flight handle and reports `Aborted` instead.
struct Reporter {
    store: Arc<CacheStore>,
    key: SerializedKey,
    handle: InFlight,
    tx: Option<oneshot::Sender<FetchOutcome>>,
}

impl Reporter {
    fn report(mut self, outcome: FetchOutcome) {
        if let Some(tx) = self.tx.take() {
            // Nobody may be waiting any more; the store already has the outcome.
            let _ = tx.send(outcome);
        }
    }
}

impl Drop for Reporter {
    fn drop(&mut self) {
        let Some(tx) = self.tx.take() else {
            return;
        };
        let err = fetch_task_dropped_error();
        error!("💥 FETCH ABORTED: {}", self.key);
        self.store.update(
            &self.key,
            StatePatch::new()
                .clear_data()
                .error(err.clone())
                .release_in_flight(&self.handle),
        );
        let _ = tx.send(Err(err));
    }
}

struct FetchJob {
    store: Arc<CacheStore>,
    transport: Arc<dyn Transport>,
    endpoint: Endpoint,
    params: Value,
    query_key: QueryKey,
    key: SerializedKey,
    config: QueryConfig,
    handle: InFlight,
}

type AttemptResult = Result<(Value, Option<ResponseMeta>), (FetchError, Option<ResponseMeta>)>;

impl FetchJob {
    async fn run(self) -> FetchOutcome {
        let policy = RetryPolicy::from_config(&self.config);
        let started = Instant::now();
        let mut retries = 0u32;

        loop {
            info!("🔄 FETCH START: {} (attempt: {})", self.key, retries + 1);
            match self.attempt().await {
                Ok((value, meta)) => {
                    self.store.update(
                        &self.key,
                        StatePatch::new()
                            .data(value.clone())
                            .release_in_flight(&self.handle)
                            .clear_error()
                            .response_meta(meta),
                    );
                    info!("✅ FETCH SUCCESS: {} ({:.2}s)", self.key, started.elapsed().as_secs_f64());
                    return Ok(value);
                }
                Err((err, meta)) => match policy.decide(&err, retries) {
                    RetryDecision::Retry { after } => {
                        warn!(
                            "🔄 FETCH RETRY: {} scheduled in {}ms (attempt {}/{}) - {}",
                            self.key,
                            after.as_millis(),
                            retries + 2,
                            policy.max_retries + 1,
                            err
                        );
                        self.store
                            .update(&self.key, StatePatch::new().release_in_flight(&self.handle));
                        sleep(after).await;
                        retries += 1;
                        if let Some(running) = self.resume() {
                            debug!("⏳ FETCH HANDOFF: {} joined a newer fetch", self.key);
                            return running.wait().await;
                        }
                    }
                    RetryDecision::GiveUp => {
                        let err = policy.surface(err, retries + 1);
                        self.store.update(
                            &self.key,
                            StatePatch::new()
                                .clear_data()
                                .error(err.clone())
                                .release_in_flight(&self.handle)
                                .response_meta(meta),
                        );
                        if retries > 0 {
                            error!("💀 FETCH ABANDONED: {} after {} attempts", self.key, retries + 1);
                        } else {
                            error!(
                                "❌ FETCH FAILED: {} ({:.2}s) - {}",
                                self.key,
                                started.elapsed().as_secs_f64(),
                                err
                            );
                        }
                        if let Some(on_error) = &self.config.on_error {
                            on_error(&err);
                        }
                        return Err(err);
                    }
                },
            }
        }
    }

    /// Republish our handle after a retry delay. If another fetch started
    /// for the key in the meantime, hand back that one instead.
    fn resume(&self) -> Option<InFlight> {
        match self.store.begin_fetch(
            &self.key,
            &self.query_key,
            &self.config.tags,
            true,
            self.config.fresh_time,
            self.handle.clone(),
        ) {
            FetchStep::Join(running) if running.id() != self.handle.id() => Some(running),
            _ => None,
        }
    }

    async fn attempt(&self) -> AttemptResult {
        let (raw, meta) = match &self.config.fetcher {
            Some(fetcher) => {
                let value = fetcher(self.params.clone()).await.map_err(|e| {
                    let meta = e.meta.clone();
                    (FetchError::from(e), meta)
                })?;
                (value, None)
            }
            None => {
                let response = self.transport.send(&self.endpoint, &self.params).await.map_err(|e| {
                    let meta = e.meta.clone();
                    (FetchError::from(e), meta)
                })?;
                (response.value, Some(response.meta))
            }
        };

        match &self.config.parser {
            Some(parser) => match parser(raw) {
                Ok(value) => Ok((value, meta)),
                Err(message) => Err((FetchError::Parse(message), meta)),
            },
            None => Ok((raw, meta)),
        }
    }
}

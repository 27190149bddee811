pub mod config;
pub mod errors;
pub mod fetcher;
pub mod key;
pub mod orchestrator;
pub mod retry;
pub mod state;
pub mod store;
pub mod streamer;
pub mod subscription;
pub mod tags;

pub use config::{QueryConfig, QueryOptions};
pub use errors::{FetchError, TransportError};
pub use fetcher::{ErrorCallback, Fetcher, FnTransport, Parser, ResponseMeta, Transport, TransportResponse};
pub use key::{Endpoint, KeyCodec, Method, QueryKey, SerializedKey};
pub use orchestrator::FetchOrchestrator;
pub use retry::{RetryDecision, RetryOn, RetryPolicy};
pub use state::{CachedValue, FetchStatus, InFlight, QueryState, StatePatch};
pub use store::{CacheStats, CacheStore};
pub use streamer::{Streamer, StreamerOptions, StreamerSnapshot};
pub use subscription::{Subscriber, SubscriberId, Subscription, SubscriptionManager};
pub use tags::{MutateAction, MutationReport, TagClause, TagFilter, TagInvalidator};

use std::future::Future;
use tracing::warn;

/// Run `future` on the current tokio runtime, if there is one.
pub(crate) fn spawn_detached<F>(what: &str, future: F)
where
    F: Future<Output = ()> + Send + 'static,
{
    match tokio::runtime::Handle::try_current() {
        Ok(runtime) => {
            runtime.spawn(future);
        }
        Err(_) => warn!("⚠️  No tokio runtime, skipping {}", what),
    }
}

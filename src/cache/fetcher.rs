use super::errors::{FetchError, TransportError};
use super::key::Endpoint;
use async_trait::async_trait;
use futures::future::BoxFuture;
use serde_json::Value;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;

/// Status and headers of the last response for a key.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResponseMeta {
    pub status: u16,
    pub headers: BTreeMap<String, String>,
}

impl ResponseMeta {
    #[must_use]
    pub fn with_status(status: u16) -> Self {
        Self {
            status,
            headers: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TransportResponse {
    pub value: Value,
    pub meta: ResponseMeta,
}

impl TransportResponse {
    #[must_use]
    pub fn ok(value: Value) -> Self {
        Self {
            value,
            meta: ResponseMeta::with_status(200),
        }
    }
}

/// Performs the remote call for an endpoint.
///
/// The cache never retries inside a transport; a failed call is reported
/// once and the orchestrator decides what happens next.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, endpoint: &Endpoint, params: &Value) -> Result<TransportResponse, TransportError>;
}

/// Per-call replacement for the transport.
pub type Fetcher = Arc<dyn Fn(Value) -> BoxFuture<'static, Result<Value, TransportError>> + Send + Sync>;

/// Per-call transformation of a successful response.
pub type Parser = Arc<dyn Fn(Value) -> Result<Value, String> + Send + Sync>;

/// Invoked once when a fetch fails for good.
pub type ErrorCallback = Arc<dyn Fn(&FetchError) + Send + Sync>;

/// Wrap an async closure as a [`Fetcher`].
pub fn fetcher<F, Fut>(f: F) -> Fetcher
where
    F: Fn(Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, TransportError>> + Send + 'static,
{
    Arc::new(move |params| Box::pin(f(params)))
}

pub fn parser<F>(f: F) -> Parser
where
    F: Fn(Value) -> Result<Value, String> + Send + Sync + 'static,
{
    Arc::new(f)
}

pub fn on_error<F>(f: F) -> ErrorCallback
where
    F: Fn(&FetchError) + Send + Sync + 'static,
{
    Arc::new(f)
}

/// A [`Transport`] backed by a closure; handy for tests and for adapting
/// clients that are not HTTP.
pub struct FnTransport<F> {
    send: F,
}

impl<F, Fut> FnTransport<F>
where
    F: Fn(Endpoint, Value) -> Fut + Send + Sync,
    Fut: Future<Output = Result<TransportResponse, TransportError>> + Send + 'static,
{
    pub const fn new(send: F) -> Self {
        Self { send }
    }
}

#[async_trait]
impl<F, Fut> Transport for FnTransport<F>
where
    F: Fn(Endpoint, Value) -> Fut + Send + Sync,
    Fut: Future<Output = Result<TransportResponse, TransportError>> + Send + 'static,
{
    async fn send(&self, endpoint: &Endpoint, params: &Value) -> Result<TransportResponse, TransportError> {
        (self.send)(endpoint.clone(), params.clone()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_fn_transport_passes_request_through() {
        let transport = FnTransport::new(|endpoint: Endpoint, params: Value| async move {
            Ok(TransportResponse::ok(json!({ "id": endpoint.id(), "params": params })))
        });
        let response = transport
            .send(&Endpoint::get("/articles"), &json!({ "page": 2 }))
            .await
            .unwrap();
        assert_eq!(response.value, json!({ "id": "GET:/articles", "params": { "page": 2 } }));
        assert_eq!(response.meta.status, 200);
    }

    #[tokio::test]
    async fn test_fetcher_and_parser_helpers() {
        let fetch = fetcher(|params: Value| async move { Ok(json!([params])) });
        let parse = parser(|value: Value| {
            value
                .as_array()
                .map(|items| json!(items.len()))
                .ok_or_else(|| "expected an array".to_string())
        });

        let raw = fetch(json!(1)).await.unwrap();
        assert_eq!(parse(raw).unwrap(), json!(1));
        assert!(parse(json!({})).is_err());
    }
}

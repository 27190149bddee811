use crate::USER_AGENT;
use crate::cache::errors::TransportError;
use crate::cache::fetcher::{ResponseMeta, Transport, TransportResponse};
use crate::cache::key::{Endpoint, Method};
use crate::error::Result;
use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use serde_json::Value;
use tracing::debug;

/// Overrides [`USER_AGENT`] when set
pub const USER_AGENT_ENV: &str = "QUERYCACHE_USER_AGENT";

/// [`Transport`] over HTTP: `base_url` + endpoint path.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    base_url: String,
}

impl HttpTransport {
    /// # Errors
    ///
    /// Will return `Err` if the HTTP client cannot be built
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let user_agent = std::env::var(USER_AGENT_ENV).unwrap_or_else(|_| USER_AGENT.to_string());
        let client = reqwest::Client::builder().user_agent(user_agent).build()?;
        Ok(Self::with_client(client, base_url))
    }

    pub fn with_client(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    #[must_use]
    pub fn url(&self, endpoint: &Endpoint) -> String {
        let path = endpoint.path();
        if path.starts_with('/') {
            format!("{}{}", self.base_url, path)
        } else {
            format!("{}/{}", self.base_url, path)
        }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, endpoint: &Endpoint, params: &Value) -> std::result::Result<TransportResponse, TransportError> {
        let url = self.url(endpoint);
        let request = self.client.request(reqwest_method(endpoint.method()), &url);
        let request = if endpoint.method().uses_query_string() {
            request.query(&query_pairs(params))
        } else {
            request.json(params)
        };

        debug!("🌐 HTTP {} {}", endpoint.method(), url);
        let response = request
            .send()
            .await
            .map_err(|e| TransportError::new(format!("{url}: {e}")))?;

        let meta = response_meta(&response);
        let is_json = meta
            .headers
            .get(CONTENT_TYPE.as_str())
            .is_some_and(|ct| ct.contains("json"));
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| TransportError::new(format!("{url}: {e}")).with_meta(meta.clone()))?;

        if !status.is_success() {
            let reason = status.canonical_reason().unwrap_or("request failed");
            let message = if body.is_empty() { reason.to_string() } else { format!("{reason}: {body}") };
            return Err(TransportError::with_status(status.as_u16(), message).with_meta(meta));
        }

        let value = decode_body(&body, is_json).map_err(|e| TransportError::undecodable(e).with_meta(meta.clone()))?;
        Ok(TransportResponse { value, meta })
    }
}

fn reqwest_method(method: Method) -> reqwest::Method {
    match method {
        Method::Get => reqwest::Method::GET,
        Method::Post => reqwest::Method::POST,
        Method::Put => reqwest::Method::PUT,
        Method::Patch => reqwest::Method::PATCH,
        Method::Delete => reqwest::Method::DELETE,
    }
}

fn response_meta(response: &reqwest::Response) -> ResponseMeta {
    ResponseMeta {
        status: response.status().as_u16(),
        headers: response
            .headers()
            .iter()
            .filter_map(|(name, value)| value.to_str().ok().map(|v| (name.as_str().to_string(), v.to_string())))
            .collect(),
    }
}

/// Strings go verbatim, other scalars and nested values as JSON text.
/// Null members are skipped.
fn query_pairs(params: &Value) -> Vec<(String, String)> {
    let Value::Object(map) = params else {
        return Vec::new();
    };
    map.iter()
        .filter(|(_, value)| !value.is_null())
        .map(|(name, value)| {
            let text = match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            (name.clone(), text)
        })
        .collect()
}

fn decode_body(body: &str, is_json: bool) -> std::result::Result<Value, String> {
    if body.is_empty() {
        return Ok(Value::Null);
    }
    if is_json {
        return serde_json::from_str(body).map_err(|e| format!("invalid JSON body: {e}"));
    }
    Ok(Value::String(body.to_string()))
}

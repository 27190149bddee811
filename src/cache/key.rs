//! Query identity and the canonical, hashed form the store is keyed by.
//!
//! Two keys serialize identically whenever their structure is equal,
//! regardless of object member order. Null object members are dropped, so a
//! `None` field and a missing field address the same entry.

use super::errors::{FetchError, invalid_key_error};
use serde::Serialize;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

impl Method {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Patch => "PATCH",
            Self::Delete => "DELETE",
        }
    }

    /// Whether params travel in the query string rather than a body
    #[must_use]
    pub const fn uses_query_string(&self) -> bool {
        matches!(self, Self::Get | Self::Delete)
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Method {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "GET" => Ok(Self::Get),
            "POST" => Ok(Self::Post),
            "PUT" => Ok(Self::Put),
            "PATCH" => Ok(Self::Patch),
            "DELETE" => Ok(Self::Delete),
            other => Err(format!("unsupported method: {other}")),
        }
    }
}

/// A remote operation: method plus path.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    method: Method,
    path: String,
}

impl Endpoint {
    #[must_use]
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
        }
    }

    #[must_use]
    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::Get, path)
    }

    #[must_use]
    pub fn post(path: impl Into<String>) -> Self {
        Self::new(Method::Post, path)
    }

    #[must_use]
    pub const fn method(&self) -> Method {
        self.method
    }

    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    /// `METHOD:path`, e.g. `GET:/api/articles`
    #[must_use]
    pub fn id(&self) -> String {
        format!("{}:{}", self.method, self.path)
    }
}

/// Logical identity of a cache entry.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryKey {
    pub endpoint_id: String,
    pub params: Value,
    pub namespace: Option<String>,
    /// Marks the base key a streamer listens on
    pub streamer: bool,
}

impl QueryKey {
    #[must_use]
    pub fn new(endpoint: &Endpoint, params: Value) -> Self {
        Self {
            endpoint_id: endpoint.id(),
            params,
            namespace: None,
            streamer: false,
        }
    }

    /// Build a key from any serializable params.
    ///
    /// # Errors
    ///
    /// `FetchError::InvalidKey` when the params are not plain structured
    /// data (for instance a map with non-string keys).
    pub fn from_params<P: Serialize + ?Sized>(endpoint: &Endpoint, params: &P) -> Result<Self, FetchError> {
        let params = serde_json::to_value(params).map_err(|e| invalid_key_error(&e))?;
        Ok(Self::new(endpoint, params))
    }

    #[must_use]
    pub fn with_namespace(mut self, namespace: Option<String>) -> Self {
        self.namespace = namespace;
        self
    }

    /// The streamer base identity: pagination fields stripped.
    #[must_use]
    pub fn streamer_base(&self) -> Self {
        let params = match &self.params {
            Value::Object(map) => Value::Object(
                map.iter()
                    .filter(|(name, _)| name.as_str() != "offset" && name.as_str() != "limit")
                    .map(|(name, value)| (name.clone(), value.clone()))
                    .collect(),
            ),
            other => other.clone(),
        };
        Self {
            endpoint_id: self.endpoint_id.clone(),
            params,
            namespace: self.namespace.clone(),
            streamer: true,
        }
    }

    /// # Errors
    ///
    /// See [`KeyCodec::serialize`].
    pub fn serialize(&self) -> Result<SerializedKey, FetchError> {
        KeyCodec::serialize(self)
    }
}

/// Opaque map key produced by [`KeyCodec`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SerializedKey(String);

impl SerializedKey {
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Endpoint id part of the key
    #[must_use]
    pub fn endpoint_id(&self) -> &str {
        self.0.split_once('#').map_or(self.0.as_str(), |(id, _)| id)
    }
}

impl fmt::Display for SerializedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SerializedKey {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

pub struct KeyCodec;

impl KeyCodec {
    /// Canonical JSON of the key, hashed with SHA-256 and prefixed with the
    /// endpoint id: `GET:/articles#<64 hex chars>`.
    ///
    /// # Errors
    ///
    /// `FetchError::InvalidKey` if the canonical form cannot be rendered.
    pub fn serialize(key: &QueryKey) -> Result<SerializedKey, FetchError> {
        let canonical = Self::canonical_json(key)?;
        let digest = Sha256::digest(canonical.as_bytes());
        Ok(SerializedKey(format!("{}#{}", key.endpoint_id, hex::encode(digest))))
    }

    /// # Errors
    ///
    /// `FetchError::InvalidKey` if rendering fails.
    pub fn canonical_json(key: &QueryKey) -> Result<String, FetchError> {
        let mut doc = BTreeMap::new();
        doc.insert("endpoint", Value::String(key.endpoint_id.clone()));
        doc.insert("params", canonicalize(&key.params));
        if let Some(namespace) = &key.namespace {
            doc.insert("namespace", Value::String(namespace.clone()));
        }
        if key.streamer {
            doc.insert("streamer", Value::Bool(true));
        }
        serde_json::to_string(&doc).map_err(|e| invalid_key_error(&e))
    }
}

/// Sort object members recursively and drop null members.
fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let sorted: BTreeMap<&String, Value> = map
                .iter()
                .filter(|(_, member)| !member.is_null())
                .map(|(name, member)| (name, canonicalize(member)))
                .collect();
            let mut out = Map::new();
            for (name, member) in sorted {
                out.insert(name.clone(), member);
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashMap;

    fn key(params: Value) -> SerializedKey {
        QueryKey::new(&Endpoint::get("/articles"), params).serialize().unwrap()
    }

    #[test]
    fn test_member_order_is_irrelevant() {
        let a = key(json!({ "page": 1, "filter": { "tag": "rust", "lang": "en" } }));
        let b = key(json!({ "filter": { "lang": "en", "tag": "rust" }, "page": 1 }));
        assert_eq!(a, b);
    }

    #[test]
    fn test_null_members_match_absent() {
        assert_eq!(key(json!({ "page": 1, "author": null })), key(json!({ "page": 1 })));
    }

    #[test]
    fn test_array_order_matters() {
        assert_ne!(key(json!({ "ids": [1, 2] })), key(json!({ "ids": [2, 1] })));
    }

    #[test]
    fn test_identity_axes_separate_keys() {
        let endpoint = Endpoint::get("/articles");
        let plain = QueryKey::new(&endpoint, json!({}));
        let alice = plain.clone().with_namespace(Some("alice".into()));
        let other_method = QueryKey::new(&Endpoint::post("/articles"), json!({}));

        let keys = [
            plain.serialize().unwrap(),
            alice.serialize().unwrap(),
            other_method.serialize().unwrap(),
            plain.streamer_base().serialize().unwrap(),
        ];
        for (i, a) in keys.iter().enumerate() {
            for b in &keys[i + 1..] {
                assert_ne!(a, b);
            }
        }
    }

    #[test]
    fn test_key_is_prefixed_with_endpoint_id() {
        let serialized = key(json!({ "page": 1 }));
        assert!(serialized.as_str().starts_with("GET:/articles#"));
        assert_eq!(serialized.endpoint_id(), "GET:/articles");
    }

    #[test]
    fn test_streamer_base_strips_pagination() {
        let endpoint = Endpoint::get("/feed");
        let page = QueryKey::new(&endpoint, json!({ "q": "x", "offset": 40, "limit": 20 }));
        let base = page.streamer_base();
        assert!(base.streamer);
        assert_eq!(base.params, json!({ "q": "x" }));
        assert_eq!(
            base.serialize().unwrap(),
            QueryKey::new(&endpoint, json!({ "q": "x" })).streamer_base().serialize().unwrap()
        );
    }

    #[test]
    fn test_non_string_map_keys_are_rejected() {
        let params: HashMap<(u8, u8), u8> = HashMap::from([((1, 2), 3)]);
        let result = QueryKey::from_params(&Endpoint::get("/grid"), &params);
        assert!(matches!(result, Err(FetchError::InvalidKey(_))));
    }

    #[test]
    fn test_method_parsing() {
        assert_eq!("delete".parse::<Method>(), Ok(Method::Delete));
        assert!("TRACE".parse::<Method>().is_err());
        assert!(Method::Get.uses_query_string());
        assert!(!Method::Patch.uses_query_string());
    }
}

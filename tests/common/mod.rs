#![allow(dead_code)]

use async_trait::async_trait;
use querycache::cache::{Endpoint, Transport, TransportError, TransportResponse};
use serde_json::{Value, json};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Transport that counts calls and answers from a script.
///
/// Scripted replies are consumed in order; once the script is empty, paged
/// requests (`offset`/`limit` params) get a slice of `0..items` and anything
/// else gets `{"call": n, "params": ...}`.
pub struct ScriptedTransport {
    calls: AtomicUsize,
    script: Mutex<VecDeque<Result<Value, TransportError>>>,
    requests: Mutex<Vec<(String, Value)>>,
    latency: Duration,
    items: u64,
}

impl ScriptedTransport {
    pub fn new() -> Arc<Self> {
        Self::build(Duration::ZERO, 0)
    }

    pub fn with_latency(latency: Duration) -> Arc<Self> {
        Self::build(latency, 0)
    }

    pub fn paged(items: u64) -> Arc<Self> {
        Self::build(Duration::ZERO, items)
    }

    fn build(latency: Duration, items: u64) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            script: Mutex::new(VecDeque::new()),
            requests: Mutex::new(Vec::new()),
            latency,
            items,
        })
    }

    pub fn push_ok(&self, value: Value) {
        self.script.lock().unwrap().push_back(Ok(value));
    }

    pub fn push_err(&self, status: u16) {
        self.script
            .lock()
            .unwrap()
            .push_back(Err(TransportError::with_status(status, "scripted failure")));
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<(String, Value)> {
        self.requests.lock().unwrap().clone()
    }

    fn default_reply(&self, call: usize, params: &Value) -> Value {
        match (params["offset"].as_u64(), params["limit"].as_u64()) {
            (Some(offset), Some(limit)) => json!((offset..self.items.min(offset + limit)).collect::<Vec<_>>()),
            _ => json!({ "call": call, "params": params }),
        }
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn send(&self, endpoint: &Endpoint, params: &Value) -> Result<TransportResponse, TransportError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        self.requests.lock().unwrap().push((endpoint.id(), params.clone()));
        let scripted = self.script.lock().unwrap().pop_front();
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        match scripted {
            Some(reply) => reply.map(TransportResponse::ok),
            None => Ok(TransportResponse::ok(self.default_reply(call, params))),
        }
    }
}

pub fn as_transport(transport: &Arc<ScriptedTransport>) -> Arc<dyn Transport> {
    Arc::clone(transport) as Arc<dyn Transport>
}

mod common;

use common::{ScriptedTransport, as_transport};
use futures::future::join_all;
use querycache::QueryClient;
use querycache::cache::fetcher::on_error;
use querycache::cache::{Endpoint, FetchError, QueryConfig, QueryOptions, RetryOn};
use serde_json::json;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

fn retrying() -> QueryConfig {
    QueryConfig {
        max_retries: 3,
        retry_delay: Duration::from_millis(2_000),
        retry_on_error: RetryOn::Always,
        ..QueryConfig::default()
    }
}

#[tokio::test(start_paused = true)]
async fn test_default_options_do_not_retry() {
    let transport = ScriptedTransport::new();
    for _ in 0..10 {
        transport.push_err(500);
    }
    let client = QueryClient::new(as_transport(&transport));

    let result = client
        .fetch(&Endpoint::get("/flaky"), Some(&json!({})), &QueryOptions::new())
        .await;

    assert_eq!(transport.calls(), 1);
    assert!(matches!(result, Err(FetchError::Transport(ref e)) if e.status == Some(500)));
}

#[tokio::test(start_paused = true)]
async fn test_persistent_failure_makes_max_retries_plus_one_calls() {
    let transport = ScriptedTransport::new();
    for _ in 0..10 {
        transport.push_err(503);
    }
    let client = QueryClient::with_config(as_transport(&transport), retrying());
    let started = tokio::time::Instant::now();

    let result = client
        .fetch(&Endpoint::get("/flaky"), Some(&json!({})), &QueryOptions::new())
        .await;

    assert_eq!(transport.calls(), 4);
    match result {
        Err(FetchError::RetryExhausted { attempts, last }) => {
            assert_eq!(attempts, 4);
            assert_eq!(last.status, Some(503));
        }
        other => panic!("unexpected outcome {other:?}"),
    }
    // Three constant delays between four attempts
    assert!(started.elapsed() >= Duration::from_millis(6_000));
}

#[tokio::test(start_paused = true)]
async fn test_retry_disabled_surfaces_transport_error() {
    let transport = ScriptedTransport::new();
    transport.push_err(500);
    let client = QueryClient::with_config(as_transport(&transport), retrying());

    let result = client
        .fetch(
            &Endpoint::get("/flaky"),
            Some(&json!({})),
            &QueryOptions::new().retry_on_error(false),
        )
        .await;

    assert_eq!(transport.calls(), 1);
    assert!(matches!(result, Err(FetchError::Transport(ref e)) if e.status == Some(500)));
}

#[tokio::test(start_paused = true)]
async fn test_transient_failure_recovers() {
    let transport = ScriptedTransport::new();
    transport.push_err(502);
    transport.push_ok(json!({ "ok": true }));
    let client = QueryClient::with_config(as_transport(&transport), retrying());
    let endpoint = Endpoint::get("/flaky");

    let value = client
        .fetch(&endpoint, Some(&json!({})), &QueryOptions::new())
        .await
        .unwrap();
    assert_eq!(value, json!({ "ok": true }));
    assert_eq!(transport.calls(), 2);

    let key = client.key_for(&endpoint, &json!({}), &QueryOptions::new()).unwrap();
    let state = client.store().get(&key).unwrap();
    assert!(state.error.is_none());
    assert!(state.in_flight.is_none());
}

#[tokio::test(start_paused = true)]
async fn test_predicate_limits_retries() {
    let transport = ScriptedTransport::new();
    transport.push_err(404);
    let client = QueryClient::with_config(as_transport(&transport), retrying());

    let result = client
        .fetch(
            &Endpoint::get("/missing"),
            Some(&json!({})),
            &QueryOptions::new().retry_on_error(RetryOn::server_errors()),
        )
        .await;

    assert_eq!(transport.calls(), 1);
    assert_eq!(result.unwrap_err().status(), Some(404));
}

#[tokio::test(start_paused = true)]
async fn test_waiters_share_the_whole_retry_sequence() {
    let transport = ScriptedTransport::with_latency(Duration::from_millis(10));
    transport.push_err(503);
    transport.push_err(503);
    let failures = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&failures);
    let client = QueryClient::with_config(as_transport(&transport), retrying());
    let options = QueryOptions::new().on_error(on_error(move |_| {
        seen.fetch_add(1, Ordering::SeqCst);
    }));
    let endpoint = Endpoint::get("/slow");

    let params = json!({});
    let results = join_all((0..4).map(|_| client.fetch(&endpoint, Some(&params), &options))).await;

    // Two failures and one success, no matter how many callers waited
    assert_eq!(transport.calls(), 3);
    assert_eq!(failures.load(Ordering::SeqCst), 0);
    for result in results {
        assert_eq!(result.unwrap()["call"], json!(3));
    }
}

#[tokio::test(start_paused = true)]
async fn test_terminal_failure_clears_data_and_calls_on_error() {
    let transport = ScriptedTransport::new();
    let client = QueryClient::with_config(as_transport(&transport), retrying());
    let endpoint = Endpoint::get("/report");
    let params = json!({});
    let failures = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&failures);

    client.fetch(&endpoint, Some(&params), &QueryOptions::new()).await.unwrap();
    transport.push_err(500);
    let result = client
        .fetch(
            &endpoint,
            Some(&params),
            &QueryOptions::new()
                .force_refetch(true)
                .retry_on_error(false)
                .on_error(on_error(move |_| {
                    seen.fetch_add(1, Ordering::SeqCst);
                })),
        )
        .await;

    assert!(result.is_err());
    assert_eq!(failures.load(Ordering::SeqCst), 1);
    let key = client.key_for(&endpoint, &params, &QueryOptions::new()).unwrap();
    let state = client.store().get(&key).unwrap();
    assert!(state.data.is_none());
    assert!(state.timestamp.is_none());
    assert!(state.error.is_some());
}

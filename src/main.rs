use anyhow::{Context, anyhow};
use async_trait::async_trait;
use clap::{Args as ClapArgs, Parser, Subcommand, ValueEnum};
use futures::future::join_all;
use querycache::QueryClient;
use querycache::cache::{
    Endpoint, Method, QueryConfig, QueryOptions, RetryOn, StreamerOptions, Transport, TransportError, TransportResponse,
};
use querycache::net::HttpTransport;
use serde_json::{Map, Value, json};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tracing::info;
use tracing_subscriber::{
    EnvFilter, fmt,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Compact, global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Compact,
    Json,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Issue cached fetches against an endpoint and report how many reached the server
    Fetch(FetchArgs),
    /// Aggregate pages of an offset/limit endpoint
    Stream(StreamArgs),
}

#[derive(ClapArgs, Debug)]
struct Target {
    /// Server base URL, e.g. http://localhost:8080/api
    base_url: String,

    /// Endpoint path, e.g. /articles
    path: String,

    /// HTTP method
    #[arg(short, long, default_value = "get")]
    method: Method,

    /// Query param as key=value; values that parse as JSON are sent as JSON
    #[arg(short = 'p', long = "param", value_parser = parse_param)]
    params: Vec<(String, Value)>,

    /// Tag attached to every cache entry touched
    #[arg(short, long = "tag")]
    tags: Vec<String>,
}

#[derive(ClapArgs, Debug)]
struct FetchArgs {
    #[command(flatten)]
    target: Target,

    /// Rounds of fetches
    #[arg(long, default_value_t = 1)]
    repeat: usize,

    /// Concurrent callers per round
    #[arg(long, default_value_t = 1)]
    concurrency: usize,

    /// Pause between rounds
    #[arg(long, default_value_t = 0)]
    interval_ms: u64,

    #[arg(long, env = "QUERYCACHE_FRESH_TIME_MS")]
    fresh_time_ms: Option<u64>,

    /// Retry failed transport calls
    #[arg(long)]
    retry: bool,

    #[arg(long, env = "QUERYCACHE_MAX_RETRIES")]
    max_retries: Option<u32>,

    #[arg(long, env = "QUERYCACHE_RETRY_DELAY_MS")]
    retry_delay_ms: Option<u64>,
}

#[derive(ClapArgs, Debug)]
struct StreamArgs {
    #[command(flatten)]
    target: Target,

    /// Items per page
    #[arg(long, default_value_t = 20)]
    chunk_size: usize,

    /// Pages to aggregate
    #[arg(long, default_value_t = 1)]
    pages: usize,
}

fn parse_param(raw: &str) -> Result<(String, Value), String> {
    let (name, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got {raw:?}"))?;
    let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
    Ok((name.to_string(), value))
}

/// Counts the calls that actually reach the server.
struct CountingTransport {
    inner: HttpTransport,
    calls: AtomicUsize,
}

#[async_trait]
impl Transport for CountingTransport {
    async fn send(&self, endpoint: &Endpoint, params: &Value) -> Result<TransportResponse, TransportError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.inner.send(endpoint, params).await
    }
}

fn init_tracing(format: LogFormat) -> anyhow::Result<()> {
    let env_filter = EnvFilter::builder()
        .with_default_directive(tracing::Level::WARN.into())
        .parse_lossy(std::env::var("RUST_LOG").unwrap_or_else(|_| "querycache=info".to_string()));

    let fmt_layer = match format {
        LogFormat::Json => fmt::layer().json().with_target(true).with_writer(std::io::stderr).boxed(),
        LogFormat::Compact => fmt::layer().compact().with_target(true).with_writer(std::io::stderr).boxed(),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .try_init()
        .map_err(|err| anyhow!("failed to install tracing subscriber: {err}"))
}

fn client_for(target: &Target, config: QueryConfig) -> anyhow::Result<(QueryClient, Arc<CountingTransport>)> {
    let transport = Arc::new(CountingTransport {
        inner: HttpTransport::new(target.base_url.clone()).context("building HTTP client")?,
        calls: AtomicUsize::new(0),
    });
    let config = QueryConfig {
        tags: target.tags.clone(),
        ..config
    };
    let client = QueryClient::with_config(Arc::clone(&transport) as Arc<dyn Transport>, config);
    Ok((client, transport))
}

fn params_of(target: &Target) -> Value {
    Value::Object(target.params.iter().cloned().collect::<Map<String, Value>>())
}

async fn run_fetch(args: FetchArgs) -> anyhow::Result<()> {
    let mut config = QueryConfig::from_env()?;
    if let Some(ms) = args.fresh_time_ms {
        config.fresh_time = Duration::from_millis(ms);
    }
    if args.retry {
        config.retry_on_error = RetryOn::Always;
    }
    if let Some(retries) = args.max_retries {
        config.max_retries = retries;
    }
    if let Some(ms) = args.retry_delay_ms {
        config.retry_delay = Duration::from_millis(ms);
    }
    let (client, transport) = client_for(&args.target, config)?;
    let endpoint = Endpoint::new(args.target.method, args.target.path.clone());
    let params = params_of(&args.target);
    let options = QueryOptions::new();

    let mut served = 0usize;
    let mut last = Value::Null;
    for round in 0..args.repeat.max(1) {
        if round > 0 && args.interval_ms > 0 {
            tokio::time::sleep(Duration::from_millis(args.interval_ms)).await;
        }
        let results = join_all((0..args.concurrency.max(1)).map(|_| client.fetch(&endpoint, Some(&params), &options))).await;
        for result in results {
            last = result?;
            served += 1;
        }
        info!("round {} done ({} transport calls so far)", round + 1, transport.calls.load(Ordering::SeqCst));
    }

    let stats = client.store().stats(client.defaults().fresh_time);
    let report = json!({
        "data": last,
        "requests": served,
        "transport_calls": transport.calls.load(Ordering::SeqCst),
        "entries": stats.total_entries,
        "fresh_entries": stats.fresh_entries,
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

async fn run_stream(args: StreamArgs) -> anyhow::Result<()> {
    let (client, transport) = client_for(&args.target, QueryConfig::from_env()?)?;
    let endpoint = Endpoint::new(args.target.method, args.target.path.clone());
    let params = params_of(&args.target);
    let streamer = client.streamer(
        &endpoint,
        Some(&params),
        StreamerOptions::default().chunk_size(args.chunk_size),
    )?;

    let items = streamer.set_size(args.pages).await?;
    let snapshot = streamer.snapshot();
    let report = json!({
        "items": items,
        "pages": snapshot.size,
        "finished": snapshot.is_finished,
        "transport_calls": transport.calls.load(Ordering::SeqCst),
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.log_format)?;

    match args.command {
        Command::Fetch(fetch) => run_fetch(fetch).await,
        Command::Stream(stream) => run_stream(stream).await,
    }
}

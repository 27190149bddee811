/**
 * Configuration constants and per-query settings for the request cache
 */
use super::fetcher::{ErrorCallback, Fetcher, Parser};
use super::retry::RetryOn;
use crate::error::{Error, Result};
use std::fmt;
use std::time::Duration;

/// How long a successful result is served without refetching (milliseconds)
pub const DEFAULT_FRESH_TIME_MS: u64 = 5_000;

/// Retries after the first failed attempt
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Constant delay between attempts (milliseconds)
pub const DEFAULT_RETRY_DELAY_MS: u64 = 2_000;

/// Pages a streamer aggregates before the first `next()`
pub const DEFAULT_STREAMER_SIZE: usize = 1;

/// Items requested per streamer page
pub const DEFAULT_CHUNK_SIZE: usize = 20;

/// Tag carried by every streamer page and base entry
pub const STREAMER_TAG: &str = "__querycache_streamer";

/// Prefix of the per-streamer private tag
pub const STREAMER_ID_PREFIX: &str = "streamer_id:";

pub const ENV_FRESH_TIME_MS: &str = "QUERYCACHE_FRESH_TIME_MS";
pub const ENV_MAX_RETRIES: &str = "QUERYCACHE_MAX_RETRIES";
pub const ENV_RETRY_DELAY_MS: &str = "QUERYCACHE_RETRY_DELAY_MS";

/// Validate configuration constants at compile time
const _: () = {
    assert!(DEFAULT_RETRY_DELAY_MS > 0, "DEFAULT_RETRY_DELAY_MS must be greater than 0");
    assert!(DEFAULT_STREAMER_SIZE > 0, "DEFAULT_STREAMER_SIZE must be greater than 0");
    assert!(DEFAULT_CHUNK_SIZE > 0, "DEFAULT_CHUNK_SIZE must be greater than 0");
    assert!(!STREAMER_TAG.is_empty(), "STREAMER_TAG must not be empty");
};

/// Fully resolved settings for one fetch.
///
/// A `QueryClient` holds one of these as its defaults; every call layers a
/// [`QueryOptions`] over it with [`QueryOptions::merged_over`].
#[derive(Clone)]
pub struct QueryConfig {
    /// Zero means every fetch goes to the transport
    pub fresh_time: Duration,
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub retry_on_error: RetryOn,
    /// Keep showing the last data while a revalidation is running
    pub keep_previous_data: bool,
    pub force_refetch: bool,
    pub tags: Vec<String>,
    /// Do not refetch when the entry is deleted underneath a query handle
    pub detach: bool,
    pub on_error: Option<ErrorCallback>,
    pub fetcher: Option<Fetcher>,
    pub parser: Option<Parser>,
    pub namespace: Option<String>,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            fresh_time: Duration::from_millis(DEFAULT_FRESH_TIME_MS),
            max_retries: DEFAULT_MAX_RETRIES,
            retry_delay: Duration::from_millis(DEFAULT_RETRY_DELAY_MS),
            retry_on_error: RetryOn::Never,
            keep_previous_data: true,
            force_refetch: false,
            tags: Vec::new(),
            detach: false,
            on_error: None,
            fetcher: None,
            parser: None,
            namespace: None,
        }
    }
}

impl fmt::Debug for QueryConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryConfig")
            .field("fresh_time", &self.fresh_time)
            .field("max_retries", &self.max_retries)
            .field("retry_delay", &self.retry_delay)
            .field("retry_on_error", &self.retry_on_error)
            .field("keep_previous_data", &self.keep_previous_data)
            .field("force_refetch", &self.force_refetch)
            .field("tags", &self.tags)
            .field("detach", &self.detach)
            .field("on_error", &self.on_error.is_some())
            .field("fetcher", &self.fetcher.is_some())
            .field("parser", &self.parser.is_some())
            .field("namespace", &self.namespace)
            .finish()
    }
}

impl QueryConfig {
    /// Defaults overridden by the `QUERYCACHE_*` environment variables.
    ///
    /// # Errors
    ///
    /// Returns `Error::Custom` when a variable is set but is not a
    /// non-negative integer.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Same as [`QueryConfig::from_env`] with an explicit variable source.
    ///
    /// # Errors
    ///
    /// Returns `Error::Custom` when a value does not parse.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();
        if let Some(ms) = parse_var::<u64>(&lookup, ENV_FRESH_TIME_MS)? {
            config.fresh_time = Duration::from_millis(ms);
        }
        if let Some(retries) = parse_var::<u32>(&lookup, ENV_MAX_RETRIES)? {
            config.max_retries = retries;
        }
        if let Some(ms) = parse_var::<u64>(&lookup, ENV_RETRY_DELAY_MS)? {
            config.retry_delay = Duration::from_millis(ms);
        }
        Ok(config)
    }
}

fn parse_var<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &str,
) -> Result<Option<T>> {
    match lookup(name) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| Error::Custom(format!("{name} must be a non-negative integer, got {raw:?}"))),
    }
}

/// Per-call overrides. Every `None` falls through to the layer below.
#[derive(Clone, Default)]
pub struct QueryOptions {
    pub fresh_time: Option<Duration>,
    pub max_retries: Option<u32>,
    pub retry_delay: Option<Duration>,
    pub retry_on_error: Option<RetryOn>,
    pub keep_previous_data: Option<bool>,
    pub force_refetch: Option<bool>,
    pub tags: Option<Vec<String>>,
    pub detach: Option<bool>,
    pub on_error: Option<ErrorCallback>,
    pub fetcher: Option<Fetcher>,
    pub parser: Option<Parser>,
    pub namespace: Option<String>,
}

impl fmt::Debug for QueryOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryOptions")
            .field("fresh_time", &self.fresh_time)
            .field("max_retries", &self.max_retries)
            .field("retry_delay", &self.retry_delay)
            .field("retry_on_error", &self.retry_on_error)
            .field("keep_previous_data", &self.keep_previous_data)
            .field("force_refetch", &self.force_refetch)
            .field("tags", &self.tags)
            .field("detach", &self.detach)
            .field("namespace", &self.namespace)
            .finish_non_exhaustive()
    }
}

impl QueryOptions {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub const fn fresh_time(mut self, fresh_time: Duration) -> Self {
        self.fresh_time = Some(fresh_time);
        self
    }

    #[must_use]
    pub const fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    #[must_use]
    pub const fn retry_delay(mut self, retry_delay: Duration) -> Self {
        self.retry_delay = Some(retry_delay);
        self
    }

    #[must_use]
    pub fn retry_on_error(mut self, retry_on: impl Into<RetryOn>) -> Self {
        self.retry_on_error = Some(retry_on.into());
        self
    }

    #[must_use]
    pub const fn keep_previous_data(mut self, keep: bool) -> Self {
        self.keep_previous_data = Some(keep);
        self
    }

    #[must_use]
    pub const fn force_refetch(mut self, force: bool) -> Self {
        self.force_refetch = Some(force);
        self
    }

    /// Empty tag strings are dropped.
    #[must_use]
    pub fn tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = Some(
            tags.into_iter()
                .map(Into::into)
                .filter(|tag: &String| !tag.is_empty())
                .collect(),
        );
        self
    }

    #[must_use]
    pub const fn detach(mut self, detach: bool) -> Self {
        self.detach = Some(detach);
        self
    }

    #[must_use]
    pub fn on_error(mut self, callback: ErrorCallback) -> Self {
        self.on_error = Some(callback);
        self
    }

    #[must_use]
    pub fn fetcher(mut self, fetcher: Fetcher) -> Self {
        self.fetcher = Some(fetcher);
        self
    }

    #[must_use]
    pub fn parser(mut self, parser: Parser) -> Self {
        self.parser = Some(parser);
        self
    }

    #[must_use]
    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    /// Resolve these overrides against `base`; set fields win.
    #[must_use]
    pub fn merged_over(&self, base: &QueryConfig) -> QueryConfig {
        QueryConfig {
            fresh_time: self.fresh_time.unwrap_or(base.fresh_time),
            max_retries: self.max_retries.unwrap_or(base.max_retries),
            retry_delay: self.retry_delay.unwrap_or(base.retry_delay),
            retry_on_error: self
                .retry_on_error
                .clone()
                .unwrap_or_else(|| base.retry_on_error.clone()),
            keep_previous_data: self.keep_previous_data.unwrap_or(base.keep_previous_data),
            force_refetch: self.force_refetch.unwrap_or(base.force_refetch),
            tags: self.tags.clone().unwrap_or_else(|| base.tags.clone()),
            detach: self.detach.unwrap_or(base.detach),
            on_error: self.on_error.clone().or_else(|| base.on_error.clone()),
            fetcher: self.fetcher.clone().or_else(|| base.fetcher.clone()),
            parser: self.parser.clone().or_else(|| base.parser.clone()),
            namespace: self.namespace.clone().or_else(|| base.namespace.clone()),
        }
    }

    /// Stack two override sets; fields set on `self` win over `lower`.
    #[must_use]
    pub fn layered_over(&self, lower: &Self) -> Self {
        Self {
            fresh_time: self.fresh_time.or(lower.fresh_time),
            max_retries: self.max_retries.or(lower.max_retries),
            retry_delay: self.retry_delay.or(lower.retry_delay),
            retry_on_error: self.retry_on_error.clone().or_else(|| lower.retry_on_error.clone()),
            keep_previous_data: self.keep_previous_data.or(lower.keep_previous_data),
            force_refetch: self.force_refetch.or(lower.force_refetch),
            tags: self.tags.clone().or_else(|| lower.tags.clone()),
            detach: self.detach.or(lower.detach),
            on_error: self.on_error.clone().or_else(|| lower.on_error.clone()),
            fetcher: self.fetcher.clone().or_else(|| lower.fetcher.clone()),
            parser: self.parser.clone().or_else(|| lower.parser.clone()),
            namespace: self.namespace.clone().or_else(|| lower.namespace.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let config = QueryConfig::default();
        assert_eq!(config.fresh_time, Duration::from_secs(5));
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.retry_delay, Duration::from_secs(2));
        assert!(matches!(config.retry_on_error, RetryOn::Never));
        assert!(config.keep_previous_data);
        assert!(!config.force_refetch);
        assert!(!config.detach);
        assert!(config.tags.is_empty());
    }

    #[test]
    fn test_overrides_win() {
        let base = QueryConfig {
            tags: vec!["base".to_string()],
            namespace: Some("alice".to_string()),
            ..QueryConfig::default()
        };
        let merged = QueryOptions::new()
            .fresh_time(Duration::ZERO)
            .retry_on_error(true)
            .tags(["articles", ""])
            .merged_over(&base);

        assert_eq!(merged.fresh_time, Duration::ZERO);
        assert!(matches!(merged.retry_on_error, RetryOn::Always));
        assert_eq!(merged.tags, vec!["articles".to_string()]);
        assert_eq!(merged.namespace.as_deref(), Some("alice"));
        assert_eq!(merged.max_retries, DEFAULT_MAX_RETRIES);
    }

    #[test]
    fn test_layered_options() {
        let handle = QueryOptions::new().max_retries(1).tags(["a"]);
        let call = QueryOptions::new().max_retries(5);
        let layered = call.layered_over(&handle);
        assert_eq!(layered.max_retries, Some(5));
        assert_eq!(layered.tags, Some(vec!["a".to_string()]));
    }

    #[test]
    fn test_from_lookup() {
        let vars: HashMap<&str, &str> = HashMap::from([
            (ENV_FRESH_TIME_MS, "0"),
            (ENV_MAX_RETRIES, " 7 "),
        ]);
        let config = QueryConfig::from_lookup(|name| vars.get(name).map(|v| (*v).to_string())).unwrap();
        assert_eq!(config.fresh_time, Duration::ZERO);
        assert_eq!(config.max_retries, 7);
        assert_eq!(config.retry_delay, Duration::from_millis(DEFAULT_RETRY_DELAY_MS));
    }

    #[test]
    fn test_from_lookup_rejects_garbage() {
        let result = QueryConfig::from_lookup(|name| (name == ENV_RETRY_DELAY_MS).then(|| "soon".to_string()));
        assert!(matches!(result, Err(Error::Custom(msg)) if msg.contains(ENV_RETRY_DELAY_MS)));
    }
}

//! Bounded retries with a constant delay.

use super::config::QueryConfig;
use super::errors::FetchError;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Whether a failed transport call may be attempted again.
#[derive(Clone, Default)]
pub enum RetryOn {
    #[default]
    Never,
    Always,
    When(Arc<dyn Fn(&FetchError) -> bool + Send + Sync>),
}

impl RetryOn {
    pub fn when<F>(predicate: F) -> Self
    where
        F: Fn(&FetchError) -> bool + Send + Sync + 'static,
    {
        Self::When(Arc::new(predicate))
    }

    /// Retry 5xx responses and failures that never got a status.
    #[must_use]
    pub fn server_errors() -> Self {
        Self::when(|error| error.status().is_none_or(|status| (500..600).contains(&status)))
    }

    #[must_use]
    pub fn allows(&self, error: &FetchError) -> bool {
        match self {
            Self::Never => false,
            Self::Always => true,
            Self::When(predicate) => predicate(error),
        }
    }
}

impl From<bool> for RetryOn {
    fn from(enabled: bool) -> Self {
        if enabled { Self::Always } else { Self::Never }
    }
}

impl fmt::Debug for RetryOn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Never => f.write_str("Never"),
            Self::Always => f.write_str("Always"),
            Self::When(_) => f.write_str("When(..)"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retry { after: Duration },
    GiveUp,
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub retry_on: RetryOn,
}

impl RetryPolicy {
    #[must_use]
    pub fn from_config(config: &QueryConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            retry_delay: config.retry_delay,
            retry_on: config.retry_on_error.clone(),
        }
    }

    /// `retries_so_far` is 0 after the first failed attempt.
    #[must_use]
    pub fn decide(&self, error: &FetchError, retries_so_far: u32) -> RetryDecision {
        if !error.is_retryable() || retries_so_far >= self.max_retries || !self.retry_on.allows(error) {
            return RetryDecision::GiveUp;
        }
        RetryDecision::Retry { after: self.retry_delay }
    }

    /// The error a caller sees once the policy gave up after `attempts`
    /// transport calls. Transport failures that were retried at least once
    /// are wrapped as `RetryExhausted`.
    #[must_use]
    pub fn surface(&self, error: FetchError, attempts: u32) -> FetchError {
        match error {
            FetchError::Transport(last) if attempts > 1 => FetchError::RetryExhausted { attempts, last },
            other => other,
        }
    }
}

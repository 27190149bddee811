/**
 * Errors produced while resolving a cached query
 */
use super::fetcher::ResponseMeta;
use thiserror::Error;

/// Failure reported by a transport or a fetcher override.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("transport error{}: {message}", .status.map(|s| format!(" ({s})")).unwrap_or_default())]
pub struct TransportError {
    pub status: Option<u16>,
    pub message: String,
    pub meta: Option<ResponseMeta>,
    /// The exchange succeeded but its body could not be decoded
    pub undecodable: bool,
}

impl TransportError {
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            status: None,
            message: message.into(),
            meta: None,
            undecodable: false,
        }
    }

    /// A successful response whose body could not be decoded. Surfaces as
    /// [`FetchError::Parse`] and is never retried.
    #[must_use]
    pub fn undecodable(message: impl Into<String>) -> Self {
        Self {
            undecodable: true,
            ..Self::new(message)
        }
    }

    #[must_use]
    pub fn with_status(status: u16, message: impl Into<String>) -> Self {
        Self {
            status: Some(status),
            ..Self::new(message)
        }
    }

    #[must_use]
    pub fn with_meta(mut self, meta: ResponseMeta) -> Self {
        if self.status.is_none() {
            self.status = Some(meta.status);
        }
        self.meta = Some(meta);
        self
    }
}

/// Everything a cached fetch can fail with.
///
/// Cloneable: one outcome is handed to every caller that joined the same
/// in-flight fetch and is also kept in the entry's state.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    #[error("invalid cache key: {0}")]
    InvalidKey(String),

    #[error("query is disabled until params are provided")]
    ParamRequired,

    #[error(transparent)]
    Transport(TransportError),

    #[error("failed to parse response: {0}")]
    Parse(String),

    #[error("gave up after {attempts} attempts: {last}")]
    RetryExhausted { attempts: u32, last: TransportError },

    #[error("optimistic update rejected: {0}")]
    Mutation(String),

    #[error("fetch aborted: {0}")]
    Aborted(String),
}

impl From<TransportError> for FetchError {
    fn from(err: TransportError) -> Self {
        if err.undecodable {
            Self::Parse(err.message)
        } else {
            Self::Transport(err)
        }
    }
}

impl FetchError {
    /// Only transport failures are candidates for another attempt.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport(_))
    }

    #[must_use]
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Transport(e) | Self::RetryExhausted { last: e, .. } => e.status,
            _ => None,
        }
    }

    #[must_use]
    pub const fn response_meta(&self) -> Option<&ResponseMeta> {
        match self {
            Self::Transport(e) | Self::RetryExhausted { last: e, .. } => e.meta.as_ref(),
            _ => None,
        }
    }
}

/// The spawned fetch task went away without reporting an outcome
#[must_use]
pub fn fetch_task_dropped_error() -> FetchError {
    FetchError::Aborted("fetch task ended before reporting a result".to_string())
}

/// A newer aggregation (or dropping the streamer) superseded this one
#[must_use]
pub fn interrupted_error(streamer_id: &str) -> FetchError {
    FetchError::Aborted(format!("{streamer_id} aggregation interrupted"))
}

/// Params could not be turned into a cache key
#[must_use]
pub fn invalid_key_error(err: &serde_json::Error) -> FetchError {
    FetchError::InvalidKey(err.to_string())
}

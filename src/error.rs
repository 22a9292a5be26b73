use crate::model::ChannelId;
use std::io;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ScanError {
    #[error("Invalid pattern '{pattern}': {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("Invalid search: {0}")]
    InvalidSpec(String),

    #[error("Configuration error: {0}")]
    InvalidConfig(String),

    #[error("No channels accessible ({failed} failed)")]
    NoChannelsAccessible { failed: usize },

    #[error("Platform error: {0}")]
    Platform(#[from] PlatformError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, ScanError>;

/// Outcome of a failed page fetch, as seen by the scan engine.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    /// Network trouble or a 5xx. Worth retrying with backoff.
    #[error("transient fetch failure in channel {channel}: {reason}")]
    Transient { channel: ChannelId, reason: String },

    /// Missing permission or unknown channel/message. Skip the channel.
    #[error("permanent fetch failure in channel {channel}: {reason}")]
    Permanent { channel: ChannelId, reason: String },
}

impl FetchError {
    pub fn is_transient(&self) -> bool {
        matches!(self, FetchError::Transient { .. })
    }

    pub fn channel(&self) -> ChannelId {
        match self {
            FetchError::Transient { channel, .. } | FetchError::Permanent { channel, .. } => {
                *channel
            }
        }
    }
}

/// Raw failure reported by a chat platform adapter.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PlatformError {
    #[error("rate limited, retry after {retry_after:?}")]
    RateLimited { retry_after: Duration },

    #[error("HTTP {status}: {message}")]
    Http { status: u16, message: String },

    #[error("network error: {0}")]
    Network(String),

    #[error("forbidden")]
    Forbidden,

    #[error("not found")]
    NotFound,
}

impl PlatformError {
    /// Map a non-throttle failure onto the retry taxonomy.
    ///
    /// Returns `None` for `RateLimited`, which the fetch coordinator handles
    /// itself by waiting and re-issuing the same request.
    pub fn classify(&self, channel: ChannelId) -> Option<FetchError> {
        let reason = self.to_string();
        match self {
            PlatformError::RateLimited { .. } => None,
            _ if self.is_transient() => Some(FetchError::Transient { channel, reason }),
            _ => Some(FetchError::Permanent { channel, reason }),
        }
    }

    /// Network trouble, a 5xx or a request timeout.
    pub fn is_transient(&self) -> bool {
        match self {
            PlatformError::Network(_) => true,
            PlatformError::Http { status, .. } => *status >= 500 || *status == 408,
            _ => false,
        }
    }
}

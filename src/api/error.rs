//! Typed failures for platform calls

use std::time::Duration;

/// A failed call to the communications platform.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ApiError {
    #[error("{operation} timed out after {secs}s", secs = .after.as_secs())]
    Timeout { operation: String, after: Duration },

    #[error("request to {url} failed: {message}")]
    Transport { url: String, message: String },

    #[error("401 Unauthorized for {url}")]
    Unauthorized { url: String },

    #[error("404 Not Found for {url}")]
    NotFound { url: String },

    #[error("429 Too Many Requests for {url}")]
    RateLimited { url: String, retry_after: Option<u64> },

    #[error("HTTP {status} for {url}: {body}")]
    Status { url: String, status: u16, body: String },

    #[error("unexpected response from {url}: {message}")]
    Decode { url: String, message: String },

    #[error("token acquisition failed: {0}")]
    Token(String),
}

impl ApiError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Worth trying again later (timeouts, throttling, 5xx, network).
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Timeout { .. } | Self::Transport { .. } | Self::RateLimited { .. } => true,
            Self::Status { status, .. } => *status >= 500,
            _ => false,
        }
    }
}

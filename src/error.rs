//! Error types for the feed aggregator

use std::io;

use thiserror::Error;

/// Result type alias for the feed aggregator
pub type Result<T> = std::result::Result<T, Error>;

/// Feed aggregator errors
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Provider requires an API key that is not configured
    #[error("Missing API key for provider: {0}")]
    MissingApiKey(String),

    /// Upstream answered with a non-success status
    #[error("Upstream {provider} returned status {status}")]
    UpstreamStatus {
        /// Provider name
        provider: String,
        /// HTTP status code (or provider-level status when the body carries one)
        status: u16,
    },

    /// Upstream answered 2xx but reported an error in its body
    #[error("Upstream {provider} rejected request: {message}")]
    UpstreamRejected {
        /// Provider name
        provider: String,
        /// Provider-reported message
        message: String,
    },

    /// Upstream did not answer within the provider timeout
    #[error("Upstream {provider} timed out after {after_ms}ms")]
    Timeout {
        /// Provider name
        provider: String,
        /// Timeout that elapsed
        after_ms: u64,
    },

    /// Response did not match the provider's documented schema
    #[error("Schema error from {provider}: {message}")]
    Schema {
        /// Provider name
        provider: String,
        /// What was wrong
        message: String,
    },

    /// Provider answered successfully but with no records
    #[error("Empty response from {0}")]
    EmptyResponse(String),

    /// Every provider in a chain failed and no estimate is available
    #[error("All providers failed for {0}")]
    Exhausted(String),

    /// Caller supplied an invalid parameter
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a schema error for a provider
    pub fn schema(provider: &str, message: impl Into<String>) -> Self {
        Self::Schema {
            provider: provider.to_string(),
            message: message.into(),
        }
    }

    /// Create a rejection error for a provider
    pub fn rejected(provider: &str, message: impl Into<String>) -> Self {
        Self::UpstreamRejected {
            provider: provider.to_string(),
            message: message.into(),
        }
    }

    /// Whether this failure comes from an upstream provider (and should
    /// advance a fallback chain rather than abort it)
    #[must_use]
    pub fn is_upstream(&self) -> bool {
        matches!(
            self,
            Self::UpstreamStatus { .. }
                | Self::UpstreamRejected { .. }
                | Self::Timeout { .. }
                | Self::Schema { .. }
                | Self::EmptyResponse(_)
                | Self::MissingApiKey(_)
                | Self::Json(_)
                | Self::Http(_)
        )
    }

    /// HTTP status code served to API clients
    #[must_use]
    pub fn status_code(&self) -> u16 {
        match self {
            Self::InvalidRequest(_) => 400,
            Self::Exhausted(_) => 503,
            e if e.is_upstream() => 502,
            _ => 500,
        }
    }

    /// Machine-readable error code served to API clients
    #[must_use]
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::InvalidRequest(_) => codes::INVALID_REQUEST,
            Self::Exhausted(_) => codes::UPSTREAM_UNAVAILABLE,
            e if e.is_upstream() => codes::UPSTREAM_ERROR,
            _ => codes::INTERNAL_ERROR,
        }
    }
}

/// Error codes used in JSON error bodies
pub mod codes {
    /// Caller input rejected
    pub const INVALID_REQUEST: &str = "INVALID_REQUEST";
    /// No such route
    pub const NOT_FOUND: &str = "NOT_FOUND";
    /// Inbound rate limit exceeded
    pub const RATE_LIMITED: &str = "RATE_LIMITED";
    /// No provider (and no cached value) could answer
    pub const UPSTREAM_UNAVAILABLE: &str = "UPSTREAM_UNAVAILABLE";
    /// A single upstream failed
    pub const UPSTREAM_ERROR: &str = "UPSTREAM_ERROR";
    /// Anything else
    pub const INTERNAL_ERROR: &str = "INTERNAL_ERROR";
}

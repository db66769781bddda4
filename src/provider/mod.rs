//! Upstream data providers
//!
//! A provider wraps one third-party API: it issues the request, and maps the
//! response into the feed's normalized record type. Providers are composed
//! into [`FallbackChain`]s, which try them in priority order.

pub mod chain;

pub use chain::{ChainOutcome, FallbackChain};

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::{Error, Result};

/// Source tag carried by records that come from a static estimate
pub const ESTIMATE_SOURCE: &str = "estimate";

/// One external data source producing normalized records of type `T`
#[async_trait]
pub trait Provider<T>: Send + Sync {
    /// Provider name; also the throttle and health key
    fn name(&self) -> &str;

    /// Whether the provider has what it needs (API key, enabled flag).
    /// Unconfigured providers are skipped without any request.
    fn is_configured(&self) -> bool {
        true
    }

    /// Fetch and normalize. Any failure is an `Err`; never partial data.
    async fn fetch(&self) -> Result<Vec<T>>;
}

/// Record of a single provider attempt
#[derive(Debug, Clone, Serialize)]
pub struct ProviderResult {
    /// Provider name
    pub provider_name: String,
    /// Whether the attempt produced data
    pub success: bool,
    /// Normalized records produced, as JSON
    #[serde(skip_serializing)]
    pub payload: Option<Value>,
    /// Wall-clock time spent in the fetch, excluding throttle wait
    pub latency_ms: u64,
    /// Failure reason
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ProviderResult {
    /// Successful attempt
    #[must_use]
    pub fn succeeded(provider: &str, payload: Option<Value>, latency_ms: u64) -> Self {
        Self {
            provider_name: provider.to_string(),
            success: true,
            payload,
            latency_ms,
            error: None,
        }
    }

    /// Failed attempt
    #[must_use]
    pub fn failed(provider: &str, error: String, latency_ms: u64) -> Self {
        Self {
            provider_name: provider.to_string(),
            success: false,
            payload: None,
            latency_ms,
            error: Some(error),
        }
    }
}

/// Decode a raw response into a provider's schema type.
/// Missing or mistyped required fields become [`Error::Schema`].
pub fn decode<S: DeserializeOwned>(provider: &str, raw: &Value) -> Result<S> {
    S::deserialize(raw).map_err(|e| Error::schema(provider, e.to_string()))
}

/// Parse a decimal number sent as a string
pub fn parse_decimal(provider: &str, field: &str, value: &str) -> Result<f64> {
    value
        .trim()
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite() && *v >= 0.0)
        .ok_or_else(|| Error::schema(provider, format!("{field}: not a non-negative number: {value:?}")))
}

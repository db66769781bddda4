//! Configuration management

use std::{collections::HashMap, env, path::Path, time::Duration};

use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use regex::Regex;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::{Error, Result};

/// Environment prefix for configuration overrides
pub const ENV_PREFIX: &str = "FEED_AGGREGATOR_";

/// Main configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Environment files to load before processing config.
    /// Paths support ~ expansion. Loaded in order, later files override earlier.
    pub env_files: Vec<String>,
    /// Server configuration
    pub server: ServerConfig,
    /// Inbound rate limiting
    pub rate_limit: RateLimitConfig,
    /// Outbound HTTP defaults
    pub http: HttpConfig,
    /// Upstream provider settings
    pub providers: ProvidersConfig,
    /// Per-feed settings
    pub feeds: FeedsConfig,
}

impl Config {
    /// Load configuration from file and environment
    ///
    /// # Errors
    ///
    /// Returns an error if the config file does not exist or cannot be parsed.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::new();

        if let Some(p) = path {
            if !p.exists() {
                return Err(Error::Config(format!(
                    "Config file not found: {}",
                    p.display()
                )));
            }
            figment = figment.merge(Yaml::file(p));
        }

        figment = figment.merge(Env::prefixed(ENV_PREFIX).split("__"));

        let mut config: Self = figment
            .extract()
            .map_err(|e| Error::Config(e.to_string()))?;

        // Env files first, so ${VAR} expansion can see their values
        config.load_env_files();
        config.expand_env_vars()?;
        config.validate()?;

        Ok(config)
    }

    /// Check that every configured URL is an absolute http(s) URL
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] naming the first offending entry.
    pub fn validate(&self) -> Result<()> {
        let provider_urls = self
            .providers
            .by_name
            .iter()
            .filter_map(|(name, p)| p.base_url.as_deref().map(|u| (format!("providers.{name}.base_url"), u)));
        let rpc_urls = self
            .feeds
            .gas
            .rpc_urls
            .iter()
            .map(|(network, u)| (format!("feeds.gas.rpc_urls.{network}"), u.as_str()));

        for (field, value) in provider_urls.chain(rpc_urls) {
            let parsed = Url::parse(value).map_err(|e| Error::Config(format!("{field}: {e}")))?;
            if !matches!(parsed.scheme(), "http" | "https") {
                return Err(Error::Config(format!(
                    "{field}: unsupported scheme {:?}",
                    parsed.scheme()
                )));
            }
        }
        Ok(())
    }

    /// Load environment files into the process environment.
    /// Files that don't exist are silently skipped.
    fn load_env_files(&self) {
        for path_str in &self.env_files {
            let expanded = match (path_str.strip_prefix('~'), dirs::home_dir()) {
                (Some(rest), Some(home)) => format!("{}{rest}", home.display()),
                _ => path_str.clone(),
            };

            let path = Path::new(&expanded);
            if path.exists() {
                match dotenvy::from_path(path) {
                    Ok(()) => tracing::info!("Loaded env file: {expanded}"),
                    Err(e) => tracing::warn!("Failed to load env file {expanded}: {e}"),
                }
            } else {
                tracing::debug!("Env file not found (skipped): {expanded}");
            }
        }
    }

    /// Expand ${VAR} and ${VAR:-default} patterns in provider settings
    fn expand_env_vars(&mut self) -> Result<()> {
        let re = Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)(?::-([^}]*))?\}")
            .map_err(|e| Error::Internal(e.to_string()))?;

        for provider in self.providers.by_name.values_mut() {
            for value in [&mut provider.base_url, &mut provider.api_key]
                .into_iter()
                .flatten()
            {
                *value = expand_string(&re, value);
            }
        }

        for url in self.feeds.gas.rpc_urls.values_mut() {
            *url = expand_string(&re, url);
        }

        Ok(())
    }

    /// Copy of this configuration with API keys masked, for display
    #[must_use]
    pub fn redacted(&self) -> Self {
        let mut config = self.clone();
        for provider in config.providers.by_name.values_mut() {
            if provider.api_key.is_some() {
                provider.api_key = Some("********".to_string());
            }
        }
        config
    }
}

/// Expand environment variables in a string
fn expand_string(re: &Regex, value: &str) -> String {
    re.replace_all(value, |caps: &regex::Captures| {
        let var_name = &caps[1];
        let default = caps.get(2).map_or("", |m| m.as_str());
        env::var(var_name).unwrap_or_else(|_| default.to_string())
    })
    .into_owned()
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host to bind to
    pub host: String,
    /// Port to listen on
    pub port: u16,
    /// Request timeout
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
    /// How long expired snapshots are kept for stale serving
    #[serde(with = "humantime_serde")]
    pub stale_retention: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 39500,
            request_timeout: Duration::from_secs(30),
            stale_retention: Duration::from_secs(3600),
        }
    }
}

/// Inbound rate limiting configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Enable rate limiting
    pub enabled: bool,
    /// Sustained requests per second across all clients
    pub requests_per_second: u32,
    /// Burst size
    pub burst_size: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            requests_per_second: 20,
            burst_size: 40,
        }
    }
}

/// Outbound HTTP defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    /// Default per-request timeout
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    /// User agent sent upstream
    pub user_agent: String,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            user_agent: concat!("feed-aggregator/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

/// Upstream provider configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProvidersConfig {
    /// Minimum interval between calls for providers without their own setting
    #[serde(with = "humantime_serde")]
    pub default_min_interval: Duration,
    /// Settings keyed by provider name (`etherscan`, `coinglass`, ...)
    #[serde(flatten)]
    pub by_name: HashMap<String, ProviderConfig>,
}

impl Default for ProvidersConfig {
    fn default() -> Self {
        Self {
            default_min_interval: Duration::from_millis(250),
            by_name: HashMap::new(),
        }
    }
}

impl ProvidersConfig {
    /// Resolve settings for a provider, filling gaps from defaults
    #[must_use]
    pub fn resolve(&self, name: &str, default_base_url: &str, http: &HttpConfig) -> ProviderSettings {
        let entry = self.by_name.get(name);

        ProviderSettings {
            name: name.to_string(),
            enabled: entry.is_none_or(|p| p.enabled),
            api_key: entry
                .and_then(|p| p.api_key.as_deref())
                .and_then(resolve_secret)
                .or_else(|| conventional_api_key(name)),
            base_url: entry
                .and_then(|p| p.base_url.clone())
                .unwrap_or_else(|| default_base_url.to_string())
                .trim_end_matches('/')
                .to_string(),
            timeout: entry.and_then(|p| p.timeout).unwrap_or(http.timeout),
        }
    }

    /// Providers with an explicit minimum interval
    pub fn min_intervals(&self) -> impl Iterator<Item = (&String, Duration)> {
        self.by_name
            .iter()
            .filter_map(|(name, p)| p.min_interval.map(|i| (name, i)))
    }
}

/// Resolve a secret value: `env:VAR` reads the variable, blank means unset
fn resolve_secret(value: &str) -> Option<String> {
    let resolved = match value.strip_prefix("env:") {
        Some(var_name) => env::var(var_name).ok()?,
        None => value.to_string(),
    };
    let trimmed = resolved.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

/// `whale-alert` -> `WHALE_ALERT_API_KEY`
fn conventional_api_key(name: &str) -> Option<String> {
    let var_name = format!("{}_API_KEY", name.to_uppercase().replace('-', "_"));
    env::var(var_name).ok().and_then(|v| resolve_secret(&v))
}

/// Settings for a single provider as written in config
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    /// Whether the provider may be used
    pub enabled: bool,
    /// API key (literal or `env:VAR_NAME`)
    pub api_key: Option<String>,
    /// Override the provider's base URL
    pub base_url: Option<String>,
    /// Per-request timeout
    #[serde(with = "humantime_serde::option")]
    pub timeout: Option<Duration>,
    /// Minimum interval between calls
    #[serde(with = "humantime_serde::option")]
    pub min_interval: Option<Duration>,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            api_key: None,
            base_url: None,
            timeout: None,
            min_interval: None,
        }
    }
}

/// Fully resolved provider settings
#[derive(Debug, Clone)]
pub struct ProviderSettings {
    /// Provider name
    pub name: String,
    /// Whether the provider may be used
    pub enabled: bool,
    /// Resolved API key
    pub api_key: Option<String>,
    /// Base URL without trailing slash
    pub base_url: String,
    /// Per-request timeout
    pub timeout: Duration,
}

/// Per-feed configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct FeedsConfig {
    /// Gas price feed
    pub gas: GasFeedConfig,
    /// Liquidation feed
    pub liquidations: LiquidationFeedConfig,
    /// Whale transaction feed
    pub whales: WhaleFeedConfig,
    /// Bitcoin block height feed
    pub block_height: BlockHeightFeedConfig,
}

/// Gas feed configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GasFeedConfig {
    /// Cache TTL
    #[serde(with = "humantime_serde")]
    pub ttl: Duration,
    /// Networks queried for `network=all`, in response order
    pub networks: Vec<String>,
    /// JSON-RPC endpoint overrides keyed by network
    pub rpc_urls: HashMap<String, String>,
}

impl Default for GasFeedConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(15),
            networks: ["ethereum", "polygon", "bsc", "arbitrum", "base"]
                .into_iter()
                .map(String::from)
                .collect(),
            rpc_urls: HashMap::new(),
        }
    }
}

/// Liquidation feed configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LiquidationFeedConfig {
    /// Cache TTL
    #[serde(with = "humantime_serde")]
    pub ttl: Duration,
    /// Base asset symbol
    pub symbol: String,
    /// Trade notional above which a trade is treated as a forced liquidation
    pub min_trade_usd: f64,
    /// History window requested from providers that take one
    #[serde(with = "humantime_serde")]
    pub lookback: Duration,
}

impl Default for LiquidationFeedConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(30),
            symbol: "BTC".to_string(),
            min_trade_usd: 100_000.0,
            lookback: Duration::from_secs(3600),
        }
    }
}

/// Whale feed configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WhaleFeedConfig {
    /// Cache TTL
    #[serde(with = "humantime_serde")]
    pub ttl: Duration,
    /// Minimum transfer value in USD
    pub min_value_usd: f64,
    /// History window
    #[serde(with = "humantime_serde")]
    pub lookback: Duration,
}

impl Default for WhaleFeedConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(60),
            min_value_usd: 500_000.0,
            lookback: Duration::from_secs(3600),
        }
    }
}

/// Block height feed configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BlockHeightFeedConfig {
    /// Cache TTL
    #[serde(with = "humantime_serde")]
    pub ttl: Duration,
}

impl Default for BlockHeightFeedConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(30),
        }
    }
}

/// Human-readable duration (de)serialization: `"30s"`, `"5m"`, `"250ms"`
pub mod humantime_serde {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    /// Serialize Duration to a human-readable string
    ///
    /// # Errors
    ///
    /// Returns a serialization error if the serializer fails.
    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&format_duration(*duration))
    }

    /// Deserialize a human-readable duration string
    ///
    /// # Errors
    ///
    /// Returns a deserialization error if the string cannot be parsed as a duration.
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        parse_duration(&s).map_err(serde::de::Error::custom)
    }

    /// Render whole seconds as `Ns`, anything finer as `Nms`
    #[must_use]
    pub fn format_duration(duration: Duration) -> String {
        if duration.subsec_nanos() == 0 {
            format!("{}s", duration.as_secs())
        } else {
            format!("{}ms", duration.as_millis())
        }
    }

    /// Parse `"100ms"`, `"30s"`, `"5m"`, `"1h"` or bare seconds
    pub fn parse_duration(s: &str) -> Result<Duration, String> {
        let s = s.trim();
        let parse = |n: &str| n.trim().parse::<u64>().map_err(|e| format!("{s}: {e}"));

        if let Some(ms) = s.strip_suffix("ms") {
            parse(ms).map(Duration::from_millis)
        } else if let Some(secs) = s.strip_suffix('s') {
            parse(secs).map(Duration::from_secs)
        } else if let Some(mins) = s.strip_suffix('m') {
            parse(mins).map(|m| Duration::from_secs(m * 60))
        } else if let Some(hours) = s.strip_suffix('h') {
            parse(hours).map(|h| Duration::from_secs(h * 3600))
        } else {
            parse(s).map(Duration::from_secs)
        }
    }

    /// Same format for `Option<Duration>` fields
    pub mod option {
        use std::time::Duration;

        use serde::{Deserialize, Deserializer, Serializer};

        /// Serialize an optional duration
        ///
        /// # Errors
        ///
        /// Returns a serialization error if the serializer fails.
        pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
        where
            S: Serializer,
        {
            match duration {
                Some(d) => serializer.serialize_some(&super::format_duration(*d)),
                None => serializer.serialize_none(),
            }
        }

        /// Deserialize an optional duration
        ///
        /// # Errors
        ///
        /// Returns a deserialization error if the string cannot be parsed as a duration.
        pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
        where
            D: Deserializer<'de>,
        {
            Option::<String>::deserialize(deserializer)?
                .map(|s| super::parse_duration(&s).map_err(serde::de::Error::custom))
                .transpose()
        }
    }
}

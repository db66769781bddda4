//! Gas price feed
//!
//! One fallback chain per network: the Etherscan gas oracle, then Blocknative
//! (Ethereum only), then the network's public JSON-RPC `eth_gasPrice`, then a
//! static per-network estimate. All prices are gwei.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use super::FeedSnapshot;
use crate::cache::{CacheStatsSnapshot, Cached, StalePolicy, TtlCache};
use crate::config::{Config, ProviderSettings};
use crate::failsafe::Failsafe;
use crate::http::HttpFetcher;
use crate::provider::{ESTIMATE_SOURCE, FallbackChain, Provider, decode, parse_decimal};
use crate::{Error, Result};

/// Etherscan provider name
pub const ETHERSCAN: &str = "etherscan";
/// Blocknative provider name
pub const BLOCKNATIVE: &str = "blocknative";

const ETHERSCAN_BASE_URL: &str = "https://api.etherscan.io";
const BLOCKNATIVE_BASE_URL: &str = "https://api.blocknative.com";

/// Gas price unit used by every record
pub const GWEI: &str = "gwei";

/// Static description of a supported network
#[derive(Debug)]
pub struct NetworkSpec {
    /// Network name used in requests and records
    pub name: &'static str,
    /// EVM chain id
    pub chain_id: u64,
    /// Public JSON-RPC endpoint
    pub default_rpc: &'static str,
    /// Static (slow, standard, fast) estimate in gwei
    pub estimate: (f64, f64, f64),
}

/// Supported networks
pub const NETWORKS: [NetworkSpec; 5] = [
    NetworkSpec {
        name: "ethereum",
        chain_id: 1,
        default_rpc: "https://eth.llamarpc.com",
        estimate: (15.0, 20.0, 30.0),
    },
    NetworkSpec {
        name: "polygon",
        chain_id: 137,
        default_rpc: "https://polygon-rpc.com",
        estimate: (30.0, 40.0, 60.0),
    },
    NetworkSpec {
        name: "bsc",
        chain_id: 56,
        default_rpc: "https://bsc-dataseed.binance.org",
        estimate: (1.0, 3.0, 5.0),
    },
    NetworkSpec {
        name: "arbitrum",
        chain_id: 42_161,
        default_rpc: "https://arb1.arbitrum.io/rpc",
        estimate: (0.01, 0.02, 0.05),
    },
    NetworkSpec {
        name: "base",
        chain_id: 8453,
        default_rpc: "https://mainnet.base.org",
        estimate: (0.005, 0.01, 0.02),
    },
];

/// Look up a network by name
#[must_use]
pub fn network_spec(name: &str) -> Option<&'static NetworkSpec> {
    NETWORKS.iter().find(|n| n.name == name)
}

/// Gas prices for one network
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GasData {
    /// Network name
    pub network: String,
    /// Low-priority price
    pub slow: f64,
    /// Typical price
    pub standard: f64,
    /// High-priority price
    pub fast: f64,
    /// Current base fee, when the provider reports one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_fee: Option<f64>,
    /// Always `"gwei"`
    pub unit: String,
    /// Provider name or `"estimate"`
    pub source: String,
}

impl GasData {
    fn new(network: &str, (slow, standard, fast): (f64, f64, f64), base_fee: Option<f64>, source: &str) -> Self {
        Self {
            network: network.to_string(),
            slow,
            standard,
            fast,
            base_fee,
            unit: GWEI.to_string(),
            source: source.to_string(),
        }
    }
}

/// Static estimate for a network, tagged `"estimate"`
#[must_use]
pub fn estimate(network: &NetworkSpec) -> GasData {
    GasData::new(network.name, network.estimate, None, ESTIMATE_SOURCE)
}

/// Name of a network's JSON-RPC provider
#[must_use]
pub fn rpc_provider_name(network: &str) -> String {
    format!("{network}-rpc")
}

// ── Provider schemas ───────────────────────────────────────────────

#[derive(Deserialize)]
#[serde(untagged)]
enum EtherscanResponse {
    Envelope {
        status: String,
        message: String,
        result: Value,
    },
    Bare(EtherscanGasOracle),
}

#[derive(Deserialize)]
struct EtherscanGasOracle {
    #[serde(rename = "SafeGasPrice")]
    safe: String,
    #[serde(rename = "ProposeGasPrice")]
    propose: String,
    #[serde(rename = "FastGasPrice")]
    fast: String,
    #[serde(rename = "suggestBaseFee", default)]
    base_fee: Option<String>,
}

#[derive(Deserialize)]
struct BlocknativeResponse {
    #[serde(rename = "blockPrices")]
    block_prices: Vec<BlocknativeBlock>,
}

#[derive(Deserialize)]
struct BlocknativeBlock {
    #[serde(rename = "baseFeePerGas", default)]
    base_fee: Option<f64>,
    #[serde(rename = "estimatedPrices")]
    estimated_prices: Vec<BlocknativeEstimate>,
}

#[derive(Deserialize)]
struct BlocknativeEstimate {
    confidence: f64,
    price: f64,
}

#[derive(Deserialize)]
struct RpcResponse {
    #[serde(default)]
    result: Option<String>,
    #[serde(default)]
    error: Option<RpcError>,
}

#[derive(Deserialize)]
struct RpcError {
    message: String,
}

// ── Normalizers ────────────────────────────────────────────────────

/// Normalize a raw provider response for `network`
pub fn normalize(provider: &str, network: &str, raw: &Value) -> Result<Vec<GasData>> {
    match provider {
        ETHERSCAN => normalize_etherscan(network, raw).map(|g| vec![g]),
        BLOCKNATIVE => normalize_blocknative(network, raw).map(|g| vec![g]),
        p if p == rpc_provider_name(network) => normalize_rpc(p, network, raw).map(|g| vec![g]),
        other => Err(Error::Internal(format!("no gas normalizer for provider {other}"))),
    }
}

fn normalize_etherscan(network: &str, raw: &Value) -> Result<GasData> {
    let oracle: EtherscanGasOracle = match decode(ETHERSCAN, raw)? {
        EtherscanResponse::Bare(oracle) => oracle,
        EtherscanResponse::Envelope {
            status,
            message,
            result,
        } => {
            if status != "1" {
                // On failure `result` carries the reason as a string
                let reason = result.as_str().unwrap_or(&message);
                return Err(Error::rejected(ETHERSCAN, reason));
            }
            decode(ETHERSCAN, &result)?
        }
    };

    let prices = (
        parse_decimal(ETHERSCAN, "SafeGasPrice", &oracle.safe)?,
        parse_decimal(ETHERSCAN, "ProposeGasPrice", &oracle.propose)?,
        parse_decimal(ETHERSCAN, "FastGasPrice", &oracle.fast)?,
    );
    let base_fee = oracle
        .base_fee
        .as_deref()
        .map(|b| parse_decimal(ETHERSCAN, "suggestBaseFee", b))
        .transpose()?;

    Ok(GasData::new(network, prices, base_fee, ETHERSCAN))
}

fn normalize_blocknative(network: &str, raw: &Value) -> Result<GasData> {
    let response: BlocknativeResponse = decode(BLOCKNATIVE, raw)?;
    let block = response
        .block_prices
        .into_iter()
        .next()
        .ok_or_else(|| Error::schema(BLOCKNATIVE, "blockPrices is empty"))?;

    let mut estimates = block.estimated_prices;
    if estimates.is_empty() {
        return Err(Error::schema(BLOCKNATIVE, "estimatedPrices is empty"));
    }
    estimates.sort_by(|a, b| a.confidence.total_cmp(&b.confidence));

    let slow = estimates[0].price;
    let fast = estimates[estimates.len() - 1].price;
    let standard = estimates
        .iter()
        .min_by(|a, b| (a.confidence - 90.0).abs().total_cmp(&(b.confidence - 90.0).abs()))
        .map_or(slow, |e| e.price);

    Ok(GasData::new(network, (slow, standard, fast), block.base_fee, BLOCKNATIVE))
}

#[allow(clippy::cast_precision_loss)]
fn normalize_rpc(provider: &str, network: &str, raw: &Value) -> Result<GasData> {
    let response: RpcResponse = decode(provider, raw)?;
    if let Some(error) = response.error {
        return Err(Error::rejected(provider, error.message));
    }
    let hex = response
        .result
        .ok_or_else(|| Error::schema(provider, "missing result"))?;
    let wei = u128::from_str_radix(hex.trim_start_matches("0x"), 16)
        .map_err(|e| Error::schema(provider, format!("result {hex:?}: {e}")))?;

    let gwei = wei as f64 / 1e9;
    let prices = (round_gwei(gwei * 0.9), round_gwei(gwei), round_gwei(gwei * 1.25));
    Ok(GasData::new(network, prices, None, provider))
}

fn round_gwei(value: f64) -> f64 {
    (value * 10_000.0).round() / 10_000.0
}

// ── Providers ──────────────────────────────────────────────────────

/// Etherscan V2 gas oracle for one chain id
pub struct EtherscanGas {
    http: HttpFetcher,
    settings: ProviderSettings,
    network: &'static NetworkSpec,
}

#[async_trait]
impl Provider<GasData> for EtherscanGas {
    fn name(&self) -> &str {
        ETHERSCAN
    }

    fn is_configured(&self) -> bool {
        self.settings.enabled && self.settings.api_key.is_some()
    }

    async fn fetch(&self) -> Result<Vec<GasData>> {
        let key = self
            .settings
            .api_key
            .as_deref()
            .ok_or_else(|| Error::MissingApiKey(ETHERSCAN.to_string()))?;
        let chain_id = self.network.chain_id.to_string();

        let request = self.http.get("/v2/api").query(&[
            ("chainid", chain_id.as_str()),
            ("module", "gastracker"),
            ("action", "gasoracle"),
            ("apikey", key),
        ]);
        let raw = self.http.send_json(request).await?;
        normalize(ETHERSCAN, self.network.name, &raw)
    }
}

/// Blocknative gas platform (Ethereum mainnet)
pub struct BlocknativeGas {
    http: HttpFetcher,
    settings: ProviderSettings,
    network: &'static NetworkSpec,
}

#[async_trait]
impl Provider<GasData> for BlocknativeGas {
    fn name(&self) -> &str {
        BLOCKNATIVE
    }

    fn is_configured(&self) -> bool {
        self.settings.enabled && self.settings.api_key.is_some()
    }

    async fn fetch(&self) -> Result<Vec<GasData>> {
        let key = self
            .settings
            .api_key
            .as_deref()
            .ok_or_else(|| Error::MissingApiKey(BLOCKNATIVE.to_string()))?;

        let request = self
            .http
            .get("/gasprices/blockprices")
            .query(&[("chainid", self.network.chain_id)])
            .header("Authorization", key);
        let raw = self.http.send_json(request).await?;
        normalize(BLOCKNATIVE, self.network.name, &raw)
    }
}

/// Public JSON-RPC `eth_gasPrice`
pub struct RpcGas {
    name: String,
    http: HttpFetcher,
    settings: ProviderSettings,
    network: &'static NetworkSpec,
}

#[async_trait]
impl Provider<GasData> for RpcGas {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_configured(&self) -> bool {
        self.settings.enabled
    }

    async fn fetch(&self) -> Result<Vec<GasData>> {
        let body = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": "eth_gasPrice",
            "params": [],
        });
        let request = self.http.post_to(self.http.base_url()).json(&body);
        let raw = self.http.send_json(request).await?;
        normalize(&self.name, self.network.name, &raw)
    }
}

// ── Feed ───────────────────────────────────────────────────────────

/// Gas price feed over every configured network
pub struct GasFeed {
    chains: Vec<(&'static NetworkSpec, FallbackChain<GasData>)>,
    cache: TtlCache<FeedSnapshot<GasData>>,
    ttl: Duration,
}

impl GasFeed {
    /// Build the per-network chains from configuration
    pub fn from_config(config: &Config, client: &Client, failsafe: &Failsafe) -> Result<Self> {
        let etherscan = config.providers.resolve(ETHERSCAN, ETHERSCAN_BASE_URL, &config.http);
        let blocknative = config.providers.resolve(BLOCKNATIVE, BLOCKNATIVE_BASE_URL, &config.http);

        let mut chains = Vec::with_capacity(config.feeds.gas.networks.len());
        for name in &config.feeds.gas.networks {
            let network = network_spec(name)
                .ok_or_else(|| Error::Config(format!("Unknown gas network: {name}")))?;

            let mut chain = FallbackChain::new(format!("gas:{name}"), failsafe.clone())
                .with_provider(Arc::new(EtherscanGas {
                    http: HttpFetcher::new(client.clone(), &etherscan),
                    settings: etherscan.clone(),
                    network,
                }));

            if network.chain_id == 1 {
                chain = chain.with_provider(Arc::new(BlocknativeGas {
                    http: HttpFetcher::new(client.clone(), &blocknative),
                    settings: blocknative.clone(),
                    network,
                }));
            }

            let rpc_name = rpc_provider_name(name);
            let rpc_url = config
                .feeds
                .gas
                .rpc_urls
                .get(name)
                .map_or(network.default_rpc, String::as_str);
            let rpc = config.providers.resolve(&rpc_name, rpc_url, &config.http);
            chain = chain
                .with_provider(Arc::new(RpcGas {
                    name: rpc_name,
                    http: HttpFetcher::new(client.clone(), &rpc),
                    settings: rpc,
                    network,
                }))
                .with_estimate(move || vec![estimate(network)]);

            chains.push((network, chain));
        }

        Ok(Self {
            chains,
            cache: TtlCache::new(),
            ttl: config.feeds.gas.ttl,
        })
    }

    /// Configured networks, in response order
    #[must_use]
    pub fn networks(&self) -> Vec<&'static str> {
        self.chains.iter().map(|(n, _)| n.name).collect()
    }

    /// Provider names per network, in priority order
    #[must_use]
    pub fn providers(&self) -> Vec<(&'static str, Vec<&str>)> {
        self.chains
            .iter()
            .map(|(n, c)| (n.name, c.provider_names()))
            .collect()
    }

    /// Cache TTL
    #[must_use]
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Gas prices for one network, or all of them when `network` is
    /// `None` or `"all"`. Networks are fetched concurrently.
    pub async fn snapshot(&self, network: Option<&str>) -> Result<Cached<FeedSnapshot<GasData>>> {
        let selected: Vec<&FallbackChain<GasData>> = match network {
            None | Some("all") => self.chains.iter().map(|(_, c)| c).collect(),
            Some(name) => {
                let chain = self
                    .chains
                    .iter()
                    .find(|(n, _)| n.name == name)
                    .map(|(_, c)| c)
                    .ok_or_else(|| {
                        Error::InvalidRequest(format!(
                            "unknown network {name:?}; expected all or one of {}",
                            self.networks().join(", ")
                        ))
                    })?;
                vec![chain]
            }
        };

        let key = format!("gas:{}", network.unwrap_or("all"));
        self.cache
            .get_or_fetch(&key, self.ttl, StalePolicy::Propagate, || async {
                let outcomes = join_all(selected.iter().map(|chain| chain.run())).await;
                let outcomes = outcomes.into_iter().collect::<Result<Vec<_>>>()?;
                Ok(FeedSnapshot::merge(outcomes))
            })
            .await
    }

    /// Drop cached snapshots older than `max_age`
    pub fn evict_older_than(&self, max_age: Duration) {
        self.cache.evict_older_than(max_age);
    }

    /// Cache counters
    #[must_use]
    pub fn cache_stats(&self) -> CacheStatsSnapshot {
        self.cache.stats()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_etherscan_bare_oracle() {
        let raw = json!({"SafeGasPrice": "20", "ProposeGasPrice": "25", "FastGasPrice": "35"});
        let records = normalize(ETHERSCAN, "ethereum", &raw).unwrap();

        assert_eq!(
            records,
            vec![GasData {
                network: "ethereum".to_string(),
                slow: 20.0,
                standard: 25.0,
                fast: 35.0,
                base_fee: None,
                unit: "gwei".to_string(),
                source: "etherscan".to_string(),
            }]
        );
    }

    #[test]
    fn test_etherscan_envelope() {
        let raw = json!({
            "status": "1",
            "message": "OK",
            "result": {
                "LastBlock": "19000000",
                "SafeGasPrice": "12.5",
                "ProposeGasPrice": "13",
                "FastGasPrice": "15",
                "suggestBaseFee": "12.1",
                "gasUsedRatio": "0.4,0.5"
            }
        });
        let gas = &normalize(ETHERSCAN, "polygon", &raw).unwrap()[0];

        assert_eq!(gas.network, "polygon");
        assert!((gas.slow - 12.5).abs() < f64::EPSILON);
        assert_eq!(gas.base_fee, Some(12.1));
    }

    #[test]
    fn test_etherscan_error_envelope() {
        let raw = json!({"status": "0", "message": "NOTOK", "result": "Invalid API Key"});
        let err = normalize(ETHERSCAN, "ethereum", &raw).unwrap_err();

        assert!(matches!(err, Error::UpstreamRejected { ref message, .. } if message == "Invalid API Key"));
    }

    #[test]
    fn test_etherscan_missing_field_fails_loudly() {
        let raw = json!({"SafeGasPrice": "20", "FastGasPrice": "35"});
        assert!(normalize(ETHERSCAN, "ethereum", &raw).is_err());

        let raw = json!({"SafeGasPrice": "20", "ProposeGasPrice": "n/a", "FastGasPrice": "35"});
        assert!(matches!(
            normalize(ETHERSCAN, "ethereum", &raw),
            Err(Error::Schema { .. })
        ));
    }

    #[test]
    fn test_blocknative_confidence_mapping() {
        let raw = json!({
            "blockPrices": [{
                "baseFeePerGas": 9.8,
                "estimatedPrices": [
                    {"confidence": 99, "price": 14.0},
                    {"confidence": 95, "price": 12.0},
                    {"confidence": 90, "price": 11.0},
                    {"confidence": 80, "price": 10.5},
                    {"confidence": 70, "price": 10.0}
                ]
            }]
        });
        let gas = &normalize(BLOCKNATIVE, "ethereum", &raw).unwrap()[0];

        assert_eq!((gas.slow, gas.standard, gas.fast), (10.0, 11.0, 14.0));
        assert_eq!(gas.base_fee, Some(9.8));
        assert_eq!(gas.source, BLOCKNATIVE);
    }

    #[test]
    fn test_blocknative_empty_block_prices() {
        let raw = json!({"blockPrices": []});
        assert!(normalize(BLOCKNATIVE, "ethereum", &raw).is_err());
    }

    #[test]
    fn test_rpc_hex_to_gwei() {
        // 20 gwei
        let raw = json!({"jsonrpc": "2.0", "id": 1, "result": "0x4a817c800"});
        let gas = &normalize("bsc-rpc", "bsc", &raw).unwrap()[0];

        assert_eq!((gas.slow, gas.standard, gas.fast), (18.0, 20.0, 25.0));
        assert_eq!(gas.source, "bsc-rpc");
    }

    #[test]
    fn test_rpc_error_object() {
        let raw = json!({"jsonrpc": "2.0", "id": 1, "error": {"code": -32000, "message": "rate limited"}});
        assert!(matches!(
            normalize("base-rpc", "base", &raw),
            Err(Error::UpstreamRejected { .. })
        ));
    }

    #[test]
    fn test_normalize_is_deterministic() {
        let raw = json!({"SafeGasPrice": "1", "ProposeGasPrice": "2", "FastGasPrice": "3"});
        assert_eq!(
            normalize(ETHERSCAN, "ethereum", &raw).unwrap(),
            normalize(ETHERSCAN, "ethereum", &raw).unwrap()
        );
    }

    #[test]
    fn test_unknown_provider() {
        assert!(normalize("owlracle", "ethereum", &json!({})).is_err());
        // RPC normalizer is bound to its own network
        assert!(normalize("bsc-rpc", "ethereum", &json!({"result": "0x1"})).is_err());
    }

    #[test]
    fn test_estimates_are_tagged() {
        for network in &NETWORKS {
            let gas = estimate(network);
            assert_eq!(gas.source, ESTIMATE_SOURCE);
            assert_eq!(gas.unit, GWEI);
            assert!(gas.slow <= gas.standard && gas.standard <= gas.fast);
        }
    }

    #[test]
    fn test_unknown_network_in_config() {
        let mut config = Config::default();
        config.feeds.gas.networks = vec!["solana".to_string()];
        let result = GasFeed::from_config(&config, &Client::new(), &Failsafe::unthrottled());
        assert!(matches!(result, Err(Error::Config(_))));
    }
}

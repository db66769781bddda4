//! Whale transaction feed
//!
//! Whale Alert when a key is configured, otherwise large unconfirmed Bitcoin
//! transactions from blockchain.info priced at the current USD ticker.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use super::FeedSnapshot;
use super::liquidations::from_secs;
use crate::cache::{CacheStatsSnapshot, Cached, StalePolicy, TtlCache};
use crate::config::{Config, ProviderSettings};
use crate::failsafe::{Failsafe, ProviderThrottle};
use crate::http::HttpFetcher;
use crate::provider::{FallbackChain, Provider, decode};
use crate::{Error, Result};

/// Whale Alert provider name
pub const WHALE_ALERT: &str = "whale-alert";
/// blockchain.info provider name
pub const BLOCKCHAIN_INFO: &str = "blockchain-info";

const WHALE_ALERT_BASE_URL: &str = "https://api.whale-alert.io";
pub(crate) const BLOCKCHAIN_INFO_BASE_URL: &str = "https://blockchain.info";

const SATS_PER_BTC: f64 = 100_000_000.0;

/// One large on-chain transfer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WhaleTransaction {
    /// Chain name (`bitcoin`, `ethereum`, ...)
    pub blockchain: String,
    /// Asset symbol, lower case
    pub symbol: String,
    /// Transaction hash
    pub hash: String,
    /// Sender address, when known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    /// Sender owner label (an exchange name, for instance)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_owner: Option<String>,
    /// Recipient address, when known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
    /// Recipient owner label
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to_owner: Option<String>,
    /// Amount in units of `symbol`
    pub amount: f64,
    /// Amount in USD
    pub amount_usd: f64,
    /// Transaction time
    pub timestamp: DateTime<Utc>,
    /// Provider name
    pub source: String,
}

// ── Provider schemas ───────────────────────────────────────────────

#[derive(Deserialize)]
struct WhaleAlertResponse {
    result: String,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    transactions: Vec<WhaleAlertTransaction>,
}

#[derive(Deserialize)]
struct WhaleAlertTransaction {
    blockchain: String,
    symbol: String,
    hash: String,
    #[serde(default)]
    from: WhaleAlertParty,
    #[serde(default)]
    to: WhaleAlertParty,
    timestamp: i64,
    amount: f64,
    amount_usd: f64,
}

#[derive(Deserialize, Default)]
struct WhaleAlertParty {
    #[serde(default)]
    address: Option<String>,
    #[serde(default)]
    owner: Option<String>,
}

impl WhaleAlertParty {
    /// (address, owner); Whale Alert reports unattributed wallets as "unknown"
    fn split(self) -> (Option<String>, Option<String>) {
        let owner = self.owner.filter(|o| !o.is_empty() && o != "unknown");
        (self.address, owner)
    }
}

#[derive(Deserialize)]
struct BlockchainInfoRaw {
    ticker: BlockchainInfoTicker,
    unconfirmed: BlockchainInfoMempool,
}

#[derive(Deserialize)]
#[serde(rename_all = "UPPERCASE")]
struct BlockchainInfoTicker {
    usd: BlockchainInfoQuote,
}

#[derive(Deserialize)]
struct BlockchainInfoQuote {
    last: f64,
}

#[derive(Deserialize)]
struct BlockchainInfoMempool {
    txs: Vec<BlockchainInfoTx>,
}

#[derive(Deserialize)]
struct BlockchainInfoTx {
    hash: String,
    time: i64,
    #[serde(default)]
    inputs: Vec<BlockchainInfoInput>,
    out: Vec<BlockchainInfoOutput>,
}

#[derive(Deserialize)]
struct BlockchainInfoInput {
    #[serde(default)]
    prev_out: Option<BlockchainInfoOutput>,
}

#[derive(Deserialize)]
struct BlockchainInfoOutput {
    #[serde(default)]
    value: u64,
    #[serde(default)]
    addr: Option<String>,
}

// ── Normalizers ────────────────────────────────────────────────────

/// Normalize a raw provider response. `min_value_usd` filters providers
/// that return every transaction rather than only large ones.
pub fn normalize(provider: &str, raw: &Value, min_value_usd: f64) -> Result<Vec<WhaleTransaction>> {
    match provider {
        WHALE_ALERT => normalize_whale_alert(raw),
        BLOCKCHAIN_INFO => normalize_blockchain_info(raw, min_value_usd),
        other => Err(Error::Internal(format!("no whale normalizer for provider {other}"))),
    }
}

fn normalize_whale_alert(raw: &Value) -> Result<Vec<WhaleTransaction>> {
    let response: WhaleAlertResponse = decode(WHALE_ALERT, raw)?;
    if response.result != "success" {
        return Err(Error::rejected(
            WHALE_ALERT,
            response.message.unwrap_or(response.result),
        ));
    }

    response
        .transactions
        .into_iter()
        .map(|tx| {
            let (from, from_owner) = tx.from.split();
            let (to, to_owner) = tx.to.split();
            Ok(WhaleTransaction {
                blockchain: tx.blockchain,
                symbol: tx.symbol.to_lowercase(),
                hash: tx.hash,
                from,
                from_owner,
                to,
                to_owner,
                amount: tx.amount,
                amount_usd: tx.amount_usd,
                timestamp: from_secs(WHALE_ALERT, tx.timestamp)?,
                source: WHALE_ALERT.to_string(),
            })
        })
        .collect()
}

#[allow(clippy::cast_precision_loss)]
fn normalize_blockchain_info(raw: &Value, min_value_usd: f64) -> Result<Vec<WhaleTransaction>> {
    let raw: BlockchainInfoRaw = decode(BLOCKCHAIN_INFO, raw)?;
    let price = raw.ticker.usd.last;
    if !price.is_finite() || price <= 0.0 {
        return Err(Error::schema(BLOCKCHAIN_INFO, format!("invalid USD price {price}")));
    }

    let mut records = Vec::new();
    for tx in raw.unconfirmed.txs {
        let total_sats = tx
            .out
            .iter()
            .try_fold(0u64, |acc, o| acc.checked_add(o.value))
            .ok_or_else(|| Error::schema(BLOCKCHAIN_INFO, format!("output total overflows in {}", tx.hash)))?;
        let amount = total_sats as f64 / SATS_PER_BTC;
        let amount_usd = amount * price;
        if amount_usd < min_value_usd {
            continue;
        }

        let from = tx
            .inputs
            .into_iter()
            .find_map(|i| i.prev_out.and_then(|p| p.addr));
        let to = tx
            .out
            .into_iter()
            .max_by_key(|o| o.value)
            .and_then(|o| o.addr);

        records.push(WhaleTransaction {
            blockchain: "bitcoin".to_string(),
            symbol: "btc".to_string(),
            hash: tx.hash,
            from,
            from_owner: None,
            to,
            to_owner: None,
            amount,
            amount_usd,
            timestamp: from_secs(BLOCKCHAIN_INFO, tx.time)?,
            source: BLOCKCHAIN_INFO.to_string(),
        });
    }
    Ok(records)
}

// ── Providers ──────────────────────────────────────────────────────

/// Whale Alert transaction API
pub struct WhaleAlert {
    http: HttpFetcher,
    settings: ProviderSettings,
    min_value_usd: f64,
    lookback: Duration,
}

#[async_trait]
impl Provider<WhaleTransaction> for WhaleAlert {
    fn name(&self) -> &str {
        WHALE_ALERT
    }

    fn is_configured(&self) -> bool {
        self.settings.enabled && self.settings.api_key.is_some()
    }

    async fn fetch(&self) -> Result<Vec<WhaleTransaction>> {
        let key = self
            .settings
            .api_key
            .as_deref()
            .ok_or_else(|| Error::MissingApiKey(WHALE_ALERT.to_string()))?;
        let start = Utc::now().timestamp() - i64::try_from(self.lookback.as_secs()).unwrap_or(0);
        let min_value = format!("{:.0}", self.min_value_usd);
        let start = start.to_string();

        let request = self.http.get("/v1/transactions").query(&[
            ("api_key", key),
            ("min_value", min_value.as_str()),
            ("start", start.as_str()),
        ]);
        let raw = self.http.send_json(request).await?;
        normalize(WHALE_ALERT, &raw, self.min_value_usd)
    }
}

/// Large unconfirmed Bitcoin transactions from blockchain.info
pub struct BlockchainInfoWhales {
    http: HttpFetcher,
    settings: ProviderSettings,
    min_value_usd: f64,
    /// The chain throttles the first request; the second waits here
    throttle: Arc<ProviderThrottle>,
}

#[async_trait]
impl Provider<WhaleTransaction> for BlockchainInfoWhales {
    fn name(&self) -> &str {
        BLOCKCHAIN_INFO
    }

    fn is_configured(&self) -> bool {
        self.settings.enabled
    }

    async fn fetch(&self) -> Result<Vec<WhaleTransaction>> {
        let ticker = self.http.send_json(self.http.get("/ticker")).await?;
        self.throttle.acquire(BLOCKCHAIN_INFO).await;
        let unconfirmed = self
            .http
            .send_json(
                self.http
                    .get("/unconfirmed-transactions")
                    .query(&[("format", "json")]),
            )
            .await?;

        let raw = json!({ "ticker": ticker, "unconfirmed": unconfirmed });
        normalize(BLOCKCHAIN_INFO, &raw, self.min_value_usd)
    }
}

// ── Feed ───────────────────────────────────────────────────────────

/// Whale transaction feed
pub struct WhaleFeed {
    chain: FallbackChain<WhaleTransaction>,
    cache: TtlCache<FeedSnapshot<WhaleTransaction>>,
    ttl: Duration,
}

impl WhaleFeed {
    /// Build the chain from configuration
    #[must_use]
    pub fn from_config(config: &Config, client: &Client, failsafe: &Failsafe) -> Self {
        let feed = &config.feeds.whales;
        let whale_alert = config.providers.resolve(WHALE_ALERT, WHALE_ALERT_BASE_URL, &config.http);
        let blockchain_info = config
            .providers
            .resolve(BLOCKCHAIN_INFO, BLOCKCHAIN_INFO_BASE_URL, &config.http);

        let chain = FallbackChain::new("whales", failsafe.clone())
            .with_provider(Arc::new(WhaleAlert {
                http: HttpFetcher::new(client.clone(), &whale_alert),
                settings: whale_alert,
                min_value_usd: feed.min_value_usd,
                lookback: feed.lookback,
            }))
            .with_provider(Arc::new(BlockchainInfoWhales {
                http: HttpFetcher::new(client.clone(), &blockchain_info),
                settings: blockchain_info,
                min_value_usd: feed.min_value_usd,
                throttle: Arc::clone(&failsafe.throttle),
            }))
            .with_estimate(Vec::new)
            .empty_is_failure(true);

        Self {
            chain,
            cache: TtlCache::new(),
            ttl: feed.ttl,
        }
    }

    /// Cache TTL
    #[must_use]
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Provider names in priority order
    #[must_use]
    pub fn providers(&self) -> Vec<&str> {
        self.chain.provider_names()
    }

    /// Recent whale transactions
    pub async fn snapshot(&self) -> Result<Cached<FeedSnapshot<WhaleTransaction>>> {
        self.cache
            .get_or_fetch("whales", self.ttl, StalePolicy::Propagate, || async {
                self.chain.run().await.map(FeedSnapshot::from_outcome)
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

//! Derivatives liquidation feed
//!
//! CoinGlass, then Coinalyze, then Bybit public trades. Bybit does not
//! publish liquidations, so large trades stand in for them.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::FeedSnapshot;
use crate::cache::{CacheStatsSnapshot, Cached, StalePolicy, TtlCache};
use crate::config::{Config, LiquidationFeedConfig, ProviderSettings};
use crate::failsafe::Failsafe;
use crate::http::HttpFetcher;
use crate::provider::{FallbackChain, Provider, decode, parse_decimal};
use crate::{Error, Result};

/// CoinGlass provider name
pub const COINGLASS: &str = "coinglass";
/// Coinalyze provider name
pub const COINALYZE: &str = "coinalyze";
/// Bybit provider name
pub const BYBIT: &str = "bybit";

const COINGLASS_BASE_URL: &str = "https://open-api-v4.coinglass.com";
const COINALYZE_BASE_URL: &str = "https://api.coinalyze.net";
const BYBIT_BASE_URL: &str = "https://api.bybit.com";

/// Which side of the book was liquidated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LiquidationSide {
    /// A long position was force-closed
    Long,
    /// A short position was force-closed
    Short,
}

/// One forced position closure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Liquidation {
    /// Exchange where it happened
    pub exchange: String,
    /// Instrument symbol as reported
    pub symbol: String,
    /// Liquidated side
    pub side: LiquidationSide,
    /// Notional in USD
    pub amount_usd: f64,
    /// Execution price, when reported
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub price: Option<f64>,
    /// Event time
    pub timestamp: DateTime<Utc>,
    /// Provider name
    pub source: String,
}

/// Parameters the liquidation normalizers need beyond the raw body
#[derive(Debug, Clone)]
pub struct LiquidationQuery {
    /// Base asset, upper case
    pub symbol: String,
    /// Trade notional treated as a liquidation (Bybit heuristic)
    pub min_trade_usd: f64,
}

impl From<&LiquidationFeedConfig> for LiquidationQuery {
    fn from(config: &LiquidationFeedConfig) -> Self {
        Self {
            symbol: config.symbol.to_uppercase(),
            min_trade_usd: config.min_trade_usd,
        }
    }
}

// ── Provider schemas ───────────────────────────────────────────────

#[derive(Deserialize)]
#[serde(untagged)]
enum Code {
    Text(String),
    Number(i64),
}

impl Code {
    fn is_ok(&self) -> bool {
        match self {
            Self::Text(s) => s == "0",
            Self::Number(n) => *n == 0,
        }
    }
}

#[derive(Deserialize)]
struct CoinglassResponse {
    code: Code,
    #[serde(default)]
    msg: Option<String>,
    #[serde(default)]
    data: Vec<CoinglassOrder>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CoinglassOrder {
    exchange_name: String,
    symbol: String,
    price: f64,
    side: u8,
    usd_value: f64,
    time: i64,
}

#[derive(Deserialize)]
struct CoinalyzeSeries {
    symbol: String,
    history: Vec<CoinalyzePoint>,
}

#[derive(Deserialize)]
struct CoinalyzePoint {
    t: i64,
    l: f64,
    s: f64,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct BybitResponse {
    ret_code: i64,
    #[serde(default)]
    ret_msg: String,
    #[serde(default)]
    result: Option<BybitResult>,
}

#[derive(Deserialize)]
struct BybitResult {
    #[serde(default)]
    list: Vec<BybitTrade>,
}

#[derive(Deserialize)]
struct BybitTrade {
    symbol: String,
    price: String,
    size: String,
    side: String,
    time: String,
}

// ── Normalizers ────────────────────────────────────────────────────

/// Normalize a raw provider response
pub fn normalize(provider: &str, raw: &Value, query: &LiquidationQuery) -> Result<Vec<Liquidation>> {
    match provider {
        COINGLASS => normalize_coinglass(raw),
        COINALYZE => normalize_coinalyze(raw),
        BYBIT => normalize_bybit(raw, query.min_trade_usd),
        other => Err(Error::Internal(format!("no liquidation normalizer for provider {other}"))),
    }
}

fn normalize_coinglass(raw: &Value) -> Result<Vec<Liquidation>> {
    let response: CoinglassResponse = decode(COINGLASS, raw)?;
    if !response.code.is_ok() {
        return Err(Error::rejected(
            COINGLASS,
            response.msg.unwrap_or_else(|| "non-zero code".to_string()),
        ));
    }

    response
        .data
        .into_iter()
        .map(|order| {
            let side = match order.side {
                1 => LiquidationSide::Long,
                2 => LiquidationSide::Short,
                other => return Err(Error::schema(COINGLASS, format!("unknown side {other}"))),
            };
            Ok(Liquidation {
                exchange: order.exchange_name,
                symbol: order.symbol,
                side,
                amount_usd: order.usd_value,
                price: Some(order.price),
                timestamp: from_millis(COINGLASS, order.time)?,
                source: COINGLASS.to_string(),
            })
        })
        .collect()
}

fn normalize_coinalyze(raw: &Value) -> Result<Vec<Liquidation>> {
    let series: Vec<CoinalyzeSeries> = decode(COINALYZE, raw)?;
    let mut records = Vec::new();

    for s in series {
        let exchange = coinalyze_exchange(&s.symbol);
        for point in s.history {
            let timestamp = from_secs(COINALYZE, point.t)?;
            for (side, amount) in [(LiquidationSide::Long, point.l), (LiquidationSide::Short, point.s)] {
                if amount > 0.0 {
                    records.push(Liquidation {
                        exchange: exchange.to_string(),
                        symbol: s.symbol.clone(),
                        side,
                        amount_usd: amount,
                        price: None,
                        timestamp,
                        source: COINALYZE.to_string(),
                    });
                }
            }
        }
    }
    Ok(records)
}

/// Exchange named by a Coinalyze symbol suffix (`BTCUSDT_PERP.A`)
fn coinalyze_exchange(symbol: &str) -> &'static str {
    match symbol.rsplit_once('.').map(|(_, code)| code) {
        Some("A") => "Binance",
        Some("6") => "Bybit",
        Some("3") => "OKX",
        _ => "Unknown",
    }
}

fn normalize_bybit(raw: &Value, min_trade_usd: f64) -> Result<Vec<Liquidation>> {
    let response: BybitResponse = decode(BYBIT, raw)?;
    if response.ret_code != 0 {
        return Err(Error::rejected(BYBIT, response.ret_msg));
    }

    let trades = response.result.map(|r| r.list).unwrap_or_default();
    let mut records = Vec::new();
    for trade in trades {
        let price = parse_decimal(BYBIT, "price", &trade.price)?;
        let size = parse_decimal(BYBIT, "size", &trade.size)?;
        let notional = price * size;
        if notional < min_trade_usd {
            continue;
        }

        // A forced sell closes a long
        let side = match trade.side.as_str() {
            "Sell" => LiquidationSide::Long,
            "Buy" => LiquidationSide::Short,
            other => return Err(Error::schema(BYBIT, format!("unknown side {other:?}"))),
        };
        let millis = trade
            .time
            .parse::<i64>()
            .map_err(|e| Error::schema(BYBIT, format!("time {:?}: {e}", trade.time)))?;

        records.push(Liquidation {
            exchange: "Bybit".to_string(),
            symbol: trade.symbol,
            side,
            amount_usd: notional,
            price: Some(price),
            timestamp: from_millis(BYBIT, millis)?,
            source: BYBIT.to_string(),
        });
    }
    Ok(records)
}

pub(crate) fn from_millis(provider: &str, millis: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(millis)
        .ok_or_else(|| Error::schema(provider, format!("timestamp out of range: {millis}")))
}

pub(crate) fn from_secs(provider: &str, secs: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp(secs, 0)
        .ok_or_else(|| Error::schema(provider, format!("timestamp out of range: {secs}")))
}

fn lookback_window(lookback: Duration) -> (i64, i64) {
    let to = Utc::now().timestamp();
    let from = to - i64::try_from(lookback.as_secs()).unwrap_or(i64::MAX / 2);
    (from, to)
}

// ── Providers ──────────────────────────────────────────────────────

/// CoinGlass liquidation orders
pub struct Coinglass {
    http: HttpFetcher,
    settings: ProviderSettings,
    query: LiquidationQuery,
}

#[async_trait]
impl Provider<Liquidation> for Coinglass {
    fn name(&self) -> &str {
        COINGLASS
    }

    fn is_configured(&self) -> bool {
        self.settings.enabled && self.settings.api_key.is_some()
    }

    async fn fetch(&self) -> Result<Vec<Liquidation>> {
        let key = self
            .settings
            .api_key
            .as_deref()
            .ok_or_else(|| Error::MissingApiKey(COINGLASS.to_string()))?;

        let request = self
            .http
            .get("/api/futures/liquidation/order")
            .query(&[("symbol", self.query.symbol.as_str())])
            .header("CG-API-KEY", key);
        let raw = self.http.send_json(request).await?;
        normalize(COINGLASS, &raw, &self.query)
    }
}

/// Coinalyze aggregated liquidation history
pub struct Coinalyze {
    http: HttpFetcher,
    settings: ProviderSettings,
    query: LiquidationQuery,
    lookback: Duration,
}

#[async_trait]
impl Provider<Liquidation> for Coinalyze {
    fn name(&self) -> &str {
        COINALYZE
    }

    fn is_configured(&self) -> bool {
        self.settings.enabled && self.settings.api_key.is_some()
    }

    async fn fetch(&self) -> Result<Vec<Liquidation>> {
        let key = self
            .settings
            .api_key
            .as_deref()
            .ok_or_else(|| Error::MissingApiKey(COINALYZE.to_string()))?;
        let (from, to) = lookback_window(self.lookback);
        let symbols = format!("{}USDT_PERP.A", self.query.symbol);

        let request = self
            .http
            .get("/v1/liquidation-history")
            .query(&[
                ("symbols", symbols.as_str()),
                ("interval", "1min"),
                ("convert_to_usd", "true"),
            ])
            .query(&[("from", from), ("to", to)])
            .header("api_key", key);
        let raw = self.http.send_json(request).await?;
        normalize(COINALYZE, &raw, &self.query)
    }
}

/// Bybit public trades, filtered by notional
pub struct Bybit {
    http: HttpFetcher,
    settings: ProviderSettings,
    query: LiquidationQuery,
}

#[async_trait]
impl Provider<Liquidation> for Bybit {
    fn name(&self) -> &str {
        BYBIT
    }

    fn is_configured(&self) -> bool {
        self.settings.enabled
    }

    async fn fetch(&self) -> Result<Vec<Liquidation>> {
        let symbol = format!("{}USDT", self.query.symbol);
        let request = self.http.get("/v5/market/recent-trade").query(&[
            ("category", "linear"),
            ("symbol", symbol.as_str()),
            ("limit", "1000"),
        ]);
        let raw = self.http.send_json(request).await?;
        normalize(BYBIT, &raw, &self.query)
    }
}

// ── Feed ───────────────────────────────────────────────────────────

/// Liquidation feed for the configured symbol
pub struct LiquidationFeed {
    chain: FallbackChain<Liquidation>,
    cache: TtlCache<FeedSnapshot<Liquidation>>,
    ttl: Duration,
}

impl LiquidationFeed {
    /// Build the chain from configuration
    #[must_use]
    pub fn from_config(config: &Config, client: &Client, failsafe: &Failsafe) -> Self {
        let feed = &config.feeds.liquidations;
        let query = LiquidationQuery::from(feed);
        let coinglass = config.providers.resolve(COINGLASS, COINGLASS_BASE_URL, &config.http);
        let coinalyze = config.providers.resolve(COINALYZE, COINALYZE_BASE_URL, &config.http);
        let bybit = config.providers.resolve(BYBIT, BYBIT_BASE_URL, &config.http);

        let chain = FallbackChain::new("liquidations", failsafe.clone())
            .with_provider(Arc::new(Coinglass {
                http: HttpFetcher::new(client.clone(), &coinglass),
                settings: coinglass,
                query: query.clone(),
            }))
            .with_provider(Arc::new(Coinalyze {
                http: HttpFetcher::new(client.clone(), &coinalyze),
                settings: coinalyze,
                query: query.clone(),
                lookback: feed.lookback,
            }))
            .with_provider(Arc::new(Bybit {
                http: HttpFetcher::new(client.clone(), &bybit),
                settings: bybit,
                query,
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

    /// Recent liquidations
    pub async fn snapshot(&self) -> Result<Cached<FeedSnapshot<Liquidation>>> {
        self.cache
            .get_or_fetch("liquidations", self.ttl, StalePolicy::Propagate, || async {
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

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn query() -> LiquidationQuery {
        LiquidationQuery {
            symbol: "BTC".to_string(),
            min_trade_usd: 100_000.0,
        }
    }

    #[test]
    fn test_coinglass_orders() {
        let raw = json!({
            "code": "0",
            "msg": "success",
            "data": [
                {"exchangeName": "Binance", "symbol": "BTCUSDT", "price": 64000.5, "side": 1, "usdValue": 250000.0, "time": 1_700_000_000_000_i64},
                {"exchangeName": "OKX", "symbol": "BTC-USDT-SWAP", "price": 64010.0, "side": 2, "usdValue": 12000.0, "time": 1_700_000_001_000_i64}
            ]
        });
        let records = normalize(COINGLASS, &raw, &query()).unwrap();

        assert_eq!(records.len(), 2);
        assert_eq!(records[0].side, LiquidationSide::Long);
        assert_eq!(records[0].exchange, "Binance");
        assert_eq!(records[0].price, Some(64000.5));
        assert_eq!(records[0].timestamp.timestamp(), 1_700_000_000);
        assert_eq!(records[1].side, LiquidationSide::Short);
        assert!(records.iter().all(|r| r.source == COINGLASS));
    }

    #[test]
    fn test_coinglass_numeric_code_and_error() {
        let ok = json!({"code": 0, "data": []});
        assert!(normalize(COINGLASS, &ok, &query()).unwrap().is_empty());

        let err = json!({"code": "40001", "msg": "API key missing"});
        assert!(matches!(
            normalize(COINGLASS, &err, &query()),
            Err(Error::UpstreamRejected { .. })
        ));
    }

    #[test]
    fn test_coinglass_unknown_side() {
        let raw = json!({
            "code": "0",
            "data": [{"exchangeName": "Binance", "symbol": "BTCUSDT", "price": 1.0, "side": 3, "usdValue": 1.0, "time": 0}]
        });
        assert!(matches!(normalize(COINGLASS, &raw, &query()), Err(Error::Schema { .. })));
    }

    #[test]
    fn test_coinalyze_history_splits_sides() {
        let raw = json!([{
            "symbol": "BTCUSDT_PERP.A",
            "history": [
                {"t": 1_700_000_000, "l": 150_000.0, "s": 0.0},
                {"t": 1_700_000_060, "l": 20_000.0, "s": 35_000.0}
            ]
        }]);
        let records = normalize(COINALYZE, &raw, &query()).unwrap();

        let sides: Vec<_> = records.iter().map(|r| (r.side, r.amount_usd)).collect();
        assert_eq!(
            sides,
            vec![
                (LiquidationSide::Long, 150_000.0),
                (LiquidationSide::Long, 20_000.0),
                (LiquidationSide::Short, 35_000.0),
            ]
        );
        assert!(records.iter().all(|r| r.exchange == "Binance" && r.price.is_none()));
    }

    #[test]
    fn test_coinalyze_exchange_codes() {
        assert_eq!(coinalyze_exchange("BTCUSDT_PERP.A"), "Binance");
        assert_eq!(coinalyze_exchange("BTCUSDT.6"), "Bybit");
        assert_eq!(coinalyze_exchange("BTCUSDT_PERP.3"), "OKX");
        assert_eq!(coinalyze_exchange("BTCUSDT"), "Unknown");
    }

    #[test]
    fn test_bybit_threshold_heuristic() {
        let raw = json!({
            "retCode": 0,
            "retMsg": "OK",
            "result": {
                "category": "linear",
                "list": [
                    {"execId": "a", "symbol": "BTCUSDT", "price": "64000", "size": "2", "side": "Sell", "time": "1700000000000"},
                    {"execId": "b", "symbol": "BTCUSDT", "price": "64000", "size": "0.5", "side": "Buy", "time": "1700000000100"},
                    {"execId": "c", "symbol": "BTCUSDT", "price": "50000", "size": "2", "side": "Buy", "time": "1700000000200"}
                ]
            }
        });
        let records = normalize(BYBIT, &raw, &query()).unwrap();

        assert_eq!(records.len(), 2);
        assert_eq!(records[0].side, LiquidationSide::Long);
        assert!((records[0].amount_usd - 128_000.0).abs() < f64::EPSILON);
        // Exactly at the threshold counts
        assert_eq!(records[1].side, LiquidationSide::Short);
        assert!((records[1].amount_usd - 100_000.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_bybit_error_code() {
        let raw = json!({"retCode": 10001, "retMsg": "params error", "result": {}});
        assert!(matches!(
            normalize(BYBIT, &raw, &query()),
            Err(Error::UpstreamRejected { ref message, .. }) if message == "params error"
        ));
    }

    #[test]
    fn test_wrong_shape_is_schema_error() {
        let raw = json!({"unexpected": true});
        assert!(matches!(normalize(COINALYZE, &raw, &query()), Err(Error::Schema { .. })));
    }
}

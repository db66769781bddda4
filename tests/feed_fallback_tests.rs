//! Feed fallback integration tests against mock upstreams

use std::time::Duration;

use mockito::{Matcher, Server, ServerGuard};
use pretty_assertions::assert_eq;
use reqwest::Client;
use serde_json::json;

use feed_aggregator::Error;
use feed_aggregator::cache::Freshness;
use feed_aggregator::config::{Config, ProviderConfig};
use feed_aggregator::failsafe::Failsafe;
use feed_aggregator::feeds::{BlockHeightFeed, GasFeed, LiquidationFeed, LiquidationSide, WhaleFeed};

/// Config with no throttling and every provider disabled
fn quiet_config() -> Config {
    let mut config = Config::default();
    config.providers.default_min_interval = Duration::ZERO;
    for name in [
        "etherscan",
        "blocknative",
        "coinglass",
        "coinalyze",
        "bybit",
        "whale-alert",
        "blockchain-info",
        "mempool",
    ] {
        config.providers.by_name.insert(
            name.to_string(),
            ProviderConfig {
                enabled: false,
                ..Default::default()
            },
        );
    }
    config
}

fn point_at(config: &mut Config, name: &str, server: &ServerGuard, api_key: Option<&str>) {
    config.providers.by_name.insert(
        name.to_string(),
        ProviderConfig {
            enabled: true,
            api_key: api_key.map(String::from),
            base_url: Some(server.url()),
            timeout: Some(Duration::from_secs(5)),
            ..Default::default()
        },
    );
}

#[tokio::test]
async fn test_gas_etherscan_success_is_cached() {
    let mut server = Server::new_async().await;
    let mock = server
        .mock("GET", "/v2/api")
        .match_query(Matcher::AllOf(vec![
            Matcher::UrlEncoded("chainid".into(), "1".into()),
            Matcher::UrlEncoded("module".into(), "gastracker".into()),
            Matcher::UrlEncoded("action".into(), "gasoracle".into()),
            Matcher::UrlEncoded("apikey".into(), "test-key".into()),
        ]))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(
            json!({"SafeGasPrice": "20", "ProposeGasPrice": "25", "FastGasPrice": "35"}).to_string(),
        )
        .expect(1)
        .create_async()
        .await;

    let mut config = quiet_config();
    config.feeds.gas.networks = vec!["ethereum".to_string()];
    point_at(&mut config, "etherscan", &server, Some("test-key"));

    let feed = GasFeed::from_config(&config, &Client::new(), &Failsafe::new(&config.providers)).unwrap();

    let first = feed.snapshot(Some("ethereum")).await.unwrap();
    assert_eq!(first.freshness, Freshness::Fetched);
    let gas = &first.value.data[0];
    assert_eq!((gas.slow, gas.standard, gas.fast), (20.0, 25.0, 35.0));
    assert_eq!(gas.unit, "gwei");
    assert_eq!(gas.source, "etherscan");
    assert_eq!(first.value.sources, vec!["etherscan"]);
    assert!(!first.value.estimated);

    let second = feed.snapshot(Some("ethereum")).await.unwrap();
    assert_eq!(second.freshness, Freshness::Fresh);
    assert_eq!(second.value.data, first.value.data);

    mock.assert_async().await;
}

#[tokio::test]
async fn test_gas_all_networks_fall_back_to_estimates() {
    let mut server = Server::new_async().await;
    let etherscan = server
        .mock("GET", "/v2/api")
        .match_query(Matcher::Any)
        .with_status(500)
        .expect(5)
        .create_async()
        .await;
    let rpc = server
        .mock("POST", Matcher::Regex(r"^/rpc/".to_string()))
        .with_status(503)
        .expect(5)
        .create_async()
        .await;

    let mut config = quiet_config();
    point_at(&mut config, "etherscan", &server, Some("test-key"));
    for network in &config.feeds.gas.networks.clone() {
        config
            .feeds
            .gas
            .rpc_urls
            .insert(network.clone(), format!("{}/rpc/{network}", server.url()));
    }

    let feed = GasFeed::from_config(&config, &Client::new(), &Failsafe::new(&config.providers)).unwrap();
    let snapshot = feed.snapshot(Some("all")).await.unwrap().value;

    let networks: Vec<&str> = snapshot.data.iter().map(|g| g.network.as_str()).collect();
    assert_eq!(networks, vec!["ethereum", "polygon", "bsc", "arbitrum", "base"]);
    assert!(snapshot.data.iter().all(|g| g.source == "estimate"));
    assert!(snapshot.estimated);
    assert_eq!(snapshot.sources, vec!["estimate"]);
    // etherscan then rpc, per network
    assert_eq!(snapshot.attempts.len(), 10);
    assert!(snapshot.attempts.iter().all(|a| !a.success));

    let ethereum = &snapshot.data[0];
    assert_eq!((ethereum.slow, ethereum.standard, ethereum.fast), (15.0, 20.0, 30.0));

    etherscan.assert_async().await;
    rpc.assert_async().await;
}

#[tokio::test]
async fn test_gas_rpc_fallback_when_etherscan_unconfigured() {
    let mut server = Server::new_async().await;
    server
        .mock("POST", "/")
        .match_body(Matcher::PartialJson(json!({"method": "eth_gasPrice"})))
        .with_status(200)
        .with_body(json!({"jsonrpc": "2.0", "id": 1, "result": "0x3b9aca00"}).to_string())
        .create_async()
        .await;

    let mut config = quiet_config();
    config.feeds.gas.networks = vec!["polygon".to_string()];
    config
        .feeds
        .gas
        .rpc_urls
        .insert("polygon".to_string(), server.url());

    let feed = GasFeed::from_config(&config, &Client::new(), &Failsafe::new(&config.providers)).unwrap();
    let snapshot = feed.snapshot(None).await.unwrap().value;

    let gas = &snapshot.data[0];
    assert_eq!(gas.source, "polygon-rpc");
    assert_eq!((gas.slow, gas.standard, gas.fast), (0.9, 1.0, 1.25));
    // Unconfigured etherscan is skipped without an attempt
    assert_eq!(snapshot.attempts.len(), 1);
}

#[tokio::test]
async fn test_gas_unknown_network_is_invalid_request() {
    let config = quiet_config();
    let feed = GasFeed::from_config(&config, &Client::new(), &Failsafe::unthrottled()).unwrap();

    let err = feed.snapshot(Some("solana")).await.unwrap_err();
    assert!(matches!(err, Error::InvalidRequest(ref m) if m.contains("solana")));
}

#[tokio::test]
async fn test_liquidations_fall_through_in_order() {
    let mut server = Server::new_async().await;
    let coinglass = server
        .mock("GET", "/api/futures/liquidation/order")
        .match_query(Matcher::UrlEncoded("symbol".into(), "BTC".into()))
        .match_header("CG-API-KEY", "cg-key")
        .with_status(200)
        .with_body(json!({"code": "0", "msg": "success", "data": []}).to_string())
        .expect(1)
        .create_async()
        .await;
    let coinalyze = server
        .mock("GET", "/v1/liquidation-history")
        .match_query(Matcher::UrlEncoded("symbols".into(), "BTCUSDT_PERP.A".into()))
        .match_header("api_key", "ca-key")
        .with_status(429)
        .expect(1)
        .create_async()
        .await;
    let bybit = server
        .mock("GET", "/v5/market/recent-trade")
        .match_query(Matcher::AllOf(vec![
            Matcher::UrlEncoded("category".into(), "linear".into()),
            Matcher::UrlEncoded("symbol".into(), "BTCUSDT".into()),
        ]))
        .with_status(200)
        .with_body(
            json!({
                "retCode": 0,
                "retMsg": "OK",
                "result": {"list": [
                    {"symbol": "BTCUSDT", "price": "65000", "size": "3", "side": "Sell", "time": "1700000000000"},
                    {"symbol": "BTCUSDT", "price": "65000", "size": "0.01", "side": "Buy", "time": "1700000000001"}
                ]}
            })
            .to_string(),
        )
        .expect(1)
        .create_async()
        .await;

    let mut config = quiet_config();
    point_at(&mut config, "coinglass", &server, Some("cg-key"));
    point_at(&mut config, "coinalyze", &server, Some("ca-key"));
    point_at(&mut config, "bybit", &server, None);

    let feed = LiquidationFeed::from_config(&config, &Client::new(), &Failsafe::new(&config.providers));
    let snapshot = feed.snapshot().await.unwrap().value;

    let attempted: Vec<(&str, bool)> = snapshot
        .attempts
        .iter()
        .map(|a| (a.provider_name.as_str(), a.success))
        .collect();
    assert_eq!(
        attempted,
        vec![("coinglass", false), ("coinalyze", false), ("bybit", true)]
    );
    assert_eq!(snapshot.sources, vec!["bybit"]);
    assert_eq!(snapshot.data.len(), 1);
    assert_eq!(snapshot.data[0].side, LiquidationSide::Long);
    assert!((snapshot.data[0].amount_usd - 195_000.0).abs() < 1e-6);

    coinglass.assert_async().await;
    coinalyze.assert_async().await;
    bybit.assert_async().await;
}

#[tokio::test]
async fn test_liquidations_all_empty_serves_empty_estimate() {
    let mut server = Server::new_async().await;
    server
        .mock("GET", "/v5/market/recent-trade")
        .match_query(Matcher::Any)
        .with_status(200)
        .with_body(json!({"retCode": 0, "result": {"list": []}}).to_string())
        .create_async()
        .await;

    let mut config = quiet_config();
    point_at(&mut config, "bybit", &server, None);

    let feed = LiquidationFeed::from_config(&config, &Client::new(), &Failsafe::unthrottled());
    let snapshot = feed.snapshot().await.unwrap().value;

    assert!(snapshot.data.is_empty());
    assert!(snapshot.estimated);
    assert_eq!(snapshot.sources, vec!["estimate"]);
}

#[tokio::test]
async fn test_whales_from_blockchain_info() {
    let mut server = Server::new_async().await;
    server
        .mock("GET", "/ticker")
        .with_status(200)
        .with_body(json!({"USD": {"last": 50000.0, "symbol": "$"}}).to_string())
        .create_async()
        .await;
    server
        .mock("GET", "/unconfirmed-transactions")
        .match_query(Matcher::UrlEncoded("format".into(), "json".into()))
        .with_status(200)
        .with_body(
            json!({"txs": [
                {"hash": "whale", "time": 1_700_000_000, "inputs": [], "out": [{"value": 2_000_000_000_u64, "addr": "bc1qbig"}]},
                {"hash": "shrimp", "time": 1_700_000_000, "inputs": [], "out": [{"value": 1_000_u64}]}
            ]})
            .to_string(),
        )
        .create_async()
        .await;

    let mut config = quiet_config();
    point_at(&mut config, "blockchain-info", &server, None);

    let feed = WhaleFeed::from_config(&config, &Client::new(), &Failsafe::unthrottled());
    let snapshot = feed.snapshot().await.unwrap().value;

    assert_eq!(snapshot.sources, vec!["blockchain-info"]);
    assert_eq!(snapshot.data.len(), 1);
    assert_eq!(snapshot.data[0].hash, "whale");
    assert!((snapshot.data[0].amount_usd - 1_000_000.0).abs() < 1e-6);
}

#[tokio::test]
async fn test_block_height_serves_stale_when_all_down() {
    let mut server = Server::new_async().await;
    let down = server
        .mock("GET", "/latestblock")
        .with_status(502)
        .create_async()
        .await;
    let tip = server
        .mock("GET", "/api/blocks/tip/height")
        .with_status(200)
        .with_body("817001")
        .create_async()
        .await;

    let mut config = quiet_config();
    config.feeds.block_height.ttl = Duration::from_millis(20);
    point_at(&mut config, "blockchain-info", &server, None);
    point_at(&mut config, "mempool", &server, None);

    let feed = BlockHeightFeed::from_config(&config, &Client::new(), &Failsafe::unthrottled());

    let fresh = feed.snapshot().await.unwrap();
    assert_eq!(fresh.freshness, Freshness::Fetched);
    assert_eq!(fresh.value.data[0].height, 817_001);
    assert_eq!(fresh.value.sources, vec!["mempool"]);

    // Unmatched requests get 501 from the mock server
    tip.remove_async().await;
    down.remove_async().await;
    tokio::time::sleep(Duration::from_millis(40)).await;

    let stale = feed.snapshot().await.unwrap();
    assert_eq!(stale.freshness, Freshness::Stale);
    assert_eq!(stale.value.data[0].height, 817_001);
}

#[tokio::test]
async fn test_block_height_exhausted_without_cache() {
    let mut server = Server::new_async().await;
    server.mock("GET", "/latestblock").with_status(500).create_async().await;
    server
        .mock("GET", "/api/blocks/tip/height")
        .with_status(200)
        .with_body("\"not a height\"")
        .create_async()
        .await;

    let mut config = quiet_config();
    point_at(&mut config, "blockchain-info", &server, None);
    point_at(&mut config, "mempool", &server, None);

    let feed = BlockHeightFeed::from_config(&config, &Client::new(), &Failsafe::unthrottled());
    let err = feed.snapshot().await.unwrap_err();

    assert!(matches!(err, Error::Exhausted(ref label) if label == "block-height"));
    assert_eq!(err.status_code(), 503);
}

#[tokio::test]
async fn test_shared_provider_is_throttled_across_networks() {
    let mut server = Server::new_async().await;
    server
        .mock("GET", "/v2/api")
        .match_query(Matcher::Any)
        .with_status(200)
        .with_body(json!({"SafeGasPrice": "1", "ProposeGasPrice": "2", "FastGasPrice": "3"}).to_string())
        .expect(3)
        .create_async()
        .await;

    let mut config = quiet_config();
    config.feeds.gas.networks = vec!["ethereum".into(), "polygon".into(), "bsc".into()];
    point_at(&mut config, "etherscan", &server, Some("test-key"));
    config
        .providers
        .by_name
        .get_mut("etherscan")
        .unwrap()
        .min_interval = Some(Duration::from_millis(100));

    let feed = GasFeed::from_config(&config, &Client::new(), &Failsafe::new(&config.providers)).unwrap();
    let started = std::time::Instant::now();
    let snapshot = feed.snapshot(None).await.unwrap().value;

    assert_eq!(snapshot.data.len(), 3);
    assert_eq!(snapshot.sources, vec!["etherscan"]);
    // Three calls on one key: at least two full intervals apart
    assert!(started.elapsed() >= Duration::from_millis(200));
}

#[tokio::test]
async fn test_blockchain_info_requests_are_spaced() {
    let mut server = Server::new_async().await;
    let ticker = server
        .mock("GET", "/ticker")
        .with_status(200)
        .with_body(json!({"USD": {"last": 50000.0}}).to_string())
        .expect(1)
        .create_async()
        .await;
    let unconfirmed = server
        .mock("GET", "/unconfirmed-transactions")
        .match_query(Matcher::Any)
        .with_status(200)
        .with_body(
            json!({"txs": [
                {"hash": "whale", "time": 1_700_000_000, "inputs": [], "out": [{"value": 2_000_000_000_u64}]}
            ]})
            .to_string(),
        )
        .expect(1)
        .create_async()
        .await;
    let latest = server
        .mock("GET", "/latestblock")
        .with_status(200)
        .with_body(json!({"height": 817_000, "hash": "00ab", "time": 1_700_000_000}).to_string())
        .expect(1)
        .create_async()
        .await;

    let mut config = quiet_config();
    point_at(&mut config, "blockchain-info", &server, None);
    config
        .providers
        .by_name
        .get_mut("blockchain-info")
        .unwrap()
        .min_interval = Some(Duration::from_millis(150));

    let failsafe = Failsafe::new(&config.providers);
    let whales = WhaleFeed::from_config(&config, &Client::new(), &failsafe);
    let height = BlockHeightFeed::from_config(&config, &Client::new(), &failsafe);

    let started = std::time::Instant::now();
    let snapshot = whales.snapshot().await.unwrap().value;
    // Ticker and unconfirmed transactions are two calls on one key
    assert!(started.elapsed() >= Duration::from_millis(150));
    assert_eq!(snapshot.sources, vec!["blockchain-info"]);

    // Block height shares the key and waits out the interval again
    height.snapshot().await.unwrap();
    assert!(started.elapsed() >= Duration::from_millis(300));

    ticker.assert_async().await;
    unconfirmed.assert_async().await;
    latest.assert_async().await;
}

//! Feed Aggregator Library
//!
//! Multi-source crypto market data with per-provider throttling, ordered
//! fallback chains and TTL caching.
//!
//! # Feeds
//!
//! - **Gas**: Etherscan, Blocknative and public JSON-RPC per EVM network,
//!   falling back to static per-network estimates
//! - **Liquidations**: CoinGlass, Coinalyze, then large Bybit trades
//! - **Whales**: Whale Alert, then large unconfirmed Bitcoin transactions
//! - **Block height**: blockchain.info, then mempool.space, serving the last
//!   known height when both are down
//!
//! Every upstream response goes through a pure, schema-checked normalizer, so
//! a provider that changes its format fails loudly and the chain moves on.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod cache;
pub mod cli;
pub mod config;
pub mod error;
pub mod failsafe;
pub mod feeds;
pub mod http;
pub mod provider;
pub mod server;

pub use error::{Error, Result};

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Setup tracing/logging
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter);

    match format {
        Some("json") => subscriber
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .try_init()
            .map_err(|e| Error::Internal(format!("Failed to install tracing subscriber: {e}"))),
        _ => subscriber
            .with(fmt::layer().with_writer(std::io::stderr))
            .try_init()
            .map_err(|e| Error::Internal(format!("Failed to install tracing subscriber: {e}"))),
    }
}

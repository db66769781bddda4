//! Bitcoin block height feed
//!
//! There is no sensible static estimate for a block height, so when both
//! providers fail the last cached height is served instead.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::FeedSnapshot;
use super::liquidations::from_secs;
use super::whales::{BLOCKCHAIN_INFO, BLOCKCHAIN_INFO_BASE_URL};
use crate::cache::{CacheStatsSnapshot, Cached, StalePolicy, TtlCache};
use crate::config::{Config, ProviderSettings};
use crate::failsafe::Failsafe;
use crate::http::HttpFetcher;
use crate::provider::{FallbackChain, Provider, decode};
use crate::{Error, Result};

/// mempool.space provider name
pub const MEMPOOL: &str = "mempool";

const MEMPOOL_BASE_URL: &str = "https://mempool.space";

/// Chain tip
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockHeight {
    /// Always `"bitcoin"`
    pub chain: String,
    /// Tip height
    pub height: u64,
    /// Tip hash, when reported
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
    /// Tip block time, when reported
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
    /// Provider name
    pub source: String,
}

#[derive(Deserialize)]
struct LatestBlock {
    height: u64,
    hash: String,
    time: i64,
}

/// Normalize a raw provider response
pub fn normalize(provider: &str, raw: &Value) -> Result<Vec<BlockHeight>> {
    let block = match provider {
        BLOCKCHAIN_INFO => {
            let latest: LatestBlock = decode(BLOCKCHAIN_INFO, raw)?;
            BlockHeight {
                chain: "bitcoin".to_string(),
                height: latest.height,
                hash: Some(latest.hash),
                timestamp: Some(from_secs(BLOCKCHAIN_INFO, latest.time)?),
                source: BLOCKCHAIN_INFO.to_string(),
            }
        }
        MEMPOOL => {
            let height: u64 = decode(MEMPOOL, raw)?;
            BlockHeight {
                chain: "bitcoin".to_string(),
                height,
                hash: None,
                timestamp: None,
                source: MEMPOOL.to_string(),
            }
        }
        other => return Err(Error::Internal(format!("no block height normalizer for provider {other}"))),
    };
    Ok(vec![block])
}

/// blockchain.info `/latestblock`
pub struct BlockchainInfoHeight {
    http: HttpFetcher,
    settings: ProviderSettings,
}

#[async_trait]
impl Provider<BlockHeight> for BlockchainInfoHeight {
    fn name(&self) -> &str {
        BLOCKCHAIN_INFO
    }

    fn is_configured(&self) -> bool {
        self.settings.enabled
    }

    async fn fetch(&self) -> Result<Vec<BlockHeight>> {
        let raw = self.http.send_json(self.http.get("/latestblock")).await?;
        normalize(BLOCKCHAIN_INFO, &raw)
    }
}

/// mempool.space tip height
pub struct MempoolHeight {
    http: HttpFetcher,
    settings: ProviderSettings,
}

#[async_trait]
impl Provider<BlockHeight> for MempoolHeight {
    fn name(&self) -> &str {
        MEMPOOL
    }

    fn is_configured(&self) -> bool {
        self.settings.enabled
    }

    async fn fetch(&self) -> Result<Vec<BlockHeight>> {
        // Bare integer body, which is valid JSON
        let raw = self.http.send_json(self.http.get("/api/blocks/tip/height")).await?;
        normalize(MEMPOOL, &raw)
    }
}

/// Block height feed
pub struct BlockHeightFeed {
    chain: FallbackChain<BlockHeight>,
    cache: TtlCache<FeedSnapshot<BlockHeight>>,
    ttl: Duration,
}

impl BlockHeightFeed {
    /// Build the chain from configuration
    #[must_use]
    pub fn from_config(config: &Config, client: &Client, failsafe: &Failsafe) -> Self {
        let blockchain_info = config
            .providers
            .resolve(BLOCKCHAIN_INFO, BLOCKCHAIN_INFO_BASE_URL, &config.http);
        let mempool = config.providers.resolve(MEMPOOL, MEMPOOL_BASE_URL, &config.http);

        let chain = FallbackChain::new("block-height", failsafe.clone())
            .with_provider(Arc::new(BlockchainInfoHeight {
                http: HttpFetcher::new(client.clone(), &blockchain_info),
                settings: blockchain_info,
            }))
            .with_provider(Arc::new(MempoolHeight {
                http: HttpFetcher::new(client.clone(), &mempool),
                settings: mempool,
            }));

        Self {
            chain,
            cache: TtlCache::new(),
            ttl: config.feeds.block_height.ttl,
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

    /// Current tip; the last known tip if every provider fails
    pub async fn snapshot(&self) -> Result<Cached<FeedSnapshot<BlockHeight>>> {
        self.cache
            .get_or_fetch("block-height", self.ttl, StalePolicy::ServeStale, || async {
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

//! Market data feeds
//!
//! Each feed owns its fallback chains and a TTL cache, and answers with a
//! [`FeedSnapshot`]: the normalized records plus where they came from.

pub mod block_height;
pub mod gas;
pub mod liquidations;
pub mod whales;

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::config::Config;
use crate::failsafe::{Failsafe, HealthMetrics};
use crate::http::build_client;
use crate::provider::{ChainOutcome, ProviderResult};
use crate::Result;

pub use block_height::{BlockHeight, BlockHeightFeed};
pub use gas::{GasData, GasFeed};
pub use liquidations::{Liquidation, LiquidationFeed, LiquidationSide};
pub use whales::{WhaleFeed, WhaleTransaction};

/// Normalized records from one feed request
#[derive(Debug, Clone, Serialize)]
pub struct FeedSnapshot<T> {
    /// Normalized records
    pub data: Vec<T>,
    /// Winning provider per chain, deduplicated, in chain order
    pub sources: Vec<String>,
    /// Whether any record is a static estimate
    pub estimated: bool,
    /// Every provider attempt made for this snapshot
    pub attempts: Vec<ProviderResult>,
    /// When the snapshot was assembled
    pub fetched_at: DateTime<Utc>,
}

impl<T> FeedSnapshot<T> {
    /// Snapshot from a single chain run
    #[must_use]
    pub fn from_outcome(outcome: ChainOutcome<T>) -> Self {
        Self::merge(vec![outcome])
    }

    /// Snapshot from several chain runs, concatenating their records
    #[must_use]
    pub fn merge(outcomes: Vec<ChainOutcome<T>>) -> Self {
        let mut snapshot = Self {
            data: Vec::new(),
            sources: Vec::new(),
            estimated: false,
            attempts: Vec::new(),
            fetched_at: Utc::now(),
        };

        for outcome in outcomes {
            snapshot.estimated |= outcome.estimated;
            if !snapshot.sources.contains(&outcome.source) {
                snapshot.sources.push(outcome.source);
            }
            snapshot.data.extend(outcome.records);
            snapshot.attempts.extend(outcome.attempts);
        }
        snapshot
    }
}

/// All feeds, sharing one HTTP client and one failsafe state
pub struct Aggregator {
    /// Gas prices
    pub gas: GasFeed,
    /// Derivatives liquidations
    pub liquidations: LiquidationFeed,
    /// Whale transactions
    pub whales: WhaleFeed,
    /// Bitcoin block height
    pub block_height: BlockHeightFeed,
    failsafe: Failsafe,
}

impl Aggregator {
    /// Build every feed from configuration
    pub fn from_config(config: &Config) -> Result<Self> {
        let client = build_client(&config.http)?;
        let failsafe = Failsafe::new(&config.providers);

        Ok(Self {
            gas: GasFeed::from_config(config, &client, &failsafe)?,
            liquidations: LiquidationFeed::from_config(config, &client, &failsafe),
            whales: WhaleFeed::from_config(config, &client, &failsafe),
            block_height: BlockHeightFeed::from_config(config, &client, &failsafe),
            failsafe,
        })
    }

    /// Health of every provider called so far
    #[must_use]
    pub fn provider_health(&self) -> Vec<HealthMetrics> {
        self.failsafe.health.snapshot()
    }

    /// Drop cached snapshots older than `max_age` from every feed
    pub fn evict_stale(&self, max_age: Duration) {
        self.gas.evict_older_than(max_age);
        self.liquidations.evict_older_than(max_age);
        self.whales.evict_older_than(max_age);
        self.block_height.evict_older_than(max_age);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn outcome(source: &str, records: Vec<u32>, estimated: bool) -> ChainOutcome<u32> {
        ChainOutcome {
            records,
            source: source.to_string(),
            estimated,
            attempts: vec![ProviderResult::failed("down", "status 500".to_string(), 3)],
        }
    }

    #[test]
    fn test_merge_concatenates_in_order() {
        let snapshot = FeedSnapshot::merge(vec![
            outcome("etherscan", vec![1], false),
            outcome("estimate", vec![2], true),
            outcome("etherscan", vec![3], false),
        ]);

        assert_eq!(snapshot.data, vec![1, 2, 3]);
        assert_eq!(snapshot.sources, vec!["etherscan", "estimate"]);
        assert!(snapshot.estimated);
        assert_eq!(snapshot.attempts.len(), 3);
    }

    #[test]
    fn test_from_outcome() {
        let snapshot = FeedSnapshot::from_outcome(outcome("estimate", vec![], true));
        assert_eq!(snapshot.sources, vec!["estimate"]);
        assert!(snapshot.estimated);
        assert!(snapshot.data.is_empty());
    }
}

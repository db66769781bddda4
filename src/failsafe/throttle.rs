//! Per-provider minimum-interval throttle
//!
//! Each provider key owns a slot holding the instant of its last call. A
//! caller holds the slot's lock while it waits out the remaining interval, so
//! concurrent callers for the same provider are spaced one after another.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::Mutex;
use tokio::time::{Instant, sleep};
use tracing::trace;

/// Throttle spacing outbound calls per provider
#[derive(Debug)]
pub struct ProviderThrottle {
    /// Interval used for providers without an explicit setting
    default_interval: Duration,
    /// Per-provider overrides
    intervals: DashMap<String, Duration>,
    /// Last call instant per provider
    slots: DashMap<String, Arc<Mutex<Option<Instant>>>>,
}

impl ProviderThrottle {
    /// Create a throttle with a default minimum interval
    #[must_use]
    pub fn new(default_interval: Duration) -> Self {
        Self {
            default_interval,
            intervals: DashMap::new(),
            slots: DashMap::new(),
        }
    }

    /// Set the minimum interval for one provider
    pub fn set_interval(&self, provider: &str, interval: Duration) {
        self.intervals.insert(provider.to_string(), interval);
    }

    /// Minimum interval applied to a provider
    #[must_use]
    pub fn interval_for(&self, provider: &str) -> Duration {
        self.intervals
            .get(provider)
            .map_or(self.default_interval, |i| *i)
    }

    /// Wait until the provider's interval has elapsed since its last call,
    /// then record now as the last call.
    pub async fn acquire(&self, provider: &str) {
        let interval = self.interval_for(provider);
        let slot = Arc::clone(
            self.slots
                .entry(provider.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(None)))
                .value(),
        );

        let mut last = slot.lock().await;
        if let Some(previous) = *last {
            let elapsed = previous.elapsed();
            if elapsed < interval {
                let wait = interval - elapsed;
                trace!(provider, wait_ms = wait.as_millis() as u64, "Throttling provider call");
                sleep(wait).await;
            }
        }
        *last = Some(Instant::now());
    }

    /// Instant of the most recent call for a provider, if any
    pub async fn last_call(&self, provider: &str) -> Option<Instant> {
        let slot = self.slots.get(provider).map(|s| Arc::clone(s.value()))?;
        let last = *slot.lock().await;
        last
    }
}

impl Default for ProviderThrottle {
    fn default() -> Self {
        Self::new(Duration::ZERO)
    }
}

//! Failsafe mechanisms: provider throttling, inbound rate limiting, health tracking

mod health;
mod rate_limiter;
mod throttle;

pub use health::{HealthMetrics, HealthRegistry, ProviderHealth};
pub use rate_limiter::RateLimiter;
pub use throttle::ProviderThrottle;

use std::sync::Arc;

use crate::config::ProvidersConfig;

/// Shared outbound failsafe state handed to every fallback chain
#[derive(Clone)]
pub struct Failsafe {
    /// Per-provider minimum-interval throttle
    pub throttle: Arc<ProviderThrottle>,
    /// Per-provider health
    pub health: Arc<HealthRegistry>,
}

impl Failsafe {
    /// Create failsafe state from provider configuration
    #[must_use]
    pub fn new(config: &ProvidersConfig) -> Self {
        let throttle = ProviderThrottle::new(config.default_min_interval);
        for (name, interval) in config.min_intervals() {
            throttle.set_interval(name, interval);
        }

        Self {
            throttle: Arc::new(throttle),
            health: Arc::new(HealthRegistry::new()),
        }
    }

    /// Failsafe state with no throttling, for tests and one-off runs
    #[must_use]
    pub fn unthrottled() -> Self {
        Self {
            throttle: Arc::new(ProviderThrottle::default()),
            health: Arc::new(HealthRegistry::new()),
        }
    }
}

//! Inbound request rate limiting for the HTTP surface

use std::num::NonZeroU32;
use std::time::Duration;

use chrono::Utc;
use governor::middleware::StateInformationMiddleware;
use governor::{Quota, RateLimiter as GovernorLimiter};
use parking_lot::Mutex;

use crate::config::RateLimitConfig;

type DirectLimiter = GovernorLimiter<
    governor::state::NotKeyed,
    governor::state::InMemoryState,
    governor::clock::DefaultClock,
    StateInformationMiddleware,
>;

/// Quota state after a granted request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Permit {
    /// Requests still allowed in the current burst
    pub remaining: u32,
    /// Unix time (seconds) at which the burst is fully replenished
    pub reset_at: i64,
}

/// Global rate limiter for API clients
pub struct RateLimiter {
    /// Whether rate limiting is enabled
    enabled: bool,
    /// Internal rate limiter (lazy initialized)
    inner: Mutex<Option<DirectLimiter>>,
    /// Quota configuration
    rps: u32,
    burst: u32,
}

impl RateLimiter {
    /// Create a new rate limiter
    #[must_use]
    pub fn new(config: &RateLimitConfig) -> Self {
        Self {
            enabled: config.enabled,
            inner: Mutex::new(None),
            rps: config.requests_per_second,
            burst: config.burst_size,
        }
    }

    /// Try to acquire a permit; `None` when the quota is exhausted
    pub fn try_acquire(&self) -> Option<Permit> {
        if !self.enabled {
            return Some(Permit {
                remaining: self.burst,
                reset_at: Utc::now().timestamp(),
            });
        }

        let mut inner = self.inner.lock();
        let limiter = inner.get_or_insert_with(|| {
            let quota = Quota::per_second(NonZeroU32::new(self.rps).unwrap_or(NonZeroU32::MIN))
                .allow_burst(NonZeroU32::new(self.burst).unwrap_or(NonZeroU32::MIN));
            GovernorLimiter::direct(quota).with_middleware::<StateInformationMiddleware>()
        });

        let snapshot = limiter.check().ok()?;
        let remaining = snapshot.remaining_burst_capacity();
        let used = snapshot.quota().burst_size().get().saturating_sub(remaining);
        let refill = snapshot.quota().replenish_interval() * used;

        Some(Permit {
            remaining,
            reset_at: Utc::now().timestamp() + ceil_secs(refill),
        })
    }

    /// Sustained requests per second advertised in `X-RateLimit-Limit`
    #[must_use]
    pub fn limit(&self) -> u32 {
        self.rps
    }

    /// Whether limiting is active
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }
}

fn ceil_secs(duration: Duration) -> i64 {
    let secs = duration.as_secs() + u64::from(duration.subsec_nanos() > 0);
    i64::try_from(secs).unwrap_or(i64::MAX)
}

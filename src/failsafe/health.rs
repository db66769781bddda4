//! Provider health tracking with latency metrics
//!
//! Every fallback-chain attempt lands here, so `/api/v2/providers` can show
//! which upstreams are currently answering and how fast.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::RwLock;
use serde::Serialize;
use tracing::{info, warn};

/// Default capacity for latency histogram
const DEFAULT_HISTOGRAM_CAPACITY: usize = 1000;

/// Consecutive failures after which a provider is reported unhealthy
const UNHEALTHY_AFTER: u64 = 3;

fn now_millis() -> u64 {
    u64::try_from(chrono::Utc::now().timestamp_millis()).unwrap_or_default()
}

/// Health tracker for a single provider
pub struct ProviderHealth {
    /// Provider name
    name: String,
    /// Whether provider is currently healthy
    healthy: AtomicBool,
    /// Total successful fetches
    success_count: AtomicU64,
    /// Total failed fetches
    failure_count: AtomicU64,
    /// Consecutive failures
    consecutive_failures: AtomicU64,
    /// Last successful fetch (millis since epoch)
    last_success: AtomicU64,
    /// Last failed fetch (millis since epoch)
    last_failure: AtomicU64,
    /// Most recent error message
    last_error: RwLock<Option<String>>,
    /// Latency samples
    latencies: RwLock<LatencyHistogram>,
}

impl ProviderHealth {
    /// Create a new health tracker
    #[must_use]
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            healthy: AtomicBool::new(true),
            success_count: AtomicU64::new(0),
            failure_count: AtomicU64::new(0),
            consecutive_failures: AtomicU64::new(0),
            last_success: AtomicU64::new(0),
            last_failure: AtomicU64::new(0),
            last_error: RwLock::new(None),
            latencies: RwLock::new(LatencyHistogram::new(DEFAULT_HISTOGRAM_CAPACITY)),
        }
    }

    /// Record a successful fetch
    pub fn record_success(&self, latency: Duration) {
        self.success_count.fetch_add(1, Ordering::Relaxed);
        self.consecutive_failures.store(0, Ordering::Relaxed);
        self.last_success.store(now_millis(), Ordering::Relaxed);
        self.latencies.write().record(latency);

        if !self.healthy.swap(true, Ordering::Relaxed) {
            info!(provider = %self.name, "Provider recovered");
        }
    }

    /// Record a failed fetch
    pub fn record_failure(&self, latency: Duration, error: &str) {
        self.failure_count.fetch_add(1, Ordering::Relaxed);
        let consecutive = self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
        self.last_failure.store(now_millis(), Ordering::Relaxed);
        *self.last_error.write() = Some(error.to_string());
        self.latencies.write().record(latency);

        if consecutive >= UNHEALTHY_AFTER && self.healthy.swap(false, Ordering::Relaxed) {
            warn!(
                provider = %self.name,
                consecutive_failures = consecutive,
                "Provider marked unhealthy"
            );
        }
    }

    /// Check if provider is currently healthy
    #[must_use]
    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Relaxed)
    }

    /// Get current health metrics
    #[must_use]
    pub fn metrics(&self) -> HealthMetrics {
        let latencies = self.latencies.read();
        let millis = |d: Duration| u64::try_from(d.as_millis()).unwrap_or(u64::MAX);

        HealthMetrics {
            provider: self.name.clone(),
            healthy: self.healthy.load(Ordering::Relaxed),
            success_count: self.success_count.load(Ordering::Relaxed),
            failure_count: self.failure_count.load(Ordering::Relaxed),
            consecutive_failures: self.consecutive_failures.load(Ordering::Relaxed),
            last_success_ms: self.last_success.load(Ordering::Relaxed),
            last_failure_ms: self.last_failure.load(Ordering::Relaxed),
            last_error: self.last_error.read().clone(),
            latency_p50_ms: latencies.percentile(0.50).map(millis),
            latency_p95_ms: latencies.percentile(0.95).map(millis),
            latency_p99_ms: latencies.percentile(0.99).map(millis),
        }
    }
}

/// Health metrics snapshot
#[derive(Debug, Clone, Serialize)]
pub struct HealthMetrics {
    /// Provider name
    pub provider: String,
    /// Current health status
    pub healthy: bool,
    /// Total successful fetches
    pub success_count: u64,
    /// Total failed fetches
    pub failure_count: u64,
    /// Consecutive failures
    pub consecutive_failures: u64,
    /// Last success timestamp (millis since epoch)
    pub last_success_ms: u64,
    /// Last failure timestamp (millis since epoch)
    pub last_failure_ms: u64,
    /// Most recent error
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    /// 50th percentile latency (milliseconds)
    pub latency_p50_ms: Option<u64>,
    /// 95th percentile latency (milliseconds)
    pub latency_p95_ms: Option<u64>,
    /// 99th percentile latency (milliseconds)
    pub latency_p99_ms: Option<u64>,
}

/// Health trackers keyed by provider name
#[derive(Default)]
pub struct HealthRegistry {
    providers: DashMap<String, Arc<ProviderHealth>>,
}

impl HealthRegistry {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Tracker for a provider, created on first use
    pub fn tracker(&self, provider: &str) -> Arc<ProviderHealth> {
        Arc::clone(
            self.providers
                .entry(provider.to_string())
                .or_insert_with(|| Arc::new(ProviderHealth::new(provider)))
                .value(),
        )
    }

    /// Metrics for every provider seen so far, sorted by name
    #[must_use]
    pub fn snapshot(&self) -> Vec<HealthMetrics> {
        let mut metrics: Vec<HealthMetrics> =
            self.providers.iter().map(|p| p.value().metrics()).collect();
        metrics.sort_by(|a, b| a.provider.cmp(&b.provider));
        metrics
    }
}

/// Latency histogram for percentile calculation
struct LatencyHistogram {
    /// Recent latency samples (in milliseconds)
    samples: VecDeque<u64>,
    /// Maximum number of samples to keep
    capacity: usize,
}

impl LatencyHistogram {
    fn new(capacity: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    fn record(&mut self, latency: Duration) {
        if self.samples.len() >= self.capacity {
            self.samples.pop_front();
        }
        self.samples
            .push_back(u64::try_from(latency.as_millis()).unwrap_or(u64::MAX));
    }

    /// Calculate percentile (0.0 to 1.0)
    #[allow(
        clippy::cast_precision_loss,
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss
    )]
    fn percentile(&self, p: f64) -> Option<Duration> {
        if self.samples.is_empty() {
            return None;
        }

        let mut sorted: Vec<u64> = self.samples.iter().copied().collect();
        sorted.sort_unstable();

        let index = ((sorted.len() as f64) * p).floor() as usize;
        let index = index.min(sorted.len() - 1);
        Some(Duration::from_millis(sorted[index]))
    }
}

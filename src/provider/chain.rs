//! Ordered fallback over providers
//!
//! Providers are tried one at a time in declared order and the first success
//! wins. Cheaper or faster providers go first, so candidates are never raced.

use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use tracing::{debug, info, warn};

use super::{ESTIMATE_SOURCE, Provider, ProviderResult};
use crate::failsafe::Failsafe;
use crate::{Error, Result};

type Estimate<T> = Arc<dyn Fn() -> Vec<T> + Send + Sync>;

/// Result of running a chain
#[derive(Debug, Clone)]
pub struct ChainOutcome<T> {
    /// Normalized records
    pub records: Vec<T>,
    /// Winning provider, or `"estimate"`
    pub source: String,
    /// Whether the records are the static estimate
    pub estimated: bool,
    /// Every provider attempt, in order
    pub attempts: Vec<ProviderResult>,
}

/// Providers tried in priority order, with an optional static estimate
pub struct FallbackChain<T> {
    label: String,
    providers: Vec<Arc<dyn Provider<T>>>,
    estimate: Option<Estimate<T>>,
    empty_is_failure: bool,
    failsafe: Failsafe,
}

impl<T> FallbackChain<T>
where
    T: Serialize + Send + 'static,
{
    /// Create an empty chain
    pub fn new(label: impl Into<String>, failsafe: Failsafe) -> Self {
        Self {
            label: label.into(),
            providers: Vec::new(),
            estimate: None,
            empty_is_failure: false,
            failsafe,
        }
    }

    /// Append a provider at the lowest priority so far
    #[must_use]
    pub fn with_provider(mut self, provider: Arc<dyn Provider<T>>) -> Self {
        self.providers.push(provider);
        self
    }

    /// Records returned when every provider fails
    #[must_use]
    pub fn with_estimate<F>(mut self, estimate: F) -> Self
    where
        F: Fn() -> Vec<T> + Send + Sync + 'static,
    {
        self.estimate = Some(Arc::new(estimate));
        self
    }

    /// Treat a successful but empty response as a failure
    #[must_use]
    pub fn empty_is_failure(mut self, empty_is_failure: bool) -> Self {
        self.empty_is_failure = empty_is_failure;
        self
    }

    /// Provider names in priority order
    #[must_use]
    pub fn provider_names(&self) -> Vec<&str> {
        self.providers.iter().map(|p| p.name()).collect()
    }

    /// Try providers in order; return the first success, else the estimate.
    ///
    /// Errors only with [`Error::Exhausted`], when every provider failed and
    /// the chain has no estimate.
    #[tracing::instrument(skip(self), fields(chain = %self.label))]
    pub async fn run(&self) -> Result<ChainOutcome<T>> {
        let mut attempts = Vec::with_capacity(self.providers.len());

        for provider in &self.providers {
            let name = provider.name();
            if !provider.is_configured() {
                debug!(provider = name, "Provider not configured, skipping");
                continue;
            }

            self.failsafe.throttle.acquire(name).await;
            let health = self.failsafe.health.tracker(name);
            let started = Instant::now();

            let result = match provider.fetch().await {
                Ok(records) if records.is_empty() && self.empty_is_failure => {
                    Err(Error::EmptyResponse(name.to_string()))
                }
                other => other,
            };
            let elapsed = started.elapsed();
            let latency_ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX);

            match result {
                Ok(records) => {
                    health.record_success(elapsed);
                    debug!(provider = name, latency_ms, records = records.len(), "Provider succeeded");
                    let payload = serde_json::to_value(&records).ok();
                    attempts.push(ProviderResult::succeeded(name, payload, latency_ms));
                    return Ok(ChainOutcome {
                        records,
                        source: name.to_string(),
                        estimated: false,
                        attempts,
                    });
                }
                Err(e) => {
                    health.record_failure(elapsed, &e.to_string());
                    warn!(provider = name, latency_ms, error = %e, "Provider failed, trying next");
                    attempts.push(ProviderResult::failed(name, e.to_string(), latency_ms));
                }
            }
        }

        match &self.estimate {
            Some(estimate) => {
                info!(attempted = attempts.len(), "All providers failed, serving static estimate");
                Ok(ChainOutcome {
                    records: estimate(),
                    source: ESTIMATE_SOURCE.to_string(),
                    estimated: true,
                    attempts,
                })
            }
            None => Err(Error::Exhausted(self.label.clone())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Scripted {
        name: &'static str,
        configured: bool,
        response: Option<Vec<u32>>,
        calls: AtomicUsize,
    }

    impl Scripted {
        fn ok(name: &'static str, records: Vec<u32>) -> Arc<Self> {
            Arc::new(Self {
                name,
                configured: true,
                response: Some(records),
                calls: AtomicUsize::new(0),
            })
        }

        fn failing(name: &'static str) -> Arc<Self> {
            Arc::new(Self {
                name,
                configured: true,
                response: None,
                calls: AtomicUsize::new(0),
            })
        }

        fn unconfigured(name: &'static str) -> Arc<Self> {
            Arc::new(Self {
                name,
                configured: false,
                response: Some(vec![1]),
                calls: AtomicUsize::new(0),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Provider<u32> for Scripted {
        fn name(&self) -> &str {
            self.name
        }

        fn is_configured(&self) -> bool {
            self.configured
        }

        async fn fetch(&self) -> Result<Vec<u32>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.response.clone().ok_or_else(|| Error::UpstreamStatus {
                provider: self.name.to_string(),
                status: 500,
            })
        }
    }

    #[tokio::test]
    async fn test_first_success_short_circuits() {
        let a = Scripted::failing("a");
        let b = Scripted::ok("b", vec![2]);
        let c = Scripted::ok("c", vec![3]);

        let chain = FallbackChain::new("test", Failsafe::unthrottled())
            .with_provider(a.clone())
            .with_provider(b.clone())
            .with_provider(c.clone())
            .with_estimate(|| vec![0]);

        let outcome = chain.run().await.unwrap();
        assert_eq!(outcome.records, vec![2]);
        assert_eq!(outcome.source, "b");
        assert!(!outcome.estimated);
        assert_eq!(a.calls(), 1);
        assert_eq!(b.calls(), 1);
        assert_eq!(c.calls(), 0);

        assert_eq!(outcome.attempts.len(), 2);
        assert!(!outcome.attempts[0].success);
        assert!(outcome.attempts[1].success);
        assert_eq!(outcome.attempts[1].payload, Some(serde_json::json!([2])));
    }

    #[tokio::test]
    async fn test_all_fail_returns_estimate() {
        let chain = FallbackChain::new("test", Failsafe::unthrottled())
            .with_provider(Scripted::failing("a"))
            .with_provider(Scripted::failing("b"))
            .with_estimate(|| vec![99]);

        let outcome = chain.run().await.unwrap();
        assert_eq!(outcome.records, vec![99]);
        assert_eq!(outcome.source, ESTIMATE_SOURCE);
        assert!(outcome.estimated);
        assert_eq!(outcome.attempts.len(), 2);
    }

    #[tokio::test]
    async fn test_all_fail_without_estimate_is_exhausted() {
        let chain = FallbackChain::new("block-height", Failsafe::unthrottled())
            .with_provider(Scripted::failing("a"));

        let err = chain.run().await.unwrap_err();
        assert!(matches!(err, Error::Exhausted(label) if label == "block-height"));
    }

    #[tokio::test]
    async fn test_unconfigured_provider_is_skipped() {
        let keyed = Scripted::unconfigured("keyed");
        let public = Scripted::ok("public", vec![5]);

        let chain = FallbackChain::new("test", Failsafe::unthrottled())
            .with_provider(keyed.clone())
            .with_provider(public.clone());

        let outcome = chain.run().await.unwrap();
        assert_eq!(outcome.source, "public");
        assert_eq!(keyed.calls(), 0);
        assert_eq!(outcome.attempts.len(), 1);
    }

    #[tokio::test]
    async fn test_empty_is_failure() {
        let empty = Scripted::ok("empty", vec![]);
        let full = Scripted::ok("full", vec![1, 2]);

        let chain = FallbackChain::new("test", Failsafe::unthrottled())
            .with_provider(empty.clone())
            .with_provider(full.clone())
            .empty_is_failure(true);

        let outcome = chain.run().await.unwrap();
        assert_eq!(outcome.source, "full");
        assert_eq!(empty.calls(), 1);
        assert!(outcome.attempts[0].error.as_deref().unwrap().contains("Empty"));
    }

    #[tokio::test]
    async fn test_empty_accepted_by_default() {
        let chain = FallbackChain::new("test", Failsafe::unthrottled())
            .with_provider(Scripted::ok("empty", vec![]))
            .with_provider(Scripted::ok("never", vec![1]));

        let outcome = chain.run().await.unwrap();
        assert_eq!(outcome.source, "empty");
        assert!(outcome.records.is_empty());
    }

    #[tokio::test]
    async fn test_attempts_recorded_in_health() {
        let failsafe = Failsafe::unthrottled();
        let chain = FallbackChain::new("test", failsafe.clone())
            .with_provider(Scripted::failing("flaky"))
            .with_provider(Scripted::ok("steady", vec![1]));

        chain.run().await.unwrap();

        let snapshot = failsafe.health.snapshot();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[0].provider, "flaky");
        assert_eq!(snapshot[0].failure_count, 1);
        assert_eq!(snapshot[1].success_count, 1);
        assert_eq!(chain.provider_names(), vec!["flaky", "steady"]);
    }
}

use std::collections::BTreeSet;
use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::aggregator::{self, AggregationResult, FallbackSuccess, FallbackValue};
use crate::cache::CacheStore;
use crate::circuit_breaker::{BreakerSnapshot, CircuitBreaker, CircuitBreakerConfig};
use crate::config::ResilienceConfig;
use crate::error::ResilienceError;
use crate::health::{HealthCheck, HealthSnapshot, HealthTracker};
use crate::monitor::{PerformanceMonitor, PerformanceStats};
use crate::resilient::ResilientFn;
use crate::retry::RetryPolicy;
use crate::throttling::{AdaptiveRateLimiter, EndpointSnapshot, RateLimiterConfig};

/// Breaker and health view of one dependency.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DependencySnapshot {
    pub dependency: String,
    pub breaker: Option<BreakerSnapshot>,
    pub health: Option<HealthSnapshot>,
}

/// Everything an operational status surface needs in one value.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusReport {
    pub performance: PerformanceStats,
    pub dependencies: Vec<DependencySnapshot>,
    pub endpoints: Vec<EndpointSnapshot>,
    pub cache_entries: usize,
}

struct RegistryInner {
    config: ResilienceConfig,
    cache: CacheStore,
    limiter: AdaptiveRateLimiter,
    breakers: DashMap<String, Arc<CircuitBreaker>>,
    monitor: PerformanceMonitor,
    health: HealthTracker,
}

/// Process-wide resilience context.
///
/// Construct one per process (or per test) and hand clones to every data
/// adapter. Clones share all state: breakers per dependency, pacing per
/// endpoint, the cache and the performance monitor.
#[derive(Clone)]
pub struct ResilienceRegistry {
    inner: Arc<RegistryInner>,
}

impl std::fmt::Debug for ResilienceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResilienceRegistry")
            .field("config", &self.inner.config)
            .field("cache", &self.inner.cache)
            .field("breakers", &self.inner.breakers.len())
            .finish()
    }
}

impl Default for ResilienceRegistry {
    fn default() -> Self {
        Self::new(ResilienceConfig::default())
    }
}

impl ResilienceRegistry {
    /// Registry with an in-memory cache.
    pub fn new(config: ResilienceConfig) -> Self {
        let cache = CacheStore::new(config.cache_ttl());
        Self::with_cache(config, cache)
    }

    /// Registry around a caller-built cache, e.g. one with a durable tier.
    pub fn with_cache(config: ResilienceConfig, cache: CacheStore) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                limiter: AdaptiveRateLimiter::new(RateLimiterConfig::from(&config)),
                monitor: PerformanceMonitor::new(config.latency_window),
                breakers: DashMap::new(),
                health: HealthTracker::new(),
                cache,
                config,
            }),
        }
    }

    pub fn config(&self) -> &ResilienceConfig {
        &self.inner.config
    }

    pub fn cache(&self) -> &CacheStore {
        &self.inner.cache
    }

    pub fn limiter(&self) -> &AdaptiveRateLimiter {
        &self.inner.limiter
    }

    pub fn monitor(&self) -> &PerformanceMonitor {
        &self.inner.monitor
    }

    pub fn health(&self) -> &HealthTracker {
        &self.inner.health
    }

    /// Breaker for `dependency`, created on first use.
    pub fn breaker(&self, dependency: &str) -> Arc<CircuitBreaker> {
        if let Some(breaker) = self.inner.breakers.get(dependency) {
            return Arc::clone(&breaker);
        }
        let breaker = self
            .inner
            .breakers
            .entry(dependency.to_owned())
            .or_insert_with(|| {
                Arc::new(CircuitBreaker::new(
                    dependency,
                    CircuitBreakerConfig::from(&self.inner.config),
                ))
            });
        Arc::clone(&breaker)
    }

    /// Declares a dependency up front so it shows in snapshots before its
    /// first call, and records whether it still lacks an API key.
    pub fn register_dependency(
        &self,
        dependency: &str,
        requires_api_key: bool,
        api_key_configured: bool,
    ) {
        self.breaker(dependency);
        self.inner
            .health
            .register(dependency, requires_api_key, api_key_configured);
    }

    /// Wraps `f` so that every call goes through the cache, the dependency's
    /// breaker, the endpoint's pacing and the retry policy. `operation`
    /// names the call for cache keys and latency stats.
    pub fn wrap<F>(&self, dependency: &str, operation: &str, f: F) -> ResilientFn<F> {
        ResilientFn::new(
            self.clone(),
            dependency,
            operation,
            RetryPolicy::from(&self.inner.config),
            f,
        )
    }

    pub async fn fetch_multi<T, I, S, F, Fut>(
        &self,
        sources: I,
    ) -> Result<AggregationResult<T>, ResilienceError>
    where
        I: IntoIterator<Item = (S, F)>,
        S: Into<String>,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, ResilienceError>>,
    {
        aggregator::fetch_multi(sources).await
    }

    pub async fn fetch_first<T, I, S, F, Fut>(
        &self,
        sources: I,
    ) -> Result<FallbackSuccess<T>, ResilienceError>
    where
        I: IntoIterator<Item = (S, F)>,
        S: Into<String>,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, ResilienceError>>,
    {
        aggregator::fetch_first(sources).await
    }

    /// Stale-cache fallback against this registry's cache.
    pub async fn stale_cache_fallback<T, F, Fut>(
        &self,
        fetch: F,
        key: &str,
        max_age: Duration,
    ) -> Result<FallbackValue<T>, ResilienceError>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, ResilienceError>>,
    {
        aggregator::stale_cache_fallback(&self.inner.cache, fetch, key, max_age).await
    }

    /// Actively checks `dependency` under `timeout` and records the outcome
    /// in its health.
    pub async fn check_health<T, E, Fut>(
        &self,
        dependency: &str,
        timeout: Duration,
        check: Fut,
    ) -> HealthCheck
    where
        Fut: Future<Output = Result<T, E>>,
        E: Display,
    {
        self.inner.health.check(dependency, timeout, check).await
    }

    pub fn get_stats(&self) -> PerformanceStats {
        self.inner.monitor.get_stats()
    }

    /// Every dependency seen by a breaker or the health tracker, by name.
    pub fn dependency_snapshots(&self) -> Vec<DependencySnapshot> {
        let mut names = self
            .inner
            .breakers
            .iter()
            .map(|entry| entry.key().clone())
            .collect::<BTreeSet<_>>();
        names.extend(
            self.inner
                .health
                .snapshots()
                .into_iter()
                .map(|snapshot| snapshot.dependency),
        );

        names
            .into_iter()
            .map(|dependency| DependencySnapshot {
                breaker: self
                    .inner
                    .breakers
                    .get(&dependency)
                    .map(|breaker| breaker.snapshot()),
                health: self.inner.health.snapshot(&dependency),
                dependency,
            })
            .collect()
    }

    pub fn status_report(&self) -> StatusReport {
        StatusReport {
            performance: self.get_stats(),
            dependencies: self.dependency_snapshots(),
            endpoints: self.inner.limiter.snapshots(),
            cache_entries: self.inner.cache.len(),
        }
    }
}

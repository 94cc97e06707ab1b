//! # QAHT Core
//!
//! Resilience layer for every outbound data-source call of the QAHT market
//! screener.
//!
//! ## Overview
//!
//! Data adapters hand plain fetch functions to a [`ResilienceRegistry`] and
//! get back wrapped functions with the same contract. Each wrapped call runs
//! through:
//!
//! - **TTL cache** with force-refresh and bypass modes, optionally backed by
//!   the DuckDB warehouse
//! - **Circuit breaker** per dependency, with a single half-open probe
//! - **Adaptive rate limiter** per endpoint, shrinking on sustained success
//!   and growing on errors or rate-limit signals
//! - **Retry policy** with bounded exponential backoff for transient failures
//! - **Performance monitor** timing every invocation
//!
//! Fan-out across redundant sources is a partial-success operation
//! ([`fetch_multi`]), with an ordered fallback chain ([`fetch_first`]) and a
//! stale-cache fallback for when fresh data is unavailable.
//!
//! ## Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`aggregator`] | Multi-source fan-out and fallbacks |
//! | [`cache`] | TTL cache, cache keys and the durable backend trait |
//! | [`circuit_breaker`] | Per-dependency circuit breaker |
//! | [`config`] | Layered configuration |
//! | [`durable`] | Warehouse-backed cache tier |
//! | [`error`] | Failure taxonomy and error types |
//! | [`health`] | Dependency health tracking |
//! | [`http_client`] | HTTP transport and failure classification |
//! | [`monitor`] | Latency and counter statistics |
//! | [`registry`] | The composition context |
//! | [`retry`] | Retry policy |
//! | [`throttling`] | Adaptive rate limiter |
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use qaht_core::{CallError, ResilienceConfig, ResilienceRegistry};
//!
//! let registry = ResilienceRegistry::new(ResilienceConfig::load(None)?);
//! let markets = registry.wrap("coingecko", "coingecko.markets", |vs: String| async move {
//!     fetch_markets(&vs).await.map_err(|error| CallError::transient(error.to_string()))
//! });
//!
//! let prices = markets.call(String::from("usd")).await?;
//! println!("{}", serde_json::to_string_pretty(&registry.get_stats())?);
//! ```

pub mod aggregator;
pub mod cache;
pub mod circuit_breaker;
pub mod config;
pub mod durable;
pub mod error;
pub mod health;
pub mod http_client;
pub mod monitor;
pub mod registry;
pub mod resilient;
pub mod retry;
pub mod throttling;

pub use aggregator::{
    fetch_first, fetch_multi, stale_cache_fallback, AggregationResult, FallbackSuccess,
    FallbackValue, Freshness,
};
pub use cache::{cache_key, CacheBackend, CacheMode, CacheStore, CachedValue, StoredEntry};
pub use circuit_breaker::{
    BreakerError, BreakerSnapshot, CircuitBreaker, CircuitBreakerConfig, CircuitState,
};
pub use config::{ConfigError, ResilienceConfig};
pub use durable::WarehouseBackend;
pub use error::{CallError, FailureKind, ResilienceError, MAX_RETRY_AFTER};
pub use health::{HealthCheck, HealthSnapshot, HealthState, HealthTracker};
pub use http_client::{
    classify_response, classify_transport_error, HttpClient, HttpRequest, HttpResponse,
    ReqwestHttpClient, TransportFailure,
};
pub use monitor::{OperationStats, OperationTimer, Outcome, PerformanceMonitor, PerformanceStats};
pub use registry::{DependencySnapshot, ResilienceRegistry, StatusReport};
pub use resilient::ResilientFn;
pub use retry::{Backoff, RetryError, RetryPolicy};
pub use throttling::{AdaptiveRateLimiter, EndpointSnapshot, RateLimiterConfig};

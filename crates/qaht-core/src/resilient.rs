//! The composed call: cache, then breaker admission, then per-attempt pacing
//! and retries around the underlying fetch, all timed by the monitor.

use std::future::Future;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::time::Instant;

use crate::cache::{cache_key, CacheMode};
use crate::circuit_breaker::BreakerError;
use crate::error::{CallError, FailureKind, ResilienceError};
use crate::monitor::{API_CALLS, CACHE_HITS, CACHE_MISSES};
use crate::registry::ResilienceRegistry;
use crate::retry::{RetryError, RetryPolicy};

/// A fetch function wrapped by a [`ResilienceRegistry`].
///
/// `call(args)` has the same contract as the wrapped `f(args)`, except that
/// failures surface as [`ResilienceError`]: `CircuitOpen` when the breaker
/// rejected the call, `RateLimited` for rate-limit signals and `Upstream`
/// for everything else once retries are done.
#[derive(Clone)]
pub struct ResilientFn<F> {
    registry: ResilienceRegistry,
    dependency: String,
    operation: String,
    endpoint: String,
    cache_ttl: Option<Duration>,
    caching: bool,
    retry: RetryPolicy,
    call: F,
}

impl<F> std::fmt::Debug for ResilientFn<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResilientFn")
            .field("dependency", &self.dependency)
            .field("operation", &self.operation)
            .field("endpoint", &self.endpoint)
            .field("cache_ttl", &self.cache_ttl)
            .field("caching", &self.caching)
            .field("retry", &self.retry)
            .finish()
    }
}

impl<F> ResilientFn<F> {
    pub(crate) fn new(
        registry: ResilienceRegistry,
        dependency: &str,
        operation: &str,
        retry: RetryPolicy,
        call: F,
    ) -> Self {
        Self {
            registry,
            dependency: dependency.to_owned(),
            operation: operation.to_owned(),
            endpoint: dependency.to_owned(),
            cache_ttl: None,
            caching: true,
            retry,
            call,
        }
    }

    /// Paces under `endpoint` instead of the dependency name.
    pub fn endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    pub fn cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = Some(ttl);
        self
    }

    /// Never read or write the cache for this function.
    pub fn no_cache(mut self) -> Self {
        self.caching = false;
        self
    }

    pub fn retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = policy;
        self
    }

    pub fn dependency(&self) -> &str {
        &self.dependency
    }

    pub fn operation(&self) -> &str {
        &self.operation
    }

    pub async fn call<A, T, Fut>(&self, args: A) -> Result<T, ResilienceError>
    where
        F: Fn(A) -> Fut,
        Fut: Future<Output = Result<T, CallError>>,
        A: Serialize + Clone,
        T: Serialize + DeserializeOwned,
    {
        self.call_with_mode(args, CacheMode::Use).await
    }

    pub async fn call_with_mode<A, T, Fut>(
        &self,
        args: A,
        mode: CacheMode,
    ) -> Result<T, ResilienceError>
    where
        F: Fn(A) -> Fut,
        Fut: Future<Output = Result<T, CallError>>,
        A: Serialize + Clone,
        T: Serialize + DeserializeOwned,
    {
        let monitor = self.registry.monitor();
        let mut timer = monitor.time_operation(self.operation.as_str());

        let key = if self.caching && mode != CacheMode::Bypass {
            Some(cache_key(&self.operation, &args)?)
        } else {
            None
        };

        if let (Some(key), CacheMode::Use) = (key.as_deref(), mode) {
            if let Some(value) = self.read_cache::<T>(key).await {
                monitor.increment(CACHE_HITS);
                timer.cache_hit();
                return Ok(value);
            }
            monitor.increment(CACHE_MISSES);
        }

        let breaker = self.registry.breaker(&self.dependency);
        let started = Instant::now();
        let outcome = breaker.call(|| self.invoke(args)).await;
        let elapsed = started.elapsed();

        match outcome {
            Ok(value) => {
                self.registry.health().record_success(&self.dependency, elapsed);
                if let Some(key) = key.as_deref() {
                    self.write_cache(key, &value).await;
                }
                timer.succeed();
                Ok(value)
            }
            Err(BreakerError::Open { retry_in }) => {
                tracing::debug!(
                    dependency = %self.dependency,
                    operation = %self.operation,
                    retry_in_ms = retry_in.as_millis() as u64,
                    "call rejected by open circuit"
                );
                Err(ResilienceError::CircuitOpen {
                    dependency: self.dependency.clone(),
                    retry_in,
                })
            }
            Err(BreakerError::Inner(RetryError {
                attempts,
                last_error,
            })) => {
                self.registry
                    .health()
                    .record_failure(&self.dependency, elapsed, &last_error.to_string());
                Err(self.surface(attempts, last_error))
            }
        }
    }

    /// Retried sequence of paced attempts. Every attempt waits on the rate
    /// limiter and feeds its outcome back to it.
    async fn invoke<A, T, Fut>(&self, args: A) -> Result<T, RetryError>
    where
        F: Fn(A) -> Fut,
        Fut: Future<Output = Result<T, CallError>>,
        A: Clone,
    {
        let limiter = self.registry.limiter();
        let monitor = self.registry.monitor();
        let endpoint = self.endpoint.as_str();

        self.retry
            .execute(|attempt| {
                let args = args.clone();
                async move {
                    limiter.wait(endpoint).await;
                    monitor.increment(API_CALLS);
                    tracing::debug!(endpoint, attempt, operation = %self.operation, "calling dependency");

                    let result = (self.call)(args).await;
                    match &result {
                        Ok(_) => limiter.on_success(endpoint),
                        Err(error) => match error.kind() {
                            FailureKind::RateLimited => {
                                limiter.on_rate_limit(endpoint, error.retry_after());
                            }
                            FailureKind::Transient | FailureKind::Unknown => {
                                limiter.on_error(endpoint);
                            }
                            FailureKind::AuthFailure | FailureKind::ClientError => {}
                        },
                    }
                    result
                }
            })
            .await
    }

    fn surface(&self, attempts: u32, error: CallError) -> ResilienceError {
        match error.kind() {
            FailureKind::RateLimited => ResilienceError::RateLimited {
                dependency: self.dependency.clone(),
                retry_after: error.retry_after(),
                source: error,
            },
            FailureKind::AuthFailure => {
                tracing::error!(
                    dependency = %self.dependency,
                    operation = %self.operation,
                    error = %error,
                    "authentication failed, check credentials for this dependency"
                );
                ResilienceError::Upstream {
                    dependency: self.dependency.clone(),
                    attempts,
                    source: error,
                }
            }
            _ => ResilienceError::Upstream {
                dependency: self.dependency.clone(),
                attempts,
                source: error,
            },
        }
    }

    async fn read_cache<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let value = self.registry.cache().get(key).await?;
        match serde_json::from_value(value) {
            Ok(decoded) => {
                tracing::debug!(operation = %self.operation, key, "cache hit");
                Some(decoded)
            }
            Err(error) => {
                tracing::warn!(key, error = %error, "cached value does not decode, refetching");
                None
            }
        }
    }

    async fn write_cache<T: Serialize>(&self, key: &str, value: &T) {
        let ttl = self
            .cache_ttl
            .unwrap_or_else(|| self.registry.cache().default_ttl());
        if let Err(error) = self.registry.cache().set_serialized(key, value, ttl).await {
            tracing::warn!(key, error = %error, "result not cached");
        }
    }
}

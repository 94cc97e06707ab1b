//! Graceful degradation: partial-success fan-out, ordered fallback chains and
//! the stale-cache fallback.

use std::collections::BTreeMap;
use std::future::Future;
use std::time::Duration;

use futures::future::join_all;
use serde::de::DeserializeOwned;
use serde::ser::SerializeStruct;
use serde::{Serialize, Serializer};
use tokio::time::Instant;

use crate::cache::CacheStore;
use crate::error::ResilienceError;

/// Outcome of one fan-out. Every requested source lands in exactly one of
/// the two maps.
#[derive(Debug)]
pub struct AggregationResult<T> {
    pub succeeded: BTreeMap<String, T>,
    pub failed: BTreeMap<String, ResilienceError>,
}

impl<T> Default for AggregationResult<T> {
    fn default() -> Self {
        Self {
            succeeded: BTreeMap::new(),
            failed: BTreeMap::new(),
        }
    }
}

impl<T> AggregationResult<T> {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }

    pub fn is_partial(&self) -> bool {
        !self.succeeded.is_empty() && !self.failed.is_empty()
    }

    pub fn source_count(&self) -> usize {
        self.succeeded.len() + self.failed.len()
    }

    pub fn failure_messages(&self) -> BTreeMap<String, String> {
        self.failed
            .iter()
            .map(|(name, error)| (name.clone(), error.to_string()))
            .collect()
    }

    /// Folds the successful results into one value.
    pub fn combine<R>(self, combiner: impl FnOnce(BTreeMap<String, T>) -> R) -> R {
        combiner(self.succeeded)
    }
}

impl<T: Serialize> Serialize for AggregationResult<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut state = serializer.serialize_struct("AggregationResult", 2)?;
        state.serialize_field("succeeded", &self.succeeded)?;
        state.serialize_field("failed", &self.failure_messages())?;
        state.end()
    }
}

/// Invokes every source concurrently and sorts the outcomes into
/// successes and failures.
///
/// Partial failure is never an error. `Err(AllSourcesFailed)` is returned
/// only when there was at least one source and none succeeded; an empty
/// source list yields an empty result. Names are expected to be unique.
pub async fn fetch_multi<T, I, S, F, Fut>(sources: I) -> Result<AggregationResult<T>, ResilienceError>
where
    I: IntoIterator<Item = (S, F)>,
    S: Into<String>,
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T, ResilienceError>>,
{
    let (names, calls): (Vec<String>, Vec<Fut>) = sources
        .into_iter()
        .map(|(name, source)| (name.into(), source()))
        .unzip();
    let outcomes = join_all(calls).await;

    let mut result = AggregationResult::default();
    for (name, outcome) in names.into_iter().zip(outcomes) {
        match outcome {
            Ok(value) => {
                tracing::debug!(source = %name, "source succeeded");
                result.succeeded.insert(name, value);
            }
            Err(error) => {
                tracing::debug!(source = %name, error = %error, "source failed");
                result.failed.insert(name, error);
            }
        }
    }

    if result.succeeded.is_empty() && !result.failed.is_empty() {
        let failures = result.failure_messages();
        tracing::error!(?failures, "all sources failed");
        return Err(ResilienceError::AllSourcesFailed { failures });
    }
    if !result.failed.is_empty() {
        tracing::warn!(
            succeeded = result.succeeded.len(),
            total = result.source_count(),
            failed = ?result.failed.keys().collect::<Vec<_>>(),
            "partial success"
        );
    }
    Ok(result)
}

/// First successful source of an ordered chain.
#[derive(Debug, Clone, Serialize)]
pub struct FallbackSuccess<T> {
    pub data: T,
    pub selected_source: String,
    pub source_chain: Vec<String>,
    /// Failures of the sources tried before `selected_source`, in order.
    pub errors: Vec<(String, String)>,
    pub latency_ms: u64,
}

/// Tries sources one at a time, in order, stopping at the first success.
pub async fn fetch_first<T, I, S, F, Fut>(sources: I) -> Result<FallbackSuccess<T>, ResilienceError>
where
    I: IntoIterator<Item = (S, F)>,
    S: Into<String>,
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T, ResilienceError>>,
{
    let started = Instant::now();
    let mut source_chain = Vec::new();
    let mut errors = Vec::new();

    for (name, source) in sources {
        let name = name.into();
        source_chain.push(name.clone());
        match source().await {
            Ok(data) => {
                if !errors.is_empty() {
                    tracing::warn!(
                        source = %name,
                        skipped = errors.len(),
                        "fallback succeeded after failed source(s)"
                    );
                }
                return Ok(FallbackSuccess {
                    data,
                    selected_source: name,
                    source_chain,
                    errors,
                    latency_ms: elapsed_ms(started),
                });
            }
            Err(error) => {
                tracing::debug!(source = %name, error = %error, "source failed, trying next");
                errors.push((name, error.to_string()));
            }
        }
    }

    let failures = errors.into_iter().collect::<BTreeMap<_, _>>();
    tracing::error!(?failures, "every source in the fallback chain failed");
    Err(ResilienceError::AllSourcesFailed { failures })
}

/// Where a [`FallbackValue`] came from.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum Freshness {
    Fresh,
    /// Cached entry younger than the allowed age.
    Cached { age_seconds: f64 },
    /// Cached entry older than the allowed age, served anyway.
    Stale { age_seconds: f64 },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FallbackValue<T> {
    pub value: T,
    pub freshness: Freshness,
}

/// Fresh fetch first, then a cached entry younger than `max_age`, then any
/// cached entry at all. Fails only when the fetch fails and nothing is
/// cached under `key`. A fresh result is written back to the cache.
pub async fn stale_cache_fallback<T, F, Fut>(
    cache: &CacheStore,
    fetch: F,
    key: &str,
    max_age: Duration,
) -> Result<FallbackValue<T>, ResilienceError>
where
    T: Serialize + DeserializeOwned,
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T, ResilienceError>>,
{
    let error = match fetch().await {
        Ok(value) => {
            match cache
                .set_serialized(key, &value, cache.default_ttl())
                .await
            {
                Ok(_) => {}
                Err(error) => tracing::warn!(key, error = %error, "fresh value not cached"),
            }
            return Ok(FallbackValue {
                value,
                freshness: Freshness::Fresh,
            });
        }
        Err(error) => error,
    };

    tracing::warn!(key, error = %error, "fetch failed, trying cache");
    let Some(cached) = cache.get_any_age(key).await else {
        tracing::error!(key, "fetch failed and nothing is cached");
        return Err(ResilienceError::NoCachedValue {
            key: key.to_owned(),
            source: Box::new(error),
        });
    };

    let value = match serde_json::from_value::<T>(cached.value) {
        Ok(value) => value,
        Err(decode_error) => {
            tracing::warn!(key, error = %decode_error, "cached value does not decode");
            return Err(ResilienceError::NoCachedValue {
                key: key.to_owned(),
                source: Box::new(error),
            });
        }
    };

    let age_seconds = cached.age.as_secs_f64();
    let freshness = if cached.age < max_age {
        tracing::info!(key, age_seconds, "serving cached value");
        Freshness::Cached { age_seconds }
    } else {
        tracing::warn!(key, age_seconds, "cached value is past max age, serving it anyway");
        Freshness::Stale { age_seconds }
    };
    Ok(FallbackValue { value, freshness })
}

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis().min(u128::from(u64::MAX)) as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{CallError, FailureKind};
    use serde_json::{json, Value};
    use std::pin::Pin;

    type BoxedSource<T> = Pin<Box<dyn Future<Output = Result<T, ResilienceError>>>>;

    fn upstream(message: &str) -> ResilienceError {
        ResilienceError::Upstream {
            dependency: String::from("test"),
            attempts: 1,
            source: CallError::transient(message),
        }
    }

    fn succeeds<T: 'static>(value: T) -> BoxedSource<T> {
        Box::pin(async move { Ok(value) })
    }

    fn fails<T: 'static>(message: &'static str) -> BoxedSource<T> {
        Box::pin(async move { Err(upstream(message)) })
    }

    fn failing_fetch() -> std::future::Ready<Result<Value, ResilienceError>> {
        std::future::ready(Err(upstream("down")))
    }

    #[tokio::test]
    async fn partial_failure_keeps_successful_sources() {
        let sources = vec![
            ("a", fails::<Vec<i32>>("a down")),
            ("b", succeeds(vec![1, 2, 3])),
            ("c", succeeds(vec![4, 5])),
        ];
        let result = fetch_multi(sources.into_iter().map(|(name, call)| (name, move || call)))
            .await
            .expect("partial success is not an error");

        assert_eq!(result.succeeded.len(), 2);
        assert_eq!(result.succeeded["b"], vec![1, 2, 3]);
        assert_eq!(result.succeeded["c"], vec![4, 5]);
        assert_eq!(result.failed.len(), 1);
        assert!(result.failed.contains_key("a"));
        assert!(result.is_partial());
    }

    #[tokio::test]
    async fn all_failed_sources_are_reported_together() {
        let sources = ["x", "y"].map(|name| (name, move || fails::<i32>(name)));
        let error = fetch_multi(sources).await.expect_err("nothing succeeded");

        match error {
            ResilienceError::AllSourcesFailed { failures } => {
                assert_eq!(failures.keys().collect::<Vec<_>>(), vec!["x", "y"]);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn empty_fan_out_is_an_empty_result() {
        let sources: Vec<(String, fn() -> BoxedSource<i32>)> = Vec::new();
        let result = fetch_multi(sources).await.expect("empty input is fine");
        assert_eq!(result.source_count(), 0);
        assert!(result.is_complete());
    }

    #[tokio::test(start_paused = true)]
    async fn sources_run_concurrently() {
        let started = Instant::now();
        let sources = [1_u64, 2, 3].map(|secs| {
            (format!("s{secs}"), move || async move {
                tokio::time::sleep(Duration::from_secs(secs)).await;
                Ok::<_, ResilienceError>(secs)
            })
        });
        let result = fetch_multi(sources).await.expect("all succeed");

        assert_eq!(result.succeeded.len(), 3);
        assert_eq!(started.elapsed(), Duration::from_secs(3));
    }

    #[test]
    fn aggregation_serializes_failures_as_messages() {
        let mut result = AggregationResult::default();
        result.succeeded.insert(String::from("b"), 1);
        result.failed.insert(String::from("a"), upstream("down"));

        let encoded = serde_json::to_value(&result).expect("serializes");
        assert_eq!(encoded["succeeded"], json!({"b": 1}));
        assert!(encoded["failed"]["a"]
            .as_str()
            .is_some_and(|message| message.contains("down")));
        assert_eq!(result.combine(|ok| ok.values().sum::<i32>()), 1);
    }

    #[tokio::test]
    async fn fallback_chain_stops_at_first_success() {
        let sources = [
            ("primary", fails::<&str>("primary down")),
            ("secondary", succeeds("quote")),
            ("tertiary", succeeds("never used")),
        ];
        let success = fetch_first(sources.map(|(name, call)| (name, move || call)))
            .await
            .expect("secondary succeeds");

        assert_eq!(success.data, "quote");
        assert_eq!(success.selected_source, "secondary");
        assert_eq!(success.source_chain, vec!["primary", "secondary"]);
        assert_eq!(success.errors.len(), 1);
        assert_eq!(success.errors[0].0, "primary");
    }

    #[tokio::test]
    async fn fallback_chain_fails_when_every_source_fails() {
        let sources = ["primary", "secondary"].map(|name| (name, move || fails::<()>(name)));
        let error = fetch_first(sources).await.expect_err("every source failed");
        assert_eq!(error.code(), "resilience.all_sources_failed");
    }

    #[tokio::test(start_paused = true)]
    async fn stale_fallback_precedence() {
        let cache = CacheStore::new(Duration::from_secs(60));
        let max_age = Duration::from_secs(300);

        let fresh = stale_cache_fallback(&cache, || async { Ok(json!([1, 2])) }, "k", max_age)
            .await
            .expect("fresh");
        assert_eq!(fresh.freshness, Freshness::Fresh);

        tokio::time::advance(Duration::from_secs(120)).await;
        let young = stale_cache_fallback(&cache, failing_fetch, "k", max_age)
            .await
            .expect("cached");
        assert_eq!(young.value, json!([1, 2]));
        assert_eq!(young.freshness, Freshness::Cached { age_seconds: 120.0 });

        tokio::time::advance(Duration::from_secs(600)).await;
        let stale = stale_cache_fallback(&cache, failing_fetch, "k", max_age)
            .await
            .expect("stale");
        assert_eq!(stale.freshness, Freshness::Stale { age_seconds: 720.0 });

        let missing = stale_cache_fallback(&cache, failing_fetch, "other", max_age)
            .await
            .expect_err("nothing cached");
        assert!(matches!(missing, ResilienceError::NoCachedValue { .. }));
        assert_eq!(missing.failure_kind(), Some(FailureKind::Transient));
    }
}

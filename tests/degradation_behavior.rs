//! Behavior-driven tests for graceful degradation
//!
//! These tests verify HOW the system keeps answering when some or all of its
//! data sources fail: partial fan-out results, ordered fallback chains and
//! stale cache service.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use qaht_core::{
    CallError, Freshness, HealthState, ResilienceConfig, ResilienceError, ResilienceRegistry,
};

fn quick_registry() -> ResilienceRegistry {
    ResilienceRegistry::new(ResilienceConfig {
        default_delay_secs: 0.0,
        min_delay_secs: 0.0,
        max_retries: 1,
        ..ResilienceConfig::default()
    })
}

// =============================================================================
// Multi-Source Fan-Out
// =============================================================================

#[tokio::test(start_paused = true)]
async fn when_one_of_three_sources_fails_the_others_still_answer() {
    // Given: A always fails, B returns [1,2,3], C returns [4,5]
    let registry = quick_registry();
    let upstreams = [
        ("a", None),
        ("b", Some(vec![1_u32, 2, 3])),
        ("c", Some(vec![4_u32, 5])),
    ];
    let wrapped = upstreams.map(|(name, payload)| {
        let fetch = registry.wrap(name, &format!("{name}.list"), move |_: ()| {
            let payload = payload.clone();
            async move { payload.ok_or_else(|| CallError::transient("source unavailable")) }
        });
        (name, fetch)
    });

    // When: the sources are fanned out
    let result = registry
        .fetch_multi(wrapped.iter().map(|(name, fetch)| (*name, move || fetch.call(()))))
        .await
        .expect("partial success never raises");

    // Then: two successes, one failure
    assert_eq!(result.succeeded.len(), 2);
    assert_eq!(result.succeeded["b"], vec![1, 2, 3]);
    assert_eq!(result.succeeded["c"], vec![4, 5]);
    assert_eq!(result.failed.len(), 1);
    assert!(result.failed.contains_key("a"));
    assert!(result.is_partial());

    // And: health reflects which dependency is failing
    assert_eq!(registry.health().state("a"), HealthState::Unhealthy);
    assert_eq!(registry.health().state("b"), HealthState::Healthy);
}

#[tokio::test(start_paused = true)]
async fn when_a_slow_source_fails_late_fast_successes_are_unaffected() {
    // Given: one fast source and one that fails after a long stall
    let registry = quick_registry();
    let delays = [("fast", 0_u64, true), ("stalled", 30, false)];
    let wrapped = delays.map(|(name, stall_secs, ok)| {
        let fetch = registry.wrap(name, &format!("{name}.quote"), move |_: ()| async move {
            tokio::time::sleep(Duration::from_secs(stall_secs)).await;
            if ok {
                Ok(150.0_f64)
            } else {
                Err(CallError::unknown("malformed payload"))
            }
        });
        (name, fetch)
    });

    // When: both run together
    let result = registry
        .fetch_multi(wrapped.iter().map(|(name, fetch)| (*name, move || fetch.call(()))))
        .await
        .expect("one source succeeded");

    // Then: the fast value is intact and the late failure is recorded
    assert_eq!(result.succeeded["fast"], 150.0);
    assert_eq!(
        result.failed["stalled"].failure_kind(),
        Some(qaht_core::FailureKind::Unknown)
    );
}

#[tokio::test(start_paused = true)]
async fn when_every_source_fails_all_failures_are_reported_together() {
    // Given: two sources that both fail
    let registry = quick_registry();
    let wrapped = ["coingecko", "binance"].map(|name| {
        let fetch = registry.wrap(name, &format!("{name}.price"), |_: ()| async {
            Err::<f64, _>(CallError::transient("timed out"))
        });
        (name, fetch)
    });

    // When: they are fanned out
    let error = registry
        .fetch_multi(wrapped.iter().map(|(name, fetch)| (*name, move || fetch.call(()))))
        .await
        .expect_err("nothing succeeded");

    // Then: the error names every source
    match error {
        ResilienceError::AllSourcesFailed { failures } => {
            assert_eq!(
                failures.keys().map(String::as_str).collect::<Vec<_>>(),
                vec!["binance", "coingecko"]
            );
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

// =============================================================================
// Ordered Fallback Chain
// =============================================================================

#[tokio::test(start_paused = true)]
async fn when_primary_fails_fallback_chain_answers_from_the_next_source() {
    // Given: primary fails, secondary and tertiary would succeed
    let registry = quick_registry();
    let tertiary_calls = Arc::new(AtomicUsize::new(0));
    let chain = [("primary", false), ("secondary", true), ("tertiary", true)].map(
        |(name, ok)| {
            let tertiary_calls = Arc::clone(&tertiary_calls);
            let fetch = registry.wrap(name, &format!("{name}.quote"), move |symbol: String| {
                if name == "tertiary" {
                    tertiary_calls.fetch_add(1, Ordering::SeqCst);
                }
                async move {
                    if ok {
                        Ok(format!("{symbol}@{name}"))
                    } else {
                        Err(CallError::transient("connection refused"))
                    }
                }
            });
            (name, fetch)
        },
    );

    // When: the chain is tried in order
    let success = registry
        .fetch_first(
            chain
                .iter()
                .map(|(name, fetch)| (*name, move || fetch.call(String::from("AAPL")))),
        )
        .await
        .expect("secondary answers");

    // Then: secondary's value, with primary's failure kept for diagnostics
    assert_eq!(success.data, "AAPL@secondary");
    assert_eq!(success.selected_source, "secondary");
    assert_eq!(success.source_chain, vec!["primary", "secondary"]);
    assert_eq!(success.errors.len(), 1);
    assert_eq!(success.errors[0].0, "primary");
    assert_eq!(tertiary_calls.load(Ordering::SeqCst), 0);
}

// =============================================================================
// Stale Cache Fallback
// =============================================================================

#[tokio::test(start_paused = true)]
async fn when_fresh_fetch_fails_recent_then_stale_cache_is_served_before_failing() {
    // Given: a price cached with a 60s TTL
    let registry = quick_registry();
    let key = "AAPL_price";
    let max_age = Duration::from_secs(300);
    registry
        .cache()
        .set_with_ttl(key, serde_json::json!(150.0), Duration::from_secs(60))
        .await;
    let failing = || async {
        Err::<f64, _>(ResilienceError::CircuitOpen {
            dependency: String::from("yahoo"),
            retry_in: Duration::from_secs(10),
        })
    };

    // When: the fetch fails 2 minutes later
    tokio::time::advance(Duration::from_secs(120)).await;
    let recent = registry
        .stale_cache_fallback(failing, key, max_age)
        .await
        .expect("recent entry served");

    // Then: the expired-but-recent entry is served as cached
    assert_eq!(recent.value, 150.0);
    assert!(matches!(recent.freshness, Freshness::Cached { .. }));

    // When: the fetch fails 10 minutes after caching
    tokio::time::advance(Duration::from_secs(480)).await;
    let stale = registry
        .stale_cache_fallback(failing, key, max_age)
        .await
        .expect("stale entry served");

    // Then: the old entry is still served, marked stale
    assert_eq!(stale.value, 150.0);
    match stale.freshness {
        Freshness::Stale { age_seconds } => assert!(age_seconds >= 600.0),
        other => panic!("unexpected freshness: {other:?}"),
    }

    // When: nothing was ever cached for another key
    let error = registry
        .stale_cache_fallback(failing, "MSFT_price", max_age)
        .await
        .expect_err("nothing to fall back to");

    // Then: the failure is surfaced with its cause
    match error {
        ResilienceError::NoCachedValue { key, source } => {
            assert_eq!(key, "MSFT_price");
            assert!(source.is_circuit_open());
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn when_fresh_fetch_succeeds_it_wins_and_refreshes_the_cache() {
    // Given: an old cached price
    let registry = quick_registry();
    registry
        .cache()
        .set("BTC_price", serde_json::json!(60_000.0))
        .await;

    // When: a fresh fetch succeeds
    let fresh = registry
        .stale_cache_fallback(
            || async { Ok::<_, ResilienceError>(65_000.0_f64) },
            "BTC_price",
            Duration::from_secs(60),
        )
        .await
        .expect("fresh value");

    // Then: the fresh value is returned and now cached
    assert_eq!(fresh.value, 65_000.0);
    assert_eq!(fresh.freshness, Freshness::Fresh);
    assert_eq!(
        registry.cache().get("BTC_price").await,
        Some(serde_json::json!(65_000.0))
    );
}

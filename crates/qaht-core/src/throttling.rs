use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use dashmap::DashMap;
use serde::Serialize;
use tokio::time::Instant;

use crate::config::ResilienceConfig;
use crate::error::MAX_RETRY_AFTER;

/// Pacing knobs shared by every endpoint of one limiter.
#[derive(Debug, Clone, PartialEq)]
pub struct RateLimiterConfig {
    pub default_delay_secs: f64,
    pub min_delay_secs: f64,
    /// Ceiling for self-imposed growth. An explicit `retry_after` from the
    /// dependency is honoured even above it.
    pub max_delay_secs: f64,
    pub success_threshold: u32,
    pub shrink_factor: f64,
    pub error_growth_factor: f64,
    pub rate_limit_growth_factor: f64,
    pub endpoint_delays: BTreeMap<String, f64>,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self::from(&ResilienceConfig::default())
    }
}

impl From<&ResilienceConfig> for RateLimiterConfig {
    fn from(config: &ResilienceConfig) -> Self {
        Self {
            default_delay_secs: config.default_delay_secs,
            min_delay_secs: config.min_delay_secs,
            max_delay_secs: config.max_delay_secs,
            success_threshold: config.success_threshold.max(1),
            shrink_factor: config.shrink_factor,
            error_growth_factor: config.error_growth_factor,
            rate_limit_growth_factor: config.rate_limit_growth_factor,
            endpoint_delays: config.endpoint_delays.clone(),
        }
    }
}

impl RateLimiterConfig {
    fn initial_delay(&self, endpoint: &str) -> f64 {
        self.endpoint_delays
            .get(endpoint)
            .copied()
            .unwrap_or(self.default_delay_secs)
            .max(self.min_delay_secs)
    }
}

#[derive(Debug, Clone, Copy)]
struct LimiterState {
    delay_secs: f64,
    consecutive_successes: u32,
}

/// Per-endpoint entry. `last_call` is held across the pacing sleep so callers
/// of one endpoint queue behind each other; `state` is only ever held for a
/// read-modify-write and never across an await.
#[derive(Debug)]
struct EndpointSlot {
    last_call: tokio::sync::Mutex<Option<Instant>>,
    state: Mutex<LimiterState>,
}

impl EndpointSlot {
    fn new(delay_secs: f64) -> Self {
        Self {
            last_call: tokio::sync::Mutex::new(None),
            state: Mutex::new(LimiterState {
                delay_secs,
                consecutive_successes: 0,
            }),
        }
    }

    fn update<R>(&self, f: impl FnOnce(&mut LimiterState) -> R) -> R {
        let mut state = self
            .state
            .lock()
            .expect("rate limiter state lock is not poisoned");
        f(&mut state)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EndpointSnapshot {
    pub endpoint: String,
    pub delay_secs: f64,
    pub consecutive_successes: u32,
}

/// Per-endpoint adaptive pacing.
///
/// Entries are created lazily on first use and never removed; the key space
/// is the small, fixed set of endpoint names. Different endpoints never
/// contend on each other's locks.
#[derive(Debug)]
pub struct AdaptiveRateLimiter {
    config: RateLimiterConfig,
    slots: DashMap<String, Arc<EndpointSlot>>,
}

impl Default for AdaptiveRateLimiter {
    fn default() -> Self {
        Self::new(RateLimiterConfig::default())
    }
}

impl AdaptiveRateLimiter {
    pub fn new(config: RateLimiterConfig) -> Self {
        Self {
            config,
            slots: DashMap::new(),
        }
    }

    pub fn config(&self) -> &RateLimiterConfig {
        &self.config
    }

    fn slot(&self, endpoint: &str) -> Arc<EndpointSlot> {
        if let Some(slot) = self.slots.get(endpoint) {
            return Arc::clone(&slot);
        }
        let slot = self
            .slots
            .entry(endpoint.to_owned())
            .or_insert_with(|| Arc::new(EndpointSlot::new(self.config.initial_delay(endpoint))));
        Arc::clone(&slot)
    }

    /// Suspends until the endpoint's delay has elapsed since its last call,
    /// then stamps the new call time.
    ///
    /// Cancel-safe: dropping the future mid-sleep leaves the last call time
    /// untouched.
    pub async fn wait(&self, endpoint: &str) {
        let slot = self.slot(endpoint);
        let mut last_call = slot.last_call.lock().await;

        if let Some(previous) = *last_call {
            let delay = secs_to_duration(slot.update(|state| state.delay_secs));
            let ready_at = previous
                .checked_add(delay)
                .unwrap_or_else(|| previous + MAX_RETRY_AFTER);
            if ready_at > Instant::now() {
                tracing::debug!(
                    endpoint,
                    delay_ms = (ready_at - Instant::now()).as_millis() as u64,
                    "pacing call"
                );
                tokio::time::sleep_until(ready_at).await;
            }
        }

        *last_call = Some(Instant::now());
    }

    pub fn on_success(&self, endpoint: &str) {
        let config = &self.config;
        let shrunk = self.slot(endpoint).update(|state| {
            state.consecutive_successes += 1;
            if state.consecutive_successes < config.success_threshold {
                return None;
            }
            state.consecutive_successes = 0;
            state.delay_secs = (state.delay_secs * config.shrink_factor).max(config.min_delay_secs);
            Some(state.delay_secs)
        });

        if let Some(delay_secs) = shrunk {
            tracing::debug!(endpoint, delay_secs, "sustained success, shrinking delay");
        }
    }

    /// Applies a rate-limit signal and returns the new delay. A `retry_after`
    /// hint is clamped to [`MAX_RETRY_AFTER`].
    pub fn on_rate_limit(&self, endpoint: &str, retry_after: Option<Duration>) -> Duration {
        let config = &self.config;
        let retry_after = retry_after.map(|wait| wait.min(MAX_RETRY_AFTER));
        let delay_secs = self.slot(endpoint).update(|state| {
            state.consecutive_successes = 0;
            state.delay_secs = match retry_after {
                Some(retry_after) => state.delay_secs.max(retry_after.as_secs_f64()),
                None => (state.delay_secs * config.rate_limit_growth_factor)
                    .min(config.max_delay_secs)
                    .max(state.delay_secs),
            };
            state.delay_secs
        });

        tracing::warn!(
            endpoint,
            delay_secs,
            retry_after_secs = retry_after.map(|value| value.as_secs_f64()),
            "rate limited, backing off"
        );
        secs_to_duration(delay_secs)
    }

    pub fn on_error(&self, endpoint: &str) -> Duration {
        let config = &self.config;
        let delay_secs = self.slot(endpoint).update(|state| {
            state.consecutive_successes = 0;
            state.delay_secs = (state.delay_secs * config.error_growth_factor)
                .min(config.max_delay_secs)
                .max(state.delay_secs);
            state.delay_secs
        });
        tracing::debug!(endpoint, delay_secs, "call failed, growing delay");
        secs_to_duration(delay_secs)
    }

    /// Current delay for the endpoint, as seconds.
    pub fn delay_secs(&self, endpoint: &str) -> f64 {
        self.slot(endpoint).update(|state| state.delay_secs)
    }

    pub fn snapshots(&self) -> Vec<EndpointSnapshot> {
        let mut snapshots = self
            .slots
            .iter()
            .map(|entry| {
                let state = entry.value().update(|state| *state);
                EndpointSnapshot {
                    endpoint: entry.key().clone(),
                    delay_secs: state.delay_secs,
                    consecutive_successes: state.consecutive_successes,
                }
            })
            .collect::<Vec<_>>();
        snapshots.sort_by(|left, right| left.endpoint.cmp(&right.endpoint));
        snapshots
    }
}

/// Saturating conversion; negative and NaN read as zero.
fn secs_to_duration(secs: f64) -> Duration {
    Duration::try_from_secs_f64(secs.max(0.0)).unwrap_or(Duration::MAX)
}

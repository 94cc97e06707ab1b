//! In-memory latency and counter tracking.

use std::collections::{BTreeMap, VecDeque};
use std::time::Duration;

use dashmap::DashMap;
use serde::Serialize;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tokio::time::Instant;

pub const CACHE_HITS: &str = "cache_hits";
pub const CACHE_MISSES: &str = "cache_misses";
pub const API_CALLS: &str = "api_calls";

/// Outcome tag of one timed invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Success,
    Error,
    CacheHit,
}

#[derive(Debug)]
struct OperationRecord {
    samples_ms: VecDeque<f64>,
    count: u64,
    successes: u64,
    errors: u64,
    cache_hits: u64,
    last_recorded_at: OffsetDateTime,
}

impl OperationRecord {
    fn new() -> Self {
        Self {
            samples_ms: VecDeque::new(),
            count: 0,
            successes: 0,
            errors: 0,
            cache_hits: 0,
            last_recorded_at: OffsetDateTime::now_utc(),
        }
    }

    fn push(&mut self, window: usize, duration: Duration, outcome: Outcome) {
        if self.samples_ms.len() >= window {
            self.samples_ms.pop_front();
        }
        self.samples_ms.push_back(duration.as_secs_f64() * 1_000.0);
        self.count += 1;
        match outcome {
            Outcome::Success => self.successes += 1,
            Outcome::Error => self.errors += 1,
            Outcome::CacheHit => self.cache_hits += 1,
        }
        self.last_recorded_at = OffsetDateTime::now_utc();
    }

    fn stats(&self) -> OperationStats {
        let mut sorted = self.samples_ms.iter().copied().collect::<Vec<_>>();
        sorted.sort_by(f64::total_cmp);

        let (mean_ms, p95_ms, min_ms, max_ms) = if sorted.is_empty() {
            (0.0, 0.0, 0.0, 0.0)
        } else {
            let len = sorted.len();
            let p95_index = ((len as f64 * 0.95) as usize).min(len - 1);
            (
                sorted.iter().sum::<f64>() / len as f64,
                sorted[p95_index],
                sorted[0],
                sorted[len - 1],
            )
        };

        OperationStats {
            count: self.count,
            mean_ms,
            p95_ms,
            min_ms,
            max_ms,
            successes: self.successes,
            errors: self.errors,
            cache_hits: self.cache_hits,
            last_recorded_at: self.last_recorded_at.format(&Rfc3339).ok(),
        }
    }
}

/// Per-operation view. Latency figures cover the most recent samples of the
/// rolling window; `count` and the outcome tallies are lifetime totals.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OperationStats {
    pub count: u64,
    pub mean_ms: f64,
    pub p95_ms: f64,
    pub min_ms: f64,
    pub max_ms: f64,
    pub successes: u64,
    pub errors: u64,
    pub cache_hits: u64,
    pub last_recorded_at: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PerformanceStats {
    pub uptime_seconds: f64,
    pub operations: BTreeMap<String, OperationStats>,
    pub counters: BTreeMap<String, u64>,
    /// `cache_hits / (cache_hits + cache_misses)`, present once both
    /// counters exist.
    pub cache_hit_rate: Option<f64>,
}

#[derive(Debug)]
pub struct PerformanceMonitor {
    started: Instant,
    window: usize,
    operations: DashMap<String, OperationRecord>,
    counters: DashMap<String, u64>,
}

impl Default for PerformanceMonitor {
    fn default() -> Self {
        Self::new(1_024)
    }
}

impl PerformanceMonitor {
    pub fn new(window: usize) -> Self {
        Self {
            started: Instant::now(),
            window: window.max(1),
            operations: DashMap::new(),
            counters: DashMap::new(),
        }
    }

    /// Starts timing `name`. The sample is recorded exactly once, when the
    /// timer is dropped, as an error unless marked otherwise.
    pub fn time_operation(&self, name: impl Into<String>) -> OperationTimer<'_> {
        OperationTimer {
            monitor: self,
            name: name.into(),
            started: Instant::now(),
            outcome: Outcome::Error,
        }
    }

    pub fn record(&self, name: &str, duration: Duration, outcome: Outcome) {
        let window = self.window;
        self.operations
            .entry(name.to_owned())
            .or_insert_with(OperationRecord::new)
            .push(window, duration, outcome);
    }

    pub fn increment(&self, counter: &str) {
        *self.counters.entry(counter.to_owned()).or_insert(0) += 1;
    }

    pub fn counter(&self, counter: &str) -> u64 {
        self.counters.get(counter).map(|value| *value).unwrap_or(0)
    }

    pub fn get_stats(&self) -> PerformanceStats {
        let operations = self
            .operations
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().stats()))
            .collect::<BTreeMap<_, _>>();
        let counters = self
            .counters
            .iter()
            .map(|entry| (entry.key().clone(), *entry.value()))
            .collect::<BTreeMap<_, _>>();

        let cache_hit_rate = match (counters.get(CACHE_HITS), counters.get(CACHE_MISSES)) {
            (Some(hits), Some(misses)) if hits + misses > 0 => {
                Some(*hits as f64 / (hits + misses) as f64)
            }
            _ => None,
        };

        PerformanceStats {
            uptime_seconds: self.started.elapsed().as_secs_f64(),
            operations,
            counters,
            cache_hit_rate,
        }
    }
}

/// Scoped measurement returned by [`PerformanceMonitor::time_operation`].
#[derive(Debug)]
pub struct OperationTimer<'a> {
    monitor: &'a PerformanceMonitor,
    name: String,
    started: Instant,
    outcome: Outcome,
}

impl OperationTimer<'_> {
    pub fn succeed(&mut self) {
        self.outcome = Outcome::Success;
    }

    pub fn fail(&mut self) {
        self.outcome = Outcome::Error;
    }

    pub fn cache_hit(&mut self) {
        self.outcome = Outcome::CacheHit;
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }
}

impl Drop for OperationTimer<'_> {
    fn drop(&mut self) {
        self.monitor
            .record(&self.name, self.started.elapsed(), self.outcome);
    }
}

//! Per-dependency health derived from recorded request outcomes and from
//! active checks run under a timeout.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

/// A failure this recent marks the dependency unhealthy regardless of rate.
pub const RECENT_FAILURE_WINDOW: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthState {
    Healthy,
    Degraded,
    Unhealthy,
    /// No requests recorded yet.
    Unknown,
    /// Needs an API key that is not configured.
    Unconfigured,
}

#[derive(Debug, Clone)]
struct HealthRecord {
    requires_api_key: bool,
    api_key_configured: bool,
    total_requests: u64,
    success_count: u64,
    failure_count: u64,
    avg_response_ms: f64,
    last_error: Option<String>,
    last_success: Option<Instant>,
    last_failure: Option<Instant>,
}

impl HealthRecord {
    fn new(requires_api_key: bool, api_key_configured: bool) -> Self {
        Self {
            requires_api_key,
            api_key_configured,
            total_requests: 0,
            success_count: 0,
            failure_count: 0,
            avg_response_ms: 0.0,
            last_error: None,
            last_success: None,
            last_failure: None,
        }
    }

    fn error_rate(&self) -> f64 {
        if self.total_requests == 0 {
            0.0
        } else {
            self.failure_count as f64 / self.total_requests as f64 * 100.0
        }
    }

    fn state(&self) -> HealthState {
        if self.requires_api_key && !self.api_key_configured {
            return HealthState::Unconfigured;
        }
        if self.total_requests == 0 {
            return HealthState::Unknown;
        }
        if self
            .last_failure
            .is_some_and(|at| at.elapsed() < RECENT_FAILURE_WINDOW)
        {
            return HealthState::Unhealthy;
        }

        let error_rate = self.error_rate();
        if error_rate >= 50.0 {
            HealthState::Unhealthy
        } else if error_rate >= 20.0 {
            HealthState::Degraded
        } else {
            HealthState::Healthy
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthSnapshot {
    pub dependency: String,
    pub state: HealthState,
    pub total_requests: u64,
    pub success_count: u64,
    pub failure_count: u64,
    pub avg_response_ms: f64,
    /// Percentage of failed requests.
    pub error_rate: f64,
    pub last_error: Option<String>,
    pub seconds_since_last_success: Option<f64>,
    pub seconds_since_last_failure: Option<f64>,
}

/// Result of one active health check.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthCheck {
    pub dependency: String,
    pub success: bool,
    pub response_ms: f64,
    pub error: Option<String>,
}

#[derive(Debug, Default)]
pub struct HealthTracker {
    records: DashMap<String, HealthRecord>,
}

impl HealthTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a dependency ahead of its first request. Re-registering
    /// updates the API key flags and keeps the counts.
    pub fn register(&self, dependency: &str, requires_api_key: bool, api_key_configured: bool) {
        self.records
            .entry(dependency.to_owned())
            .and_modify(|record| {
                record.requires_api_key = requires_api_key;
                record.api_key_configured = api_key_configured;
            })
            .or_insert_with(|| HealthRecord::new(requires_api_key, api_key_configured));
    }

    pub fn record_success(&self, dependency: &str, response_time: Duration) {
        self.record(dependency, response_time, None);
    }

    pub fn record_failure(&self, dependency: &str, response_time: Duration, error: &str) {
        self.record(dependency, response_time, Some(error));
    }

    /// Runs `check` against `dependency` for at most `timeout` and records
    /// the outcome like a request. Running out of time is a failure.
    pub async fn check<T, E, Fut>(
        &self,
        dependency: &str,
        timeout: Duration,
        check: Fut,
    ) -> HealthCheck
    where
        Fut: Future<Output = Result<T, E>>,
        E: Display,
    {
        let started = Instant::now();
        let outcome = tokio::time::timeout(timeout, check).await;
        let elapsed = started.elapsed();

        let error = match outcome {
            Ok(Ok(_)) => None,
            Ok(Err(error)) => Some(error.to_string()),
            Err(_) => Some(format!("health check timed out after {}ms", timeout.as_millis())),
        };
        match &error {
            None => tracing::debug!(
                dependency,
                elapsed_ms = elapsed.as_millis() as u64,
                "health check passed"
            ),
            Some(error) => tracing::warn!(dependency, error = %error, "health check failed"),
        }
        self.record(dependency, elapsed, error.as_deref());

        HealthCheck {
            dependency: dependency.to_owned(),
            success: error.is_none(),
            response_ms: elapsed.as_secs_f64() * 1_000.0,
            error,
        }
    }

    fn record(&self, dependency: &str, response_time: Duration, error: Option<&str>) {
        let mut record = self
            .records
            .entry(dependency.to_owned())
            .or_insert_with(|| HealthRecord::new(false, false));
        let previous = record.state();

        record.total_requests += 1;
        match error {
            None => {
                record.success_count += 1;
                record.last_success = Some(Instant::now());
            }
            Some(error) => {
                record.failure_count += 1;
                record.last_failure = Some(Instant::now());
                record.last_error = Some(error.to_owned());
            }
        }

        let response_ms = response_time.as_secs_f64() * 1_000.0;
        if response_ms > 0.0 {
            let total = record.avg_response_ms * (record.total_requests - 1) as f64;
            record.avg_response_ms = (total + response_ms) / record.total_requests as f64;
        }

        let current = record.state();
        if current != previous {
            tracing::info!(
                dependency,
                from = ?previous,
                to = ?current,
                error_rate = record.error_rate(),
                "dependency health changed"
            );
        }
    }

    pub fn state(&self, dependency: &str) -> HealthState {
        self.records
            .get(dependency)
            .map(|record| record.state())
            .unwrap_or(HealthState::Unknown)
    }

    pub fn snapshot(&self, dependency: &str) -> Option<HealthSnapshot> {
        self.records
            .get(dependency)
            .map(|record| to_snapshot(dependency, &record))
    }

    /// All tracked dependencies, sorted by name.
    pub fn snapshots(&self) -> Vec<HealthSnapshot> {
        let mut snapshots = self
            .records
            .iter()
            .map(|entry| to_snapshot(entry.key(), entry.value()))
            .collect::<Vec<_>>();
        snapshots.sort_by(|left, right| left.dependency.cmp(&right.dependency));
        snapshots
    }

    pub fn healthy_dependencies(&self) -> Vec<String> {
        self.snapshots()
            .into_iter()
            .filter(|snapshot| snapshot.state == HealthState::Healthy)
            .map(|snapshot| snapshot.dependency)
            .collect()
    }

    pub fn unhealthy_dependencies(&self) -> Vec<String> {
        self.snapshots()
            .into_iter()
            .filter(|snapshot| snapshot.state == HealthState::Unhealthy)
            .map(|snapshot| snapshot.dependency)
            .collect()
    }
}

fn to_snapshot(dependency: &str, record: &HealthRecord) -> HealthSnapshot {
    HealthSnapshot {
        dependency: dependency.to_owned(),
        state: record.state(),
        total_requests: record.total_requests,
        success_count: record.success_count,
        failure_count: record.failure_count,
        avg_response_ms: record.avg_response_ms,
        error_rate: record.error_rate(),
        last_error: record.last_error.clone(),
        seconds_since_last_success: record.last_success.map(|at| at.elapsed().as_secs_f64()),
        seconds_since_last_failure: record.last_failure.map(|at| at.elapsed().as_secs_f64()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unseen_and_unconfigured_dependencies() {
        let tracker = HealthTracker::new();
        assert_eq!(tracker.state("yahoo"), HealthState::Unknown);

        tracker.register("newsapi", true, false);
        assert_eq!(tracker.state("newsapi"), HealthState::Unconfigured);
        tracker.record_success("newsapi", Duration::from_millis(10));
        assert_eq!(tracker.state("newsapi"), HealthState::Unconfigured);

        tracker.register("newsapi", true, true);
        assert_eq!(tracker.state("newsapi"), HealthState::Healthy);
        assert_eq!(tracker.snapshot("newsapi").map(|s| s.total_requests), Some(1));
    }

    #[tokio::test(start_paused = true)]
    async fn recent_failure_is_unhealthy_until_window_passes() {
        let tracker = HealthTracker::new();
        for _ in 0..9 {
            tracker.record_success("coingecko", Duration::from_millis(20));
        }
        tracker.record_failure("coingecko", Duration::from_millis(20), "HTTP 503");
        assert_eq!(tracker.state("coingecko"), HealthState::Unhealthy);

        tokio::time::advance(RECENT_FAILURE_WINDOW).await;
        assert_eq!(tracker.state("coingecko"), HealthState::Healthy);

        let snapshot = tracker.snapshot("coingecko").expect("tracked");
        assert_eq!(snapshot.last_error.as_deref(), Some("HTTP 503"));
        assert!((snapshot.error_rate - 10.0).abs() < 1e-9);
    }

    #[tokio::test(start_paused = true)]
    async fn error_rate_bands_drive_status_once_failures_age() {
        let tracker = HealthTracker::new();
        for _ in 0..3 {
            tracker.record_success("reddit", Duration::ZERO);
        }
        tracker.record_failure("reddit", Duration::ZERO, "timeout");
        for _ in 0..2 {
            tracker.record_success("yahoo", Duration::ZERO);
        }
        tracker.record_failure("yahoo", Duration::ZERO, "timeout");
        tracker.record_failure("yahoo", Duration::ZERO, "timeout");

        tokio::time::advance(Duration::from_secs(301)).await;
        assert_eq!(tracker.state("reddit"), HealthState::Degraded);
        assert_eq!(tracker.state("yahoo"), HealthState::Unhealthy);
        assert_eq!(tracker.unhealthy_dependencies(), vec![String::from("yahoo")]);
        assert!(tracker.healthy_dependencies().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn passing_check_records_success_with_its_latency() {
        let tracker = HealthTracker::new();
        let result = tracker
            .check("coingecko", Duration::from_secs(10), async {
                tokio::time::sleep(Duration::from_millis(50)).await;
                Ok::<_, String>(())
            })
            .await;

        assert!(result.success);
        assert_eq!(result.error, None);
        assert!((result.response_ms - 50.0).abs() < 1e-9);
        assert_eq!(tracker.state("coingecko"), HealthState::Healthy);
        assert_eq!(tracker.snapshot("coingecko").map(|s| s.success_count), Some(1));
    }

    #[tokio::test(start_paused = true)]
    async fn check_that_outlives_its_timeout_is_a_failure() {
        let tracker = HealthTracker::new();
        let result = tracker
            .check("newsapi", Duration::from_secs(5), async {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok::<_, String>(())
            })
            .await;

        assert!(!result.success);
        assert_eq!(
            result.error.as_deref(),
            Some("health check timed out after 5000ms")
        );
        assert!((result.response_ms - 5_000.0).abs() < 1e-9);
        assert_eq!(tracker.state("newsapi"), HealthState::Unhealthy);
        let snapshot = tracker.snapshot("newsapi").expect("tracked");
        assert_eq!(snapshot.failure_count, 1);
        assert_eq!(snapshot.last_error, result.error);
    }

    #[tokio::test]
    async fn failing_check_keeps_its_error_message() {
        let tracker = HealthTracker::new();
        let result = tracker
            .check("yahoo", Duration::from_secs(1), async { Err::<(), _>("HTTP 503") })
            .await;

        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("HTTP 503"));
        assert_eq!(tracker.state("yahoo"), HealthState::Unhealthy);
    }

    #[test]
    fn average_response_time_is_a_running_mean() {
        let tracker = HealthTracker::new();
        tracker.record_success("yahoo", Duration::from_millis(100));
        tracker.record_success("yahoo", Duration::from_millis(300));
        let snapshot = tracker.snapshot("yahoo").expect("tracked");
        assert!((snapshot.avg_response_ms - 200.0).abs() < 1e-9);
        assert_eq!(snapshot.success_count, 2);
    }
}

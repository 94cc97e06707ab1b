use std::fmt::{Display, Formatter};
use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

use crate::config::ResilienceConfig;

/// Runtime circuit state for one dependency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// Circuit breaker thresholds and timers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub recovery_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(60),
        }
    }
}

impl From<&ResilienceConfig> for CircuitBreakerConfig {
    fn from(config: &ResilienceConfig) -> Self {
        Self {
            failure_threshold: config.failure_threshold.max(1),
            recovery_timeout: config.recovery_timeout(),
        }
    }
}

/// How a call was let through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Admission {
    /// Breaker closed, ordinary call.
    Normal,
    /// The single half-open recovery probe.
    Probe,
}

/// Outcome of [`CircuitBreaker::call`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BreakerError<E> {
    /// Rejected without invoking the operation.
    Open { retry_in: Duration },
    /// The operation ran and failed.
    Inner(E),
}

impl<E: Display> Display for BreakerError<E> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Open { retry_in } => write!(
                f,
                "circuit open, next probe in {}ms",
                retry_in.as_millis()
            ),
            Self::Inner(error) => error.fmt(f),
        }
    }
}

impl<E> std::error::Error for BreakerError<E>
where
    E: std::error::Error + 'static,
{
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Open { .. } => None,
            Self::Inner(error) => Some(error),
        }
    }
}

/// Point-in-time view for status surfaces.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BreakerSnapshot {
    pub dependency: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub failure_threshold: u32,
    pub seconds_since_last_failure: Option<f64>,
}

#[derive(Debug)]
struct CircuitInner {
    state: CircuitState,
    failure_count: u32,
    last_failure_time: Option<Instant>,
    probe_in_flight: bool,
}

impl Default for CircuitInner {
    fn default() -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            last_failure_time: None,
            probe_in_flight: false,
        }
    }
}

/// Thread-safe circuit breaker guarding one dependency.
///
/// Closed → Open after `failure_threshold` consecutive failures; Open →
/// HalfOpen once `recovery_timeout` has elapsed since the last failure;
/// HalfOpen → Closed on a successful probe, back to Open on a failed one.
/// Half-open probes are serialized: while one is in flight every other
/// caller is rejected.
#[derive(Debug)]
pub struct CircuitBreaker {
    dependency: String,
    config: CircuitBreakerConfig,
    inner: Mutex<CircuitInner>,
}

impl CircuitBreaker {
    pub fn new(dependency: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            dependency: dependency.into(),
            config,
            inner: Mutex::new(CircuitInner::default()),
        }
    }

    pub fn dependency(&self) -> &str {
        &self.dependency
    }

    pub const fn config(&self) -> CircuitBreakerConfig {
        self.config
    }

    /// Decides whether a call may proceed. `Err` carries the time left until
    /// the next probe may be attempted. An admitted probe holds the half-open
    /// slot until its outcome is recorded or it is released.
    pub(crate) fn admit(&self) -> Result<Admission, Duration> {
        let mut inner = self
            .inner
            .lock()
            .expect("circuit breaker lock is not poisoned");
        match inner.state {
            CircuitState::Closed => Ok(Admission::Normal),
            CircuitState::HalfOpen => {
                if inner.probe_in_flight {
                    Err(Duration::ZERO)
                } else {
                    inner.probe_in_flight = true;
                    Ok(Admission::Probe)
                }
            }
            CircuitState::Open => {
                let elapsed = inner
                    .last_failure_time
                    .map(|at| at.elapsed())
                    .unwrap_or(self.config.recovery_timeout);

                if elapsed >= self.config.recovery_timeout {
                    inner.state = CircuitState::HalfOpen;
                    inner.probe_in_flight = true;
                    tracing::info!(
                        dependency = %self.dependency,
                        "circuit breaker open -> half_open, probing recovery"
                    );
                    Ok(Admission::Probe)
                } else {
                    Err(self.config.recovery_timeout - elapsed)
                }
            }
        }
    }

    /// Whether a call made now would be let through. Changes no state, so it
    /// never claims the half-open probe.
    pub fn allow_request(&self) -> bool {
        let inner = self
            .inner
            .lock()
            .expect("circuit breaker lock is not poisoned");
        match inner.state {
            CircuitState::Closed => true,
            CircuitState::HalfOpen => !inner.probe_in_flight,
            CircuitState::Open => inner
                .last_failure_time
                .map_or(true, |at| at.elapsed() >= self.config.recovery_timeout),
        }
    }

    pub fn record_success(&self) {
        let mut inner = self
            .inner
            .lock()
            .expect("circuit breaker lock is not poisoned");
        if inner.state == CircuitState::HalfOpen {
            tracing::info!(dependency = %self.dependency, "circuit breaker half_open -> closed");
        }
        inner.state = CircuitState::Closed;
        inner.failure_count = 0;
        inner.probe_in_flight = false;
    }

    pub fn record_failure(&self) {
        let mut inner = self
            .inner
            .lock()
            .expect("circuit breaker lock is not poisoned");
        inner.failure_count = inner.failure_count.saturating_add(1);
        inner.last_failure_time = Some(Instant::now());

        match inner.state {
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Open;
                inner.probe_in_flight = false;
                tracing::warn!(
                    dependency = %self.dependency,
                    failure_count = inner.failure_count,
                    "circuit breaker probe failed, half_open -> open"
                );
            }
            CircuitState::Closed if inner.failure_count >= self.config.failure_threshold => {
                inner.state = CircuitState::Open;
                tracing::warn!(
                    dependency = %self.dependency,
                    failure_count = inner.failure_count,
                    recovery_timeout_ms = self.config.recovery_timeout.as_millis() as u64,
                    "circuit breaker tripped, closed -> open"
                );
            }
            _ => {}
        }
    }

    /// Gives up a probe slot without an outcome, e.g. when the probing
    /// caller was cancelled.
    fn release_probe(&self) {
        let mut inner = self
            .inner
            .lock()
            .expect("circuit breaker lock is not poisoned");
        inner.probe_in_flight = false;
    }

    /// Runs `operation` under the breaker. Any `Err` counts as a failure.
    pub async fn call<T, E, F, Fut>(&self, operation: F) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let admission = self
            .admit()
            .map_err(|retry_in| BreakerError::Open { retry_in })?;

        let mut guard = ProbeGuard {
            breaker: self,
            armed: admission == Admission::Probe,
        };
        let result = operation().await;
        guard.armed = false;

        match result {
            Ok(value) => {
                self.record_success();
                Ok(value)
            }
            Err(error) => {
                self.record_failure();
                Err(BreakerError::Inner(error))
            }
        }
    }

    pub fn state(&self) -> CircuitState {
        let inner = self
            .inner
            .lock()
            .expect("circuit breaker lock is not poisoned");
        inner.state
    }

    pub fn failure_count(&self) -> u32 {
        let inner = self
            .inner
            .lock()
            .expect("circuit breaker lock is not poisoned");
        inner.failure_count
    }

    pub fn last_failure_time(&self) -> Option<Instant> {
        let inner = self
            .inner
            .lock()
            .expect("circuit breaker lock is not poisoned");
        inner.last_failure_time
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let inner = self
            .inner
            .lock()
            .expect("circuit breaker lock is not poisoned");
        BreakerSnapshot {
            dependency: self.dependency.clone(),
            state: inner.state,
            failure_count: inner.failure_count,
            failure_threshold: self.config.failure_threshold,
            seconds_since_last_failure: inner
                .last_failure_time
                .map(|at| at.elapsed().as_secs_f64()),
        }
    }
}

struct ProbeGuard<'a> {
    breaker: &'a CircuitBreaker,
    armed: bool,
}

impl Drop for ProbeGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.breaker.release_probe();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn breaker(failure_threshold: u32, recovery_secs: u64) -> CircuitBreaker {
        CircuitBreaker::new(
            "coincap",
            CircuitBreakerConfig {
                failure_threshold,
                recovery_timeout: Duration::from_secs(recovery_secs),
            },
        )
    }

    async fn fail(breaker: &CircuitBreaker) -> Result<(), BreakerError<&'static str>> {
        breaker.call(|| async { Err("boom") }).await
    }

    #[tokio::test(start_paused = true)]
    async fn opens_after_threshold_failures() {
        let breaker = breaker(2, 10);

        assert_eq!(breaker.state(), CircuitState::Closed);
        let _ = fail(&breaker).await;
        assert_eq!(breaker.state(), CircuitState::Closed);
        let _ = fail(&breaker).await;
        assert_eq!(breaker.state(), CircuitState::Open);
        assert_eq!(breaker.failure_count(), 2);
        assert!(!breaker.allow_request());
    }

    #[tokio::test(start_paused = true)]
    async fn open_breaker_rejects_without_invoking_operation() {
        let breaker = breaker(1, 10);
        let _ = fail(&breaker).await;
        let invocations = AtomicU32::new(0);

        tokio::time::advance(Duration::from_secs(4)).await;
        let result = breaker
            .call(|| async {
                invocations.fetch_add(1, Ordering::SeqCst);
                Ok::<_, &str>(())
            })
            .await;

        match result {
            Err(BreakerError::Open { retry_in }) => {
                assert_eq!(retry_in, Duration::from_secs(6));
            }
            other => panic!("expected open rejection, got {other:?}"),
        }
        assert_eq!(invocations.load(Ordering::SeqCst), 0);
        assert_eq!(breaker.failure_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn success_resets_failure_count_while_closed() {
        let breaker = breaker(3, 10);
        let _ = fail(&breaker).await;
        let _ = fail(&breaker).await;
        assert_eq!(breaker.failure_count(), 2);

        breaker
            .call(|| async { Ok::<_, &str>(()) })
            .await
            .expect("closed breaker lets calls through");
        assert_eq!(breaker.failure_count(), 0);

        let _ = fail(&breaker).await;
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn transitions_to_half_open_after_timeout_then_closes_on_success() {
        let breaker = breaker(1, 5);
        let _ = fail(&breaker).await;
        assert_eq!(breaker.state(), CircuitState::Open);

        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(breaker.admit(), Ok(Admission::Probe));
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        breaker.record_success();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.failure_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_probe_reopens_and_refreshes_last_failure() {
        let breaker = breaker(2, 5);
        let _ = fail(&breaker).await;
        let _ = fail(&breaker).await;
        let tripped_at = breaker.last_failure_time().expect("failure recorded");

        tokio::time::advance(Duration::from_secs(6)).await;
        let _ = fail(&breaker).await;

        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(breaker.failure_count() >= 2);
        let refreshed = breaker.last_failure_time().expect("failure recorded");
        assert_eq!(refreshed - tripped_at, Duration::from_secs(6));
        assert!(!breaker.allow_request());
    }

    #[tokio::test(start_paused = true)]
    async fn allow_request_never_claims_the_half_open_slot() {
        let breaker = breaker(1, 5);
        let _ = fail(&breaker).await;
        assert!(!breaker.allow_request());

        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(breaker.allow_request());
        assert!(breaker.allow_request());
        assert_eq!(breaker.state(), CircuitState::Open);

        tokio::time::advance(Duration::from_secs(600)).await;
        breaker
            .call(|| async { Ok::<_, &str>(()) })
            .await
            .expect("half-open slot is still free");
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert!(breaker.allow_request());
    }

    #[tokio::test(start_paused = true)]
    async fn allow_request_is_false_while_the_half_open_slot_is_taken() {
        let breaker = breaker(1, 5);
        let _ = fail(&breaker).await;
        tokio::time::advance(Duration::from_secs(6)).await;

        assert_eq!(breaker.admit(), Ok(Admission::Probe));
        assert!(!breaker.allow_request());
        breaker.record_failure();
        assert!(!breaker.allow_request());
    }

    #[tokio::test(start_paused = true)]
    async fn only_one_half_open_probe_runs_at_a_time() {
        let breaker = Arc::new(breaker(1, 5));
        let _ = fail(&breaker).await;
        tokio::time::advance(Duration::from_secs(6)).await;

        let gate = Arc::new(tokio::sync::Notify::new());
        let probe = {
            let breaker = Arc::clone(&breaker);
            let gate = Arc::clone(&gate);
            tokio::spawn(async move {
                breaker
                    .call(|| async move {
                        gate.notified().await;
                        Ok::<_, &str>("probe")
                    })
                    .await
            })
        };
        tokio::task::yield_now().await;

        let concurrent = breaker.call(|| async { Ok::<_, &str>("second") }).await;
        assert!(matches!(concurrent, Err(BreakerError::Open { .. })));

        gate.notify_one();
        let probed = probe.await.expect("probe task completes");
        assert_eq!(probed, Ok("probe"));
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_probe_frees_the_slot() {
        let breaker = breaker(1, 5);
        let _ = fail(&breaker).await;
        tokio::time::advance(Duration::from_secs(6)).await;

        let cancelled = tokio::time::timeout(
            Duration::from_millis(10),
            breaker.call(|| async {
                std::future::pending::<()>().await;
                Ok::<_, &str>(())
            }),
        )
        .await;
        assert!(cancelled.is_err());
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        breaker
            .call(|| async { Ok::<_, &str>(()) })
            .await
            .expect("next caller gets the probe");
        assert_eq!(breaker.state(), CircuitState::Closed);
    }
}

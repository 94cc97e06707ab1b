//! Failure classification and the error surface of wrapped calls.
//!
//! Every underlying call failure is classified exactly once, where the call is
//! made, into a [`CallError`] carrying a closed [`FailureKind`]. The breaker,
//! the rate limiter and the retry policy switch on that kind and never on
//! transport-specific error types.

use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};
use std::time::Duration;

use thiserror::Error;

/// Longest wait a dependency's rate-limit hint may impose. Larger hints are
/// clamped to it.
pub const MAX_RETRY_AFTER: Duration = Duration::from_secs(3_600);

/// Closed set of recognized failure kinds for one underlying call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    /// Timeout, connection reset, 5xx-equivalent.
    Transient,
    /// Explicit 429-equivalent or provider rate-limit response.
    RateLimited,
    /// 401/403-equivalent; a configuration problem.
    AuthFailure,
    /// Any other 4xx-equivalent.
    ClientError,
    Unknown,
}

impl FailureKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Transient => "transient",
            Self::RateLimited => "rate_limited",
            Self::AuthFailure => "auth_failure",
            Self::ClientError => "client_error",
            Self::Unknown => "unknown",
        }
    }

    /// Whether the retry policy may attempt the call again.
    pub const fn retryable(self) -> bool {
        matches!(self, Self::Transient)
    }
}

impl Display for FailureKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classified failure of a single underlying call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallError {
    kind: FailureKind,
    message: String,
    status: Option<u16>,
    retry_after: Option<Duration>,
}

impl CallError {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            status: None,
            retry_after: None,
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Transient, message)
    }

    /// `retry_after` is clamped to [`MAX_RETRY_AFTER`].
    pub fn rate_limited(message: impl Into<String>, retry_after: Option<Duration>) -> Self {
        Self {
            retry_after: retry_after.map(|wait| wait.min(MAX_RETRY_AFTER)),
            ..Self::new(FailureKind::RateLimited, message)
        }
    }

    pub fn auth_failure(message: impl Into<String>) -> Self {
        Self::new(FailureKind::AuthFailure, message)
    }

    pub fn client_error(message: impl Into<String>) -> Self {
        Self::new(FailureKind::ClientError, message)
    }

    pub fn unknown(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Unknown, message)
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    pub const fn kind(&self) -> FailureKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub const fn status(&self) -> Option<u16> {
        self.status
    }

    pub const fn retry_after(&self) -> Option<Duration> {
        self.retry_after
    }

    pub const fn retryable(&self) -> bool {
        self.kind.retryable()
    }

    pub const fn code(&self) -> &'static str {
        match self.kind {
            FailureKind::Transient => "call.transient",
            FailureKind::RateLimited => "call.rate_limited",
            FailureKind::AuthFailure => "call.auth_failure",
            FailureKind::ClientError => "call.client_error",
            FailureKind::Unknown => "call.unknown",
        }
    }
}

impl Display for CallError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self.status {
            Some(status) => write!(f, "{} (HTTP {status}, {})", self.message, self.code()),
            None => write!(f, "{} ({})", self.message, self.code()),
        }
    }
}

impl std::error::Error for CallError {}

/// Error surfaced by wrapped calls and the degradation helpers.
#[derive(Debug, Error)]
pub enum ResilienceError {
    /// Rejected by an open breaker without invoking the operation.
    #[error("circuit open for '{dependency}', next probe in {}ms", .retry_in.as_millis())]
    CircuitOpen {
        dependency: String,
        retry_in: Duration,
    },

    #[error("'{dependency}' is rate limited: {source}")]
    RateLimited {
        dependency: String,
        retry_after: Option<Duration>,
        #[source]
        source: CallError,
    },

    /// Final failure of the underlying call once the retry policy gave up.
    #[error("'{dependency}' failed after {attempts} attempt(s): {source}")]
    Upstream {
        dependency: String,
        attempts: u32,
        #[source]
        source: CallError,
    },

    #[error("all {} source(s) failed", .failures.len())]
    AllSourcesFailed { failures: BTreeMap<String, String> },

    /// Fresh fetch failed and nothing was cached under the key.
    #[error("fetch failed and no cached value exists for '{key}': {source}")]
    NoCachedValue {
        key: String,
        #[source]
        source: Box<ResilienceError>,
    },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("persistence error: {0}")]
    Persistence(String),
}

impl ResilienceError {
    /// Kind of the underlying call failure, when there was one.
    pub fn failure_kind(&self) -> Option<FailureKind> {
        match self {
            Self::RateLimited { source, .. } | Self::Upstream { source, .. } => {
                Some(source.kind())
            }
            Self::NoCachedValue { source, .. } => source.failure_kind(),
            _ => None,
        }
    }

    pub const fn is_circuit_open(&self) -> bool {
        matches!(self, Self::CircuitOpen { .. })
    }

    pub const fn is_rate_limited(&self) -> bool {
        matches!(self, Self::RateLimited { .. })
    }

    pub const fn code(&self) -> &'static str {
        match self {
            Self::CircuitOpen { .. } => "resilience.circuit_open",
            Self::RateLimited { .. } => "resilience.rate_limited",
            Self::Upstream { .. } => "resilience.upstream",
            Self::AllSourcesFailed { .. } => "resilience.all_sources_failed",
            Self::NoCachedValue { .. } => "resilience.no_cached_value",
            Self::Serialization(_) => "resilience.serialization",
            Self::Persistence(_) => "resilience.persistence",
        }
    }
}

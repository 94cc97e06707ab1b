//! HTTP transport and the single point where its failures are classified.

use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{CallError, FailureKind, MAX_RETRY_AFTER};

/// Outgoing GET request. Header names are lower-cased.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
    pub url: String,
    pub headers: BTreeMap<String, String>,
    pub timeout_ms: u64,
}

impl HttpRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            headers: BTreeMap::new(),
            timeout_ms: 10_000,
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers
            .insert(name.into().to_ascii_lowercase(), value.into());
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }
}

/// Response envelope. Header names are lower-cased.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: BTreeMap<String, String>,
    pub body: String,
}

impl HttpResponse {
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            headers: BTreeMap::new(),
            body: body.into(),
        }
    }

    pub fn ok_json(body: impl Into<String>) -> Self {
        Self::new(200, body)
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers
            .insert(name.into().to_ascii_lowercase(), value.into());
        self
    }

    pub const fn is_success(&self) -> bool {
        self.status >= 200 && self.status < 300
    }

    pub fn retry_after(&self) -> Option<Duration> {
        self.headers
            .get("retry-after")
            .and_then(|value| parse_retry_after(value))
    }
}

/// How a request failed before any response arrived.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportFailure {
    Timeout,
    Connect,
    Other,
}

/// Maps a transport failure onto the failure taxonomy. Timeouts and
/// connection failures are transient; anything else is unknown.
pub fn classify_transport_error(failure: TransportFailure, message: impl Into<String>) -> CallError {
    match failure {
        TransportFailure::Timeout | TransportFailure::Connect => CallError::transient(message),
        TransportFailure::Other => CallError::unknown(message),
    }
}

/// Passes 2xx responses through and turns everything else into a classified
/// [`CallError`] carrying the status.
pub fn classify_response(response: HttpResponse) -> Result<HttpResponse, CallError> {
    if response.is_success() {
        return Ok(response);
    }

    let status = response.status;
    let message = format!("HTTP {status}: {}", summarize_body(&response.body));
    let error = match failure_kind_for_status(status) {
        FailureKind::RateLimited => CallError::rate_limited(message, response.retry_after()),
        kind => CallError::new(kind, message),
    };
    Err(error.with_status(status))
}

pub const fn failure_kind_for_status(status: u16) -> FailureKind {
    match status {
        408 | 500..=599 => FailureKind::Transient,
        429 => FailureKind::RateLimited,
        401 | 403 => FailureKind::AuthFailure,
        400..=499 => FailureKind::ClientError,
        _ => FailureKind::Unknown,
    }
}

/// `Retry-After` as delta seconds, clamped to [`MAX_RETRY_AFTER`]. HTTP-date
/// values are not supported.
pub fn parse_retry_after(value: &str) -> Option<Duration> {
    let seconds = value.trim().parse::<f64>().ok()?;
    if seconds.is_nan() || seconds < 0.0 {
        return None;
    }
    Duration::try_from_secs_f64(seconds.min(MAX_RETRY_AFTER.as_secs_f64())).ok()
}

fn summarize_body(body: &str) -> String {
    const LIMIT: usize = 200;
    let trimmed = body.trim();
    if trimmed.chars().count() <= LIMIT {
        return trimmed.to_owned();
    }
    let mut summary = trimmed.chars().take(LIMIT).collect::<String>();
    summary.push_str("...");
    summary
}

pub type HttpFuture<'a> = Pin<Box<dyn Future<Output = Result<HttpResponse, CallError>> + Send + 'a>>;

/// Transport contract. Implementations return classified failures, so
/// callers never see transport-specific error types.
pub trait HttpClient: Send + Sync {
    fn execute<'a>(&'a self, request: HttpRequest) -> HttpFuture<'a>;
}

/// Production HTTP client backed by reqwest.
#[derive(Debug, Clone)]
pub struct ReqwestHttpClient {
    client: Arc<reqwest::Client>,
}

impl ReqwestHttpClient {
    pub fn new() -> Self {
        Self {
            client: Arc::new(
                reqwest::Client::builder()
                    .user_agent(concat!("qaht/", env!("CARGO_PKG_VERSION")))
                    .build()
                    .unwrap_or_else(|_| reqwest::Client::new()),
            ),
        }
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self {
            client: Arc::new(client),
        }
    }
}

impl Default for ReqwestHttpClient {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpClient for ReqwestHttpClient {
    fn execute<'a>(&'a self, request: HttpRequest) -> HttpFuture<'a> {
        Box::pin(async move {
            let mut builder = self.client.get(&request.url);
            for (name, value) in &request.headers {
                builder = builder.header(name, value);
            }
            builder = builder.timeout(Duration::from_millis(request.timeout_ms));

            let response = builder.send().await.map_err(|error| {
                let failure = if error.is_timeout() {
                    TransportFailure::Timeout
                } else if error.is_connect() {
                    TransportFailure::Connect
                } else {
                    TransportFailure::Other
                };
                classify_transport_error(failure, format!("request to {} failed: {error}", request.url))
            })?;

            let status = response.status().as_u16();
            let headers = response
                .headers()
                .iter()
                .filter_map(|(name, value)| {
                    value
                        .to_str()
                        .ok()
                        .map(|value| (name.as_str().to_owned(), value.to_owned()))
                })
                .collect::<BTreeMap<_, _>>();
            let body = response.text().await.map_err(|error| {
                let failure = if error.is_timeout() {
                    TransportFailure::Timeout
                } else {
                    TransportFailure::Other
                };
                classify_transport_error(failure, format!("failed to read response body: {error}"))
            })?;

            classify_response(HttpResponse {
                status,
                headers,
                body,
            })
        })
    }
}

//! TTL response cache with an optional durable tier.
//!
//! The in-memory tier is a concurrent map, so readers and writers of
//! different keys never contend and a `set` replaces an entry atomically.
//! When a [`CacheBackend`] is attached every write goes through to it, and an
//! in-memory miss is answered from the backend when it still holds a live
//! entry. Backend failures are logged and otherwise ignored.
//!
//! With a backend attached, writes and removals of one key are serialized
//! across both tiers, so the tiers always agree on the last writer.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};
use time::OffsetDateTime;
use tokio::time::Instant;

use crate::error::ResilienceError;

/// Defines how a wrapped call uses the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CacheMode {
    /// Serve a live entry if present; otherwise call and store the result.
    #[default]
    Use,
    /// Skip the read, call, and store the fresh result.
    Refresh,
    /// Neither read nor write.
    Bypass,
}

/// Entry as exchanged with a durable backend. Timestamps are unix
/// milliseconds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredEntry {
    pub value_json: String,
    pub cached_at_ms: i64,
    pub expires_at_ms: i64,
}

/// Durable second tier behind [`CacheStore`]. Implementations may block; the
/// store always calls them from the blocking pool.
pub trait CacheBackend: Send + Sync {
    fn load(&self, key: &str) -> Result<Option<StoredEntry>, ResilienceError>;
    fn store(&self, key: &str, entry: StoredEntry) -> Result<(), ResilienceError>;
    fn remove(&self, key: &str) -> Result<(), ResilienceError>;
    fn clear(&self) -> Result<(), ResilienceError>;
    /// Removes entries with `expires_at_ms <= now_ms`, returning how many.
    fn purge_expired(&self, now_ms: i64) -> Result<usize, ResilienceError>;
}

/// Cached value of any age, as served by the stale fallback.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedValue {
    pub value: Value,
    pub age: Duration,
}

#[derive(Debug, Clone)]
struct CacheEntry {
    value: Value,
    cached_at: Instant,
    expires_at: Instant,
}

impl CacheEntry {
    fn is_live(&self, now: Instant) -> bool {
        now < self.expires_at
    }

    fn from_stored(stored: &StoredEntry, now_ms: i64) -> Option<Self> {
        let value = serde_json::from_str(&stored.value_json).ok()?;
        let now = Instant::now();
        let age = Duration::from_millis(now_ms.saturating_sub(stored.cached_at_ms).max(0) as u64);
        let remaining = stored.expires_at_ms.saturating_sub(now_ms);
        let expires_at = if remaining > 0 {
            now + Duration::from_millis(remaining as u64)
        } else {
            now
        };
        Some(Self {
            value,
            cached_at: now.checked_sub(age).unwrap_or(now),
            expires_at,
        })
    }
}

/// Lock stripes guarding two-tier writes. Keys hash onto a stripe.
const WRITE_STRIPES: usize = 32;

/// Stand-in expiry for a TTL too long to represent.
const FAR_FUTURE: Duration = Duration::from_secs(100 * 365 * 86_400);

type WriteStripe = Arc<tokio::sync::Mutex<()>>;

struct CacheInner {
    entries: DashMap<String, CacheEntry>,
    default_ttl: Duration,
    backend: Option<Arc<dyn CacheBackend>>,
    write_stripes: Vec<WriteStripe>,
}

/// Shared TTL cache. Cloning is cheap and clones share entries.
#[derive(Clone)]
pub struct CacheStore {
    inner: Arc<CacheInner>,
}

impl std::fmt::Debug for CacheStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheStore")
            .field("entries", &self.inner.entries.len())
            .field("default_ttl", &self.inner.default_ttl)
            .field("durable", &self.inner.backend.is_some())
            .finish()
    }
}

impl CacheStore {
    pub fn new(default_ttl: Duration) -> Self {
        Self::build(default_ttl, None)
    }

    /// Cache that also writes through to `backend`.
    pub fn with_backend(default_ttl: Duration, backend: Arc<dyn CacheBackend>) -> Self {
        Self::build(default_ttl, Some(backend))
    }

    fn build(default_ttl: Duration, backend: Option<Arc<dyn CacheBackend>>) -> Self {
        Self {
            inner: Arc::new(CacheInner {
                entries: DashMap::new(),
                default_ttl,
                backend,
                write_stripes: (0..WRITE_STRIPES)
                    .map(|_| Arc::new(tokio::sync::Mutex::new(())))
                    .collect(),
            }),
        }
    }

    pub fn default_ttl(&self) -> Duration {
        self.inner.default_ttl
    }

    pub fn is_durable(&self) -> bool {
        self.inner.backend.is_some()
    }

    /// Live value for `key`. Never-cached and expired both read as `None`.
    pub async fn get(&self, key: &str) -> Option<Value> {
        if let Some(entry) = self.inner.entries.get(key) {
            if entry.is_live(Instant::now()) {
                return Some(entry.value.clone());
            }
        }

        let stored = self.load_from_backend(key).await?;
        let entry = CacheEntry::from_stored(&stored, unix_ms_now())?;
        if !entry.is_live(Instant::now()) {
            return None;
        }
        tracing::debug!(key, "promoting durable cache entry");
        let value = entry.value.clone();
        self.inner.entries.insert(key.to_owned(), entry);
        Some(value)
    }

    pub async fn get_typed<T>(&self, key: &str) -> Result<Option<T>, ResilienceError>
    where
        T: DeserializeOwned,
    {
        match self.get(key).await {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    /// Value for `key` regardless of expiry, with its age.
    pub async fn get_any_age(&self, key: &str) -> Option<CachedValue> {
        if let Some(entry) = self.inner.entries.get(key) {
            return Some(CachedValue {
                value: entry.value.clone(),
                age: entry.cached_at.elapsed(),
            });
        }

        let stored = self.load_from_backend(key).await?;
        let value = serde_json::from_str(&stored.value_json).ok()?;
        let age_ms = unix_ms_now().saturating_sub(stored.cached_at_ms).max(0);
        Some(CachedValue {
            value,
            age: Duration::from_millis(age_ms as u64),
        })
    }

    /// Stores `value` under the default TTL. Returns `false`, storing
    /// nothing, for null and empty arrays or objects.
    pub async fn set(&self, key: &str, value: Value) -> bool {
        self.set_with_ttl(key, value, self.inner.default_ttl).await
    }

    pub async fn set_with_ttl(&self, key: &str, value: Value, ttl: Duration) -> bool {
        if is_empty_value(&value) {
            tracing::debug!(key, "refusing to cache empty result");
            return false;
        }

        let now = Instant::now();
        let entry = CacheEntry {
            value,
            cached_at: now,
            expires_at: now.checked_add(ttl).unwrap_or_else(|| now + FAR_FUTURE),
        };

        if self.inner.backend.is_none() {
            self.inner.entries.insert(key.to_owned(), entry);
            return true;
        }

        let stored = match serde_json::to_string(&entry.value) {
            Ok(value_json) => {
                let cached_at_ms = unix_ms_now();
                Some(StoredEntry {
                    value_json,
                    cached_at_ms,
                    expires_at_ms: cached_at_ms
                        .saturating_add(i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX)),
                })
            }
            Err(error) => {
                tracing::warn!(key, error = %error, "cache value is not serializable for the durable tier");
                None
            }
        };

        // The stripe stays held until the durable write finishes, even if
        // this future is dropped first.
        let write = self.write_stripe(key).lock_owned().await;
        self.inner.entries.insert(key.to_owned(), entry);
        if let Some(stored) = stored {
            let owned_key = key.to_owned();
            self.run_backend("store", move |backend| {
                let _write = write;
                backend.store(&owned_key, stored)
            })
            .await;
        }
        true
    }

    pub async fn set_serialized<T>(
        &self,
        key: &str,
        value: &T,
        ttl: Duration,
    ) -> Result<bool, ResilienceError>
    where
        T: Serialize + ?Sized,
    {
        let value = serde_json::to_value(value)?;
        Ok(self.set_with_ttl(key, value, ttl).await)
    }

    pub async fn invalidate(&self, key: &str) {
        if self.inner.backend.is_none() {
            self.inner.entries.remove(key);
            return;
        }

        let write = self.write_stripe(key).lock_owned().await;
        self.inner.entries.remove(key);
        let owned_key = key.to_owned();
        self.run_backend("remove", move |backend| {
            let _write = write;
            backend.remove(&owned_key)
        })
        .await;
    }

    pub async fn clear(&self) {
        self.inner.entries.clear();
        self.run_backend("clear", |backend| backend.clear()).await;
    }

    /// Physically removes expired entries from both tiers and returns how
    /// many in-memory entries were dropped.
    pub async fn cleanup_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.inner.entries.len();
        self.inner.entries.retain(|_, entry| entry.is_live(now));
        let removed = before.saturating_sub(self.inner.entries.len());

        let now_ms = unix_ms_now();
        if let Some(purged) = self
            .run_backend("purge_expired", move |backend| backend.purge_expired(now_ms))
            .await
        {
            tracing::debug!(purged, "purged expired durable cache entries");
        }
        removed
    }

    /// In-memory entries, expired ones included until cleanup.
    pub fn len(&self) -> usize {
        self.inner.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.entries.is_empty()
    }

    fn write_stripe(&self, key: &str) -> WriteStripe {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        let index = (hasher.finish() % WRITE_STRIPES as u64) as usize;
        Arc::clone(&self.inner.write_stripes[index])
    }

    async fn load_from_backend(&self, key: &str) -> Option<StoredEntry> {
        let owned_key = key.to_owned();
        self.run_backend("load", move |backend| backend.load(&owned_key))
            .await
            .flatten()
    }

    async fn run_backend<T, F>(&self, action: &'static str, operation: F) -> Option<T>
    where
        T: Send + 'static,
        F: FnOnce(&dyn CacheBackend) -> Result<T, ResilienceError> + Send + 'static,
    {
        let backend = self.inner.backend.clone()?;
        match tokio::task::spawn_blocking(move || operation(backend.as_ref())).await {
            Ok(Ok(value)) => Some(value),
            Ok(Err(error)) => {
                tracing::warn!(action, error = %error, "durable cache operation failed");
                None
            }
            Err(error) => {
                tracing::warn!(action, error = %error, "durable cache task did not complete");
                None
            }
        }
    }
}

/// `null`, `[]` and `{}` are never cached.
pub fn is_empty_value(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Array(items) => items.is_empty(),
        Value::Object(fields) => fields.is_empty(),
        _ => false,
    }
}

/// Deterministic cache key for `operation` called with `args`.
///
/// Object keys are sorted recursively before hashing, so argument order never
/// matters, and the operation name is hashed alongside the arguments so two
/// operations never share a key.
pub fn cache_key<A>(operation: &str, args: &A) -> Result<String, ResilienceError>
where
    A: Serialize + ?Sized,
{
    let canonical = canonicalize(serde_json::to_value(args)?);
    let encoded = serde_json::to_string(&canonical)?;

    let mut hasher = blake3::Hasher::new();
    hasher.update(operation.as_bytes());
    hasher.update(&[0]);
    hasher.update(encoded.as_bytes());
    Ok(format!("{operation}:{}", hasher.finalize().to_hex()))
}

fn canonicalize(value: Value) -> Value {
    match value {
        Value::Object(fields) => {
            let mut sorted = fields.into_iter().collect::<Vec<_>>();
            sorted.sort_by(|left, right| left.0.cmp(&right.0));
            Value::Object(
                sorted
                    .into_iter()
                    .map(|(name, value)| (name, canonicalize(value)))
                    .collect::<Map<_, _>>(),
            )
        }
        Value::Array(items) => Value::Array(items.into_iter().map(canonicalize).collect()),
        other => other,
    }
}

pub(crate) fn unix_ms_now() -> i64 {
    (OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64
}

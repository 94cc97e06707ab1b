//! Warehouse-backed durable cache tier.

use std::path::Path;

use qaht_warehouse::{CacheRecord, CacheTableStats, CacheWarehouse, WarehouseConfig, WarehouseError};

use crate::cache::{unix_ms_now, CacheBackend, StoredEntry};
use crate::error::ResilienceError;

/// [`CacheBackend`] over the DuckDB `response_cache` table.
#[derive(Debug, Clone)]
pub struct WarehouseBackend {
    warehouse: CacheWarehouse,
}

impl WarehouseBackend {
    pub fn new(warehouse: CacheWarehouse) -> Self {
        Self { warehouse }
    }

    /// Opens (and migrates) the database at `db_path`.
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self, ResilienceError> {
        let config = WarehouseConfig::at_path(db_path.as_ref());
        CacheWarehouse::open(config)
            .map(Self::new)
            .map_err(persistence)
    }

    /// Opens the database under `QAHT_HOME`.
    pub fn open_default() -> Result<Self, ResilienceError> {
        CacheWarehouse::open_default()
            .map(Self::new)
            .map_err(persistence)
    }

    pub fn warehouse(&self) -> &CacheWarehouse {
        &self.warehouse
    }

    pub fn stats(&self) -> Result<CacheTableStats, ResilienceError> {
        self.warehouse.stats(unix_ms_now()).map_err(persistence)
    }

    pub fn purge_expired_now(&self) -> Result<usize, ResilienceError> {
        self.warehouse
            .purge_expired(unix_ms_now())
            .map_err(persistence)
    }

    /// Drops every entry written for `operation`.
    pub fn invalidate_operation(&self, operation: &str) -> Result<usize, ResilienceError> {
        self.warehouse
            .remove_prefix(&format!("{operation}:"))
            .map_err(persistence)
    }
}

impl CacheBackend for WarehouseBackend {
    fn load(&self, key: &str) -> Result<Option<StoredEntry>, ResilienceError> {
        let record = self.warehouse.get(key).map_err(persistence)?;
        Ok(record.map(|record| StoredEntry {
            value_json: record.value_json,
            cached_at_ms: record.cached_at_ms,
            expires_at_ms: record.expires_at_ms,
        }))
    }

    fn store(&self, key: &str, entry: StoredEntry) -> Result<(), ResilienceError> {
        self.warehouse
            .put(&CacheRecord {
                cache_key: key.to_owned(),
                value_json: entry.value_json,
                cached_at_ms: entry.cached_at_ms,
                expires_at_ms: entry.expires_at_ms,
            })
            .map_err(persistence)
    }

    fn remove(&self, key: &str) -> Result<(), ResilienceError> {
        self.warehouse.remove(key).map(|_| ()).map_err(persistence)
    }

    fn clear(&self) -> Result<(), ResilienceError> {
        self.warehouse.clear().map(|_| ()).map_err(persistence)
    }

    fn purge_expired(&self, now_ms: i64) -> Result<usize, ResilienceError> {
        self.warehouse.purge_expired(now_ms).map_err(persistence)
    }
}

fn persistence(error: WarehouseError) -> ResilienceError {
    ResilienceError::Persistence(error.to_string())
}

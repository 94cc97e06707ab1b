//! # QAHT Warehouse
//!
//! DuckDB-backed durable tier for the QAHT response cache.
//!
//! Cache entries survive process restarts here, so a freshly started screener
//! can serve recent responses, and stale ones when every upstream is failing,
//! without calling the network first.
//!
//! ## Tables
//!
//! | Table | Description |
//! |-------|-------------|
//! | `response_cache` | One row per cache key: JSON value plus cached/expiry unix-millisecond timestamps |
//! | `schema_migrations` | Applied migration versions |
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use qaht_warehouse::{CacheRecord, CacheWarehouse};
//!
//! let warehouse = CacheWarehouse::open_default()?;
//! warehouse.put(&CacheRecord {
//!     cache_key: String::from("yahoo.quote:abc"),
//!     value_json: String::from("{\"price\":150.0}"),
//!     cached_at_ms: 1_700_000_000_000,
//!     expires_at_ms: 1_700_003_600_000,
//! })?;
//! # Ok::<(), qaht_warehouse::WarehouseError>(())
//! ```

pub mod duckdb;
pub mod migrations;

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use ::duckdb::{Connection, ToSql};
use serde::Serialize;
use thiserror::Error;

pub use duckdb::{DuckDbConnectionManager, PooledConnection};

#[derive(Debug, Error)]
pub enum WarehouseError {
    #[error(transparent)]
    DuckDb(#[from] ::duckdb::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("invalid data: {0}")]
    InvalidData(String),
}

#[derive(Debug, Clone)]
pub struct WarehouseConfig {
    /// Root directory for qaht data.
    pub qaht_home: PathBuf,
    pub db_path: PathBuf,
    pub max_pool_size: usize,
}

impl Default for WarehouseConfig {
    fn default() -> Self {
        Self::in_home(resolve_qaht_home())
    }
}

impl WarehouseConfig {
    /// Database at `<home>/cache/responses.duckdb`.
    pub fn in_home(qaht_home: PathBuf) -> Self {
        let db_path = qaht_home.join("cache").join("responses.duckdb");
        Self {
            qaht_home,
            db_path,
            max_pool_size: 4,
        }
    }

    /// Database at an explicit path.
    pub fn at_path(db_path: impl Into<PathBuf>) -> Self {
        Self {
            qaht_home: resolve_qaht_home(),
            db_path: db_path.into(),
            max_pool_size: 4,
        }
    }
}

/// One persisted cache entry. Timestamps are unix milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CacheRecord {
    pub cache_key: String,
    pub value_json: String,
    pub cached_at_ms: i64,
    pub expires_at_ms: i64,
}

impl CacheRecord {
    pub const fn is_live(&self, now_ms: i64) -> bool {
        now_ms < self.expires_at_ms
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CacheTableStats {
    pub entries: u64,
    pub live: u64,
    pub expired: u64,
    pub oldest_cached_at_ms: Option<i64>,
    pub newest_cached_at_ms: Option<i64>,
}

/// Durable response cache store.
#[derive(Clone)]
pub struct CacheWarehouse {
    config: WarehouseConfig,
    manager: DuckDbConnectionManager,
}

impl std::fmt::Debug for CacheWarehouse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheWarehouse")
            .field("db_path", &self.config.db_path)
            .field("max_pool_size", &self.config.max_pool_size)
            .finish()
    }
}

impl CacheWarehouse {
    pub fn open_default() -> Result<Self, WarehouseError> {
        Self::open(WarehouseConfig::default())
    }

    pub fn open(config: WarehouseConfig) -> Result<Self, WarehouseError> {
        if let Some(parent) = config.db_path.parent() {
            fs::create_dir_all(parent)?;
        }

        let manager = DuckDbConnectionManager::open(config.db_path.clone(), config.max_pool_size)?;
        let warehouse = Self { config, manager };
        warehouse.initialize()?;
        Ok(warehouse)
    }

    pub fn initialize(&self) -> Result<(), WarehouseError> {
        let connection = self.manager.acquire()?;
        migrations::apply_migrations(&connection)
    }

    pub fn db_path(&self) -> &Path {
        self.manager.db_path()
    }

    pub fn config(&self) -> &WarehouseConfig {
        &self.config
    }

    /// Inserts or replaces the entry for `record.cache_key`.
    pub fn put(&self, record: &CacheRecord) -> Result<(), WarehouseError> {
        if record.cache_key.is_empty() {
            return Err(WarehouseError::InvalidData(String::from(
                "cache key must not be empty",
            )));
        }
        if record.expires_at_ms < record.cached_at_ms {
            return Err(WarehouseError::InvalidData(format!(
                "entry '{}' expires before it was cached",
                record.cache_key
            )));
        }

        let connection = self.manager.acquire()?;
        let params: [&dyn ToSql; 4] = [
            &record.cache_key,
            &record.value_json,
            &record.cached_at_ms,
            &record.expires_at_ms,
        ];
        connection.execute(
            "INSERT OR REPLACE INTO response_cache \
             (cache_key, value_json, cached_at_ms, expires_at_ms) \
             VALUES (?, ?, ?, ?)",
            params.as_slice(),
        )?;
        Ok(())
    }

    /// Entry for `cache_key` regardless of expiry.
    pub fn get(&self, cache_key: &str) -> Result<Option<CacheRecord>, WarehouseError> {
        let connection = self.manager.acquire()?;
        let mut statement = connection.prepare(
            "SELECT cache_key, value_json, cached_at_ms, expires_at_ms \
             FROM response_cache WHERE cache_key = ?",
        )?;
        let params: [&dyn ToSql; 1] = [&cache_key];
        let mut rows = statement.query(params.as_slice())?;
        let Some(row) = rows.next()? else {
            return Ok(None);
        };

        Ok(Some(CacheRecord {
            cache_key: row.get(0)?,
            value_json: row.get(1)?,
            cached_at_ms: row.get(2)?,
            expires_at_ms: row.get(3)?,
        }))
    }

    /// Returns whether an entry was removed.
    pub fn remove(&self, cache_key: &str) -> Result<bool, WarehouseError> {
        let connection = self.manager.acquire()?;
        let params: [&dyn ToSql; 1] = [&cache_key];
        let removed = connection.execute(
            "DELETE FROM response_cache WHERE cache_key = ?",
            params.as_slice(),
        )?;
        Ok(removed > 0)
    }

    /// Removes every key starting with `prefix`, e.g. all entries of one
    /// operation.
    pub fn remove_prefix(&self, prefix: &str) -> Result<usize, WarehouseError> {
        let connection = self.manager.acquire()?;
        let params: [&dyn ToSql; 1] = [&prefix];
        let removed = connection.execute(
            "DELETE FROM response_cache WHERE starts_with(cache_key, ?)",
            params.as_slice(),
        )?;
        Ok(removed)
    }

    pub fn clear(&self) -> Result<usize, WarehouseError> {
        let connection = self.manager.acquire()?;
        connection.execute_batch("BEGIN TRANSACTION")?;
        let result = (|| -> Result<usize, WarehouseError> {
            let removed = connection.execute("DELETE FROM response_cache", [])?;
            Ok(removed)
        })();
        finalize_transaction(&connection, result)
    }

    /// Deletes entries whose expiry is at or before `now_ms`.
    pub fn purge_expired(&self, now_ms: i64) -> Result<usize, WarehouseError> {
        let connection = self.manager.acquire()?;
        let params: [&dyn ToSql; 1] = [&now_ms];
        let removed = connection.execute(
            "DELETE FROM response_cache WHERE expires_at_ms <= ?",
            params.as_slice(),
        )?;
        Ok(removed)
    }

    pub fn stats(&self, now_ms: i64) -> Result<CacheTableStats, WarehouseError> {
        let connection = self.manager.acquire()?;
        let params: [&dyn ToSql; 1] = [&now_ms];
        let (entries, live, oldest, newest) = connection.query_row(
            "SELECT COUNT(*), \
                    COUNT(*) FILTER (WHERE expires_at_ms > ?), \
                    MIN(cached_at_ms), \
                    MAX(cached_at_ms) \
             FROM response_cache",
            params.as_slice(),
            |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, Option<i64>>(2)?,
                    row.get::<_, Option<i64>>(3)?,
                ))
            },
        )?;

        let entries = u64::try_from(entries)
            .map_err(|_| WarehouseError::InvalidData(format!("negative row count {entries}")))?;
        let live = u64::try_from(live)
            .map_err(|_| WarehouseError::InvalidData(format!("negative row count {live}")))?;
        Ok(CacheTableStats {
            entries,
            live,
            expired: entries.saturating_sub(live),
            oldest_cached_at_ms: oldest,
            newest_cached_at_ms: newest,
        })
    }
}

pub(crate) fn finalize_transaction<T>(
    connection: &Connection,
    result: Result<T, WarehouseError>,
) -> Result<T, WarehouseError> {
    match result {
        Ok(value) => {
            connection.execute_batch("COMMIT")?;
            Ok(value)
        }
        Err(error) => {
            let _ = connection.execute_batch("ROLLBACK");
            Err(error)
        }
    }
}

fn resolve_qaht_home() -> PathBuf {
    if let Some(path) = env::var_os("QAHT_HOME") {
        let path = PathBuf::from(path);
        if !path.as_os_str().is_empty() {
            return path;
        }
    }

    if let Some(home) = env::var_os("HOME") {
        return PathBuf::from(home).join(".qaht");
    }

    PathBuf::from(".qaht")
}

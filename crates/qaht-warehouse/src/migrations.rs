use ::duckdb::{Connection, ToSql};

use crate::{finalize_transaction, WarehouseError};

struct Migration {
    version: &'static str,
    sql: &'static str,
}

const MIGRATIONS: &[Migration] = &[
    Migration {
        version: "0001_response_cache",
        sql: r#"
CREATE TABLE IF NOT EXISTS response_cache (
    cache_key VARCHAR PRIMARY KEY,
    value_json VARCHAR NOT NULL,
    cached_at_ms BIGINT NOT NULL,
    expires_at_ms BIGINT NOT NULL
);
"#,
    },
    Migration {
        version: "0002_response_cache_expiry_index",
        sql: r#"
CREATE INDEX IF NOT EXISTS idx_response_cache_expires_at ON response_cache(expires_at_ms);
"#,
    },
];

pub fn apply_migrations(connection: &Connection) -> Result<(), WarehouseError> {
    connection.execute_batch(
        r#"
CREATE TABLE IF NOT EXISTS schema_migrations (
    version VARCHAR PRIMARY KEY,
    applied_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
);
"#,
    )?;

    for migration in MIGRATIONS {
        let params: [&dyn ToSql; 1] = [&migration.version];
        let applied_count: i64 = connection.query_row(
            "SELECT COUNT(*) FROM schema_migrations WHERE version = ?",
            params.as_slice(),
            |row| row.get(0),
        )?;
        if applied_count > 0 {
            continue;
        }

        connection.execute_batch("BEGIN TRANSACTION")?;
        let result = (|| -> Result<(), WarehouseError> {
            connection.execute_batch(migration.sql)?;
            connection.execute(
                "INSERT INTO schema_migrations (version) VALUES (?)",
                params.as_slice(),
            )?;
            Ok(())
        })();
        finalize_transaction(connection, result)?;
    }

    Ok(())
}

pub fn applied_versions(connection: &Connection) -> Result<Vec<String>, WarehouseError> {
    let mut statement =
        connection.prepare("SELECT version FROM schema_migrations ORDER BY version")?;
    let versions = statement
        .query_map([], |row| row.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(versions)
}

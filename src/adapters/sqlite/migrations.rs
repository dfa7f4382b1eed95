//! Embedded schema migrations.
//!
//! The schema ships inside the binary as ordered SQL scripts and is brought
//! up to date at startup. Applied versions are tracked in a `schema_version`
//! table so reruns are no-ops.

use sqlx::SqlitePool;
use thiserror::Error;

/// Ordered (version, script) pairs. Append-only: released versions are never
/// edited, schema changes get a new entry.
const MIGRATIONS: &[(i64, &str)] = &[(
    1,
    include_str!("../../../migrations/001_initial_schema.sql"),
)];

#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("schema migration {version} failed: {source}")]
    Apply {
        version: i64,
        #[source]
        source: sqlx::Error,
    },
    #[error("could not read schema version: {0}")]
    Version(#[source] sqlx::Error),
}

/// Apply every migration newer than the stored schema version. Returns how
/// many were applied.
pub async fn apply_pending(pool: &SqlitePool) -> Result<usize, SchemaError> {
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
    )
    .execute(pool)
    .await
    .map_err(|e| SchemaError::Apply { version: 0, source: e })?;

    let current = schema_version(pool).await?;
    let mut applied = 0;

    for &(version, sql) in MIGRATIONS {
        if version <= current {
            continue;
        }
        sqlx::raw_sql(sql)
            .execute(pool)
            .await
            .map_err(|e| SchemaError::Apply { version, source: e })?;
        sqlx::query("INSERT INTO schema_version (version) VALUES (?)")
            .bind(version)
            .execute(pool)
            .await
            .map_err(|e| SchemaError::Apply { version, source: e })?;
        applied += 1;
    }

    Ok(applied)
}

/// Highest applied migration version; 0 on a fresh database.
pub async fn schema_version(pool: &SqlitePool) -> Result<i64, SchemaError> {
    let row: Option<(i64,)> = sqlx::query_as("SELECT COALESCE(MAX(version), 0) FROM schema_version")
        .fetch_optional(pool)
        .await
        .map_err(SchemaError::Version)?;
    Ok(row.map(|(v,)| v).unwrap_or(0))
}

//! SQLite pool setup for the persistence gateway.
//!
//! The gateway's access pattern is many short read-modify-write rounds on
//! single task rows plus append-only interaction writes, issued concurrently
//! by the executor loops. WAL keeps readers from stalling behind writers and
//! a generous busy timeout absorbs write contention inside SQLite, so the
//! version check in `mutate` stays the only conflict surface the engine sees.

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::SqlitePool;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// A handful of connections covers the loops; writes serialize inside SQLite
/// anyway.
const MAX_CONNECTIONS: u32 = 5;
const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(3);
const BUSY_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum StoreOpenError {
    #[error("unusable database URL '{0}'")]
    UnusableUrl(String),
    #[error("could not prepare database directory: {0}")]
    PrepareDirectory(#[source] std::io::Error),
    #[error("could not open task database: {0}")]
    Open(#[source] sqlx::Error),
}

/// Open the task database, creating the file and its parent directory on
/// first use.
pub async fn open_pool(database_url: &str) -> Result<SqlitePool, StoreOpenError> {
    prepare_directory(database_url)?;

    let options = SqliteConnectOptions::from_str(database_url)
        .map_err(|_| StoreOpenError::UnusableUrl(database_url.to_string()))?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal)
        // Interactions hang off tasks with ON DELETE CASCADE.
        .foreign_keys(true)
        .busy_timeout(BUSY_TIMEOUT);

    SqlitePoolOptions::new()
        .max_connections(MAX_CONNECTIONS)
        .acquire_timeout(ACQUIRE_TIMEOUT)
        .connect_with(options)
        .await
        .map_err(StoreOpenError::Open)
}

/// In-memory database for tests. Held to a single connection: an in-memory
/// SQLite database lives and dies with its connection, and one writer makes
/// the optimistic-version behavior in tests deterministic.
pub async fn open_memory_pool() -> Result<SqlitePool, StoreOpenError> {
    let options = SqliteConnectOptions::from_str("sqlite::memory:")
        .map_err(|_| StoreOpenError::UnusableUrl("sqlite::memory:".to_string()))?
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal)
        .foreign_keys(true)
        .shared_cache(true);

    SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(options)
        .await
        .map_err(StoreOpenError::Open)
}

fn prepare_directory(database_url: &str) -> Result<(), StoreOpenError> {
    let path = database_url
        .strip_prefix("sqlite://")
        .or_else(|| database_url.strip_prefix("sqlite:"))
        .unwrap_or(database_url);

    if path == ":memory:" || path.is_empty() {
        return Ok(());
    }

    if let Some(parent) = Path::new(path).parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            std::fs::create_dir_all(parent).map_err(StoreOpenError::PrepareDirectory)?;
        }
    }
    Ok(())
}

pub mod schema;
pub mod sync;

use std::str::FromStr;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use tidemark_common::error::{TidemarkError, TidemarkResult};

// The SQLite default cache is only 2000 KiB.
const CACHE_SIZE_KB: i64 = 60_000;

/// Open (creating if missing) the SQLite database at `path` and return a pool.
pub async fn create_pool(path: &str) -> TidemarkResult<SqlitePool> {
    tracing::info!(path, "opening database");
    let options = SqliteConnectOptions::from_str(path)
        .map_err(|e| TidemarkError::Database(e.to_string()))?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .pragma("cache_size", format!("-{CACHE_SIZE_KB}"));

    SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await
        .map_err(|e| TidemarkError::Database(e.to_string()))
}

/// In-memory database, one connection so every query sees the same store.
/// Intended for tests.
pub async fn create_memory_pool() -> TidemarkResult<SqlitePool> {
    SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .map_err(|e| TidemarkError::Database(e.to_string()))
}

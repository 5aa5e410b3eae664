//! Split-role SQLite pools for the run store.
//!
//! Checkpoint commits go through a single writer connection, so SQLite
//! never sees two concurrent writers; `list` and `dashboard` queries
//! share a small reader pool. WAL keeps readers off the writer's lock.

use std::path::Path;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};

/// Concurrent reader connections for listing queries.
const READER_CONNECTIONS: u32 = 8;

/// How long a connection waits on a locked database before erroring.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Reader/writer pool pair over one database file.
#[derive(Clone)]
pub struct DatabasePool {
    pub reader: SqlitePool,
    pub writer: SqlitePool,
}

impl DatabasePool {
    /// Open the database at `path`, creating it if missing, and run any
    /// pending migrations on the writer before the readers connect.
    pub async fn open(path: &Path) -> Result<Self, sqlx::Error> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true)
            .busy_timeout(BUSY_TIMEOUT);

        let writer = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options.clone())
            .await?;

        sqlx::migrate!("../../migrations").run(&writer).await?;

        let reader = SqlitePoolOptions::new()
            .max_connections(READER_CONNECTIONS)
            .connect_with(options.read_only(true))
            .await?;

        Ok(Self { reader, writer })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn open_temp() -> (tempfile::TempDir, DatabasePool) {
        let dir = tempfile::tempdir().unwrap();
        let pool = DatabasePool::open(&dir.path().join("runs.db"))
            .await
            .unwrap();
        (dir, pool)
    }

    #[tokio::test]
    async fn test_open_applies_migrations() {
        let (_dir, pool) = open_temp().await;

        let tables: Vec<(String,)> = sqlx::query_as(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%'",
        )
        .fetch_all(&pool.reader)
        .await
        .unwrap();

        for expected in ["workflow_definitions", "workflow_runs", "attempt_log"] {
            assert!(
                tables.iter().any(|(name,)| name == expected),
                "{expected} table missing"
            );
        }
    }

    #[tokio::test]
    async fn test_open_sets_wal_and_foreign_keys() {
        let (_dir, pool) = open_temp().await;

        let (journal_mode,): (String,) = sqlx::query_as("PRAGMA journal_mode")
            .fetch_one(&pool.writer)
            .await
            .unwrap();
        assert_eq!(journal_mode.to_lowercase(), "wal");

        let (foreign_keys,): (i32,) = sqlx::query_as("PRAGMA foreign_keys")
            .fetch_one(&pool.writer)
            .await
            .unwrap();
        assert_eq!(foreign_keys, 1);
    }

    #[tokio::test]
    async fn test_reader_pool_rejects_writes() {
        let (_dir, pool) = open_temp().await;

        let result = sqlx::query(
            "INSERT INTO workflow_definitions (id, name, definition, created_at, updated_at) \
             VALUES ('d', 'n', '{}', '2026-01-01T00:00:00Z', '2026-01-01T00:00:00Z')",
        )
        .execute(&pool.reader)
        .await;
        assert!(result.is_err());
    }
}

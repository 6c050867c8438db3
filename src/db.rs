//! Database connection and schema management.
//!
//! This module provides SQLite database connectivity with:
//! - Connection pool management
//! - WAL mode so observers can read while a transfer writes progress
//! - Automatic migration execution
//!
//! # Example
//!
//! ```no_run
//! use resumable_dl::Database;
//! use std::path::Path;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let db = Database::new(Path::new("downloads.db")).await?;
//! // Hand db to a RecordStore...
//! # Ok(())
//! # }
//! ```

use std::path::Path;
use std::time::Duration;

use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous,
};
use thiserror::Error;
use tracing::{debug, instrument};

/// Pool size for file databases. Writers serialize on the file lock anyway;
/// the extra connections serve observers reading snapshots.
const FILE_POOL_SIZE: u32 = 5;

/// How long a connection waits on a locked database before `SQLITE_BUSY`.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Database-related errors.
#[derive(Error, Debug)]
pub enum DbError {
    /// Opening the file or a pooled connection failed.
    #[error("failed to open download database: {0}")]
    Connection(#[from] sqlx::Error),

    /// Schema migration failed.
    #[error("failed to migrate download database: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
}

/// Pooled handle to the downloads database. Cheap to clone.
#[derive(Debug, Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Opens (or creates) the database file at `db_path` and brings the
    /// schema up to date.
    ///
    /// Every pooled connection runs in WAL mode with a busy timeout, so
    /// progress writes from transfers never block list queries.
    ///
    /// # Errors
    ///
    /// Returns `DbError::Connection` if the file cannot be opened,
    /// or `DbError::Migration` if migrations fail.
    #[instrument(skip(db_path), fields(path = %db_path.display()))]
    pub async fn new(db_path: &Path) -> Result<Self, DbError> {
        let options = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(BUSY_TIMEOUT);

        let pool = SqlitePoolOptions::new()
            .max_connections(FILE_POOL_SIZE)
            .connect_with(options)
            .await?;

        Self::migrated(pool).await
    }

    /// Creates a private in-memory database, used by tests.
    ///
    /// The pool is pinned to one connection that is never reaped, since a
    /// fresh in-memory connection would see an empty database.
    ///
    /// # Errors
    ///
    /// Returns `DbError::Connection` if the connection fails,
    /// or `DbError::Migration` if migrations fail.
    #[instrument]
    pub async fn new_in_memory() -> Result<Self, DbError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(SqliteConnectOptions::new().in_memory(true))
            .await?;

        Self::migrated(pool).await
    }

    async fn migrated(pool: SqlitePool) -> Result<Self, DbError> {
        sqlx::migrate!("./migrations").run(&pool).await?;
        debug!("download schema up to date");
        Ok(Self { pool })
    }

    /// Returns a reference to the underlying connection pool.
    #[must_use]
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Reports whether the database runs in WAL journal mode.
    ///
    /// # Errors
    ///
    /// Returns `DbError::Connection` if the query fails.
    #[instrument(skip(self))]
    pub async fn is_wal_enabled(&self) -> Result<bool, DbError> {
        let (mode,): (String,) = sqlx::query_as("PRAGMA journal_mode")
            .fetch_one(&self.pool)
            .await?;

        Ok(mode.eq_ignore_ascii_case("wal"))
    }

    /// Closes all pooled connections, checkpointing the WAL.
    #[instrument(skip(self))]
    pub async fn close(self) {
        self.pool.close().await;
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_database_new_in_memory_succeeds() {
        let db = Database::new_in_memory().await;
        assert!(db.is_ok(), "Failed to create in-memory database");
    }

    #[tokio::test]
    async fn test_database_downloads_table_exists() {
        let db = Database::new_in_memory().await.unwrap();

        let result = sqlx::query(
            "INSERT INTO downloads (id, url, file_path, file_name, queue_time, modified_time)
             VALUES (1, 'https://example.com/a.bin', '/tmp', 'a.bin', 0, 0)",
        )
        .execute(db.pool())
        .await;

        assert!(result.is_ok(), "downloads table should exist after migration");
    }

    #[tokio::test]
    async fn test_database_rejects_unknown_status() {
        let db = Database::new_in_memory().await.unwrap();

        let result = sqlx::query(
            "INSERT INTO downloads (id, url, file_path, file_name, status, queue_time, modified_time)
             VALUES (1, 'https://example.com/a.bin', '/tmp', 'a.bin', 'exploded', 0, 0)",
        )
        .execute(db.pool())
        .await;

        assert!(
            result.is_err(),
            "Invalid status should be rejected by CHECK constraint"
        );
    }

    #[tokio::test]
    async fn test_database_with_tempfile_enables_wal() {
        let temp_dir = tempfile::tempdir().unwrap();
        let db_path = temp_dir.path().join("test.db");

        let db = Database::new(&db_path).await.unwrap();
        assert!(db.is_wal_enabled().await.unwrap());
    }

    #[tokio::test]
    async fn test_database_reopen_keeps_rows() {
        let temp_dir = tempfile::tempdir().unwrap();
        let db_path = temp_dir.path().join("reopen.db");

        let db = Database::new(&db_path).await.unwrap();
        sqlx::query(
            "INSERT INTO downloads (id, url, file_path, file_name, queue_time, modified_time)
             VALUES (7, 'https://example.com/a.bin', '/tmp', 'a.bin', 0, 0)",
        )
        .execute(db.pool())
        .await
        .unwrap();
        db.close().await;

        let db = Database::new(&db_path).await.unwrap();
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM downloads")
            .fetch_one(db.pool())
            .await
            .unwrap();
        assert_eq!(count, 1);
    }
}

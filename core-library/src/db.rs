//! # Database
//!
//! SQLite pool shared by the library repositories and the sync engine.
//! Every pool runs the embedded migrations before it is handed out.
//!
//! ```rust,ignore
//! use core_library::db::{create_pool, DatabaseConfig};
//!
//! let pool = create_pool(DatabaseConfig::new("library.db")).await?;
//! let songs = SqliteSongRepository::new(pool.clone()).list_active().await?;
//! ```

use crate::{LibraryError, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Pool, Sqlite};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    /// `sqlite:` URL of the database file, or `sqlite::memory:`
    pub database_url: String,
    pub max_connections: u32,
    pub acquire_timeout: Duration,
    /// How long a writer waits on a locked database before failing
    pub busy_timeout: Duration,
}

impl DatabaseConfig {
    pub fn new(database_path: impl Into<PathBuf>) -> Self {
        Self {
            database_url: format!("sqlite:{}", database_path.into().display()),
            max_connections: 5,
            acquire_timeout: Duration::from_secs(30),
            busy_timeout: Duration::from_secs(5),
        }
    }

    pub fn in_memory() -> Self {
        Self {
            database_url: "sqlite::memory:".to_string(),
            ..Self::new("")
        }
    }

    pub fn max_connections(mut self, max: u32) -> Self {
        self.max_connections = max;
        self
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self::in_memory()
    }
}

/// Open the pool and bring the schema up to date
pub async fn create_pool(config: DatabaseConfig) -> Result<Pool<Sqlite>> {
    info!(
        database_url = %config.database_url,
        max_connections = config.max_connections,
        "Opening library database"
    );

    let options = SqliteConnectOptions::from_str(&config.database_url)
        .map_err(LibraryError::Database)?
        .journal_mode(SqliteJournalMode::Wal)
        .foreign_keys(true)
        .create_if_missing(true)
        .busy_timeout(config.busy_timeout);

    let pool = SqlitePoolOptions::new()
        .max_connections(config.max_connections.max(1))
        .acquire_timeout(config.acquire_timeout)
        .connect_with(options)
        .await
        .map_err(|e| {
            warn!(error = %e, "Failed to open library database");
            LibraryError::Database(e)
        })?;

    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .map_err(|e| {
            warn!(error = %e, "Migration failed");
            LibraryError::Migration(e.to_string())
        })?;

    debug!("Library schema up to date");
    Ok(pool)
}

/// In-memory pool for tests
///
/// Capped at one connection: each connection to `sqlite::memory:` would
/// otherwise see its own empty database.
pub async fn create_test_pool() -> Result<Pool<Sqlite>> {
    create_pool(DatabaseConfig::in_memory().max_connections(1)).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_config_url() {
        let config = DatabaseConfig::new("/tmp/setlists/library.db").max_connections(2);
        assert_eq!(config.database_url, "sqlite:/tmp/setlists/library.db");
        assert_eq!(config.max_connections, 2);
        assert_eq!(DatabaseConfig::default().database_url, "sqlite::memory:");
    }

    #[tokio::test]
    async fn test_foreign_keys_enabled() {
        let pool = create_test_pool().await.unwrap();

        let (enabled,): (i32,) = sqlx::query_as("PRAGMA foreign_keys")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(enabled, 1);
    }

    #[tokio::test]
    async fn test_migrations_create_tables() {
        let pool = create_test_pool().await.unwrap();

        for table in [
            "songs",
            "setlists",
            "setlist_entries",
            "song_usage",
            "editing_sessions",
            "edit_activity",
            "pending_changes",
            "edit_locks",
            "conflict_detections",
            "delta_sync_records",
            "delta_baselines",
            "backups",
            "integrity_results",
            "integrity_history",
            "data_loss_events",
            "predicted_song_usage",
            "sync_statistics",
            "sync_health_scores",
            "sync_settings",
        ] {
            let (count,): (i32,) =
                sqlx::query_as("SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?")
                    .bind(table)
                    .fetch_one(&pool)
                    .await
                    .unwrap();
            assert_eq!(count, 1, "{} table missing", table);
        }
    }

    #[tokio::test]
    async fn test_single_active_lock_index() {
        let pool = create_test_pool().await.unwrap();

        let insert = "INSERT INTO edit_locks (id, record_id, record_type, device_id, acquired_at, expires_at, is_active) \
                      VALUES (?, 'song-1', 'song', ?, 0, 300, 1)";

        sqlx::query(insert)
            .bind("lock-1")
            .bind("device-a")
            .execute(&pool)
            .await
            .unwrap();
        let second = sqlx::query(insert)
            .bind("lock-2")
            .bind("device-b")
            .execute(&pool)
            .await;

        assert!(second.is_err(), "second active lock on one record");
    }

    #[tokio::test]
    async fn test_single_open_change_index() {
        let pool = create_test_pool().await.unwrap();

        let insert = "INSERT INTO pending_changes (id, record_id, record_type, status, queued_at) \
                      VALUES (?, 'song-1', 'song', ?, 0)";

        sqlx::query(insert).bind("c-1").bind("synced").execute(&pool).await.unwrap();
        sqlx::query(insert).bind("c-2").bind("pending").execute(&pool).await.unwrap();
        let second_open = sqlx::query(insert).bind("c-3").bind("failed").execute(&pool).await;

        assert!(second_open.is_err(), "second open change on one record");
    }
}

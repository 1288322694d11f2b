//! Persisted sync settings (key/value)

use crate::{Result, SyncError};
use async_trait::async_trait;
use sqlx::SqlitePool;

/// Key of the flag that suspends or resumes syncing
pub const SYNC_ENABLED_KEY: &str = "sync_enabled";

#[async_trait]
pub trait SyncSettingsRepository: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;

    async fn set(&self, key: &str, value: &str) -> Result<()>;

    /// Sync is enabled unless explicitly switched off
    async fn is_sync_enabled(&self) -> Result<bool> {
        Ok(self
            .get(SYNC_ENABLED_KEY)
            .await?
            .map(|v| v != "false")
            .unwrap_or(true))
    }

    async fn set_sync_enabled(&self, enabled: bool) -> Result<()> {
        self.set(SYNC_ENABLED_KEY, if enabled { "true" } else { "false" })
            .await
    }
}

pub struct SqliteSyncSettingsRepository {
    pool: SqlitePool,
}

impl SqliteSyncSettingsRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SyncSettingsRepository for SqliteSyncSettingsRepository {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let value: Option<(String,)> = sqlx::query_as("SELECT value FROM sync_settings WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| SyncError::Database(e.to_string()))?;

        Ok(value.map(|(v,)| v))
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO sync_settings (key, value) VALUES (?, ?)
            ON CONFLICT(key) DO UPDATE SET value = excluded.value
            "#,
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await
        .map_err(|e| SyncError::Database(e.to_string()))?;

        Ok(())
    }
}

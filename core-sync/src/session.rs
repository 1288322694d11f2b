//! # Editing Sessions and Edit Activity
//!
//! An editing session spans the time a device has a record open in an
//! editor. Every save inside a session appends an [`EditActivity`] row; the
//! conflict engine reads those rows to spot several devices editing the same
//! record, and the timing check reads `last_edit_at` to hold a sync back
//! while the user is still typing.

use crate::{Result, SyncError};
use async_trait::async_trait;
use core_library::RecordType;
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool};
use uuid::Uuid;

// ============================================================================
// Types
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EditingSession {
    pub id: String,
    pub record_id: String,
    pub record_type: RecordType,
    pub device_id: String,
    pub user_id: String,
    pub started_at: i64,
    pub ended_at: Option<i64>,
    pub last_edit_at: Option<i64>,
    pub edit_count: i64,
    pub is_active: bool,
}

impl EditingSession {
    pub fn new(
        record_id: impl Into<String>,
        record_type: RecordType,
        device_id: impl Into<String>,
        user_id: impl Into<String>,
        now: i64,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            record_id: record_id.into(),
            record_type,
            device_id: device_id.into(),
            user_id: user_id.into(),
            started_at: now,
            ended_at: None,
            last_edit_at: None,
            edit_count: 0,
            is_active: true,
        }
    }

    /// Time of the last edit, or the session start if nothing was edited yet
    pub fn last_activity_at(&self) -> i64 {
        self.last_edit_at.unwrap_or(self.started_at)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EditActivity {
    pub id: String,
    pub record_id: String,
    pub record_type: RecordType,
    pub device_id: String,
    pub session_id: Option<String>,
    pub edited_at: i64,
}

impl EditActivity {
    pub fn new(
        record_id: impl Into<String>,
        record_type: RecordType,
        device_id: impl Into<String>,
        session_id: Option<String>,
        edited_at: i64,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            record_id: record_id.into(),
            record_type,
            device_id: device_id.into(),
            session_id,
            edited_at,
        }
    }
}

// ============================================================================
// Rows
// ============================================================================

#[derive(FromRow)]
struct EditingSessionRow {
    id: String,
    record_id: String,
    record_type: String,
    device_id: String,
    user_id: String,
    started_at: i64,
    ended_at: Option<i64>,
    last_edit_at: Option<i64>,
    edit_count: i64,
    is_active: bool,
}

impl TryFrom<EditingSessionRow> for EditingSession {
    type Error = SyncError;

    fn try_from(row: EditingSessionRow) -> Result<Self> {
        Ok(Self {
            id: row.id,
            record_id: row.record_id,
            record_type: row.record_type.parse()?,
            device_id: row.device_id,
            user_id: row.user_id,
            started_at: row.started_at,
            ended_at: row.ended_at,
            last_edit_at: row.last_edit_at,
            edit_count: row.edit_count,
            is_active: row.is_active,
        })
    }
}

#[derive(FromRow)]
struct EditActivityRow {
    id: String,
    record_id: String,
    record_type: String,
    device_id: String,
    session_id: Option<String>,
    edited_at: i64,
}

impl TryFrom<EditActivityRow> for EditActivity {
    type Error = SyncError;

    fn try_from(row: EditActivityRow) -> Result<Self> {
        Ok(Self {
            id: row.id,
            record_id: row.record_id,
            record_type: row.record_type.parse()?,
            device_id: row.device_id,
            session_id: row.session_id,
            edited_at: row.edited_at,
        })
    }
}

// ============================================================================
// Editing Session Repository
// ============================================================================

#[async_trait]
pub trait EditingSessionRepository: Send + Sync {
    async fn insert(&self, session: &EditingSession) -> Result<()>;

    async fn find_by_id(&self, id: &str) -> Result<Option<EditingSession>>;

    async fn active_sessions(&self) -> Result<Vec<EditingSession>>;

    /// End an active session; returns false if it was not active
    async fn end(&self, id: &str, now: i64) -> Result<bool>;

    /// Bump `edit_count` and `last_edit_at` of an active session
    async fn touch(&self, id: &str, now: i64) -> Result<bool>;

    /// Latest `last_edit_at` across active sessions
    async fn latest_active_edit(&self) -> Result<Option<i64>>;

    /// End active sessions whose last activity is before `cutoff`
    async fn close_idle(&self, cutoff: i64, now: i64) -> Result<u64>;

    async fn has_active(&self) -> Result<bool>;
}

pub struct SqliteEditingSessionRepository {
    pool: SqlitePool,
}

impl SqliteEditingSessionRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl EditingSessionRepository for SqliteEditingSessionRepository {
    async fn insert(&self, session: &EditingSession) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO editing_sessions (
                id, record_id, record_type, device_id, user_id,
                started_at, ended_at, last_edit_at, edit_count, is_active
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&session.id)
        .bind(&session.record_id)
        .bind(session.record_type.as_str())
        .bind(&session.device_id)
        .bind(&session.user_id)
        .bind(session.started_at)
        .bind(session.ended_at)
        .bind(session.last_edit_at)
        .bind(session.edit_count)
        .bind(session.is_active)
        .execute(&self.pool)
        .await
        .map_err(|e| SyncError::Database(e.to_string()))?;

        Ok(())
    }

    async fn find_by_id(&self, id: &str) -> Result<Option<EditingSession>> {
        let row = sqlx::query_as::<_, EditingSessionRow>(
            "SELECT * FROM editing_sessions WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| SyncError::Database(e.to_string()))?;

        row.map(EditingSession::try_from).transpose()
    }

    async fn active_sessions(&self) -> Result<Vec<EditingSession>> {
        let rows = sqlx::query_as::<_, EditingSessionRow>(
            "SELECT * FROM editing_sessions WHERE is_active = 1 ORDER BY started_at, id",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| SyncError::Database(e.to_string()))?;

        rows.into_iter().map(EditingSession::try_from).collect()
    }

    async fn end(&self, id: &str, now: i64) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE editing_sessions SET is_active = 0, ended_at = ? WHERE id = ? AND is_active = 1",
        )
        .bind(now)
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(|e| SyncError::Database(e.to_string()))?;

        Ok(result.rows_affected() > 0)
    }

    async fn touch(&self, id: &str, now: i64) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE editing_sessions
            SET edit_count = edit_count + 1, last_edit_at = ?
            WHERE id = ? AND is_active = 1
            "#,
        )
        .bind(now)
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(|e| SyncError::Database(e.to_string()))?;

        Ok(result.rows_affected() > 0)
    }

    async fn latest_active_edit(&self) -> Result<Option<i64>> {
        let latest: (Option<i64>,) = sqlx::query_as(
            "SELECT MAX(last_edit_at) FROM editing_sessions WHERE is_active = 1",
        )
        .fetch_one(&self.pool)
        .await
        .map_err(|e| SyncError::Database(e.to_string()))?;

        Ok(latest.0)
    }

    async fn close_idle(&self, cutoff: i64, now: i64) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE editing_sessions
            SET is_active = 0, ended_at = ?
            WHERE is_active = 1 AND COALESCE(last_edit_at, started_at) < ?
            "#,
        )
        .bind(now)
        .bind(cutoff)
        .execute(&self.pool)
        .await
        .map_err(|e| SyncError::Database(e.to_string()))?;

        Ok(result.rows_affected())
    }

    async fn has_active(&self) -> Result<bool> {
        let count: (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM editing_sessions WHERE is_active = 1")
                .fetch_one(&self.pool)
                .await
                .map_err(|e| SyncError::Database(e.to_string()))?;

        Ok(count.0 > 0)
    }
}

// ============================================================================
// Edit Activity Repository
// ============================================================================

#[async_trait]
pub trait EditActivityRepository: Send + Sync {
    async fn insert(&self, activity: &EditActivity) -> Result<()>;

    /// Number of distinct devices that edited `record_id` at or after `since`
    async fn distinct_devices_since(&self, record_id: &str, since: i64) -> Result<i64>;

    /// Activity at or after `since`, newest first
    async fn since(&self, since: i64) -> Result<Vec<EditActivity>>;
}

pub struct SqliteEditActivityRepository {
    pool: SqlitePool,
}

impl SqliteEditActivityRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl EditActivityRepository for SqliteEditActivityRepository {
    async fn insert(&self, activity: &EditActivity) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO edit_activity (id, record_id, record_type, device_id, session_id, edited_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&activity.id)
        .bind(&activity.record_id)
        .bind(activity.record_type.as_str())
        .bind(&activity.device_id)
        .bind(&activity.session_id)
        .bind(activity.edited_at)
        .execute(&self.pool)
        .await
        .map_err(|e| SyncError::Database(e.to_string()))?;

        Ok(())
    }

    async fn distinct_devices_since(&self, record_id: &str, since: i64) -> Result<i64> {
        let count: (i64,) = sqlx::query_as(
            "SELECT COUNT(DISTINCT device_id) FROM edit_activity WHERE record_id = ? AND edited_at >= ?",
        )
        .bind(record_id)
        .bind(since)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| SyncError::Database(e.to_string()))?;

        Ok(count.0)
    }

    async fn since(&self, since: i64) -> Result<Vec<EditActivity>> {
        let rows = sqlx::query_as::<_, EditActivityRow>(
            "SELECT * FROM edit_activity WHERE edited_at >= ? ORDER BY edited_at DESC, id",
        )
        .bind(since)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| SyncError::Database(e.to_string()))?;

        rows.into_iter().map(EditActivity::try_from).collect()
    }
}

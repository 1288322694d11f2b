//! # Pending Change Queue
//!
//! Records with local edits waiting for the remote replica. At most one open
//! (pending or failed) change exists per record; re-queuing a record that
//! already has an open change flips it back to `pending` and bumps its
//! `generation`. A sync closes only the generation it pushed, so an edit
//! queued while the remote call is in flight stays open.

use crate::{Result, SyncError};
use async_trait::async_trait;
use core_library::RecordType;
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, QueryBuilder, Sqlite, SqlitePool};
use std::str::FromStr;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeStatus {
    Pending,
    Synced,
    Failed,
}

impl ChangeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeStatus::Pending => "pending",
            ChangeStatus::Synced => "synced",
            ChangeStatus::Failed => "failed",
        }
    }
}

impl FromStr for ChangeStatus {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(ChangeStatus::Pending),
            "synced" => Ok(ChangeStatus::Synced),
            "failed" => Ok(ChangeStatus::Failed),
            _ => Err(SyncError::invalid_value("status", s)),
        }
    }
}

impl std::fmt::Display for ChangeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingChange {
    pub id: String,
    pub record_id: String,
    pub record_type: RecordType,
    pub status: ChangeStatus,
    pub attempts: i64,
    /// Bumped every time the record is re-queued while open
    pub generation: i64,
    pub queued_at: i64,
    pub last_attempt_at: Option<i64>,
    pub last_error: Option<String>,
}

#[derive(FromRow)]
struct PendingChangeRow {
    id: String,
    record_id: String,
    record_type: String,
    status: String,
    attempts: i64,
    generation: i64,
    queued_at: i64,
    last_attempt_at: Option<i64>,
    last_error: Option<String>,
}

impl TryFrom<PendingChangeRow> for PendingChange {
    type Error = SyncError;

    fn try_from(row: PendingChangeRow) -> Result<Self> {
        Ok(Self {
            id: row.id,
            record_id: row.record_id,
            record_type: row.record_type.parse()?,
            status: row.status.parse()?,
            attempts: row.attempts,
            generation: row.generation,
            queued_at: row.queued_at,
            last_attempt_at: row.last_attempt_at,
            last_error: row.last_error,
        })
    }
}

#[async_trait]
pub trait PendingChangeRepository: Send + Sync {
    /// Queue a record for the next sync
    async fn enqueue(&self, record_id: &str, record_type: RecordType, now: i64) -> Result<()>;

    /// The open (pending or failed) change for a record
    async fn find_open(&self, record_id: &str) -> Result<Option<PendingChange>>;

    /// Every open change, oldest first
    async fn list_open(&self) -> Result<Vec<PendingChange>>;

    async fn list_by_status(&self, status: ChangeStatus) -> Result<Vec<PendingChange>>;

    async fn count_by_status(&self, status: ChangeStatus) -> Result<i64>;

    /// Close `changes` as synced, skipping any re-queued since they were read
    async fn mark_synced(&self, changes: &[PendingChange], now: i64) -> Result<u64>;

    /// Mark the open changes of `record_ids` as failed with `error`
    async fn mark_failed(&self, record_ids: &[String], error: &str, now: i64) -> Result<u64>;
}

pub struct SqlitePendingChangeRepository {
    pool: SqlitePool,
}

impl SqlitePendingChangeRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    async fn close_open(
        &self,
        record_ids: &[String],
        status: ChangeStatus,
        error: Option<&str>,
        now: i64,
    ) -> Result<u64> {
        if record_ids.is_empty() {
            return Ok(0);
        }

        let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new("UPDATE pending_changes SET status = ");
        builder
            .push_bind(status.as_str())
            .push(", attempts = attempts + 1, last_attempt_at = ")
            .push_bind(now)
            .push(", last_error = ")
            .push_bind(error.map(str::to_string))
            .push(" WHERE status != 'synced' AND record_id IN (");

        let mut ids = builder.separated(", ");
        for id in record_ids {
            ids.push_bind(id);
        }
        ids.push_unseparated(")");

        let result = builder
            .build()
            .execute(&self.pool)
            .await
            .map_err(|e| SyncError::Database(e.to_string()))?;

        Ok(result.rows_affected())
    }
}

#[async_trait]
impl PendingChangeRepository for SqlitePendingChangeRepository {
    async fn enqueue(&self, record_id: &str, record_type: RecordType, now: i64) -> Result<()> {
        let reopened = sqlx::query(
            r#"
            UPDATE pending_changes SET status = 'pending', generation = generation + 1
            WHERE record_id = ? AND status != 'synced'
            "#,
        )
        .bind(record_id)
        .execute(&self.pool)
        .await
        .map_err(|e| SyncError::Database(e.to_string()))?;

        if reopened.rows_affected() > 0 {
            return Ok(());
        }

        sqlx::query(
            r#"
            INSERT INTO pending_changes (id, record_id, record_type, status, attempts, queued_at)
            VALUES (?, ?, ?, 'pending', 0, ?)
            "#,
        )
        .bind(Uuid::new_v4().to_string())
        .bind(record_id)
        .bind(record_type.as_str())
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| SyncError::Database(e.to_string()))?;

        Ok(())
    }

    async fn find_open(&self, record_id: &str) -> Result<Option<PendingChange>> {
        let row = sqlx::query_as::<_, PendingChangeRow>(
            "SELECT * FROM pending_changes WHERE record_id = ? AND status != 'synced'",
        )
        .bind(record_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| SyncError::Database(e.to_string()))?;

        row.map(PendingChange::try_from).transpose()
    }

    async fn list_open(&self) -> Result<Vec<PendingChange>> {
        let rows = sqlx::query_as::<_, PendingChangeRow>(
            "SELECT * FROM pending_changes WHERE status != 'synced' ORDER BY queued_at, id",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| SyncError::Database(e.to_string()))?;

        rows.into_iter().map(PendingChange::try_from).collect()
    }

    async fn list_by_status(&self, status: ChangeStatus) -> Result<Vec<PendingChange>> {
        let rows = sqlx::query_as::<_, PendingChangeRow>(
            "SELECT * FROM pending_changes WHERE status = ? ORDER BY queued_at, id",
        )
        .bind(status.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| SyncError::Database(e.to_string()))?;

        rows.into_iter().map(PendingChange::try_from).collect()
    }

    async fn count_by_status(&self, status: ChangeStatus) -> Result<i64> {
        let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM pending_changes WHERE status = ?")
            .bind(status.as_str())
            .fetch_one(&self.pool)
            .await
            .map_err(|e| SyncError::Database(e.to_string()))?;

        Ok(count.0)
    }

    async fn mark_synced(&self, changes: &[PendingChange], now: i64) -> Result<u64> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| SyncError::Database(e.to_string()))?;

        let mut closed = 0;
        for change in changes {
            let result = sqlx::query(
                r#"
                UPDATE pending_changes
                SET status = 'synced', attempts = attempts + 1, last_attempt_at = ?, last_error = NULL
                WHERE id = ? AND generation = ? AND status != 'synced'
                "#,
            )
            .bind(now)
            .bind(&change.id)
            .bind(change.generation)
            .execute(&mut *tx)
            .await
            .map_err(|e| SyncError::Database(e.to_string()))?;
            closed += result.rows_affected();
        }

        tx.commit()
            .await
            .map_err(|e| SyncError::Database(e.to_string()))?;

        Ok(closed)
    }

    async fn mark_failed(&self, record_ids: &[String], error: &str, now: i64) -> Result<u64> {
        self.close_open(record_ids, ChangeStatus::Failed, Some(error), now)
            .await
    }
}

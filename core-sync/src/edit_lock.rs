//! # Edit Lock Manager
//!
//! Advisory, time-limited locks that tell other devices a record is being
//! edited.
//!
//! ## Overview
//!
//! At most one active lock exists per record. Acquisition is serialized by an
//! in-process mutex and runs inside a single transaction; the partial unique
//! index `edit_locks(record_id) WHERE is_active = 1` turns any cross-process
//! race into a denial instead of a second holder.
//!
//! - A device that already holds the lock renews it by acquiring again.
//! - A lock past its expiry is deactivated in the same transaction that
//!   inserts its successor.
//! - `sweep_expired` deactivates every expired lock and is idempotent.
//!
//! ## Usage
//!
//! ```rust,ignore
//! let manager = EditLockManager::new(pool, clock, event_bus, Duration::from_secs(300));
//!
//! match manager.acquire("song-1", RecordType::Song, "ipad").await? {
//!     LockOutcome::Acquired(lock) | LockOutcome::Renewed(lock) => edit(lock),
//!     denied => show_banner(denied.to_string()),
//! }
//! ```

use crate::{Result, SyncError};
use bridge_traits::time::Clock;
use core_library::RecordType;
use core_runtime::events::{CoreEvent, EventBus, SyncEvent};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

// ============================================================================
// Types
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EditLock {
    pub id: String,
    pub record_id: String,
    pub record_type: RecordType,
    pub device_id: String,
    pub acquired_at: i64,
    pub expires_at: i64,
    pub is_active: bool,
    pub released_at: Option<i64>,
}

impl EditLock {
    pub fn is_expired(&self, now: i64) -> bool {
        self.expires_at <= now
    }

    /// Active and not yet expired
    pub fn is_held(&self, now: i64) -> bool {
        self.is_active && !self.is_expired(now)
    }
}

/// Result of an acquisition attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockOutcome {
    Acquired(EditLock),
    /// The requesting device already held the lock; its expiry was extended
    Renewed(EditLock),
    Denied { locked_by: String, expires_at: i64 },
}

impl LockOutcome {
    pub fn is_granted(&self) -> bool {
        !matches!(self, LockOutcome::Denied { .. })
    }

    pub fn lock(&self) -> Option<&EditLock> {
        match self {
            LockOutcome::Acquired(lock) | LockOutcome::Renewed(lock) => Some(lock),
            LockOutcome::Denied { .. } => None,
        }
    }
}

impl fmt::Display for LockOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockOutcome::Acquired(lock) => write!(f, "acquired until {}", lock.expires_at),
            LockOutcome::Renewed(lock) => write!(f, "renewed until {}", lock.expires_at),
            LockOutcome::Denied {
                locked_by,
                expires_at,
            } => write!(f, "locked by {}, expires at {}", locked_by, expires_at),
        }
    }
}

#[derive(FromRow)]
struct EditLockRow {
    id: String,
    record_id: String,
    record_type: String,
    device_id: String,
    acquired_at: i64,
    expires_at: i64,
    is_active: bool,
    released_at: Option<i64>,
}

impl TryFrom<EditLockRow> for EditLock {
    type Error = SyncError;

    fn try_from(row: EditLockRow) -> Result<Self> {
        Ok(Self {
            id: row.id,
            record_id: row.record_id,
            record_type: row.record_type.parse()?,
            device_id: row.device_id,
            acquired_at: row.acquired_at,
            expires_at: row.expires_at,
            is_active: row.is_active,
            released_at: row.released_at,
        })
    }
}

// ============================================================================
// Manager
// ============================================================================

pub struct EditLockManager {
    pool: SqlitePool,
    clock: Arc<dyn Clock>,
    event_bus: EventBus,
    ttl: Duration,
    acquire_guard: Mutex<()>,
}

impl EditLockManager {
    pub fn new(pool: SqlitePool, clock: Arc<dyn Clock>, event_bus: EventBus, ttl: Duration) -> Self {
        Self {
            pool,
            clock,
            event_bus,
            ttl,
            acquire_guard: Mutex::new(()),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Acquire or renew the lock on a record for `device_id`
    #[instrument(skip(self))]
    pub async fn acquire(
        &self,
        record_id: &str,
        record_type: RecordType,
        device_id: &str,
    ) -> Result<LockOutcome> {
        let _guard = self.acquire_guard.lock().await;
        let now = self.clock.unix_timestamp();
        let expires_at = now + self.ttl.as_secs() as i64;

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| SyncError::Database(e.to_string()))?;

        let current = sqlx::query_as::<_, EditLockRow>(
            "SELECT * FROM edit_locks WHERE record_id = ? AND is_active = 1",
        )
        .bind(record_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| SyncError::Database(e.to_string()))?
        .map(EditLock::try_from)
        .transpose()?;

        if let Some(mut lock) = current {
            if !lock.is_expired(now) {
                if lock.device_id != device_id {
                    tx.rollback()
                        .await
                        .map_err(|e| SyncError::Database(e.to_string()))?;
                    return Ok(self.denied(record_id, lock.device_id, lock.expires_at));
                }

                sqlx::query("UPDATE edit_locks SET expires_at = ? WHERE id = ?")
                    .bind(expires_at)
                    .bind(&lock.id)
                    .execute(&mut *tx)
                    .await
                    .map_err(|e| SyncError::Database(e.to_string()))?;
                tx.commit()
                    .await
                    .map_err(|e| SyncError::Database(e.to_string()))?;

                lock.expires_at = expires_at;
                debug!(record_id, device_id, expires_at, "Renewed edit lock");
                self.emit_acquired(&lock);
                return Ok(LockOutcome::Renewed(lock));
            }

            sqlx::query("UPDATE edit_locks SET is_active = 0, released_at = ? WHERE id = ?")
                .bind(now)
                .bind(&lock.id)
                .execute(&mut *tx)
                .await
                .map_err(|e| SyncError::Database(e.to_string()))?;
            debug!(record_id, lock_id = %lock.id, "Deactivated expired edit lock");
        }

        let lock = EditLock {
            id: Uuid::new_v4().to_string(),
            record_id: record_id.to_string(),
            record_type,
            device_id: device_id.to_string(),
            acquired_at: now,
            expires_at,
            is_active: true,
            released_at: None,
        };

        let inserted = sqlx::query(
            r#"
            INSERT INTO edit_locks (
                id, record_id, record_type, device_id, acquired_at, expires_at, is_active
            ) VALUES (?, ?, ?, ?, ?, ?, 1)
            "#,
        )
        .bind(&lock.id)
        .bind(&lock.record_id)
        .bind(lock.record_type.as_str())
        .bind(&lock.device_id)
        .bind(lock.acquired_at)
        .bind(lock.expires_at)
        .execute(&mut *tx)
        .await;

        match inserted {
            Ok(_) => {
                tx.commit()
                    .await
                    .map_err(|e| SyncError::Database(e.to_string()))?;
            }
            Err(e) if is_unique_violation(&e) => {
                // Another process won the race between our read and insert
                tx.rollback()
                    .await
                    .map_err(|e| SyncError::Database(e.to_string()))?;
                warn!(record_id, device_id, "Lost edit lock race to another writer");
                return match self.active_lock_for(record_id).await? {
                    Some(winner) => Ok(self.denied(record_id, winner.device_id, winner.expires_at)),
                    None => Err(SyncError::LockContention {
                        record_id: record_id.to_string(),
                        locked_by: "unknown".to_string(),
                    }),
                };
            }
            Err(e) => return Err(SyncError::Database(e.to_string())),
        }

        info!(record_id, device_id, expires_at, "Acquired edit lock");
        self.emit_acquired(&lock);
        Ok(LockOutcome::Acquired(lock))
    }

    /// Extend an active, unexpired lock to `now + extension`
    #[instrument(skip(self))]
    pub async fn renew(&self, lock_id: &str, extension: Duration) -> Result<bool> {
        let now = self.clock.unix_timestamp();

        let result = sqlx::query(
            r#"
            UPDATE edit_locks SET expires_at = ?
            WHERE id = ? AND is_active = 1 AND expires_at > ?
            "#,
        )
        .bind(now + extension.as_secs() as i64)
        .bind(lock_id)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| SyncError::Database(e.to_string()))?;

        Ok(result.rows_affected() > 0)
    }

    /// Release an active lock; returns false if it was not active
    #[instrument(skip(self))]
    pub async fn release(&self, lock_id: &str) -> Result<bool> {
        let now = self.clock.unix_timestamp();

        let released: Option<(String,)> = sqlx::query_as(
            r#"
            UPDATE edit_locks SET is_active = 0, released_at = ?
            WHERE id = ? AND is_active = 1
            RETURNING record_id
            "#,
        )
        .bind(now)
        .bind(lock_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| SyncError::Database(e.to_string()))?;

        match released {
            Some((record_id,)) => {
                info!(lock_id, record_id = %record_id, "Released edit lock");
                self.event_bus
                    .emit(CoreEvent::Sync(SyncEvent::LockReleased {
                        record_id,
                        lock_id: lock_id.to_string(),
                    }))
                    .ok();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Deactivate every lock whose expiry has passed
    #[instrument(skip(self))]
    pub async fn sweep_expired(&self) -> Result<u64> {
        let now = self.clock.unix_timestamp();

        let result = sqlx::query(
            r#"
            UPDATE edit_locks SET is_active = 0, released_at = ?
            WHERE is_active = 1 AND expires_at <= ?
            "#,
        )
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| SyncError::Database(e.to_string()))?;

        if result.rows_affected() > 0 {
            info!(swept = result.rows_affected(), "Swept expired edit locks");
        }

        Ok(result.rows_affected())
    }

    /// The unexpired active lock on a record, if any
    pub async fn active_lock_for(&self, record_id: &str) -> Result<Option<EditLock>> {
        let now = self.clock.unix_timestamp();

        let row = sqlx::query_as::<_, EditLockRow>(
            "SELECT * FROM edit_locks WHERE record_id = ? AND is_active = 1 AND expires_at > ?",
        )
        .bind(record_id)
        .bind(now)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| SyncError::Database(e.to_string()))?;

        row.map(EditLock::try_from).transpose()
    }

    /// Look up a lock in any state
    pub async fn find(&self, lock_id: &str) -> Result<Option<EditLock>> {
        let row = sqlx::query_as::<_, EditLockRow>("SELECT * FROM edit_locks WHERE id = ?")
            .bind(lock_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| SyncError::Database(e.to_string()))?;

        row.map(EditLock::try_from).transpose()
    }

    fn denied(&self, record_id: &str, locked_by: String, expires_at: i64) -> LockOutcome {
        debug!(record_id, locked_by = %locked_by, expires_at, "Edit lock denied");
        self.event_bus
            .emit(CoreEvent::Sync(SyncEvent::LockDenied {
                record_id: record_id.to_string(),
                locked_by: locked_by.clone(),
                expires_at,
            }))
            .ok();

        LockOutcome::Denied {
            locked_by,
            expires_at,
        }
    }

    fn emit_acquired(&self, lock: &EditLock) {
        self.event_bus
            .emit(CoreEvent::Sync(SyncEvent::LockAcquired {
                record_id: lock.record_id.clone(),
                device_id: lock.device_id.clone(),
                expires_at: lock.expires_at,
            }))
            .ok();
    }
}

fn is_unique_violation(e: &sqlx::Error) -> bool {
    e.as_database_error()
        .map(|db| db.is_unique_violation())
        .unwrap_or(false)
}

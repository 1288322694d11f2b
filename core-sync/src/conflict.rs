//! # Conflict Risk Engine
//!
//! Scores how likely a record is to end up with conflicting edits and applies
//! a resolution strategy to each detection.
//!
//! ## Risk Signals
//!
//! Signals are checked in order; the first positive one decides the level:
//!
//! 1. Another device holds an active edit lock: **critical**
//! 2. Two or more devices edited the record within the activity window: **high**
//! 3. A pending or failed change is queued for the record: **medium**
//! 4. `local_version` differs from `remote_version`: **medium**
//! 5. Otherwise: **low**
//!
//! Detections are upserted per record. An unresolved detection's risk is
//! only ever raised, and resolved detections are never modified again.

use crate::edit_lock::{EditLockManager, LockOutcome};
use crate::pending::{PendingChangeRepository, SqlitePendingChangeRepository};
use crate::session::{
    EditActivityRepository, EditingSessionRepository, SqliteEditActivityRepository,
    SqliteEditingSessionRepository,
};
use crate::{Result, SyncError};
use async_trait::async_trait;
use bridge_traits::sync::ContentMerger;
use bridge_traits::time::Clock;
use core_library::{
    RecordType, SetlistRepository, SongRepository, SqliteSetlistRepository, SqliteSongRepository,
};
use core_runtime::events::{CoreEvent, EventBus, SyncEvent};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool};
use std::collections::HashSet;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

// ============================================================================
// Types
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

impl RiskLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            RiskLevel::Low => "low",
            RiskLevel::Medium => "medium",
            RiskLevel::High => "high",
            RiskLevel::Critical => "critical",
        }
    }
}

impl FromStr for RiskLevel {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "low" => Ok(RiskLevel::Low),
            "medium" => Ok(RiskLevel::Medium),
            "high" => Ok(RiskLevel::High),
            "critical" => Ok(RiskLevel::Critical),
            _ => Err(SyncError::invalid_value("risk_level", s)),
        }
    }
}

impl std::fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResolutionStrategy {
    /// Take the edit lock for the resolving device
    Lock,
    /// Leave the change queued for the next sync
    Queue,
    /// Hand both versions to the host's content merger
    Merge,
    /// Tell the user and let them decide
    Notify,
}

impl ResolutionStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResolutionStrategy::Lock => "lock",
            ResolutionStrategy::Queue => "queue",
            ResolutionStrategy::Merge => "merge",
            ResolutionStrategy::Notify => "notify",
        }
    }
}

impl FromStr for ResolutionStrategy {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "lock" => Ok(ResolutionStrategy::Lock),
            "queue" => Ok(ResolutionStrategy::Queue),
            "merge" => Ok(ResolutionStrategy::Merge),
            "notify" => Ok(ResolutionStrategy::Notify),
            _ => Err(SyncError::invalid_value("resolution_strategy", s)),
        }
    }
}

impl std::fmt::Display for ResolutionStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Strategy applied automatically during a sync run
pub fn recommended_strategy(level: RiskLevel) -> ResolutionStrategy {
    match level {
        RiskLevel::Critical => ResolutionStrategy::Notify,
        RiskLevel::High => ResolutionStrategy::Lock,
        RiskLevel::Medium | RiskLevel::Low => ResolutionStrategy::Queue,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RiskAssessment {
    pub level: RiskLevel,
    pub reason: String,
}

impl RiskAssessment {
    fn new(level: RiskLevel, reason: impl Into<String>) -> Self {
        Self {
            level,
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictDetection {
    pub id: String,
    pub record_id: String,
    pub record_type: RecordType,
    pub risk_level: RiskLevel,
    pub detected_at: i64,
    pub is_resolved: bool,
    pub resolution_strategy: Option<ResolutionStrategy>,
    pub resolved_at: Option<i64>,
    pub details: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolutionOutcome {
    pub detection_id: String,
    pub strategy: ResolutionStrategy,
    pub resolved: bool,
    pub message: String,
}

#[derive(FromRow)]
struct ConflictDetectionRow {
    id: String,
    record_id: String,
    record_type: String,
    risk_level: String,
    detected_at: i64,
    is_resolved: bool,
    resolution_strategy: Option<String>,
    resolved_at: Option<i64>,
    details: Option<String>,
}

impl TryFrom<ConflictDetectionRow> for ConflictDetection {
    type Error = SyncError;

    fn try_from(row: ConflictDetectionRow) -> Result<Self> {
        Ok(Self {
            id: row.id,
            record_id: row.record_id,
            record_type: row.record_type.parse()?,
            risk_level: row.risk_level.parse()?,
            detected_at: row.detected_at,
            is_resolved: row.is_resolved,
            resolution_strategy: row
                .resolution_strategy
                .as_deref()
                .map(ResolutionStrategy::from_str)
                .transpose()?,
            resolved_at: row.resolved_at,
            details: row.details,
        })
    }
}

// ============================================================================
// Repository
// ============================================================================

#[async_trait]
pub trait ConflictDetectionRepository: Send + Sync {
    async fn insert(&self, detection: &ConflictDetection) -> Result<()>;

    async fn find_by_id(&self, id: &str) -> Result<Option<ConflictDetection>>;

    /// The unresolved detection for a record
    async fn find_open(&self, record_id: &str) -> Result<Option<ConflictDetection>>;

    async fn list_unresolved(&self) -> Result<Vec<ConflictDetection>>;

    /// Raise the risk of an unresolved detection; lower levels are ignored
    async fn raise_risk(&self, id: &str, level: RiskLevel, details: &str) -> Result<bool>;

    async fn mark_resolved(&self, id: &str, strategy: ResolutionStrategy, now: i64)
        -> Result<bool>;
}

pub struct SqliteConflictDetectionRepository {
    pool: SqlitePool,
}

impl SqliteConflictDetectionRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ConflictDetectionRepository for SqliteConflictDetectionRepository {
    async fn insert(&self, detection: &ConflictDetection) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO conflict_detections (
                id, record_id, record_type, risk_level, detected_at,
                is_resolved, resolution_strategy, resolved_at, details
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&detection.id)
        .bind(&detection.record_id)
        .bind(detection.record_type.as_str())
        .bind(detection.risk_level.as_str())
        .bind(detection.detected_at)
        .bind(detection.is_resolved)
        .bind(detection.resolution_strategy.map(|s| s.as_str()))
        .bind(detection.resolved_at)
        .bind(&detection.details)
        .execute(&self.pool)
        .await
        .map_err(|e| SyncError::Database(e.to_string()))?;

        Ok(())
    }

    async fn find_by_id(&self, id: &str) -> Result<Option<ConflictDetection>> {
        let row = sqlx::query_as::<_, ConflictDetectionRow>(
            "SELECT * FROM conflict_detections WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| SyncError::Database(e.to_string()))?;

        row.map(ConflictDetection::try_from).transpose()
    }

    async fn find_open(&self, record_id: &str) -> Result<Option<ConflictDetection>> {
        let row = sqlx::query_as::<_, ConflictDetectionRow>(
            "SELECT * FROM conflict_detections WHERE record_id = ? AND is_resolved = 0",
        )
        .bind(record_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| SyncError::Database(e.to_string()))?;

        row.map(ConflictDetection::try_from).transpose()
    }

    async fn list_unresolved(&self) -> Result<Vec<ConflictDetection>> {
        let rows = sqlx::query_as::<_, ConflictDetectionRow>(
            "SELECT * FROM conflict_detections WHERE is_resolved = 0 ORDER BY detected_at, id",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| SyncError::Database(e.to_string()))?;

        rows.into_iter().map(ConflictDetection::try_from).collect()
    }

    async fn raise_risk(&self, id: &str, level: RiskLevel, details: &str) -> Result<bool> {
        // Ordering of the text levels is not lexical, so compare in Rust
        let Some(current) = self.find_by_id(id).await? else {
            return Ok(false);
        };

        if current.is_resolved || level <= current.risk_level {
            return Ok(false);
        }

        let result = sqlx::query(
            r#"
            UPDATE conflict_detections SET risk_level = ?, details = ?
            WHERE id = ? AND is_resolved = 0 AND risk_level = ?
            "#,
        )
        .bind(level.as_str())
        .bind(details)
        .bind(id)
        .bind(current.risk_level.as_str())
        .execute(&self.pool)
        .await
        .map_err(|e| SyncError::Database(e.to_string()))?;

        Ok(result.rows_affected() > 0)
    }

    async fn mark_resolved(
        &self,
        id: &str,
        strategy: ResolutionStrategy,
        now: i64,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE conflict_detections
            SET is_resolved = 1, resolution_strategy = ?, resolved_at = ?
            WHERE id = ? AND is_resolved = 0
            "#,
        )
        .bind(strategy.as_str())
        .bind(now)
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(|e| SyncError::Database(e.to_string()))?;

        Ok(result.rows_affected() > 0)
    }
}

// ============================================================================
// Engine
// ============================================================================

pub struct ConflictEngine {
    clock: Arc<dyn Clock>,
    event_bus: EventBus,
    locks: Arc<EditLockManager>,
    merger: Option<Arc<dyn ContentMerger>>,
    activity_window: Duration,
    detections: SqliteConflictDetectionRepository,
    sessions: SqliteEditingSessionRepository,
    activity: SqliteEditActivityRepository,
    pending: SqlitePendingChangeRepository,
    songs: SqliteSongRepository,
    setlists: SqliteSetlistRepository,
}

impl ConflictEngine {
    pub fn new(
        pool: SqlitePool,
        clock: Arc<dyn Clock>,
        event_bus: EventBus,
        locks: Arc<EditLockManager>,
        merger: Option<Arc<dyn ContentMerger>>,
        activity_window: Duration,
    ) -> Self {
        Self {
            clock,
            event_bus,
            locks,
            merger,
            activity_window,
            detections: SqliteConflictDetectionRepository::new(pool.clone()),
            sessions: SqliteEditingSessionRepository::new(pool.clone()),
            activity: SqliteEditActivityRepository::new(pool.clone()),
            pending: SqlitePendingChangeRepository::new(pool.clone()),
            songs: SqliteSongRepository::new(pool.clone()),
            setlists: SqliteSetlistRepository::new(pool),
        }
    }

    /// Score the conflict risk of a record from `device_id`'s point of view
    #[instrument(skip(self))]
    pub async fn detect_risk(
        &self,
        record_id: &str,
        record_type: RecordType,
        device_id: &str,
    ) -> Result<RiskAssessment> {
        if let Some(lock) = self.locks.active_lock_for(record_id).await? {
            if lock.device_id != device_id {
                return Ok(RiskAssessment::new(
                    RiskLevel::Critical,
                    format!(
                        "Being edited on {} (locked until {})",
                        lock.device_id, lock.expires_at
                    ),
                ));
            }
        }

        let since = self.clock.unix_timestamp() - self.activity_window.as_secs() as i64;
        let devices = self.activity.distinct_devices_since(record_id, since).await?;
        if devices >= 2 {
            return Ok(RiskAssessment::new(
                RiskLevel::High,
                format!(
                    "Edited on {} devices in the last {} minutes",
                    devices,
                    self.activity_window.as_secs() / 60
                ),
            ));
        }

        if let Some(change) = self.pending.find_open(record_id).await? {
            return Ok(RiskAssessment::new(
                RiskLevel::Medium,
                format!("Local change is {} sync", change.status),
            ));
        }

        let versions = match record_type {
            RecordType::Song => self
                .songs
                .find_by_id(record_id)
                .await?
                .map(|s| (s.local_version, s.remote_version)),
            RecordType::Setlist => self
                .setlists
                .find_by_id(record_id)
                .await?
                .map(|s| (s.local_version, s.remote_version)),
        };

        if let Some((local, remote)) = versions {
            if local != remote {
                return Ok(RiskAssessment::new(
                    RiskLevel::Medium,
                    format!("Local version {} differs from remote version {}", local, remote),
                ));
            }
        }

        Ok(RiskAssessment::new(RiskLevel::Low, "No conflict signals"))
    }

    /// Score every record with an active editing session and upsert detections
    ///
    /// Returns the open detections that were created or raised.
    #[instrument(skip(self))]
    pub async fn scan_for_conflicts(&self, device_id: &str) -> Result<Vec<ConflictDetection>> {
        let sessions = self.sessions.active_sessions().await?;
        let now = self.clock.unix_timestamp();
        let mut seen = HashSet::new();
        let mut touched = Vec::new();

        for session in sessions {
            if !seen.insert(session.record_id.clone()) {
                continue;
            }

            let assessment = self
                .detect_risk(&session.record_id, session.record_type, device_id)
                .await?;

            if assessment.level == RiskLevel::Low {
                continue;
            }

            match self.detections.find_open(&session.record_id).await? {
                Some(existing) => {
                    if self
                        .detections
                        .raise_risk(&existing.id, assessment.level, &assessment.reason)
                        .await?
                    {
                        debug!(
                            record_id = %session.record_id,
                            from = %existing.risk_level,
                            to = %assessment.level,
                            "Raised conflict risk"
                        );
                        if let Some(updated) = self.detections.find_by_id(&existing.id).await? {
                            touched.push(updated);
                        }
                    }
                }
                None => {
                    let detection = ConflictDetection {
                        id: Uuid::new_v4().to_string(),
                        record_id: session.record_id.clone(),
                        record_type: session.record_type,
                        risk_level: assessment.level,
                        detected_at: now,
                        is_resolved: false,
                        resolution_strategy: None,
                        resolved_at: None,
                        details: Some(assessment.reason),
                    };
                    self.detections.insert(&detection).await?;
                    touched.push(detection);
                }
            }
        }

        info!(detections = touched.len(), "Conflict scan complete");
        Ok(touched)
    }

    pub async fn unresolved_conflicts(&self) -> Result<Vec<ConflictDetection>> {
        self.detections.list_unresolved().await
    }

    pub async fn find(&self, detection_id: &str) -> Result<Option<ConflictDetection>> {
        self.detections.find_by_id(detection_id).await
    }

    /// Apply `strategy` to a detection; it stays unresolved on failure
    #[instrument(skip(self))]
    pub async fn resolve_conflict(
        &self,
        detection_id: &str,
        strategy: ResolutionStrategy,
        device_id: &str,
    ) -> Result<ResolutionOutcome> {
        let detection = self
            .detections
            .find_by_id(detection_id)
            .await?
            .ok_or_else(|| SyncError::not_found("ConflictDetection", detection_id))?;

        if detection.is_resolved {
            return Ok(outcome(&detection, strategy, false, "Conflict already resolved"));
        }

        let attempt: std::result::Result<String, String> = match strategy {
            ResolutionStrategy::Lock => {
                match self
                    .locks
                    .acquire(&detection.record_id, detection.record_type, device_id)
                    .await?
                {
                    denied @ LockOutcome::Denied { .. } => Err(denied.to_string()),
                    granted => Ok(format!("Edit lock {}", granted)),
                }
            }
            ResolutionStrategy::Queue => Ok("Change left queued for next sync".to_string()),
            ResolutionStrategy::Merge => match &self.merger {
                None => Err("No content merger configured".to_string()),
                Some(merger) => match merger
                    .merge(&detection.record_id, detection.record_type.as_str())
                    .await
                {
                    Ok(true) => Ok("Merged concurrent edits".to_string()),
                    Ok(false) => Err("Merge could not combine the edits".to_string()),
                    Err(e) => Err(format!("Merge failed: {}", e)),
                },
            },
            ResolutionStrategy::Notify => {
                let message = detection
                    .details
                    .clone()
                    .unwrap_or_else(|| format!("{} conflict risk", detection.risk_level));
                self.event_bus
                    .emit(CoreEvent::Sync(SyncEvent::ConflictDetected {
                        record_id: detection.record_id.clone(),
                        risk_level: detection.risk_level.to_string(),
                        message,
                    }))
                    .ok();
                Ok("User notified".to_string())
            }
        };

        match attempt {
            Ok(message) => {
                let now = self.clock.unix_timestamp();
                let resolved = self
                    .detections
                    .mark_resolved(&detection.id, strategy, now)
                    .await?;
                info!(
                    detection_id,
                    record_id = %detection.record_id,
                    strategy = %strategy,
                    "Conflict resolved"
                );
                Ok(outcome(&detection, strategy, resolved, message))
            }
            Err(message) => {
                warn!(
                    detection_id,
                    strategy = %strategy,
                    reason = %message,
                    "Conflict resolution failed"
                );
                Ok(outcome(&detection, strategy, false, message))
            }
        }
    }
}

fn outcome(
    detection: &ConflictDetection,
    strategy: ResolutionStrategy,
    resolved: bool,
    message: impl Into<String>,
) -> ResolutionOutcome {
    ResolutionOutcome {
        detection_id: detection.id.clone(),
        strategy,
        resolved,
        message: message.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{EditActivity, EditingSession};
    use bridge_traits::error::BridgeError;
    use bridge_traits::time::ManualClock;
    use core_library::db::create_test_pool;
    use core_library::Song;
    use mockall::mock;

    const NOW: i64 = 1_700_000_000;

    mock! {
        Merger {}

        #[async_trait]
        impl ContentMerger for Merger {
            async fn merge(&self, record_id: &str, record_type: &str) -> bridge_traits::error::Result<bool>;
        }
    }

    struct Fixture {
        pool: SqlitePool,
        locks: Arc<EditLockManager>,
        engine: ConflictEngine,
        bus: EventBus,
    }

    async fn fixture(merger: Option<Arc<dyn ContentMerger>>) -> Fixture {
        let pool = create_test_pool().await.unwrap();
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::at_timestamp(NOW));
        let bus = EventBus::new(64);
        let locks = Arc::new(EditLockManager::new(
            pool.clone(),
            clock.clone(),
            bus.clone(),
            Duration::from_secs(300),
        ));
        let engine = ConflictEngine::new(
            pool.clone(),
            clock,
            bus.clone(),
            locks.clone(),
            merger,
            Duration::from_secs(600),
        );
        Fixture {
            pool,
            locks,
            engine,
            bus,
        }
    }

    async fn synced_song(pool: &SqlitePool, id: &str) {
        let mut song = Song::new("Wonderwall", "[Em7]Today is", NOW).with_id(id);
        song.remote_version = song.local_version;
        SqliteSongRepository::new(pool.clone())
            .insert(&song)
            .await
            .unwrap();
    }

    async fn open_session(pool: &SqlitePool, record_id: &str, device: &str) {
        SqliteEditingSessionRepository::new(pool.clone())
            .insert(&EditingSession::new(
                record_id,
                RecordType::Song,
                device,
                "user-1",
                NOW,
            ))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_risk_signals_in_order() {
        let f = fixture(None).await;
        synced_song(&f.pool, "song-1").await;

        let low = f
            .engine
            .detect_risk("song-1", RecordType::Song, "phone")
            .await
            .unwrap();
        assert_eq!(low.level, RiskLevel::Low);

        // Version mismatch
        SqliteSongRepository::new(f.pool.clone())
            .bump_local_version("song-1", NOW)
            .await
            .unwrap();
        let medium = f
            .engine
            .detect_risk("song-1", RecordType::Song, "phone")
            .await
            .unwrap();
        assert_eq!(medium.level, RiskLevel::Medium);
        assert!(medium.reason.contains("differs"));

        // Edits from two devices inside the window
        let activity = SqliteEditActivityRepository::new(f.pool.clone());
        for device in ["phone", "laptop"] {
            activity
                .insert(&EditActivity::new(
                    "song-1",
                    RecordType::Song,
                    device,
                    None,
                    NOW - 60,
                ))
                .await
                .unwrap();
        }
        let high = f
            .engine
            .detect_risk("song-1", RecordType::Song, "phone")
            .await
            .unwrap();
        assert_eq!(high.level, RiskLevel::High);

        // A lock held elsewhere beats everything
        f.locks
            .acquire("song-1", RecordType::Song, "laptop")
            .await
            .unwrap();
        let critical = f
            .engine
            .detect_risk("song-1", RecordType::Song, "phone")
            .await
            .unwrap();
        assert_eq!(critical.level, RiskLevel::Critical);

        // The lock holder itself does not see its own lock as a conflict
        let own = f
            .engine
            .detect_risk("song-1", RecordType::Song, "laptop")
            .await
            .unwrap();
        assert_eq!(own.level, RiskLevel::High);
    }

    #[tokio::test]
    async fn test_pending_change_is_medium() {
        let f = fixture(None).await;
        synced_song(&f.pool, "song-1").await;
        SqlitePendingChangeRepository::new(f.pool.clone())
            .enqueue("song-1", RecordType::Song, NOW)
            .await
            .unwrap();

        let risk = f
            .engine
            .detect_risk("song-1", RecordType::Song, "phone")
            .await
            .unwrap();
        assert_eq!(risk.level, RiskLevel::Medium);
        assert!(risk.reason.contains("pending"));
    }

    #[tokio::test]
    async fn test_scan_upserts_and_never_downgrades() {
        let f = fixture(None).await;
        synced_song(&f.pool, "song-1").await;
        open_session(&f.pool, "song-1", "laptop").await;
        f.locks
            .acquire("song-1", RecordType::Song, "laptop")
            .await
            .unwrap();

        let first = f.engine.scan_for_conflicts("phone").await.unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].risk_level, RiskLevel::Critical);

        // Lock released: the record now only scores medium, detection keeps critical
        let lock = f.locks.active_lock_for("song-1").await.unwrap().unwrap();
        f.locks.release(&lock.id).await.unwrap();
        SqlitePendingChangeRepository::new(f.pool.clone())
            .enqueue("song-1", RecordType::Song, NOW)
            .await
            .unwrap();

        let second = f.engine.scan_for_conflicts("phone").await.unwrap();
        assert!(second.is_empty());

        let open = f.engine.unresolved_conflicts().await.unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].risk_level, RiskLevel::Critical);
        assert_eq!(open[0].id, first[0].id);
    }

    #[tokio::test]
    async fn test_scan_raises_existing_detection() {
        let f = fixture(None).await;
        synced_song(&f.pool, "song-1").await;
        open_session(&f.pool, "song-1", "laptop").await;
        SqlitePendingChangeRepository::new(f.pool.clone())
            .enqueue("song-1", RecordType::Song, NOW)
            .await
            .unwrap();

        let first = f.engine.scan_for_conflicts("phone").await.unwrap();
        assert_eq!(first[0].risk_level, RiskLevel::Medium);

        f.locks
            .acquire("song-1", RecordType::Song, "laptop")
            .await
            .unwrap();
        let second = f.engine.scan_for_conflicts("phone").await.unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].id, first[0].id);
        assert_eq!(second[0].risk_level, RiskLevel::Critical);
    }

    #[tokio::test]
    async fn test_resolve_with_lock_and_queue() {
        let f = fixture(None).await;
        synced_song(&f.pool, "song-1").await;
        open_session(&f.pool, "song-1", "laptop").await;
        SqlitePendingChangeRepository::new(f.pool.clone())
            .enqueue("song-1", RecordType::Song, NOW)
            .await
            .unwrap();
        let detection = f.engine.scan_for_conflicts("phone").await.unwrap().remove(0);

        // Another device holds the lock, so Lock fails and the detection stays open
        f.locks
            .acquire("song-1", RecordType::Song, "laptop")
            .await
            .unwrap();
        let failed = f
            .engine
            .resolve_conflict(&detection.id, ResolutionStrategy::Lock, "phone")
            .await
            .unwrap();
        assert!(!failed.resolved);
        assert!(failed.message.starts_with("locked by laptop"));
        assert!(!f.engine.find(&detection.id).await.unwrap().unwrap().is_resolved);

        let queued = f
            .engine
            .resolve_conflict(&detection.id, ResolutionStrategy::Queue, "phone")
            .await
            .unwrap();
        assert!(queued.resolved);

        let stored = f.engine.find(&detection.id).await.unwrap().unwrap();
        assert!(stored.is_resolved);
        assert_eq!(stored.resolution_strategy, Some(ResolutionStrategy::Queue));

        // The pending change is left in place
        assert!(SqlitePendingChangeRepository::new(f.pool.clone())
            .find_open("song-1")
            .await
            .unwrap()
            .is_some());

        // Resolved detections are immutable
        let again = f
            .engine
            .resolve_conflict(&detection.id, ResolutionStrategy::Notify, "phone")
            .await
            .unwrap();
        assert!(!again.resolved);
        assert_eq!(
            f.engine
                .find(&detection.id)
                .await
                .unwrap()
                .unwrap()
                .resolution_strategy,
            Some(ResolutionStrategy::Queue)
        );
    }

    #[tokio::test]
    async fn test_merge_requires_merger() {
        let f = fixture(None).await;
        synced_song(&f.pool, "song-1").await;
        open_session(&f.pool, "song-1", "laptop").await;
        SqlitePendingChangeRepository::new(f.pool.clone())
            .enqueue("song-1", RecordType::Song, NOW)
            .await
            .unwrap();
        let detection = f.engine.scan_for_conflicts("phone").await.unwrap().remove(0);

        let outcome = f
            .engine
            .resolve_conflict(&detection.id, ResolutionStrategy::Merge, "phone")
            .await
            .unwrap();
        assert!(!outcome.resolved);
        assert_eq!(outcome.message, "No content merger configured");
    }

    #[tokio::test]
    async fn test_merge_delegates_to_merger() {
        let mut merger = MockMerger::new();
        merger
            .expect_merge()
            .withf(|id, kind| id == "song-1" && kind == "song")
            .times(1)
            .returning(|_, _| Ok(true));
        merger
            .expect_merge()
            .withf(|id, _| id == "song-2")
            .times(1)
            .returning(|_, _| Err(BridgeError::OperationFailed("diverged".into())));

        let f = fixture(Some(Arc::new(merger))).await;
        for id in ["song-1", "song-2"] {
            synced_song(&f.pool, id).await;
            open_session(&f.pool, id, "laptop").await;
            SqlitePendingChangeRepository::new(f.pool.clone())
                .enqueue(id, RecordType::Song, NOW)
                .await
                .unwrap();
        }
        let detections = f.engine.scan_for_conflicts("phone").await.unwrap();

        for detection in detections {
            let outcome = f
                .engine
                .resolve_conflict(&detection.id, ResolutionStrategy::Merge, "phone")
                .await
                .unwrap();
            assert_eq!(outcome.resolved, detection.record_id == "song-1");
        }
    }

    #[tokio::test]
    async fn test_notify_emits_event() {
        let f = fixture(None).await;
        let mut events = f.bus.subscribe();
        synced_song(&f.pool, "song-1").await;
        open_session(&f.pool, "song-1", "laptop").await;
        f.locks
            .acquire("song-1", RecordType::Song, "laptop")
            .await
            .unwrap();
        let detection = f.engine.scan_for_conflicts("phone").await.unwrap().remove(0);
        let strategy = recommended_strategy(detection.risk_level);
        assert_eq!(strategy, ResolutionStrategy::Notify);

        let outcome = f
            .engine
            .resolve_conflict(&detection.id, strategy, "phone")
            .await
            .unwrap();
        assert!(outcome.resolved);

        let mut saw_conflict = false;
        while let Ok(event) = events.try_recv() {
            if let CoreEvent::Sync(SyncEvent::ConflictDetected {
                record_id,
                risk_level,
                ..
            }) = event
            {
                assert_eq!(record_id, "song-1");
                assert_eq!(risk_level, "critical");
                saw_conflict = true;
            }
        }
        assert!(saw_conflict);
    }

    #[test]
    fn test_recommended_strategy() {
        assert_eq!(recommended_strategy(RiskLevel::Critical), ResolutionStrategy::Notify);
        assert_eq!(recommended_strategy(RiskLevel::High), ResolutionStrategy::Lock);
        assert_eq!(recommended_strategy(RiskLevel::Medium), ResolutionStrategy::Queue);
        assert_eq!(recommended_strategy(RiskLevel::Low), ResolutionStrategy::Queue);
        assert!(RiskLevel::Critical > RiskLevel::High);
        assert!(RiskLevel::Medium > RiskLevel::Low);
    }

    #[tokio::test]
    async fn test_resolve_unknown_detection_is_not_found() {
        let f = fixture(None).await;
        let result = f
            .engine
            .resolve_conflict("missing", ResolutionStrategy::Queue, "phone")
            .await;
        assert!(matches!(result, Err(SyncError::NotFound { .. })));
    }
}

//! # Recovery Intelligence Engine
//!
//! Detects data loss, recovers automatically where the cause is clear, and
//! proposes ranked actions where it is not.
//!
//! ## Detectors
//!
//! - **Deletion**: records present in the newest verifiable backup but gone
//!   from the store. Library deletes are soft, so hard absence is unexpected.
//! - **Sync failure**: pending changes whose last push failed.
//! - **Corruption**: unrepaired failures from the newest integrity pass.
//!
//! An event is closed once recovery succeeds and is never reopened.
//! Recovery only runs for events the detector marked as recoverable.

use crate::backup::{Backup, BackupEngine, BackupTrigger, BackupType};
use crate::integrity::IntegrityEngine;
use crate::pending::{ChangeStatus, PendingChangeRepository, SqlitePendingChangeRepository};
use crate::settings::{SqliteSyncSettingsRepository, SyncSettingsRepository};
use crate::{Result, SyncError};
use bridge_traits::sync::{IncrementalSyncRequest, RemoteSyncTransport};
use bridge_traits::time::Clock;
use core_library::{
    apply_snapshot, RecordType, SetlistRepository, SongRepository, SqliteSetlistRepository,
    SqliteSongRepository,
};
use core_runtime::events::{CoreEvent, EventBus, SyncEvent};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool};
use std::collections::HashSet;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

/// User id used for recovery syncs when no run has been recorded yet
const FALLBACK_USER: &str = "local";

// ============================================================================
// Types
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataLossType {
    Deletion,
    Corruption,
    SyncFailure,
    DeviceFailure,
}

impl DataLossType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DataLossType::Deletion => "deletion",
            DataLossType::Corruption => "corruption",
            DataLossType::SyncFailure => "sync_failure",
            DataLossType::DeviceFailure => "device_failure",
        }
    }
}

impl FromStr for DataLossType {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "deletion" => Ok(DataLossType::Deletion),
            "corruption" => Ok(DataLossType::Corruption),
            "sync_failure" => Ok(DataLossType::SyncFailure),
            "device_failure" => Ok(DataLossType::DeviceFailure),
            _ => Err(SyncError::invalid_value("loss_type", s)),
        }
    }
}

impl std::fmt::Display for DataLossType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataLossEvent {
    pub id: String,
    pub loss_type: DataLossType,
    pub detection_time: i64,
    pub can_recover: bool,
    pub recovery_attempted: bool,
    pub recovery_successful: bool,
    /// Sorted record ids
    pub affected_records: Vec<String>,
    pub description: String,
    pub resolved_at: Option<i64>,
}

impl DataLossEvent {
    pub fn is_closed(&self) -> bool {
        self.recovery_successful
    }
}

#[derive(FromRow)]
struct DataLossEventRow {
    id: String,
    loss_type: String,
    detection_time: i64,
    can_recover: bool,
    recovery_attempted: bool,
    recovery_successful: bool,
    affected_records: String,
    description: String,
    resolved_at: Option<i64>,
}

impl TryFrom<DataLossEventRow> for DataLossEvent {
    type Error = SyncError;

    fn try_from(row: DataLossEventRow) -> Result<Self> {
        Ok(Self {
            id: row.id,
            loss_type: row.loss_type.parse()?,
            detection_time: row.detection_time,
            can_recover: row.can_recover,
            recovery_attempted: row.recovery_attempted,
            recovery_successful: row.recovery_successful,
            affected_records: serde_json::from_str(&row.affected_records)
                .map_err(|e| SyncError::Serialization(e.to_string()))?,
            description: row.description,
            resolved_at: row.resolved_at,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryOutcome {
    Restored { backup_id: String, record_count: usize },
    Resynced { record_count: usize },
    /// Automatic recovery is impossible; the user must restore from the cloud
    ManualRestoreRequired,
    Refused { reason: String },
    Failed { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveryResult {
    pub event_id: String,
    pub success: bool,
    pub outcome: RecoveryOutcome,
}

impl RecoveryResult {
    fn new(event_id: &str, outcome: RecoveryOutcome) -> Self {
        Self {
            event_id: event_id.to_string(),
            success: matches!(
                outcome,
                RecoveryOutcome::Restored { .. } | RecoveryOutcome::Resynced { .. }
            ),
            outcome,
        }
    }

    pub fn message(&self) -> String {
        match &self.outcome {
            RecoveryOutcome::Restored {
                backup_id,
                record_count,
            } => format!("Restored {} records from backup {}", record_count, backup_id),
            RecoveryOutcome::Resynced { record_count } => {
                format!("Re-synced {} records", record_count)
            }
            RecoveryOutcome::ManualRestoreRequired => {
                "Restore this device from the cloud copy".to_string()
            }
            RecoveryOutcome::Refused { reason } | RecoveryOutcome::Failed { reason } => {
                reason.clone()
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RecoveryActionKind {
    RestoreFromBackup,
    RetrySync,
    RepairInPlace,
    RestoreFromCloud,
    ManualReview,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryAction {
    pub kind: RecoveryActionKind,
    pub description: String,
    /// 0.0 to 1.0
    pub confidence: f64,
    pub estimated_recovery_percent: u8,
}

impl RecoveryAction {
    fn new(kind: RecoveryActionKind, description: &str, confidence: f64, percent: u8) -> Self {
        Self {
            kind,
            description: description.to_string(),
            confidence,
            estimated_recovery_percent: percent,
        }
    }
}

// ============================================================================
// Engine
// ============================================================================

pub struct RecoveryEngine {
    pool: SqlitePool,
    clock: Arc<dyn Clock>,
    event_bus: EventBus,
    backups: Arc<BackupEngine>,
    integrity: Arc<IntegrityEngine>,
    transport: Arc<dyn RemoteSyncTransport>,
    remote_timeout: Duration,
    settings: SqliteSyncSettingsRepository,
    pending: SqlitePendingChangeRepository,
    songs: SqliteSongRepository,
    setlists: SqliteSetlistRepository,
}

impl RecoveryEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        pool: SqlitePool,
        clock: Arc<dyn Clock>,
        event_bus: EventBus,
        backups: Arc<BackupEngine>,
        integrity: Arc<IntegrityEngine>,
        transport: Arc<dyn RemoteSyncTransport>,
        remote_timeout: Duration,
    ) -> Self {
        Self {
            settings: SqliteSyncSettingsRepository::new(pool.clone()),
            pending: SqlitePendingChangeRepository::new(pool.clone()),
            songs: SqliteSongRepository::new(pool.clone()),
            setlists: SqliteSetlistRepository::new(pool.clone()),
            pool,
            clock,
            event_bus,
            backups,
            integrity,
            transport,
            remote_timeout,
        }
    }

    /// Newest backup taken strictly before the loss was detected
    ///
    /// Backups from the detection second onwards, such as the emergency
    /// backup, already miss the lost records.
    async fn backup_predating(&self, event: &DataLossEvent) -> Result<Option<Backup>> {
        self.backups.latest_backup_before(event.detection_time).await
    }

    /// Run every detector and persist events for new findings
    ///
    /// Returns only the events created by this call.
    #[instrument(skip(self))]
    pub async fn detect_data_loss(&self) -> Result<Vec<DataLossEvent>> {
        let now = self.clock.unix_timestamp();
        let has_backup = self.backups.latest_backup().await?.is_some();
        let mut findings: Vec<(DataLossType, Vec<String>, bool, String)> = Vec::new();

        let deleted = self.detect_deletions().await?;
        if !deleted.is_empty() {
            findings.push((
                DataLossType::Deletion,
                deleted.clone(),
                has_backup,
                format!("{} records disappeared since the last backup", deleted.len()),
            ));
        }

        let mut failed: Vec<String> = self
            .pending
            .list_by_status(ChangeStatus::Failed)
            .await?
            .into_iter()
            .map(|c| c.record_id)
            .collect();
        if !failed.is_empty() {
            failed.sort();
            findings.push((
                DataLossType::SyncFailure,
                failed.clone(),
                true,
                format!("{} local changes failed to sync", failed.len()),
            ));
        }

        let mut corrupted: Vec<String> = self
            .integrity
            .latest_unrepaired()
            .await?
            .into_iter()
            .map(|r| r.record_id)
            .collect();
        if !corrupted.is_empty() {
            corrupted.sort();
            corrupted.dedup();
            findings.push((
                DataLossType::Corruption,
                corrupted.clone(),
                has_backup,
                format!("{} records failed integrity checks", corrupted.len()),
            ));
        }

        let open = self.list_events(true).await?;
        let mut created = Vec::new();

        for (loss_type, affected, can_recover, description) in findings {
            let duplicate = open
                .iter()
                .any(|e| e.loss_type == loss_type && e.affected_records == affected);
            if duplicate {
                continue;
            }

            let event = DataLossEvent {
                id: Uuid::new_v4().to_string(),
                loss_type,
                detection_time: now,
                can_recover,
                recovery_attempted: false,
                recovery_successful: false,
                affected_records: affected,
                description,
                resolved_at: None,
            };
            self.insert_event(&event).await?;
            self.announce(&event);
            created.push(event);
        }

        Ok(created)
    }

    async fn detect_deletions(&self) -> Result<Vec<String>> {
        let Some(latest) = self.backups.latest_backup().await? else {
            return Ok(Vec::new());
        };

        let snapshot = match self.backups.load_snapshot(&latest.id).await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!(backup_id = %latest.id, error = %e, "Latest backup unusable for deletion check");
                return Ok(Vec::new());
            }
        };

        let present: HashSet<String> = self
            .songs
            .all_ids()
            .await?
            .into_iter()
            .chain(self.setlists.all_ids().await?)
            .collect();

        let mut missing: Vec<String> = snapshot
            .record_refs()
            .into_iter()
            .map(|r| r.record_id)
            .filter(|id| !present.contains(id))
            .collect();
        missing.sort();
        Ok(missing)
    }

    fn announce(&self, event: &DataLossEvent) {
        warn!(
            event_id = %event.id,
            loss_type = %event.loss_type,
            affected = event.affected_records.len(),
            can_recover = event.can_recover,
            "Data loss detected"
        );
        self.event_bus
            .emit(CoreEvent::Sync(SyncEvent::DataLossDetected {
                event_id: event.id.clone(),
                loss_type: event.loss_type.to_string(),
                affected_records: event.affected_records.len() as u64,
            }))
            .ok();
    }

    /// Record a device failure reported by the host
    #[instrument(skip(self, affected_records))]
    pub async fn report_device_failure(
        &self,
        device_id: &str,
        affected_records: Vec<String>,
    ) -> Result<DataLossEvent> {
        let mut affected = affected_records;
        affected.sort();
        affected.dedup();

        let event = DataLossEvent {
            id: Uuid::new_v4().to_string(),
            loss_type: DataLossType::DeviceFailure,
            detection_time: self.clock.unix_timestamp(),
            can_recover: true,
            recovery_attempted: false,
            recovery_successful: false,
            affected_records: affected,
            description: format!("Device {} failed", device_id),
            resolved_at: None,
        };
        self.insert_event(&event).await?;
        self.announce(&event);
        Ok(event)
    }

    #[instrument(skip(self))]
    pub async fn auto_recover(&self, event_id: &str) -> Result<RecoveryResult> {
        let event = self
            .find_event(event_id)
            .await?
            .ok_or_else(|| SyncError::not_found("DataLossEvent", event_id))?;

        if event.is_closed() {
            return Ok(RecoveryResult::new(
                event_id,
                RecoveryOutcome::Refused {
                    reason: "Event already recovered".to_string(),
                },
            ));
        }

        if !event.can_recover {
            return Ok(RecoveryResult::new(
                event_id,
                RecoveryOutcome::Refused {
                    reason: "Loss cause is ambiguous; automatic recovery disabled".to_string(),
                },
            ));
        }

        let outcome = match event.loss_type {
            DataLossType::Deletion | DataLossType::Corruption => {
                self.restore_affected(&event).await?
            }
            DataLossType::SyncFailure => self.resync(&event.affected_records).await?,
            DataLossType::DeviceFailure => RecoveryOutcome::ManualRestoreRequired,
        };

        let result = RecoveryResult::new(event_id, outcome);
        self.record_attempt(event_id, result.success).await?;

        if result.success {
            info!(event_id, message = %result.message(), "Recovery succeeded");
        } else {
            error!(event_id, message = %result.message(), "Recovery did not complete");
        }

        self.event_bus
            .emit(CoreEvent::Sync(SyncEvent::RecoveryCompleted {
                event_id: event_id.to_string(),
                success: result.success,
                message: result.message(),
            }))
            .ok();

        Ok(result)
    }

    /// Restore the event's records from the newest backup taken before it
    async fn restore_affected(&self, event: &DataLossEvent) -> Result<RecoveryOutcome> {
        let Some(backup) = self.backup_predating(event).await? else {
            return Ok(RecoveryOutcome::Failed {
                reason: "No backup predates the loss".to_string(),
            });
        };

        let snapshot = match self.backups.load_snapshot(&backup.id).await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                return Ok(RecoveryOutcome::Failed {
                    reason: e.to_string(),
                })
            }
        };

        let mut restored = 0;
        for record_id in &event.affected_records {
            if snapshot.contains(record_id) {
                restored += apply_snapshot(&self.pool, &snapshot.only(record_id)).await?;
            }
        }

        if restored == 0 {
            return Ok(RecoveryOutcome::Failed {
                reason: format!("Backup {} holds none of the affected records", backup.id),
            });
        }

        Ok(RecoveryOutcome::Restored {
            backup_id: backup.id,
            record_count: restored,
        })
    }

    async fn resync(&self, record_ids: &[String]) -> Result<RecoveryOutcome> {
        let user_id: Option<(String,)> = sqlx::query_as(
            "SELECT user_id FROM sync_statistics ORDER BY started_at DESC, rowid DESC LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| SyncError::Database(e.to_string()))?;
        let user_id = user_id.map(|(u,)| u).unwrap_or_else(|| FALLBACK_USER.to_string());

        // Freeze what goes out so edits made during the call stay queued
        let mut changes = Vec::with_capacity(record_ids.len());
        let mut versions = Vec::with_capacity(record_ids.len());
        for id in record_ids {
            if let Some(change) = self.pending.find_open(id).await? {
                changes.push(change);
            }
            versions.push(self.local_version(id).await?);
        }

        let request = IncrementalSyncRequest::new(user_id)
            .with_records(record_ids.to_vec())
            .with_batch_size(record_ids.len());

        let call = tokio::time::timeout(
            self.remote_timeout,
            self.transport.perform_incremental_sync(&request),
        )
        .await;

        let now = self.clock.unix_timestamp();
        match call {
            Ok(Ok(_report)) => {
                self.pending.mark_synced(&changes, now).await?;
                for (id, version) in record_ids.iter().zip(&versions) {
                    match version {
                        Some((RecordType::Song, v)) => self.songs.mark_synced(id, *v).await?,
                        Some((RecordType::Setlist, v)) => self.setlists.mark_synced(id, *v).await?,
                        None => false,
                    };
                }
                Ok(RecoveryOutcome::Resynced {
                    record_count: record_ids.len(),
                })
            }
            Ok(Err(e)) => {
                self.pending
                    .mark_failed(record_ids, &e.to_string(), now)
                    .await?;
                Ok(RecoveryOutcome::Failed {
                    reason: format!("Transport error: {}", e),
                })
            }
            Err(_) => Ok(RecoveryOutcome::Failed {
                reason: SyncError::Timeout(self.remote_timeout.as_secs()).to_string(),
            }),
        }
    }

    async fn local_version(&self, record_id: &str) -> Result<Option<(RecordType, i64)>> {
        if let Some(song) = self.songs.find_by_id(record_id).await? {
            return Ok(Some((RecordType::Song, song.local_version)));
        }
        Ok(self
            .setlists
            .find_by_id(record_id)
            .await?
            .map(|setlist| (RecordType::Setlist, setlist.local_version)))
    }

    /// Ranked recovery options; nothing is executed
    pub async fn suggest_recovery_actions(&self, event_id: &str) -> Result<Vec<RecoveryAction>> {
        use RecoveryActionKind::*;

        let event = self
            .find_event(event_id)
            .await?
            .ok_or_else(|| SyncError::not_found("DataLossEvent", event_id))?;

        if event.is_closed() {
            return Ok(Vec::new());
        }

        let has_backup = self.backup_predating(&event).await?.is_some();

        let mut actions = Vec::new();
        match event.loss_type {
            DataLossType::Deletion => {
                if has_backup {
                    actions.push(RecoveryAction::new(
                        RestoreFromBackup,
                        "Restore the missing records from the latest backup",
                        0.9,
                        100,
                    ));
                }
                actions.push(RecoveryAction::new(
                    RestoreFromCloud,
                    "Pull the records again from the cloud copy",
                    0.6,
                    80,
                ));
                actions.push(RecoveryAction::new(
                    ManualReview,
                    "Confirm whether the records were removed on purpose",
                    0.3,
                    0,
                ));
            }
            DataLossType::Corruption => {
                if has_backup {
                    actions.push(RecoveryAction::new(
                        RestoreFromBackup,
                        "Replace the corrupted records with their backed-up versions",
                        0.8,
                        95,
                    ));
                }
                actions.push(RecoveryAction::new(
                    RepairInPlace,
                    "Repair the records in place where possible",
                    0.4,
                    60,
                ));
                actions.push(RecoveryAction::new(
                    ManualReview,
                    "Inspect the records and fix them by hand",
                    0.2,
                    50,
                ));
            }
            DataLossType::SyncFailure => {
                actions.push(RecoveryAction::new(
                    RetrySync,
                    "Retry syncing the failed changes",
                    0.85,
                    100,
                ));
                actions.push(RecoveryAction::new(
                    ManualReview,
                    "Check connectivity and account status",
                    0.2,
                    0,
                ));
            }
            DataLossType::DeviceFailure => {
                actions.push(RecoveryAction::new(
                    RestoreFromCloud,
                    "Restore the device from the cloud copy",
                    0.7,
                    90,
                ));
                if has_backup {
                    actions.push(RecoveryAction::new(
                        RestoreFromBackup,
                        "Restore from the latest local backup",
                        0.5,
                        70,
                    ));
                }
            }
        }

        actions.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
        Ok(actions)
    }

    /// Emergency containment: full backup, then suspend sync
    #[instrument(skip(self))]
    pub async fn minimize_data_loss(&self, event_id: &str) -> Result<Backup> {
        let event = self
            .find_event(event_id)
            .await?
            .ok_or_else(|| SyncError::not_found("DataLossEvent", event_id))?;

        let snapshot = self.backups.capture_snapshot().await?;
        let backup = self
            .backups
            .create_backup(BackupTrigger::Emergency, BackupType::Full, &snapshot)
            .await?;

        self.settings.set_sync_enabled(false).await?;

        let reason = format!("Containing {} ({})", event.loss_type, event.description);
        warn!(event_id, backup_id = %backup.id, "Sync suspended");
        self.event_bus
            .emit(CoreEvent::Sync(SyncEvent::SyncSuspended { reason }))
            .ok();

        Ok(backup)
    }

    pub async fn resume_sync(&self) -> Result<()> {
        self.settings.set_sync_enabled(true).await?;
        info!("Sync resumed");
        self.event_bus
            .emit(CoreEvent::Sync(SyncEvent::SyncResumed))
            .ok();
        Ok(())
    }

    pub async fn find_event(&self, event_id: &str) -> Result<Option<DataLossEvent>> {
        let row = sqlx::query_as::<_, DataLossEventRow>(
            "SELECT * FROM data_loss_events WHERE id = ?",
        )
        .bind(event_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| SyncError::Database(e.to_string()))?;

        row.map(DataLossEvent::try_from).transpose()
    }

    /// Events newest first, optionally only those not yet recovered
    pub async fn list_events(&self, open_only: bool) -> Result<Vec<DataLossEvent>> {
        let sql = if open_only {
            "SELECT * FROM data_loss_events WHERE recovery_successful = 0 ORDER BY detection_time DESC, rowid DESC"
        } else {
            "SELECT * FROM data_loss_events ORDER BY detection_time DESC, rowid DESC"
        };

        let rows = sqlx::query_as::<_, DataLossEventRow>(sql)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| SyncError::Database(e.to_string()))?;

        rows.into_iter().map(DataLossEvent::try_from).collect()
    }

    async fn insert_event(&self, event: &DataLossEvent) -> Result<()> {
        let affected = serde_json::to_string(&event.affected_records)
            .map_err(|e| SyncError::Serialization(e.to_string()))?;

        sqlx::query(
            r#"
            INSERT INTO data_loss_events (
                id, loss_type, detection_time, can_recover, recovery_attempted,
                recovery_successful, affected_records, description, resolved_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&event.id)
        .bind(event.loss_type.as_str())
        .bind(event.detection_time)
        .bind(event.can_recover)
        .bind(event.recovery_attempted)
        .bind(event.recovery_successful)
        .bind(affected)
        .bind(&event.description)
        .bind(event.resolved_at)
        .execute(&self.pool)
        .await
        .map_err(|e| SyncError::Database(e.to_string()))?;

        Ok(())
    }

    async fn record_attempt(&self, event_id: &str, success: bool) -> Result<()> {
        let now = self.clock.unix_timestamp();
        sqlx::query(
            r#"
            UPDATE data_loss_events
            SET recovery_attempted = 1,
                recovery_successful = ?,
                resolved_at = CASE WHEN ? THEN ? ELSE resolved_at END
            WHERE id = ? AND recovery_successful = 0
            "#,
        )
        .bind(success)
        .bind(success)
        .bind(now)
        .bind(event_id)
        .execute(&self.pool)
        .await
        .map_err(|e| SyncError::Database(e.to_string()))?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SyncEngineConfig;
    use crate::test_support::{accepting_transport, MemoryFileSystem, MockTransport};
    use bridge_traits::error::BridgeError;
    use bridge_traits::time::ManualClock;
    use core_library::db::create_test_pool;
    use core_library::{RecordRef, RecordType, Song};
    use std::path::Path;

    const NOW: i64 = 1_700_000_000;

    struct Fixture {
        clock: Arc<ManualClock>,
        bus: EventBus,
        backups: Arc<BackupEngine>,
        integrity: Arc<IntegrityEngine>,
        recovery: RecoveryEngine,
        songs: SqliteSongRepository,
        pending: SqlitePendingChangeRepository,
        settings: SqliteSyncSettingsRepository,
    }

    async fn fixture(transport: MockTransport) -> Fixture {
        let pool = create_test_pool().await.unwrap();
        let clock = Arc::new(ManualClock::at_timestamp(NOW));
        let bus = EventBus::new(64);
        let backups = Arc::new(BackupEngine::new(
            pool.clone(),
            clock.clone(),
            bus.clone(),
            Arc::new(MemoryFileSystem::new()),
            Path::new("/mem/data"),
            &SyncEngineConfig::default(),
        ));
        let integrity = Arc::new(IntegrityEngine::new(
            pool.clone(),
            clock.clone(),
            bus.clone(),
            backups.clone(),
        ));
        let recovery = RecoveryEngine::new(
            pool.clone(),
            clock.clone(),
            bus.clone(),
            backups.clone(),
            integrity.clone(),
            Arc::new(transport),
            Duration::from_secs(5),
        );
        Fixture {
            clock,
            bus,
            backups,
            integrity,
            recovery,
            songs: SqliteSongRepository::new(pool.clone()),
            pending: SqlitePendingChangeRepository::new(pool.clone()),
            settings: SqliteSyncSettingsRepository::new(pool),
        }
    }

    async fn seed_and_backup(f: &Fixture, ids: &[&str]) {
        for id in ids {
            f.songs
                .insert(&Song::new(format!("Song {}", id), "[D]hey", NOW).with_id(*id))
                .await
                .unwrap();
        }
        let snapshot = f.backups.capture_snapshot().await.unwrap();
        f.backups
            .create_backup(BackupTrigger::Manual, BackupType::Full, &snapshot)
            .await
            .unwrap();
        f.clock.advance(chrono::Duration::minutes(10));
    }

    #[tokio::test]
    async fn test_deletion_detected_and_recovered() {
        let f = fixture(accepting_transport()).await;
        seed_and_backup(&f, &["song-1", "song-2", "song-3"]).await;

        // Soft deletes are user intent, hard absence is loss
        f.songs.soft_delete("song-1", NOW).await.unwrap();
        f.songs.delete("song-2").await.unwrap();

        let events = f.recovery.detect_data_loss().await.unwrap();
        assert_eq!(events.len(), 1);
        let event = &events[0];
        assert_eq!(event.loss_type, DataLossType::Deletion);
        assert_eq!(event.affected_records, vec!["song-2".to_string()]);
        assert!(event.can_recover);

        // Identical findings are not duplicated
        assert!(f.recovery.detect_data_loss().await.unwrap().is_empty());

        let result = f.recovery.auto_recover(&event.id).await.unwrap();
        assert!(result.success, "{}", result.message());
        assert!(f.songs.find_by_id("song-2").await.unwrap().is_some());
        // The soft-deleted song is left alone
        assert!(f.songs.find_by_id("song-1").await.unwrap().unwrap().is_deleted());

        let closed = f.recovery.find_event(&event.id).await.unwrap().unwrap();
        assert!(closed.is_closed());
        assert!(closed.recovery_attempted);
        assert!(closed.resolved_at.is_some());

        let again = f.recovery.auto_recover(&event.id).await.unwrap();
        assert!(!again.success);
        assert!(matches!(again.outcome, RecoveryOutcome::Refused { .. }));
    }

    #[tokio::test]
    async fn test_sync_failure_resynced() {
        let f = fixture(accepting_transport()).await;
        seed_and_backup(&f, &["song-1"]).await;
        f.pending.enqueue("song-1", RecordType::Song, NOW).await.unwrap();
        f.pending
            .mark_failed(&["song-1".to_string()], "offline", NOW)
            .await
            .unwrap();

        let events = f.recovery.detect_data_loss().await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].loss_type, DataLossType::SyncFailure);

        let result = f.recovery.auto_recover(&events[0].id).await.unwrap();
        assert_eq!(result.outcome, RecoveryOutcome::Resynced { record_count: 1 });
        assert!(f.pending.find_open("song-1").await.unwrap().is_none());
        let song = f.songs.find_by_id("song-1").await.unwrap().unwrap();
        assert!(!song.has_unsynced_changes());
    }

    #[tokio::test]
    async fn test_failed_resync_keeps_event_open() {
        let mut transport = MockTransport::new();
        transport
            .expect_perform_incremental_sync()
            .returning(|_| Err(BridgeError::Transport("503".into())));
        let f = fixture(transport).await;
        seed_and_backup(&f, &["song-1"]).await;
        f.pending.enqueue("song-1", RecordType::Song, NOW).await.unwrap();
        f.pending
            .mark_failed(&["song-1".to_string()], "offline", NOW)
            .await
            .unwrap();

        let event = f.recovery.detect_data_loss().await.unwrap().remove(0);
        let result = f.recovery.auto_recover(&event.id).await.unwrap();
        assert!(!result.success);

        let stored = f.recovery.find_event(&event.id).await.unwrap().unwrap();
        assert!(stored.recovery_attempted);
        assert!(!stored.is_closed());
        assert_eq!(f.pending.find_open("song-1").await.unwrap().unwrap().attempts, 2);
    }

    #[tokio::test]
    async fn test_corruption_without_backup_is_not_recoverable() {
        let f = fixture(accepting_transport()).await;
        let mut song = Song::new("Hallelujah", "[C]I heard", NOW).with_id("song-1");
        f.songs.insert(&song).await.unwrap();
        song.content.push_str(" tampered");
        f.songs.update(&song).await.unwrap();

        f.integrity
            .verify_after_sync(&[RecordRef::song("song-1")])
            .await
            .unwrap();

        let events = f.recovery.detect_data_loss().await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].loss_type, DataLossType::Corruption);
        assert!(!events[0].can_recover);

        let result = f.recovery.auto_recover(&events[0].id).await.unwrap();
        assert!(matches!(result.outcome, RecoveryOutcome::Refused { .. }));

        let actions = f.recovery.suggest_recovery_actions(&events[0].id).await.unwrap();
        assert!(!actions.iter().any(|a| a.kind == RecoveryActionKind::RestoreFromBackup));
    }

    #[tokio::test]
    async fn test_corruption_restored_from_earlier_backup() {
        let f = fixture(accepting_transport()).await;
        seed_and_backup(&f, &["song-1"]).await;
        let mut song = f.songs.find_by_id("song-1").await.unwrap().unwrap();
        song.content = "garbled".to_string();
        f.songs.update(&song).await.unwrap();

        f.integrity
            .verify_after_sync(&[RecordRef::song("song-1")])
            .await
            .unwrap();
        let event = f.recovery.detect_data_loss().await.unwrap().remove(0);
        assert!(event.can_recover);

        let result = f.recovery.auto_recover(&event.id).await.unwrap();
        assert!(result.success);
        let restored = f.songs.find_by_id("song-1").await.unwrap().unwrap();
        assert_eq!(restored.content, "[D]hey");
    }

    #[tokio::test]
    async fn test_device_failure_requires_manual_restore() {
        let f = fixture(accepting_transport()).await;
        let event = f
            .recovery
            .report_device_failure("ipad", vec!["song-2".into(), "song-1".into()])
            .await
            .unwrap();
        assert_eq!(event.affected_records, vec!["song-1", "song-2"]);

        let result = f.recovery.auto_recover(&event.id).await.unwrap();
        assert_eq!(result.outcome, RecoveryOutcome::ManualRestoreRequired);
        assert!(!result.success);

        let actions = f.recovery.suggest_recovery_actions(&event.id).await.unwrap();
        assert_eq!(actions[0].kind, RecoveryActionKind::RestoreFromCloud);
    }

    #[tokio::test]
    async fn test_suggestions_are_ranked() {
        let f = fixture(accepting_transport()).await;
        seed_and_backup(&f, &["song-1"]).await;
        f.songs.delete("song-1").await.unwrap();
        let event = f.recovery.detect_data_loss().await.unwrap().remove(0);

        let actions = f.recovery.suggest_recovery_actions(&event.id).await.unwrap();
        assert_eq!(actions[0].kind, RecoveryActionKind::RestoreFromBackup);
        assert!(actions
            .windows(2)
            .all(|w| w[0].confidence >= w[1].confidence));
        assert!(actions
            .iter()
            .all(|a| (0.0..=1.0).contains(&a.confidence) && a.estimated_recovery_percent <= 100));

        // Nothing was executed
        assert!(f.songs.find_by_id("song-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_minimize_data_loss_backs_up_and_suspends() {
        let f = fixture(accepting_transport()).await;
        let mut events = f.bus.subscribe();
        seed_and_backup(&f, &["song-1"]).await;
        f.songs.delete("song-1").await.unwrap();
        let event = f.recovery.detect_data_loss().await.unwrap().remove(0);

        let backup = f.recovery.minimize_data_loss(&event.id).await.unwrap();
        assert_eq!(backup.trigger, BackupTrigger::Emergency);
        assert_eq!(backup.retention_until, None);
        assert!(!f.settings.is_sync_enabled().await.unwrap());

        let mut suspended = false;
        while let Ok(e) = events.try_recv() {
            if matches!(e, CoreEvent::Sync(SyncEvent::SyncSuspended { .. })) {
                suspended = true;
            }
        }
        assert!(suspended);

        f.recovery.resume_sync().await.unwrap();
        assert!(f.settings.is_sync_enabled().await.unwrap());
    }

    #[tokio::test]
    async fn test_recovery_skips_emergency_backup_from_detection_second() {
        let f = fixture(accepting_transport()).await;
        seed_and_backup(&f, &["song-1", "song-2"]).await;
        f.songs.delete("song-1").await.unwrap();

        let event = f.recovery.detect_data_loss().await.unwrap().remove(0);
        assert_eq!(event.loss_type, DataLossType::Deletion);

        // Same clock second as detection; holds only song-2
        let emergency = f.recovery.minimize_data_loss(&event.id).await.unwrap();
        assert_eq!(emergency.created_at, event.detection_time);

        let result = f.recovery.auto_recover(&event.id).await.unwrap();
        assert!(result.success, "{}", result.message());
        assert!(matches!(
            result.outcome,
            RecoveryOutcome::Restored { ref backup_id, record_count: 1 } if *backup_id != emergency.id
        ));
        assert!(f.songs.find_by_id("song-1").await.unwrap().is_some());
    }
}

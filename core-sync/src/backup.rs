//! # Backup & Retention Engine
//!
//! Checksummed library backups with importance-based retention.
//!
//! ## Overview
//!
//! A backup is a Zstd-compressed JSON [`LibrarySnapshot`] stored as
//! `<data_dir>/backups/<id>.bak`, plus a metadata row. The SHA-256 checksum
//! is taken over the stored (compressed) bytes, and restore refuses to apply
//! a blob whose checksum no longer matches.
//!
//! ## Importance and Retention
//!
//! | Trigger | Importance | Retained |
//! |---|---|---|
//! | before performance, emergency | critical | forever |
//! | manual | high | 182 days |
//! | scheduled | low if the last backup is under an hour old, else medium | 7 / 30 days |
//! | data change | by record count: ≥ 50 high, ≥ 10 medium, else low | |
//!
//! Cleanup never touches critical backups or the most recent N backups.
//!
//! ## Usage
//!
//! ```rust,ignore
//! let snapshot = engine.capture_snapshot().await?;
//! let backup = engine
//!     .create_backup(BackupTrigger::Manual, BackupType::Full, &snapshot)
//!     .await?;
//!
//! let restored = engine.restore_backup(&backup.id).await?;
//! assert!(restored.success);
//! ```

use crate::config::SyncEngineConfig;
use crate::network::{compress_with, decompress, CompressionAlgorithm};
use crate::{Result, SyncError};
use bridge_traits::storage::FileSystemAccess;
use bridge_traits::time::Clock;
use bytes::Bytes;
use core_library::{apply_snapshot, capture_snapshot, LibrarySnapshot};
use core_runtime::events::{CoreEvent, EventBus, LibraryEvent, SyncEvent};
use core_runtime::logging::strip_path;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use sqlx::{FromRow, SqlitePool};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

const HOUR: i64 = 3600;
const DAY: i64 = 24 * HOUR;

// ============================================================================
// Types
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupType {
    Full,
    Incremental,
    Snapshot,
}

impl BackupType {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackupType::Full => "full",
            BackupType::Incremental => "incremental",
            BackupType::Snapshot => "snapshot",
        }
    }
}

impl FromStr for BackupType {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "full" => Ok(BackupType::Full),
            "incremental" => Ok(BackupType::Incremental),
            "snapshot" => Ok(BackupType::Snapshot),
            _ => Err(SyncError::invalid_value("backup_type", s)),
        }
    }
}

impl std::fmt::Display for BackupType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupTrigger {
    Manual,
    Scheduled,
    BeforePerformance,
    DataChange,
    /// Containment backup taken before sync is suspended
    Emergency,
}

impl BackupTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackupTrigger::Manual => "manual",
            BackupTrigger::Scheduled => "scheduled",
            BackupTrigger::BeforePerformance => "before_performance",
            BackupTrigger::DataChange => "data_change",
            BackupTrigger::Emergency => "emergency",
        }
    }
}

impl FromStr for BackupTrigger {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "manual" => Ok(BackupTrigger::Manual),
            "scheduled" => Ok(BackupTrigger::Scheduled),
            "before_performance" => Ok(BackupTrigger::BeforePerformance),
            "data_change" => Ok(BackupTrigger::DataChange),
            "emergency" => Ok(BackupTrigger::Emergency),
            _ => Err(SyncError::invalid_value("backup_trigger", s)),
        }
    }
}

impl std::fmt::Display for BackupTrigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Retention tier; variants are ordered from first-evicted to never-evicted
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackupImportance {
    Low,
    Medium,
    High,
    Critical,
}

impl BackupImportance {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackupImportance::Low => "low",
            BackupImportance::Medium => "medium",
            BackupImportance::High => "high",
            BackupImportance::Critical => "critical",
        }
    }

    /// Expiry of a backup created at `created_at`; `None` never expires
    pub fn retention_until(&self, created_at: i64) -> Option<i64> {
        match self {
            BackupImportance::Critical => None,
            BackupImportance::High => Some(created_at + 182 * DAY),
            BackupImportance::Medium => Some(created_at + 30 * DAY),
            BackupImportance::Low => Some(created_at + 7 * DAY),
        }
    }
}

impl FromStr for BackupImportance {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "low" => Ok(BackupImportance::Low),
            "medium" => Ok(BackupImportance::Medium),
            "high" => Ok(BackupImportance::High),
            "critical" => Ok(BackupImportance::Critical),
            _ => Err(SyncError::invalid_value("importance", s)),
        }
    }
}

impl std::fmt::Display for BackupImportance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Importance of a new backup
pub fn assess_importance(
    trigger: BackupTrigger,
    record_count: usize,
    last_backup_at: Option<i64>,
    now: i64,
) -> BackupImportance {
    match trigger {
        BackupTrigger::BeforePerformance | BackupTrigger::Emergency => BackupImportance::Critical,
        BackupTrigger::Manual => BackupImportance::High,
        BackupTrigger::Scheduled => match last_backup_at {
            Some(last) if now - last < HOUR => BackupImportance::Low,
            _ => BackupImportance::Medium,
        },
        BackupTrigger::DataChange => match record_count {
            n if n >= 50 => BackupImportance::High,
            n if n >= 10 => BackupImportance::Medium,
            _ => BackupImportance::Low,
        },
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Backup {
    pub id: String,
    pub backup_type: BackupType,
    pub trigger: BackupTrigger,
    pub data_size: i64,
    pub compressed_size: i64,
    pub record_count: i64,
    pub importance: BackupImportance,
    pub checksum: String,
    pub created_at: i64,
    pub retention_until: Option<i64>,
    pub blob_path: String,
    pub compression: CompressionAlgorithm,
}

#[derive(FromRow)]
struct BackupRow {
    id: String,
    backup_type: String,
    backup_trigger: String,
    data_size: i64,
    compressed_size: i64,
    record_count: i64,
    importance: String,
    checksum: String,
    created_at: i64,
    retention_until: Option<i64>,
    blob_path: String,
    compression: String,
}

impl TryFrom<BackupRow> for Backup {
    type Error = SyncError;

    fn try_from(row: BackupRow) -> Result<Self> {
        Ok(Self {
            id: row.id,
            backup_type: row.backup_type.parse()?,
            trigger: row.backup_trigger.parse()?,
            data_size: row.data_size,
            compressed_size: row.compressed_size,
            record_count: row.record_count,
            importance: row.importance.parse()?,
            checksum: row.checksum,
            created_at: row.created_at,
            retention_until: row.retention_until,
            blob_path: row.blob_path,
            compression: row.compression.parse()?,
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupReport {
    /// Deleted because their retention passed
    pub expired: usize,
    /// Deleted to get back under the backup cap
    pub evicted: usize,
    pub bytes_freed: u64,
    pub remaining: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestoreResult {
    pub backup_id: String,
    pub success: bool,
    pub record_count: usize,
    pub message: String,
}

impl RestoreResult {
    fn failed(backup_id: &str, message: impl Into<String>) -> Self {
        Self {
            backup_id: backup_id.to_string(),
            success: false,
            record_count: 0,
            message: message.into(),
        }
    }
}

// ============================================================================
// Engine
// ============================================================================

pub struct BackupEngine {
    pool: SqlitePool,
    clock: Arc<dyn Clock>,
    event_bus: EventBus,
    file_system: Arc<dyn FileSystemAccess>,
    backup_dir: PathBuf,
    recent_to_keep: usize,
    max_backups: usize,
}

impl BackupEngine {
    pub fn new(
        pool: SqlitePool,
        clock: Arc<dyn Clock>,
        event_bus: EventBus,
        file_system: Arc<dyn FileSystemAccess>,
        data_dir: &Path,
        config: &SyncEngineConfig,
    ) -> Self {
        Self {
            pool,
            clock,
            event_bus,
            file_system,
            backup_dir: data_dir.join("backups"),
            recent_to_keep: config.recent_backups_to_keep,
            max_backups: config.max_backups,
        }
    }

    pub fn backup_dir(&self) -> &Path {
        &self.backup_dir
    }

    pub fn blob_path(&self, backup_id: &str) -> PathBuf {
        self.backup_dir.join(format!("{}.bak", backup_id))
    }

    /// Current live library contents
    pub async fn capture_snapshot(&self) -> Result<LibrarySnapshot> {
        Ok(capture_snapshot(&self.pool, self.clock.unix_timestamp()).await?)
    }

    #[instrument(skip(self, snapshot), fields(records = snapshot.record_count()))]
    pub async fn create_backup(
        &self,
        trigger: BackupTrigger,
        backup_type: BackupType,
        snapshot: &LibrarySnapshot,
    ) -> Result<Backup> {
        let now = self.clock.unix_timestamp();
        let last_backup_at = self.latest_backup().await?.map(|b| b.created_at);
        let importance = assess_importance(trigger, snapshot.record_count(), last_backup_at, now);

        let json = serde_json::to_vec(snapshot)
            .map_err(|e| SyncError::Serialization(e.to_string()))?;
        let compressed = compress_with(&json, CompressionAlgorithm::Zstd)?;
        let checksum = format!("{:x}", Sha256::digest(&compressed));

        let id = Uuid::new_v4().to_string();
        let path = self.blob_path(&id);

        self.file_system
            .create_dir_all(&self.backup_dir)
            .await
            .map_err(|e| SyncError::Storage(e.to_string()))?;
        self.file_system
            .write_file(&path, Bytes::from(compressed.clone()))
            .await
            .map_err(|e| SyncError::Storage(e.to_string()))?;

        let backup = Backup {
            id,
            backup_type,
            trigger,
            data_size: json.len() as i64,
            compressed_size: compressed.len() as i64,
            record_count: snapshot.record_count() as i64,
            importance,
            checksum,
            created_at: now,
            retention_until: importance.retention_until(now),
            blob_path: path.to_string_lossy().into_owned(),
            compression: CompressionAlgorithm::Zstd,
        };

        if let Err(e) = self.insert(&backup).await {
            // Row never landed, so the blob is orphaned
            self.file_system.delete_file(&path).await.ok();
            return Err(e);
        }

        info!(
            backup_id = %backup.id,
            trigger = %trigger,
            importance = %importance,
            blob = strip_path(&backup.blob_path),
            compressed_size = backup.compressed_size,
            "Backup created"
        );

        self.event_bus
            .emit(CoreEvent::Sync(SyncEvent::BackupCreated {
                backup_id: backup.id.clone(),
                importance: importance.to_string(),
                record_count: backup.record_count as u64,
            }))
            .ok();

        if let Err(e) = self.cleanup_old_backups().await {
            warn!(error = %e, "Backup cleanup failed");
        }

        Ok(backup)
    }

    async fn insert(&self, backup: &Backup) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO backups (
                id, backup_type, backup_trigger, data_size, compressed_size, record_count,
                importance, checksum, created_at, retention_until, blob_path, compression
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&backup.id)
        .bind(backup.backup_type.as_str())
        .bind(backup.trigger.as_str())
        .bind(backup.data_size)
        .bind(backup.compressed_size)
        .bind(backup.record_count)
        .bind(backup.importance.as_str())
        .bind(&backup.checksum)
        .bind(backup.created_at)
        .bind(backup.retention_until)
        .bind(&backup.blob_path)
        .bind(backup.compression.as_str())
        .execute(&self.pool)
        .await
        .map_err(|e| SyncError::Database(e.to_string()))?;

        Ok(())
    }

    /// All backups, newest first
    pub async fn list_backups(&self) -> Result<Vec<Backup>> {
        let rows = sqlx::query_as::<_, BackupRow>(
            "SELECT * FROM backups ORDER BY created_at DESC, rowid DESC",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| SyncError::Database(e.to_string()))?;

        rows.into_iter().map(Backup::try_from).collect()
    }

    pub async fn find_backup(&self, backup_id: &str) -> Result<Option<Backup>> {
        let row = sqlx::query_as::<_, BackupRow>("SELECT * FROM backups WHERE id = ?")
            .bind(backup_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| SyncError::Database(e.to_string()))?;

        row.map(Backup::try_from).transpose()
    }

    pub async fn latest_backup(&self) -> Result<Option<Backup>> {
        let row = sqlx::query_as::<_, BackupRow>(
            "SELECT * FROM backups ORDER BY created_at DESC, rowid DESC LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| SyncError::Database(e.to_string()))?;

        row.map(Backup::try_from).transpose()
    }

    /// Newest backup created strictly before `timestamp`
    pub async fn latest_backup_before(&self, timestamp: i64) -> Result<Option<Backup>> {
        let row = sqlx::query_as::<_, BackupRow>(
            r#"
            SELECT * FROM backups WHERE created_at < ?
            ORDER BY created_at DESC, rowid DESC LIMIT 1
            "#,
        )
        .bind(timestamp)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| SyncError::Database(e.to_string()))?;

        row.map(Backup::try_from).transpose()
    }

    /// Total stored (compressed) bytes
    pub async fn total_backup_bytes(&self) -> Result<u64> {
        let total: (Option<i64>,) = sqlx::query_as("SELECT SUM(compressed_size) FROM backups")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| SyncError::Database(e.to_string()))?;

        Ok(total.0.unwrap_or(0).max(0) as u64)
    }

    /// Number of backups created at or after `since`
    pub async fn count_since(&self, since: i64) -> Result<i64> {
        let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM backups WHERE created_at >= ?")
            .bind(since)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| SyncError::Database(e.to_string()))?;

        Ok(count.0)
    }

    /// Delete expired backups, then evict down to the cap
    #[instrument(skip(self))]
    pub async fn cleanup_old_backups(&self) -> Result<CleanupReport> {
        let now = self.clock.unix_timestamp();
        let backups = self.list_backups().await?;

        let protected: HashSet<String> = backups
            .iter()
            .take(self.recent_to_keep)
            .map(|b| b.id.clone())
            .chain(
                backups
                    .iter()
                    .filter(|b| b.importance == BackupImportance::Critical)
                    .map(|b| b.id.clone()),
            )
            .collect();

        let mut report = CleanupReport::default();
        let mut remaining = Vec::with_capacity(backups.len());

        for backup in backups {
            let expired = matches!(backup.retention_until, Some(until) if until < now);
            if expired && !protected.contains(&backup.id) {
                report.bytes_freed += self.delete_backup(&backup).await?;
                report.expired += 1;
            } else {
                remaining.push(backup);
            }
        }

        if remaining.len() > self.max_backups {
            let mut candidates: Vec<&Backup> = remaining
                .iter()
                .filter(|b| !protected.contains(&b.id))
                .collect();
            candidates.sort_by_key(|b| (b.importance, b.created_at));

            let excess = remaining.len() - self.max_backups;
            let evict: Vec<Backup> = candidates.into_iter().take(excess).cloned().collect();
            for backup in &evict {
                report.bytes_freed += self.delete_backup(backup).await?;
                report.evicted += 1;
            }
            remaining.retain(|b| !evict.iter().any(|e| e.id == b.id));
        }

        report.remaining = remaining.len();

        if report.expired + report.evicted > 0 {
            info!(
                expired = report.expired,
                evicted = report.evicted,
                remaining = report.remaining,
                "Backup cleanup complete"
            );
        }

        Ok(report)
    }

    async fn delete_backup(&self, backup: &Backup) -> Result<u64> {
        sqlx::query("DELETE FROM backups WHERE id = ?")
            .bind(&backup.id)
            .execute(&self.pool)
            .await
            .map_err(|e| SyncError::Database(e.to_string()))?;

        if let Err(e) = self
            .file_system
            .delete_file(Path::new(&backup.blob_path))
            .await
        {
            warn!(
                backup_id = %backup.id,
                blob = strip_path(&backup.blob_path),
                error = %e,
                "Failed to delete backup blob"
            );
        }

        debug!(backup_id = %backup.id, importance = %backup.importance, "Deleted backup");
        Ok(backup.compressed_size.max(0) as u64)
    }

    /// Read and verify a backup's snapshot without applying it
    pub async fn load_snapshot(&self, backup_id: &str) -> Result<LibrarySnapshot> {
        let backup = self
            .find_backup(backup_id)
            .await?
            .ok_or_else(|| SyncError::not_found("Backup", backup_id))?;

        let blob = self
            .file_system
            .read_file(Path::new(&backup.blob_path))
            .await
            .map_err(|e| SyncError::Storage(format!("Backup {} blob unreadable: {}", backup_id, e)))?;

        let checksum = format!("{:x}", Sha256::digest(&blob));
        if checksum != backup.checksum {
            return Err(SyncError::IntegrityFailure(format!(
                "Backup {} is corrupted, checksum mismatch",
                backup_id
            )));
        }

        let json = decompress(&blob, backup.compression)?;
        serde_json::from_slice(&json).map_err(|e| SyncError::Serialization(e.to_string()))
    }

    /// Verify a backup and apply its snapshot; nothing is written on failure
    #[instrument(skip(self))]
    pub async fn restore_backup(&self, backup_id: &str) -> Result<RestoreResult> {
        let snapshot = match self.load_snapshot(backup_id).await {
            Ok(snapshot) => snapshot,
            Err(
                e @ (SyncError::IntegrityFailure(_)
                | SyncError::NotFound { .. }
                | SyncError::Storage(_)
                | SyncError::Compression(_)
                | SyncError::Serialization(_)),
            ) => {
                error!(backup_id, error = %e, "Backup restore refused");
                let message = match e {
                    SyncError::IntegrityFailure(message) => message,
                    other => other.to_string(),
                };
                return Ok(RestoreResult::failed(backup_id, message));
            }
            Err(e) => return Err(e),
        };

        let record_count = apply_snapshot(&self.pool, &snapshot).await?;

        info!(backup_id, record_count, "Backup restored");
        self.event_bus
            .emit(CoreEvent::Sync(SyncEvent::BackupRestored {
                backup_id: backup_id.to_string(),
                record_count: record_count as u64,
            }))
            .ok();
        self.event_bus
            .emit(CoreEvent::Library(LibraryEvent::SnapshotRestored {
                backup_id: backup_id.to_string(),
                record_count: record_count as u64,
            }))
            .ok();

        Ok(RestoreResult {
            backup_id: backup_id.to_string(),
            success: true,
            record_count,
            message: format!("Restored {} records", record_count),
        })
    }

    /// Restore one record from the newest verifiable backup that contains it
    ///
    /// Returns the id of the backup used, or `None` if no backup has the record.
    #[instrument(skip(self))]
    pub async fn restore_record(&self, record_id: &str) -> Result<Option<String>> {
        for backup in self.list_backups().await? {
            let snapshot = match self.load_snapshot(&backup.id).await {
                Ok(snapshot) => snapshot,
                Err(e) => {
                    warn!(backup_id = %backup.id, error = %e, "Skipping unverifiable backup");
                    continue;
                }
            };

            if snapshot.contains(record_id) {
                apply_snapshot(&self.pool, &snapshot.only(record_id)).await?;
                info!(record_id, backup_id = %backup.id, "Record restored from backup");
                return Ok(Some(backup.id));
            }
        }

        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::MemoryFileSystem;
    use bridge_traits::time::ManualClock;
    use core_library::db::create_test_pool;
    use core_library::{Setlist, SetlistRepository, Song, SongRepository, SqliteSetlistRepository, SqliteSongRepository};

    const NOW: i64 = 1_700_000_000;

    struct Fixture {
        pool: SqlitePool,
        clock: Arc<ManualClock>,
        fs: Arc<MemoryFileSystem>,
        engine: BackupEngine,
    }

    async fn fixture(config: SyncEngineConfig) -> Fixture {
        let pool = create_test_pool().await.unwrap();
        let clock = Arc::new(ManualClock::at_timestamp(NOW));
        let fs = Arc::new(MemoryFileSystem::new());
        let engine = BackupEngine::new(
            pool.clone(),
            clock.clone(),
            EventBus::new(64),
            fs.clone(),
            Path::new("/mem/data"),
            &config,
        );
        Fixture {
            pool,
            clock,
            fs,
            engine,
        }
    }

    async fn seed_library(pool: &SqlitePool, songs: usize) {
        let repo = SqliteSongRepository::new(pool.clone());
        for i in 0..songs {
            repo.insert(&Song::new(format!("Song {}", i), "[C]la la", NOW).with_id(format!("song-{}", i)))
                .await
                .unwrap();
        }
    }

    #[test]
    fn test_importance_rules() {
        use BackupImportance::*;
        use BackupTrigger::*;

        assert_eq!(assess_importance(BeforePerformance, 12, None, NOW), Critical);
        assert_eq!(assess_importance(Emergency, 0, Some(NOW), NOW), Critical);
        assert_eq!(assess_importance(Manual, 1, Some(NOW), NOW), High);
        assert_eq!(assess_importance(Scheduled, 5, Some(NOW - 600), NOW), Low);
        assert_eq!(assess_importance(Scheduled, 5, Some(NOW - 2 * HOUR), NOW), Medium);
        assert_eq!(assess_importance(Scheduled, 5, None, NOW), Medium);
        assert_eq!(assess_importance(DataChange, 50, None, NOW), High);
        assert_eq!(assess_importance(DataChange, 10, None, NOW), Medium);
        assert_eq!(assess_importance(DataChange, 9, None, NOW), Low);
    }

    #[test]
    fn test_retention_horizons() {
        assert_eq!(BackupImportance::Critical.retention_until(NOW), None);
        assert_eq!(BackupImportance::High.retention_until(NOW), Some(NOW + 182 * DAY));
        assert_eq!(BackupImportance::Medium.retention_until(NOW), Some(NOW + 30 * DAY));
        assert_eq!(BackupImportance::Low.retention_until(NOW), Some(NOW + 7 * DAY));
    }

    #[tokio::test]
    async fn test_before_performance_backup_is_critical() {
        let f = fixture(SyncEngineConfig::default()).await;
        seed_library(&f.pool, 12).await;

        let snapshot = f.engine.capture_snapshot().await.unwrap();
        let backup = f
            .engine
            .create_backup(BackupTrigger::BeforePerformance, BackupType::Full, &snapshot)
            .await
            .unwrap();

        assert_eq!(backup.record_count, 12);
        assert_eq!(backup.importance, BackupImportance::Critical);
        assert_eq!(backup.retention_until, None);
        assert!(f.fs.get(&f.engine.blob_path(&backup.id)).is_some());
    }

    #[tokio::test]
    async fn test_round_trip_and_byte_flip() {
        let f = fixture(SyncEngineConfig::default()).await;
        let content: String = "[G]Blue moon you saw me standing alone\n"
            .chars()
            .cycle()
            .take(10 * 1024)
            .collect();
        let repo = SqliteSongRepository::new(f.pool.clone());
        repo.insert(&Song::new("Blue Moon", content.clone(), NOW).with_id("song-1"))
            .await
            .unwrap();

        let snapshot = f.engine.capture_snapshot().await.unwrap();
        let backup = f
            .engine
            .create_backup(BackupTrigger::Manual, BackupType::Full, &snapshot)
            .await
            .unwrap();
        assert!(backup.compressed_size < backup.data_size);

        // Lose the song, then restore it twice
        repo.delete("song-1").await.unwrap();
        for _ in 0..2 {
            let restored = f.engine.restore_backup(&backup.id).await.unwrap();
            assert!(restored.success, "{}", restored.message);
            assert_eq!(restored.record_count, 1);
        }
        let song = repo.find_by_id("song-1").await.unwrap().unwrap();
        assert_eq!(song.content, content);

        // One flipped bit fails closed
        repo.delete("song-1").await.unwrap();
        f.fs.corrupt(&f.engine.blob_path(&backup.id), 10);
        let corrupted = f.engine.restore_backup(&backup.id).await.unwrap();
        assert!(!corrupted.success);
        assert_eq!(
            corrupted.message,
            format!("Backup {} is corrupted, checksum mismatch", backup.id)
        );
        assert!(repo.find_by_id("song-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_restore_missing_backup_or_blob() {
        let f = fixture(SyncEngineConfig::default()).await;
        let missing = f.engine.restore_backup("nope").await.unwrap();
        assert!(!missing.success);

        let snapshot = f.engine.capture_snapshot().await.unwrap();
        let backup = f
            .engine
            .create_backup(BackupTrigger::Manual, BackupType::Full, &snapshot)
            .await
            .unwrap();
        f.fs.remove(&f.engine.blob_path(&backup.id));

        let result = f.engine.restore_backup(&backup.id).await.unwrap();
        assert!(!result.success);
        assert!(result.message.contains("unreadable"));
    }

    #[tokio::test]
    async fn test_failed_blob_write_leaves_no_metadata() {
        let f = fixture(SyncEngineConfig::default()).await;
        f.fs.fail_writes_under(f.engine.backup_dir());

        let snapshot = f.engine.capture_snapshot().await.unwrap();
        let result = f
            .engine
            .create_backup(BackupTrigger::Manual, BackupType::Full, &snapshot)
            .await;
        assert!(matches!(result, Err(SyncError::Storage(_))));
        assert!(f.engine.list_backups().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cleanup_deletes_expired_but_keeps_recent_and_critical() {
        let f = fixture(SyncEngineConfig::default().with_backup_limits(2, 50)).await;
        let snapshot = LibrarySnapshot::default();

        let critical = f
            .engine
            .create_backup(BackupTrigger::BeforePerformance, BackupType::Full, &snapshot)
            .await
            .unwrap();
        f.clock.advance(chrono::Duration::hours(2));
        let low = f
            .engine
            .create_backup(BackupTrigger::DataChange, BackupType::Incremental, &snapshot)
            .await
            .unwrap();
        assert_eq!(low.importance, BackupImportance::Low);

        // Both expire-eligible backups are still among the two most recent
        f.clock.advance(chrono::Duration::days(8));
        assert_eq!(f.engine.cleanup_old_backups().await.unwrap().expired, 0);

        for _ in 0..2 {
            f.clock.advance(chrono::Duration::hours(2));
            f.engine
                .create_backup(BackupTrigger::Manual, BackupType::Full, &snapshot)
                .await
                .unwrap();
        }

        let ids: Vec<String> = f
            .engine
            .list_backups()
            .await
            .unwrap()
            .into_iter()
            .map(|b| b.id)
            .collect();
        assert!(ids.contains(&critical.id));
        assert!(!ids.contains(&low.id));
        assert!(f.fs.get(&f.engine.blob_path(&low.id)).is_none());
        assert_eq!(ids.len(), 3);
    }

    #[tokio::test]
    async fn test_cap_evicts_low_importance_first() {
        let f = fixture(SyncEngineConfig::default().with_backup_limits(2, 4)).await;
        let snapshot = LibrarySnapshot::default();

        let mut created = Vec::new();
        for trigger in [
            BackupTrigger::Manual,
            BackupTrigger::DataChange,
            BackupTrigger::BeforePerformance,
            BackupTrigger::DataChange,
            BackupTrigger::Manual,
        ] {
            f.clock.advance(chrono::Duration::minutes(5));
            created.push(
                f.engine
                    .create_backup(trigger, BackupType::Full, &snapshot)
                    .await
                    .unwrap(),
            );
        }

        let remaining: Vec<Backup> = f.engine.list_backups().await.unwrap();
        assert_eq!(remaining.len(), 4);
        // The oldest low backup went first
        assert!(!remaining.iter().any(|b| b.id == created[1].id));
        assert!(remaining.iter().any(|b| b.id == created[2].id));

        let extra = f
            .engine
            .create_backup(BackupTrigger::Manual, BackupType::Full, &snapshot)
            .await
            .unwrap();
        let remaining = f.engine.list_backups().await.unwrap();
        assert_eq!(remaining.len(), 4);
        assert!(remaining.iter().any(|b| b.id == extra.id));
        assert!(!remaining.iter().any(|b| b.id == created[3].id));
    }

    #[tokio::test]
    async fn test_retention_monotonicity() {
        let f = fixture(SyncEngineConfig::default().with_backup_limits(3, 5)).await;
        let snapshot = LibrarySnapshot::default();
        let triggers = [
            BackupTrigger::Scheduled,
            BackupTrigger::BeforePerformance,
            BackupTrigger::DataChange,
            BackupTrigger::Manual,
            BackupTrigger::Scheduled,
            BackupTrigger::Emergency,
        ];

        let mut critical_ids = Vec::new();
        let mut all = Vec::new();
        for round in 0..24 {
            f.clock.advance(chrono::Duration::days(3));
            let backup = f
                .engine
                .create_backup(triggers[round % triggers.len()], BackupType::Full, &snapshot)
                .await
                .unwrap();
            if backup.importance == BackupImportance::Critical {
                assert_eq!(backup.retention_until, None);
                critical_ids.push(backup.id.clone());
            }
            all.push(backup.id);

            let remaining: Vec<String> = f
                .engine
                .list_backups()
                .await
                .unwrap()
                .into_iter()
                .map(|b| b.id)
                .collect();
            for id in &critical_ids {
                assert!(remaining.contains(id));
            }
            for id in all.iter().rev().take(3) {
                assert!(remaining.contains(id));
            }
        }
    }

    #[tokio::test]
    async fn test_restore_record_uses_newest_backup_with_record() {
        let f = fixture(SyncEngineConfig::default()).await;
        let songs = SqliteSongRepository::new(f.pool.clone());
        let setlists = SqliteSetlistRepository::new(f.pool.clone());
        seed_library(&f.pool, 2).await;
        setlists
            .insert(&Setlist::new("Friday gig", Some(NOW + DAY), NOW).with_id("set-1"))
            .await
            .unwrap();
        setlists
            .set_entries("set-1", &["song-0".to_string(), "song-1".to_string()])
            .await
            .unwrap();

        let snapshot = f.engine.capture_snapshot().await.unwrap();
        let backup = f
            .engine
            .create_backup(BackupTrigger::Manual, BackupType::Full, &snapshot)
            .await
            .unwrap();

        setlists.delete("set-1").await.unwrap();
        songs.delete("song-1").await.unwrap();

        let used = f.engine.restore_record("set-1").await.unwrap();
        assert_eq!(used.as_deref(), Some(backup.id.as_str()));
        assert_eq!(setlists.entries("set-1").await.unwrap().len(), 2);
        // Only the requested record came back
        assert!(songs.find_by_id("song-1").await.unwrap().is_none());

        assert_eq!(f.engine.restore_record("unknown").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_latest_backup_before() {
        let f = fixture(SyncEngineConfig::default()).await;
        let snapshot = LibrarySnapshot::default();
        let first = f
            .engine
            .create_backup(BackupTrigger::Manual, BackupType::Full, &snapshot)
            .await
            .unwrap();
        f.clock.advance(chrono::Duration::hours(1));
        let second = f
            .engine
            .create_backup(BackupTrigger::Manual, BackupType::Full, &snapshot)
            .await
            .unwrap();

        assert_eq!(f.engine.latest_backup().await.unwrap().unwrap().id, second.id);
        assert_eq!(
            f.engine
                .latest_backup_before(second.created_at)
                .await
                .unwrap()
                .unwrap()
                .id,
            first.id
        );
        assert!(f
            .engine
            .latest_backup_before(first.created_at)
            .await
            .unwrap()
            .is_none());
        assert!(f.engine.total_backup_bytes().await.unwrap() > 0);
    }
}

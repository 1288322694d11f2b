//! # Data Integrity Engine
//!
//! Verifies library records after a sync and repairs what can be repaired.
//!
//! ## Check Chain
//!
//! Every record runs the same ordered chain and is classified by the first
//! failing check:
//!
//! 1. existence ([`CorruptionType::MissingData`])
//! 2. format ([`CorruptionType::InvalidFormat`])
//! 3. checksum ([`CorruptionType::ChecksumMismatch`])
//! 4. schema ([`CorruptionType::SchemaViolation`])
//!
//! Results are insert-only. Each pass writes one row per record plus an
//! aggregate `integrity_history` row used for health scoring.

use crate::backup::BackupEngine;
use crate::pending::{PendingChangeRepository, SqlitePendingChangeRepository};
use crate::{Result, SyncError};
use bridge_traits::time::Clock;
use core_library::{
    is_valid_key, RecordRef, RecordType, Setlist, SetlistRepository, Song, SongRepository,
    SqliteSetlistRepository, SqliteSongRepository, TEMPO_RANGE,
};
use core_runtime::events::{CoreEvent, EventBus, LibraryEvent, SyncEvent};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool};
use std::str::FromStr;
use std::sync::Arc;
use tracing::{info, instrument, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CorruptionType {
    MissingData,
    InvalidFormat,
    ChecksumMismatch,
    SchemaViolation,
}

impl CorruptionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CorruptionType::MissingData => "missing_data",
            CorruptionType::InvalidFormat => "invalid_format",
            CorruptionType::ChecksumMismatch => "checksum_mismatch",
            CorruptionType::SchemaViolation => "schema_violation",
        }
    }

    /// Checksum mismatches are presumed corruption and go through recovery
    pub fn can_auto_repair(&self) -> bool {
        !matches!(self, CorruptionType::ChecksumMismatch)
    }
}

impl FromStr for CorruptionType {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "missing_data" => Ok(CorruptionType::MissingData),
            "invalid_format" => Ok(CorruptionType::InvalidFormat),
            "checksum_mismatch" => Ok(CorruptionType::ChecksumMismatch),
            "schema_violation" => Ok(CorruptionType::SchemaViolation),
            _ => Err(SyncError::invalid_value("corruption_type", s)),
        }
    }
}

impl std::fmt::Display for CorruptionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntegrityCheckResult {
    pub id: String,
    pub pass_id: String,
    pub record_id: String,
    pub record_type: RecordType,
    pub is_valid: bool,
    pub corruption_type: Option<CorruptionType>,
    pub can_auto_repair: bool,
    pub repaired: bool,
    pub checked_at: i64,
    pub details: Option<String>,
}

#[derive(FromRow)]
struct IntegrityCheckRow {
    id: String,
    pass_id: String,
    record_id: String,
    record_type: String,
    is_valid: bool,
    corruption_type: Option<String>,
    can_auto_repair: bool,
    repaired: bool,
    checked_at: i64,
    details: Option<String>,
}

impl TryFrom<IntegrityCheckRow> for IntegrityCheckResult {
    type Error = SyncError;

    fn try_from(row: IntegrityCheckRow) -> Result<Self> {
        Ok(Self {
            id: row.id,
            pass_id: row.pass_id,
            record_id: row.record_id,
            record_type: row.record_type.parse()?,
            is_valid: row.is_valid,
            corruption_type: row
                .corruption_type
                .as_deref()
                .map(CorruptionType::from_str)
                .transpose()?,
            can_auto_repair: row.can_auto_repair,
            repaired: row.repaired,
            checked_at: row.checked_at,
            details: row.details,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntegrityVerificationResult {
    pub pass_id: String,
    pub total_checked: usize,
    pub valid_count: usize,
    pub corrupted_count: usize,
    pub repaired_count: usize,
    pub results: Vec<IntegrityCheckResult>,
}

impl IntegrityVerificationResult {
    pub fn is_clean(&self) -> bool {
        self.corrupted_count == self.repaired_count
    }

    pub fn corrupted(&self) -> impl Iterator<Item = &IntegrityCheckResult> {
        self.results.iter().filter(|r| !r.is_valid)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct IntegrityHistoryEntry {
    pub id: String,
    pub pass_id: String,
    pub checked_at: i64,
    pub total_checked: i64,
    pub valid_count: i64,
    pub corrupted_count: i64,
    pub repaired_count: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RepairOutcome {
    /// Fixed in place
    Repaired { message: String },
    /// Brought back from a backup snapshot
    RestoredFromBackup { backup_id: String },
    Unrepairable { reason: String },
}

impl RepairOutcome {
    pub fn is_repaired(&self) -> bool {
        !matches!(self, RepairOutcome::Unrepairable { .. })
    }
}

struct Finding {
    corruption: CorruptionType,
    details: String,
}

impl Finding {
    fn new(corruption: CorruptionType, details: impl Into<String>) -> Option<Self> {
        Some(Self {
            corruption,
            details: details.into(),
        })
    }
}

fn song_format_issue(song: &Song) -> Option<String> {
    match serde_json::from_str::<serde_json::Value>(&song.metadata) {
        Ok(value) if value.is_object() => {}
        _ => return Some("Metadata is not a JSON object".to_string()),
    }

    if song.content.contains('\0') {
        return Some("Content contains NUL bytes".to_string());
    }

    None
}

pub struct IntegrityEngine {
    pool: SqlitePool,
    clock: Arc<dyn Clock>,
    event_bus: EventBus,
    backups: Arc<BackupEngine>,
    songs: SqliteSongRepository,
    setlists: SqliteSetlistRepository,
    pending: SqlitePendingChangeRepository,
}

impl IntegrityEngine {
    pub fn new(
        pool: SqlitePool,
        clock: Arc<dyn Clock>,
        event_bus: EventBus,
        backups: Arc<BackupEngine>,
    ) -> Self {
        Self {
            songs: SqliteSongRepository::new(pool.clone()),
            setlists: SqliteSetlistRepository::new(pool.clone()),
            pending: SqlitePendingChangeRepository::new(pool.clone()),
            pool,
            clock,
            event_bus,
            backups,
        }
    }

    async fn check_record(&self, record: &RecordRef) -> Result<Option<Finding>> {
        match record.record_type {
            RecordType::Song => {
                let song = match self.songs.find_by_id(&record.record_id).await? {
                    Some(song) if !song.is_deleted() => song,
                    _ => return Ok(Finding::new(CorruptionType::MissingData, "Song not found")),
                };

                if let Some(issue) = song_format_issue(&song) {
                    return Ok(Finding::new(CorruptionType::InvalidFormat, issue));
                }

                if let Some(stored) = &song.checksum {
                    if *stored != Song::compute_checksum(&song.content) {
                        return Ok(Finding::new(
                            CorruptionType::ChecksumMismatch,
                            "Content does not match stored checksum",
                        ));
                    }
                }

                if let Err(message) = song.validate() {
                    return Ok(Finding::new(CorruptionType::SchemaViolation, message));
                }
            }
            RecordType::Setlist => {
                let setlist = match self.setlists.find_by_id(&record.record_id).await? {
                    Some(setlist) if !setlist.is_deleted() => setlist,
                    _ => return Ok(Finding::new(CorruptionType::MissingData, "Setlist not found")),
                };

                if matches!(setlist.scheduled_for, Some(t) if t < 0) {
                    return Ok(Finding::new(
                        CorruptionType::InvalidFormat,
                        "Scheduled time is negative",
                    ));
                }

                if setlist.name.trim().is_empty() {
                    return Ok(Finding::new(
                        CorruptionType::SchemaViolation,
                        "Setlist name cannot be empty",
                    ));
                }

                let dangling = self.setlists.dangling_entries(&setlist.id).await?;
                if !dangling.is_empty() {
                    return Ok(Finding::new(
                        CorruptionType::SchemaViolation,
                        format!("{} entries reference missing songs", dangling.len()),
                    ));
                }
            }
        }

        Ok(None)
    }

    /// Check each record and persist one pass worth of results
    #[instrument(skip(self, records), fields(records = records.len()))]
    pub async fn verify_after_sync(&self, records: &[RecordRef]) -> Result<IntegrityVerificationResult> {
        self.run_pass(records, false).await
    }

    /// Like [`verify_after_sync`](Self::verify_after_sync), repairing
    /// whatever can be auto-repaired
    #[instrument(skip(self, records), fields(records = records.len()))]
    pub async fn verify_and_repair(&self, records: &[RecordRef]) -> Result<IntegrityVerificationResult> {
        self.run_pass(records, true).await
    }

    async fn run_pass(&self, records: &[RecordRef], repair: bool) -> Result<IntegrityVerificationResult> {
        let pass_id = Uuid::new_v4().to_string();
        let now = self.clock.unix_timestamp();
        let mut results = Vec::with_capacity(records.len());

        for record in records {
            let finding = self.check_record(record).await?;
            let mut result = IntegrityCheckResult {
                id: Uuid::new_v4().to_string(),
                pass_id: pass_id.clone(),
                record_id: record.record_id.clone(),
                record_type: record.record_type,
                is_valid: finding.is_none(),
                corruption_type: finding.as_ref().map(|f| f.corruption),
                can_auto_repair: finding
                    .as_ref()
                    .map(|f| f.corruption.can_auto_repair())
                    .unwrap_or(false),
                repaired: false,
                checked_at: now,
                details: finding.map(|f| f.details),
            };

            if let Some(corruption) = result.corruption_type {
                warn!(
                    record_id = %result.record_id,
                    corruption = %corruption,
                    details = result.details.as_deref().unwrap_or(""),
                    "Integrity check failed"
                );
                self.event_bus
                    .emit(CoreEvent::Sync(SyncEvent::IntegrityIssue {
                        record_id: result.record_id.clone(),
                        corruption_type: corruption.to_string(),
                        can_auto_repair: result.can_auto_repair,
                    }))
                    .ok();

                if repair && result.can_auto_repair {
                    match self
                        .apply_repair(&result.record_id, result.record_type, corruption)
                        .await
                    {
                        Ok(outcome) => result.repaired = outcome.is_repaired(),
                        Err(e) => {
                            warn!(record_id = %result.record_id, error = %e, "Auto-repair failed")
                        }
                    }
                }
            }

            self.insert_result(&result).await?;
            results.push(result);
        }

        let valid_count = results.iter().filter(|r| r.is_valid).count();
        let repaired_count = results.iter().filter(|r| r.repaired).count();
        let verification = IntegrityVerificationResult {
            total_checked: results.len(),
            valid_count,
            corrupted_count: results.len() - valid_count,
            repaired_count,
            pass_id,
            results,
        };

        self.insert_history(&verification, now).await?;

        info!(
            pass_id = %verification.pass_id,
            checked = verification.total_checked,
            corrupted = verification.corrupted_count,
            repaired = verification.repaired_count,
            "Integrity pass complete"
        );

        Ok(verification)
    }

    /// Repair one record and flag its open results as repaired
    #[instrument(skip(self))]
    pub async fn auto_repair(
        &self,
        record_id: &str,
        record_type: RecordType,
        corruption: CorruptionType,
    ) -> Result<RepairOutcome> {
        let outcome = self.apply_repair(record_id, record_type, corruption).await?;

        if outcome.is_repaired() {
            sqlx::query(
                "UPDATE integrity_results SET repaired = 1 WHERE record_id = ? AND is_valid = 0 AND repaired = 0",
            )
            .bind(record_id)
            .execute(&self.pool)
            .await
            .map_err(|e| SyncError::Database(e.to_string()))?;
        }

        Ok(outcome)
    }

    async fn apply_repair(
        &self,
        record_id: &str,
        record_type: RecordType,
        corruption: CorruptionType,
    ) -> Result<RepairOutcome> {
        let now = self.clock.unix_timestamp();

        let outcome = match (corruption, record_type) {
            (CorruptionType::ChecksumMismatch, _) => RepairOutcome::Unrepairable {
                reason: "Checksum mismatch requires recovery from backup".to_string(),
            },
            (CorruptionType::MissingData, _) => match self.backups.restore_record(record_id).await? {
                Some(backup_id) => RepairOutcome::RestoredFromBackup { backup_id },
                None => RepairOutcome::Unrepairable {
                    reason: "No backup contains this record".to_string(),
                },
            },
            (CorruptionType::InvalidFormat, RecordType::Song) => {
                let mut song = self.require_song(record_id).await?;
                if !matches!(
                    serde_json::from_str::<serde_json::Value>(&song.metadata),
                    Ok(value) if value.is_object()
                ) {
                    song.metadata = "{}".to_string();
                }
                song.content = song.content.replace('\0', "");
                self.save_repaired_song(song, now).await?;
                RepairOutcome::Repaired {
                    message: "Reset metadata and stripped invalid bytes".to_string(),
                }
            }
            (CorruptionType::InvalidFormat, RecordType::Setlist) => {
                let mut setlist = self.require_setlist(record_id).await?;
                setlist.scheduled_for = None;
                setlist.local_version += 1;
                setlist.updated_at = now;
                self.setlists.update(&setlist).await?;
                RepairOutcome::Repaired {
                    message: "Cleared invalid schedule".to_string(),
                }
            }
            (CorruptionType::SchemaViolation, RecordType::Song) => {
                let mut song = self.require_song(record_id).await?;
                if song.title.trim().is_empty() {
                    song.title = "Untitled Song".to_string();
                }
                if matches!(song.tempo, Some(t) if !TEMPO_RANGE.contains(&t)) {
                    song.tempo = None;
                }
                if matches!(&song.song_key, Some(k) if !is_valid_key(k)) {
                    song.song_key = None;
                }
                self.save_repaired_song(song, now).await?;
                RepairOutcome::Repaired {
                    message: "Filled defaults for invalid fields".to_string(),
                }
            }
            (CorruptionType::SchemaViolation, RecordType::Setlist) => {
                let mut setlist = self.require_setlist(record_id).await?;
                let dropped = self.setlists.remove_dangling_entries(record_id).await?;
                if setlist.name.trim().is_empty() {
                    setlist.name = "Untitled Setlist".to_string();
                }
                setlist.local_version += 1;
                setlist.updated_at = now;
                self.setlists.update(&setlist).await?;
                RepairOutcome::Repaired {
                    message: format!("Dropped {} dangling entries", dropped),
                }
            }
        };

        if outcome.is_repaired() {
            self.pending.enqueue(record_id, record_type, now).await?;
            let event = match record_type {
                RecordType::Song => LibraryEvent::SongUpdated {
                    song_id: record_id.to_string(),
                },
                RecordType::Setlist => LibraryEvent::SetlistUpdated {
                    setlist_id: record_id.to_string(),
                },
            };
            self.event_bus.emit(CoreEvent::Library(event)).ok();
            info!(record_id, corruption = %corruption, "Record repaired");
        }

        Ok(outcome)
    }

    async fn require_song(&self, record_id: &str) -> Result<Song> {
        self.songs
            .find_by_id(record_id)
            .await?
            .ok_or_else(|| SyncError::not_found("Song", record_id))
    }

    async fn require_setlist(&self, record_id: &str) -> Result<Setlist> {
        self.setlists
            .find_by_id(record_id)
            .await?
            .ok_or_else(|| SyncError::not_found("Setlist", record_id))
    }

    async fn save_repaired_song(&self, mut song: Song, now: i64) -> Result<()> {
        song.refresh_checksum();
        song.local_version += 1;
        song.updated_at = now;
        self.songs.update(&song).await?;
        Ok(())
    }

    async fn insert_result(&self, result: &IntegrityCheckResult) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO integrity_results (
                id, pass_id, record_id, record_type, is_valid, corruption_type,
                can_auto_repair, repaired, checked_at, details
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&result.id)
        .bind(&result.pass_id)
        .bind(&result.record_id)
        .bind(result.record_type.as_str())
        .bind(result.is_valid)
        .bind(result.corruption_type.map(|c| c.as_str()))
        .bind(result.can_auto_repair)
        .bind(result.repaired)
        .bind(result.checked_at)
        .bind(&result.details)
        .execute(&self.pool)
        .await
        .map_err(|e| SyncError::Database(e.to_string()))?;

        Ok(())
    }

    async fn insert_history(&self, verification: &IntegrityVerificationResult, now: i64) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO integrity_history (
                id, pass_id, checked_at, total_checked, valid_count, corrupted_count, repaired_count
            ) VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(Uuid::new_v4().to_string())
        .bind(&verification.pass_id)
        .bind(now)
        .bind(verification.total_checked as i64)
        .bind(verification.valid_count as i64)
        .bind(verification.corrupted_count as i64)
        .bind(verification.repaired_count as i64)
        .execute(&self.pool)
        .await
        .map_err(|e| SyncError::Database(e.to_string()))?;

        Ok(())
    }

    /// Most recent passes, newest first
    pub async fn integrity_history(&self, limit: usize) -> Result<Vec<IntegrityHistoryEntry>> {
        sqlx::query_as::<_, IntegrityHistoryEntry>(
            "SELECT * FROM integrity_history ORDER BY checked_at DESC, rowid DESC LIMIT ?",
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| SyncError::Database(e.to_string()))
    }

    /// Totals of checked and valid records since `since`
    pub async fn totals_since(&self, since: i64) -> Result<(i64, i64)> {
        let (checked, valid): (Option<i64>, Option<i64>) = sqlx::query_as(
            "SELECT SUM(total_checked), SUM(valid_count) FROM integrity_history WHERE checked_at >= ?",
        )
        .bind(since)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| SyncError::Database(e.to_string()))?;

        Ok((checked.unwrap_or(0), valid.unwrap_or(0)))
    }

    /// Invalid, unrepaired results of the newest pass
    pub async fn latest_unrepaired(&self) -> Result<Vec<IntegrityCheckResult>> {
        let rows = sqlx::query_as::<_, IntegrityCheckRow>(
            r#"
            SELECT * FROM integrity_results
            WHERE is_valid = 0 AND repaired = 0 AND pass_id = (
                SELECT pass_id FROM integrity_history ORDER BY checked_at DESC, rowid DESC LIMIT 1
            )
            ORDER BY record_id
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| SyncError::Database(e.to_string()))?;

        rows.into_iter().map(IntegrityCheckResult::try_from).collect()
    }
}

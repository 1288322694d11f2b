//! # Predictive Prefetch Engine
//!
//! Predicts which songs the musician will open next and copies them into a
//! local prefetch cache so they are available offline at the venue.
//!
//! Six independent strategies score candidates; a song reached by several
//! strategies keeps its best score.

use crate::{Result, SyncError};
use bridge_traits::storage::FileSystemAccess;
use bridge_traits::time::Clock;
use bytes::Bytes;
use chrono::{DateTime, Timelike};
use core_library::{
    RecordType, SetlistEntry, SetlistRepository, SongRepository, SongUsage, SqliteSetlistRepository,
    SqliteSongRepository, SqliteUsageRepository, UsageRepository,
};
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

const HOUR: i64 = 3_600;
const DAY: i64 = 86_400;

const SCHEDULED_HORIZON: i64 = 7 * DAY;
const OFFLINE_HORIZON: i64 = DAY;
const RECENT_EDIT_WINDOW: i64 = 48 * HOUR;
const FRESH_EDIT_WINDOW: i64 = 6 * HOUR;
const USAGE_WINDOW: i64 = 30 * DAY;

// ============================================================================
// Types
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PredictionReason {
    UpcomingSetlist,
    RecentlyEdited,
    TimeOfDayPattern,
    FrequentlyUsed,
    NextInSet,
    OfflineWindow,
}

impl PredictionReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            PredictionReason::UpcomingSetlist => "upcoming_setlist",
            PredictionReason::RecentlyEdited => "recently_edited",
            PredictionReason::TimeOfDayPattern => "time_of_day_pattern",
            PredictionReason::FrequentlyUsed => "frequently_used",
            PredictionReason::NextInSet => "next_in_set",
            PredictionReason::OfflineWindow => "offline_window",
        }
    }
}

impl FromStr for PredictionReason {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "upcoming_setlist" => Ok(PredictionReason::UpcomingSetlist),
            "recently_edited" => Ok(PredictionReason::RecentlyEdited),
            "time_of_day_pattern" => Ok(PredictionReason::TimeOfDayPattern),
            "frequently_used" => Ok(PredictionReason::FrequentlyUsed),
            "next_in_set" => Ok(PredictionReason::NextInSet),
            "offline_window" => Ok(PredictionReason::OfflineWindow),
            _ => Err(SyncError::invalid_value("prediction_reason", s)),
        }
    }
}

impl std::fmt::Display for PredictionReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Candidate produced by a single strategy
#[derive(Debug, Clone, PartialEq)]
pub struct Prediction {
    pub song_id: String,
    pub score: f64,
    pub reason: PredictionReason,
    /// When the song is expected to be needed
    pub predicted_time: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictedSongUsage {
    pub song_id: String,
    pub prediction_score: f64,
    pub prediction_reason: PredictionReason,
    pub predicted_time: i64,
    pub is_prefetched: bool,
    pub created_at: i64,
}

#[derive(FromRow)]
struct PredictedSongUsageRow {
    song_id: String,
    prediction_score: f64,
    prediction_reason: String,
    predicted_time: i64,
    is_prefetched: bool,
    created_at: i64,
}

impl TryFrom<PredictedSongUsageRow> for PredictedSongUsage {
    type Error = SyncError;

    fn try_from(row: PredictedSongUsageRow) -> Result<Self> {
        Ok(Self {
            song_id: row.song_id,
            prediction_score: row.prediction_score,
            prediction_reason: row.prediction_reason.parse()?,
            predicted_time: row.predicted_time,
            is_prefetched: row.is_prefetched,
            created_at: row.created_at,
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrefetchReport {
    pub prefetched: usize,
    pub failed: usize,
}

/// Keep the best-scoring candidate per song, ordered by score then id
pub fn merge_predictions(candidates: Vec<Prediction>, limit: usize) -> Vec<Prediction> {
    let mut best: HashMap<String, Prediction> = HashMap::new();
    for candidate in candidates {
        match best.get(&candidate.song_id) {
            Some(existing) if existing.score >= candidate.score => {}
            _ => {
                best.insert(candidate.song_id.clone(), candidate);
            }
        }
    }

    let mut merged: Vec<Prediction> = best.into_values().collect();
    merged.sort_by(|a, b| {
        b.score
            .total_cmp(&a.score)
            .then_with(|| a.song_id.cmp(&b.song_id))
    });
    merged.truncate(limit);
    merged
}

/// Hour of day (UTC) of a unix timestamp
fn hour_of_day(timestamp: i64) -> i64 {
    DateTime::from_timestamp(timestamp, 0)
        .map(|dt| dt.hour() as i64)
        .unwrap_or(0)
}

/// Distance between two hours on a 24-hour dial
fn hour_distance(a: i64, b: i64) -> i64 {
    let diff = (a - b).rem_euclid(24);
    diff.min(24 - diff)
}

// ============================================================================
// Engine
// ============================================================================

pub struct PrefetchEngine {
    pool: SqlitePool,
    clock: Arc<dyn Clock>,
    file_system: Arc<dyn FileSystemAccess>,
    prefetch_dir: PathBuf,
    concurrency: usize,
    songs: SqliteSongRepository,
    setlists: SqliteSetlistRepository,
    usage: SqliteUsageRepository,
}

impl PrefetchEngine {
    pub fn new(
        pool: SqlitePool,
        clock: Arc<dyn Clock>,
        file_system: Arc<dyn FileSystemAccess>,
        data_dir: &Path,
        concurrency: usize,
    ) -> Self {
        Self {
            songs: SqliteSongRepository::new(pool.clone()),
            setlists: SqliteSetlistRepository::new(pool.clone()),
            usage: SqliteUsageRepository::new(pool.clone()),
            pool,
            clock,
            file_system,
            prefetch_dir: data_dir.join("prefetch"),
            concurrency: concurrency.max(1),
        }
    }

    pub fn prefetch_dir(&self) -> &Path {
        &self.prefetch_dir
    }

    pub fn cache_path(&self, song_id: &str) -> PathBuf {
        self.prefetch_dir.join(format!("{}.json", song_id))
    }

    /// Log that a song was opened; feeds the usage-based strategies
    pub async fn record_usage(&self, song_id: &str, context: Option<String>) -> Result<SongUsage> {
        let usage = SongUsage::new(song_id, self.clock.unix_timestamp(), context);
        self.usage.record(&usage).await?;
        Ok(usage)
    }

    /// Score candidates and replace the stored predictions with the top `limit`
    #[instrument(skip(self))]
    pub async fn predict_upcoming_songs(&self, limit: usize) -> Result<Vec<PredictedSongUsage>> {
        let now = self.clock.unix_timestamp();

        let mut candidates = Vec::new();
        candidates.extend(self.upcoming_setlists(now).await?);
        candidates.extend(self.recently_edited(now).await?);

        let usage = self.usage.since(now - USAGE_WINDOW).await?;
        candidates.extend(time_of_day_pattern(&usage, now));
        candidates.extend(self.frequently_used(now).await?);
        candidates.extend(self.next_in_set(now).await?);
        candidates.extend(self.offline_window(now).await?);

        let live: HashSet<String> = self
            .songs
            .list_active()
            .await?
            .into_iter()
            .map(|s| s.id)
            .collect();
        candidates.retain(|c| live.contains(&c.song_id));

        let top = merge_predictions(candidates, limit);
        let stored: Vec<PredictedSongUsage> = top
            .into_iter()
            .map(|p| PredictedSongUsage {
                song_id: p.song_id,
                prediction_score: p.score,
                prediction_reason: p.reason,
                predicted_time: p.predicted_time,
                is_prefetched: false,
                created_at: now,
            })
            .collect();

        self.replace_predictions(&stored).await?;
        debug!(count = stored.len(), "Predictions refreshed");
        Ok(stored)
    }

    async fn upcoming_setlists(&self, now: i64) -> Result<Vec<Prediction>> {
        let mut out = Vec::new();
        for setlist in self
            .setlists
            .scheduled_between(now, now + SCHEDULED_HORIZON)
            .await?
        {
            let Some(at) = setlist.scheduled_for else {
                continue;
            };
            let days_until = (at - now) / DAY;
            let score = (0.9 - 0.1 * days_until as f64).max(0.3);

            for entry in self.setlists.entries(&setlist.id).await? {
                out.push(Prediction {
                    song_id: entry.song_id,
                    score,
                    reason: PredictionReason::UpcomingSetlist,
                    predicted_time: at,
                });
            }
        }
        Ok(out)
    }

    async fn recently_edited(&self, now: i64) -> Result<Vec<Prediction>> {
        let rows: Vec<(String, i64)> = sqlx::query_as(
            r#"
            SELECT record_id, MAX(edited_at) FROM edit_activity
            WHERE record_type = ? AND edited_at >= ?
            GROUP BY record_id
            "#,
        )
        .bind(RecordType::Song.as_str())
        .bind(now - RECENT_EDIT_WINDOW)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| SyncError::Database(e.to_string()))?;

        Ok(rows
            .into_iter()
            .map(|(song_id, edited_at)| Prediction {
                song_id,
                score: if now - edited_at <= FRESH_EDIT_WINDOW { 0.8 } else { 0.6 },
                reason: PredictionReason::RecentlyEdited,
                predicted_time: now,
            })
            .collect())
    }

    async fn frequently_used(&self, now: i64) -> Result<Vec<Prediction>> {
        let counts = self.usage.counts_since(now - USAGE_WINDOW).await?;
        let Some(max) = counts.iter().map(|(_, n)| *n).max() else {
            return Ok(Vec::new());
        };

        Ok(counts
            .into_iter()
            .map(|(song_id, count)| Prediction {
                song_id,
                score: 0.5 * count as f64 / max as f64,
                reason: PredictionReason::FrequentlyUsed,
                predicted_time: now,
            })
            .collect())
    }

    async fn next_in_set(&self, now: i64) -> Result<Vec<Prediction>> {
        let Some(last) = self.usage.most_recent().await? else {
            return Ok(Vec::new());
        };

        let entries = self.setlists.all_entries().await?;
        let mut by_setlist: HashMap<&str, Vec<&SetlistEntry>> = HashMap::new();
        for entry in &entries {
            by_setlist.entry(entry.setlist_id.as_str()).or_default().push(entry);
        }

        let mut out = Vec::new();
        for ordered in by_setlist.values() {
            // Entries arrive ordered by position within each setlist
            for pair in ordered.windows(2) {
                if pair[0].song_id == last.song_id && pair[1].song_id != last.song_id {
                    out.push(Prediction {
                        song_id: pair[1].song_id.clone(),
                        score: 0.75,
                        reason: PredictionReason::NextInSet,
                        predicted_time: now,
                    });
                }
            }
        }
        Ok(out)
    }

    async fn offline_window(&self, now: i64) -> Result<Vec<Prediction>> {
        let mut out = Vec::new();
        for setlist in self
            .setlists
            .scheduled_between(now, now + OFFLINE_HORIZON)
            .await?
        {
            let at = setlist.scheduled_for.unwrap_or(now);
            for entry in self.setlists.entries(&setlist.id).await? {
                out.push(Prediction {
                    song_id: entry.song_id,
                    score: 0.95,
                    reason: PredictionReason::OfflineWindow,
                    predicted_time: at,
                });
            }
        }
        Ok(out)
    }

    async fn replace_predictions(&self, predictions: &[PredictedSongUsage]) -> Result<()> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| SyncError::Database(e.to_string()))?;

        sqlx::query("DELETE FROM predicted_song_usage")
            .execute(&mut *tx)
            .await
            .map_err(|e| SyncError::Database(e.to_string()))?;

        for p in predictions {
            sqlx::query(
                r#"
                INSERT INTO predicted_song_usage (
                    song_id, prediction_score, prediction_reason, predicted_time,
                    is_prefetched, created_at
                ) VALUES (?, ?, ?, ?, 0, ?)
                "#,
            )
            .bind(&p.song_id)
            .bind(p.prediction_score)
            .bind(p.prediction_reason.as_str())
            .bind(p.predicted_time)
            .bind(p.created_at)
            .execute(&mut *tx)
            .await
            .map_err(|e| SyncError::Database(e.to_string()))?;
        }

        tx.commit()
            .await
            .map_err(|e| SyncError::Database(e.to_string()))?;
        Ok(())
    }

    /// Stored predictions, best first
    pub async fn predictions(&self) -> Result<Vec<PredictedSongUsage>> {
        let rows = sqlx::query_as::<_, PredictedSongUsageRow>(
            "SELECT * FROM predicted_song_usage ORDER BY prediction_score DESC, song_id",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| SyncError::Database(e.to_string()))?;

        rows.into_iter().map(PredictedSongUsage::try_from).collect()
    }

    /// Copy every not-yet-prefetched predicted song into the prefetch cache
    #[instrument(skip(self))]
    pub async fn prefetch_predicted_songs(&self) -> Result<PrefetchReport> {
        let pending: Vec<String> = self
            .predictions()
            .await?
            .into_iter()
            .filter(|p| !p.is_prefetched)
            .map(|p| p.song_id)
            .collect();

        if pending.is_empty() {
            return Ok(PrefetchReport::default());
        }

        self.file_system
            .create_dir_all(&self.prefetch_dir)
            .await
            .map_err(|e| SyncError::Storage(e.to_string()))?;

        let outcomes: Vec<(String, Result<()>)> = stream::iter(pending)
            .map(|song_id| async move {
                let outcome = self.prefetch_one(&song_id).await;
                (song_id, outcome)
            })
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        let mut report = PrefetchReport::default();
        for (song_id, outcome) in outcomes {
            match outcome {
                Ok(()) => {
                    self.mark_prefetched(&song_id).await?;
                    report.prefetched += 1;
                }
                Err(e) => {
                    warn!(song_id = %song_id, error = %e, "Prefetch failed");
                    report.failed += 1;
                }
            }
        }

        info!(
            prefetched = report.prefetched,
            failed = report.failed,
            "Prefetch finished"
        );
        Ok(report)
    }

    async fn prefetch_one(&self, song_id: &str) -> Result<()> {
        let song = self
            .songs
            .find_by_id(song_id)
            .await?
            .filter(|s| !s.is_deleted())
            .ok_or_else(|| SyncError::not_found("Song", song_id))?;

        let json = serde_json::to_vec(&song).map_err(|e| SyncError::Serialization(e.to_string()))?;
        self.file_system
            .write_file(&self.cache_path(song_id), Bytes::from(json))
            .await
            .map_err(|e| SyncError::Storage(e.to_string()))
    }

    async fn mark_prefetched(&self, song_id: &str) -> Result<()> {
        sqlx::query("UPDATE predicted_song_usage SET is_prefetched = 1 WHERE song_id = ?")
            .bind(song_id)
            .execute(&self.pool)
            .await
            .map_err(|e| SyncError::Database(e.to_string()))?;
        Ok(())
    }
}

/// Songs used at least twice within an hour of the current time of day
fn time_of_day_pattern(usage: &[SongUsage], now: i64) -> Vec<Prediction> {
    let current = hour_of_day(now);
    let mut counts: HashMap<&str, usize> = HashMap::new();
    for u in usage {
        if hour_distance(hour_of_day(u.used_at), current) <= 1 {
            *counts.entry(u.song_id.as_str()).or_default() += 1;
        }
    }

    counts
        .into_iter()
        .filter(|(_, n)| *n >= 2)
        .map(|(song_id, n)| Prediction {
            song_id: song_id.to_string(),
            score: (0.2 * n as f64).min(0.7),
            reason: PredictionReason::TimeOfDayPattern,
            predicted_time: now,
        })
        .collect()
}

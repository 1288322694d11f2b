//! # Sync Insights Engine
//!
//! Scores sync health over a trailing window and turns the same signals into
//! human-readable optimization tips.
//!
//! ## Health Score
//!
//! Five components, each 0 to 100:
//!
//! | Component | Source |
//! |---|---|
//! | reliability | successful runs / runs |
//! | integrity | valid / checked records from integrity passes |
//! | network efficiency | original bytes vs. transferred bytes, 2:1 scores 100 |
//! | backup coverage | age of the newest backup |
//! | conflict rate | conflicts per record synced |
//!
//! Windows without data score as healthy. The overall score weights them
//! 30/30/20/15/5, with the conflict rate inverted.

use crate::backup::BackupEngine;
use crate::config::{secs, SyncEngineConfig};
use crate::integrity::IntegrityEngine;
use crate::network::NetworkOptimizer;
use crate::statistics::{
    SqliteSyncStatisticsRepository, SyncStatisticsRecord, SyncStatisticsRepository,
};
use crate::{Result, SyncError};
use bridge_traits::time::Clock;
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument};
use uuid::Uuid;

const DAY: i64 = 86_400;
const FRESH_BACKUP_AGE: i64 = DAY;
const STALE_BACKUP_AGE: i64 = 7 * DAY;
const MIN_COMPRESSION_SAMPLES: i64 = 5;
const POOR_COMPRESSION_RATIO: f64 = 1.2;
const ACTIVE_EDITING_SHARE: f64 = 0.3;
const CONFLICT_WARNING_RATE: f64 = 10.0;
const CONFLICT_CRITICAL_RATE: f64 = 25.0;

// ============================================================================
// Types
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct SyncHealthScore {
    pub id: String,
    pub overall: f64,
    pub reliability: f64,
    pub integrity: f64,
    pub network_efficiency: f64,
    pub backup_coverage: f64,
    pub conflict_rate: f64,
    pub calculated_at: i64,
}

impl SyncHealthScore {
    pub fn new(
        reliability: f64,
        integrity: f64,
        network_efficiency: f64,
        backup_coverage: f64,
        conflict_rate: f64,
        calculated_at: i64,
    ) -> Self {
        let overall = 0.30 * reliability
            + 0.30 * integrity
            + 0.20 * network_efficiency
            + 0.15 * backup_coverage
            + 0.05 * (100.0 - conflict_rate);

        Self {
            id: Uuid::new_v4().to_string(),
            overall: overall.clamp(0.0, 100.0),
            reliability,
            integrity,
            network_efficiency,
            backup_coverage,
            conflict_rate,
            calculated_at,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TipCategory {
    Storage,
    Compression,
    Timing,
    Conflicts,
    Backups,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum TipSeverity {
    Info,
    Warning,
    Critical,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OptimizationTip {
    pub category: TipCategory,
    pub severity: TipSeverity,
    pub title: String,
    pub message: String,
}

impl OptimizationTip {
    fn new(
        category: TipCategory,
        severity: TipSeverity,
        title: &str,
        message: impl Into<String>,
    ) -> Self {
        Self {
            category,
            severity,
            title: title.to_string(),
            message: message.into(),
        }
    }
}

/// Percentage of `part` in `whole`, `empty` when `whole` is zero
fn percent(part: f64, whole: f64, empty: f64) -> f64 {
    if whole <= 0.0 {
        empty
    } else {
        (100.0 * part / whole).clamp(0.0, 100.0)
    }
}

/// 100 up to a day old, falling linearly to 0 at a week
pub fn backup_coverage(last_backup_at: Option<i64>, now: i64, has_runs: bool) -> f64 {
    if !has_runs {
        return 100.0;
    }
    let Some(at) = last_backup_at else {
        return 0.0;
    };

    let age = (now - at).max(0);
    if age <= FRESH_BACKUP_AGE {
        100.0
    } else if age >= STALE_BACKUP_AGE {
        0.0
    } else {
        100.0 * (STALE_BACKUP_AGE - age) as f64 / (STALE_BACKUP_AGE - FRESH_BACKUP_AGE) as f64
    }
}

fn conflict_rate(runs: &[SyncStatisticsRecord]) -> f64 {
    let conflicts: i64 = runs.iter().map(|r| r.conflicts_detected).sum();
    let records: i64 = runs.iter().map(|r| r.records_synced).sum();
    percent(conflicts as f64, records as f64, 0.0)
}

// ============================================================================
// Engine
// ============================================================================

pub struct InsightsEngine {
    pool: SqlitePool,
    clock: Arc<dyn Clock>,
    backups: Arc<BackupEngine>,
    integrity: Arc<IntegrityEngine>,
    network: Arc<NetworkOptimizer>,
    statistics: SqliteSyncStatisticsRepository,
    window: Duration,
    cache_ttl: Duration,
    storage_budget: u64,
}

impl InsightsEngine {
    pub fn new(
        pool: SqlitePool,
        clock: Arc<dyn Clock>,
        backups: Arc<BackupEngine>,
        integrity: Arc<IntegrityEngine>,
        network: Arc<NetworkOptimizer>,
        config: &SyncEngineConfig,
    ) -> Self {
        Self {
            statistics: SqliteSyncStatisticsRepository::new(pool.clone()),
            pool,
            clock,
            backups,
            integrity,
            network,
            window: config.health_window,
            cache_ttl: config.health_cache_ttl,
            storage_budget: config.storage_budget_bytes,
        }
    }

    fn window_start(&self, now: i64) -> i64 {
        now - secs(self.window)
    }

    /// Recompute the score from scratch and persist it
    #[instrument(skip(self))]
    pub async fn calculate_sync_health_score(&self) -> Result<SyncHealthScore> {
        let now = self.clock.unix_timestamp();
        let since = self.window_start(now);
        let runs = self.statistics.list_since(Some(since)).await?;

        let successful = runs.iter().filter(|r| r.success).count();
        let reliability = percent(successful as f64, runs.len() as f64, 100.0);

        let (checked, valid) = self.integrity.totals_since(since).await?;
        let integrity = percent(valid as f64, checked as f64, 100.0);

        let original: i64 = runs.iter().map(|r| r.bytes_original).sum();
        let transferred: i64 = runs.iter().map(|r| r.bytes_transferred).sum();
        let network_efficiency = percent(original as f64, 2.0 * transferred as f64, 100.0);

        let last_backup = self.backups.latest_backup().await?.map(|b| b.created_at);
        let coverage = backup_coverage(last_backup, now, !runs.is_empty());

        let score = SyncHealthScore::new(
            reliability,
            integrity,
            network_efficiency,
            coverage,
            conflict_rate(&runs),
            now,
        );

        sqlx::query(
            r#"
            INSERT INTO sync_health_scores (
                id, overall, reliability, integrity, network_efficiency,
                backup_coverage, conflict_rate, calculated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&score.id)
        .bind(score.overall)
        .bind(score.reliability)
        .bind(score.integrity)
        .bind(score.network_efficiency)
        .bind(score.backup_coverage)
        .bind(score.conflict_rate)
        .bind(score.calculated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| SyncError::Database(e.to_string()))?;

        debug!(overall = score.overall, runs = runs.len(), "Health score calculated");
        Ok(score)
    }

    /// Latest persisted score if still fresh, otherwise a new one
    pub async fn get_sync_health_score(&self) -> Result<SyncHealthScore> {
        let now = self.clock.unix_timestamp();
        let cached = sqlx::query_as::<_, SyncHealthScore>(
            "SELECT * FROM sync_health_scores ORDER BY calculated_at DESC, rowid DESC LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| SyncError::Database(e.to_string()))?;

        match cached {
            Some(score) if now - score.calculated_at < secs(self.cache_ttl) => Ok(score),
            _ => self.calculate_sync_health_score().await,
        }
    }

    #[instrument(skip(self))]
    pub async fn generate_optimization_tips(&self) -> Result<Vec<OptimizationTip>> {
        let now = self.clock.unix_timestamp();
        let since = self.window_start(now);
        let mut tips = Vec::new();

        let used = self.backups.total_backup_bytes().await?;
        if used > self.storage_budget {
            let severity = if used > self.storage_budget.saturating_mul(2) {
                TipSeverity::Critical
            } else {
                TipSeverity::Warning
            };
            tips.push(OptimizationTip::new(
                TipCategory::Storage,
                severity,
                "Backups use too much space",
                format!(
                    "Backups take {} MB against a budget of {} MB. Fewer retained backups would free space.",
                    used / (1024 * 1024),
                    self.storage_budget / (1024 * 1024)
                ),
            ));
        }

        let (ratio, samples) = self.network.compression_summary(since).await?;
        if samples >= MIN_COMPRESSION_SAMPLES && ratio < POOR_COMPRESSION_RATIO {
            tips.push(OptimizationTip::new(
                TipCategory::Compression,
                TipSeverity::Info,
                "Changes compress poorly",
                format!(
                    "Recent changes average a {:.2}:1 ratio over {} transfers. Larger edits per sync compress better.",
                    ratio, samples
                ),
            ));
        }

        let runs = self.statistics.list_since(Some(since)).await?;
        if !runs.is_empty() {
            let busy = runs.iter().filter(|r| r.during_active_editing).count();
            let share = busy as f64 / runs.len() as f64;
            if share > ACTIVE_EDITING_SHARE {
                tips.push(OptimizationTip::new(
                    TipCategory::Timing,
                    TipSeverity::Info,
                    "Syncs often run while editing",
                    format!(
                        "{:.0}% of syncs started during an editing session. Syncing between edits lowers conflict risk.",
                        share * 100.0
                    ),
                ));
            }
        }

        let rate = conflict_rate(&runs);
        if rate > CONFLICT_WARNING_RATE {
            let severity = if rate > CONFLICT_CRITICAL_RATE {
                TipSeverity::Critical
            } else {
                TipSeverity::Warning
            };
            tips.push(OptimizationTip::new(
                TipCategory::Conflicts,
                severity,
                "Frequent conflicts",
                format!(
                    "{:.0}% of synced records hit a conflict. Edit locks keep devices from overwriting each other.",
                    rate
                ),
            ));
        }

        match self.backups.latest_backup().await? {
            None => tips.push(OptimizationTip::new(
                TipCategory::Backups,
                TipSeverity::Warning,
                "No backups yet",
                "Create a backup before the next performance.",
            )),
            Some(b) if now - b.created_at > STALE_BACKUP_AGE => tips.push(OptimizationTip::new(
                TipCategory::Backups,
                TipSeverity::Warning,
                "Backups are out of date",
                format!(
                    "The newest backup is {} days old.",
                    (now - b.created_at) / DAY
                ),
            )),
            Some(_) => {}
        }

        Ok(tips)
    }
}

//! Per-run sync statistics and period summaries

use crate::{Result, SyncError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool};
use std::str::FromStr;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StatisticsPeriod {
    Day,
    Week,
    Month,
    AllTime,
}

impl StatisticsPeriod {
    pub fn as_str(&self) -> &'static str {
        match self {
            StatisticsPeriod::Day => "day",
            StatisticsPeriod::Week => "week",
            StatisticsPeriod::Month => "month",
            StatisticsPeriod::AllTime => "all_time",
        }
    }

    /// First timestamp covered by the period, `None` for all time
    pub fn start(&self, now: i64) -> Option<i64> {
        const DAY: i64 = 86_400;
        match self {
            StatisticsPeriod::Day => Some(now - DAY),
            StatisticsPeriod::Week => Some(now - 7 * DAY),
            StatisticsPeriod::Month => Some(now - 30 * DAY),
            StatisticsPeriod::AllTime => None,
        }
    }
}

impl FromStr for StatisticsPeriod {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "day" => Ok(StatisticsPeriod::Day),
            "week" => Ok(StatisticsPeriod::Week),
            "month" => Ok(StatisticsPeriod::Month),
            "all_time" => Ok(StatisticsPeriod::AllTime),
            _ => Err(SyncError::invalid_value("period", s)),
        }
    }
}

impl std::fmt::Display for StatisticsPeriod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One row per sync run, written by the statistics stage
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct SyncStatisticsRecord {
    pub id: String,
    pub user_id: String,
    pub started_at: i64,
    pub completed_at: i64,
    pub duration_ms: i64,
    pub success: bool,
    /// Last stage reached
    pub stage: String,
    pub records_synced: i64,
    pub bytes_original: i64,
    pub bytes_transferred: i64,
    pub conflicts_detected: i64,
    pub conflicts_resolved: i64,
    pub backups_created: i64,
    pub during_active_editing: bool,
    pub error_message: Option<String>,
}

impl SyncStatisticsRecord {
    pub fn new(user_id: impl Into<String>, started_at: i64) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            user_id: user_id.into(),
            started_at,
            completed_at: started_at,
            duration_ms: 0,
            success: false,
            stage: String::new(),
            records_synced: 0,
            bytes_original: 0,
            bytes_transferred: 0,
            conflicts_detected: 0,
            conflicts_resolved: 0,
            backups_created: 0,
            during_active_editing: false,
            error_message: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncStatisticsSummary {
    pub total_syncs: u64,
    pub successful_syncs: u64,
    pub failed_syncs: u64,
    /// 0.0 to 1.0; 0.0 with no runs
    pub success_rate: f64,
    pub average_duration_ms: f64,
    pub records_synced: u64,
    pub bytes_original: u64,
    pub bytes_transferred: u64,
    pub bytes_saved: u64,
    pub conflicts_detected: u64,
    pub conflicts_resolved: u64,
    pub backups_created: u64,
    pub last_sync_at: Option<i64>,
}

impl SyncStatisticsSummary {
    pub fn from_records(records: &[SyncStatisticsRecord]) -> Self {
        let mut summary = Self::default();
        let mut total_duration = 0i64;

        for r in records {
            summary.total_syncs += 1;
            if r.success {
                summary.successful_syncs += 1;
            } else {
                summary.failed_syncs += 1;
            }
            total_duration += r.duration_ms;
            summary.records_synced += r.records_synced.max(0) as u64;
            summary.bytes_original += r.bytes_original.max(0) as u64;
            summary.bytes_transferred += r.bytes_transferred.max(0) as u64;
            summary.conflicts_detected += r.conflicts_detected.max(0) as u64;
            summary.conflicts_resolved += r.conflicts_resolved.max(0) as u64;
            summary.backups_created += r.backups_created.max(0) as u64;
            summary.last_sync_at = summary.last_sync_at.max(Some(r.completed_at));
        }

        if summary.total_syncs > 0 {
            summary.success_rate = summary.successful_syncs as f64 / summary.total_syncs as f64;
            summary.average_duration_ms = total_duration as f64 / summary.total_syncs as f64;
        }
        summary.bytes_saved = summary
            .bytes_original
            .saturating_sub(summary.bytes_transferred);
        summary
    }
}

#[async_trait]
pub trait SyncStatisticsRepository: Send + Sync {
    async fn insert(&self, record: &SyncStatisticsRecord) -> Result<()>;

    /// Runs started at or after `since` (all runs for `None`), oldest first
    async fn list_since(&self, since: Option<i64>) -> Result<Vec<SyncStatisticsRecord>>;

    async fn last_successful(&self, user_id: &str) -> Result<Option<SyncStatisticsRecord>>;
}

pub struct SqliteSyncStatisticsRepository {
    pool: SqlitePool,
}

impl SqliteSyncStatisticsRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SyncStatisticsRepository for SqliteSyncStatisticsRepository {
    async fn insert(&self, record: &SyncStatisticsRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO sync_statistics (
                id, user_id, started_at, completed_at, duration_ms, success, stage,
                records_synced, bytes_original, bytes_transferred, conflicts_detected,
                conflicts_resolved, backups_created, during_active_editing, error_message
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&record.id)
        .bind(&record.user_id)
        .bind(record.started_at)
        .bind(record.completed_at)
        .bind(record.duration_ms)
        .bind(record.success)
        .bind(&record.stage)
        .bind(record.records_synced)
        .bind(record.bytes_original)
        .bind(record.bytes_transferred)
        .bind(record.conflicts_detected)
        .bind(record.conflicts_resolved)
        .bind(record.backups_created)
        .bind(record.during_active_editing)
        .bind(&record.error_message)
        .execute(&self.pool)
        .await
        .map_err(|e| SyncError::Database(e.to_string()))?;

        Ok(())
    }

    async fn list_since(&self, since: Option<i64>) -> Result<Vec<SyncStatisticsRecord>> {
        sqlx::query_as::<_, SyncStatisticsRecord>(
            "SELECT * FROM sync_statistics WHERE started_at >= ? ORDER BY started_at, rowid",
        )
        .bind(since.unwrap_or(i64::MIN))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| SyncError::Database(e.to_string()))
    }

    async fn last_successful(&self, user_id: &str) -> Result<Option<SyncStatisticsRecord>> {
        sqlx::query_as::<_, SyncStatisticsRecord>(
            r#"
            SELECT * FROM sync_statistics
            WHERE user_id = ? AND success = 1
            ORDER BY completed_at DESC, rowid DESC
            LIMIT 1
            "#,
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| SyncError::Database(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core_library::db::create_test_pool;

    const NOW: i64 = 1_700_000_000;

    fn run(user: &str, started_at: i64, success: bool) -> SyncStatisticsRecord {
        SyncStatisticsRecord {
            completed_at: started_at + 2,
            duration_ms: 2_000,
            success,
            stage: "health_score_refresh".to_string(),
            records_synced: 3,
            bytes_original: 900,
            bytes_transferred: 300,
            conflicts_detected: 1,
            ..SyncStatisticsRecord::new(user, started_at)
        }
    }

    #[test]
    fn test_empty_summary() {
        let summary = SyncStatisticsSummary::from_records(&[]);
        assert_eq!(summary.total_syncs, 0);
        assert_eq!(summary.success_rate, 0.0);
        assert_eq!(summary.last_sync_at, None);
    }

    #[tokio::test]
    async fn test_summary_by_period() {
        let pool = create_test_pool().await.unwrap();
        let repo = SqliteSyncStatisticsRepository::new(pool);

        repo.insert(&run("u", NOW - 10 * 86_400, true)).await.unwrap();
        repo.insert(&run("u", NOW - 3_600, true)).await.unwrap();
        let mut failed = run("u", NOW - 60, false);
        failed.bytes_transferred = 0;
        failed.records_synced = 0;
        repo.insert(&failed).await.unwrap();

        let day = SyncStatisticsSummary::from_records(
            &repo.list_since(StatisticsPeriod::Day.start(NOW)).await.unwrap(),
        );
        assert_eq!(day.total_syncs, 2);
        assert_eq!(day.successful_syncs, 1);
        assert_eq!(day.failed_syncs, 1);
        assert_eq!(day.success_rate, 0.5);
        assert_eq!(day.average_duration_ms, 2_000.0);
        assert_eq!(day.records_synced, 3);
        assert_eq!(day.bytes_original, 1_800);
        assert_eq!(day.bytes_transferred, 300);
        assert_eq!(day.bytes_saved, 1_500);
        assert_eq!(day.last_sync_at, Some(NOW - 58));

        let all = SyncStatisticsSummary::from_records(
            &repo.list_since(StatisticsPeriod::AllTime.start(NOW)).await.unwrap(),
        );
        assert_eq!(all.total_syncs, 3);

        let last = repo.last_successful("u").await.unwrap().unwrap();
        assert_eq!(last.started_at, NOW - 3_600);
        assert!(repo.last_successful("other").await.unwrap().is_none());
    }
}

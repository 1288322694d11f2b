//! Song usage history repository

use crate::error::Result;
use crate::models::SongUsage;
use async_trait::async_trait;
use sqlx::{query, query_as, SqlitePool};

#[async_trait]
pub trait UsageRepository: Send + Sync {
    /// Append a usage record
    async fn record(&self, usage: &SongUsage) -> Result<()>;

    /// Usage records at or after `since`, oldest first
    async fn since(&self, since: i64) -> Result<Vec<SongUsage>>;

    /// Per-song usage counts at or after `since`, most used first
    async fn counts_since(&self, since: i64) -> Result<Vec<(String, i64)>>;

    /// The most recent usage record, if any
    async fn most_recent(&self) -> Result<Option<SongUsage>>;
}

pub struct SqliteUsageRepository {
    pool: SqlitePool,
}

impl SqliteUsageRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl UsageRepository for SqliteUsageRepository {
    async fn record(&self, usage: &SongUsage) -> Result<()> {
        query("INSERT INTO song_usage (id, song_id, used_at, context) VALUES (?, ?, ?, ?)")
            .bind(&usage.id)
            .bind(&usage.song_id)
            .bind(usage.used_at)
            .bind(&usage.context)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn since(&self, since: i64) -> Result<Vec<SongUsage>> {
        let usage = query_as::<_, SongUsage>(
            "SELECT * FROM song_usage WHERE used_at >= ? ORDER BY used_at, id",
        )
        .bind(since)
        .fetch_all(&self.pool)
        .await?;

        Ok(usage)
    }

    async fn counts_since(&self, since: i64) -> Result<Vec<(String, i64)>> {
        let counts: Vec<(String, i64)> = query_as(
            r#"
            SELECT song_id, COUNT(*) AS uses FROM song_usage
            WHERE used_at >= ?
            GROUP BY song_id
            ORDER BY uses DESC, song_id
            "#,
        )
        .bind(since)
        .fetch_all(&self.pool)
        .await?;

        Ok(counts)
    }

    async fn most_recent(&self) -> Result<Option<SongUsage>> {
        let usage = query_as::<_, SongUsage>(
            "SELECT * FROM song_usage ORDER BY used_at DESC, id DESC LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await?;

        Ok(usage)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::create_test_pool;

    #[tokio::test]
    async fn test_counts_and_most_recent() {
        let pool = create_test_pool().await.unwrap();
        let repo = SqliteUsageRepository::new(pool);

        repo.record(&SongUsage::new("a", 100, None)).await.unwrap();
        repo.record(&SongUsage::new("a", 200, None)).await.unwrap();
        repo.record(&SongUsage::new("b", 300, Some("rehearsal".into())))
            .await
            .unwrap();
        repo.record(&SongUsage::new("c", 10, None)).await.unwrap();

        let counts = repo.counts_since(50).await.unwrap();
        assert_eq!(counts, vec![("a".to_string(), 2), ("b".to_string(), 1)]);

        let recent = repo.most_recent().await.unwrap().unwrap();
        assert_eq!(recent.song_id, "b");
        assert_eq!(recent.context.as_deref(), Some("rehearsal"));

        assert_eq!(repo.since(150).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_empty_history() {
        let pool = create_test_pool().await.unwrap();
        let repo = SqliteUsageRepository::new(pool);

        assert!(repo.most_recent().await.unwrap().is_none());
        assert!(repo.counts_since(0).await.unwrap().is_empty());
    }
}

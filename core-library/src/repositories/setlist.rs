//! Setlist repository trait and implementation

use crate::error::{LibraryError, Result};
use crate::models::{Setlist, SetlistEntry};
use async_trait::async_trait;
use sqlx::{query, query_as, SqlitePool};

/// Setlist repository interface for data access operations
#[async_trait]
pub trait SetlistRepository: Send + Sync {
    /// Find a setlist by its ID, including soft-deleted setlists
    async fn find_by_id(&self, id: &str) -> Result<Option<Setlist>>;

    /// Insert a new setlist
    async fn insert(&self, setlist: &Setlist) -> Result<()>;

    /// Update an existing setlist
    async fn update(&self, setlist: &Setlist) -> Result<()>;

    /// Hard delete a setlist together with its entries
    async fn delete(&self, id: &str) -> Result<bool>;

    async fn soft_delete(&self, id: &str, now: i64) -> Result<bool>;

    async fn list_active(&self) -> Result<Vec<Setlist>>;

    async fn all_ids(&self) -> Result<Vec<String>>;

    /// Live setlists scheduled in `[from, to]`, soonest first
    async fn scheduled_between(&self, from: i64, to: i64) -> Result<Vec<Setlist>>;

    /// Replace the ordered song list of a setlist
    ///
    /// # Arguments
    /// * `setlist_id` - Setlist identifier
    /// * `song_ids` - Song identifiers in performance order
    async fn set_entries(&self, setlist_id: &str, song_ids: &[String]) -> Result<()>;

    /// Entries of a setlist in position order
    async fn entries(&self, setlist_id: &str) -> Result<Vec<SetlistEntry>>;

    /// Entries of every live setlist in position order
    async fn all_entries(&self) -> Result<Vec<SetlistEntry>>;

    /// Entries that reference a song row that does not exist
    async fn dangling_entries(&self, setlist_id: &str) -> Result<Vec<SetlistEntry>>;

    /// Remove dangling entries and return how many were dropped
    async fn remove_dangling_entries(&self, setlist_id: &str) -> Result<u64>;

    async fn bump_local_version(&self, id: &str, now: i64) -> Result<bool>;

    /// Record that the remote replica holds `version`
    async fn mark_synced(&self, id: &str, version: i64) -> Result<bool>;

    async fn count(&self) -> Result<i64>;
}

/// SQLite implementation of SetlistRepository
pub struct SqliteSetlistRepository {
    pool: SqlitePool,
}

impl SqliteSetlistRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SetlistRepository for SqliteSetlistRepository {
    async fn find_by_id(&self, id: &str) -> Result<Option<Setlist>> {
        let setlist = query_as::<_, Setlist>("SELECT * FROM setlists WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(setlist)
    }

    async fn insert(&self, setlist: &Setlist) -> Result<()> {
        setlist.validate().map_err(|msg| LibraryError::InvalidInput {
            field: "setlist".to_string(),
            message: msg,
        })?;

        query(
            r#"
            INSERT INTO setlists (
                id, name, venue, scheduled_for, local_version, remote_version,
                created_at, updated_at, deleted_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&setlist.id)
        .bind(&setlist.name)
        .bind(&setlist.venue)
        .bind(setlist.scheduled_for)
        .bind(setlist.local_version)
        .bind(setlist.remote_version)
        .bind(setlist.created_at)
        .bind(setlist.updated_at)
        .bind(setlist.deleted_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn update(&self, setlist: &Setlist) -> Result<()> {
        let result = query(
            r#"
            UPDATE setlists SET
                name = ?, venue = ?, scheduled_for = ?,
                local_version = ?, remote_version = ?,
                updated_at = ?, deleted_at = ?
            WHERE id = ?
            "#,
        )
        .bind(&setlist.name)
        .bind(&setlist.venue)
        .bind(setlist.scheduled_for)
        .bind(setlist.local_version)
        .bind(setlist.remote_version)
        .bind(setlist.updated_at)
        .bind(setlist.deleted_at)
        .bind(&setlist.id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(LibraryError::NotFound {
                entity_type: "Setlist".to_string(),
                id: setlist.id.clone(),
            });
        }

        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<bool> {
        let result = query("DELETE FROM setlists WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn soft_delete(&self, id: &str, now: i64) -> Result<bool> {
        let result = query(
            r#"
            UPDATE setlists
            SET deleted_at = ?, updated_at = ?, local_version = local_version + 1
            WHERE id = ? AND deleted_at IS NULL
            "#,
        )
        .bind(now)
        .bind(now)
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn list_active(&self) -> Result<Vec<Setlist>> {
        let setlists = query_as::<_, Setlist>(
            "SELECT * FROM setlists WHERE deleted_at IS NULL ORDER BY created_at, id",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(setlists)
    }

    async fn all_ids(&self) -> Result<Vec<String>> {
        let ids: Vec<(String,)> = query_as("SELECT id FROM setlists")
            .fetch_all(&self.pool)
            .await?;

        Ok(ids.into_iter().map(|(id,)| id).collect())
    }

    async fn scheduled_between(&self, from: i64, to: i64) -> Result<Vec<Setlist>> {
        let setlists = query_as::<_, Setlist>(
            r#"
            SELECT * FROM setlists
            WHERE deleted_at IS NULL AND scheduled_for BETWEEN ? AND ?
            ORDER BY scheduled_for, id
            "#,
        )
        .bind(from)
        .bind(to)
        .fetch_all(&self.pool)
        .await?;

        Ok(setlists)
    }

    async fn set_entries(&self, setlist_id: &str, song_ids: &[String]) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        query("DELETE FROM setlist_entries WHERE setlist_id = ?")
            .bind(setlist_id)
            .execute(&mut *tx)
            .await?;

        for (position, song_id) in song_ids.iter().enumerate() {
            query("INSERT INTO setlist_entries (setlist_id, song_id, position) VALUES (?, ?, ?)")
                .bind(setlist_id)
                .bind(song_id)
                .bind(position as i64)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn entries(&self, setlist_id: &str) -> Result<Vec<SetlistEntry>> {
        let entries = query_as::<_, SetlistEntry>(
            "SELECT * FROM setlist_entries WHERE setlist_id = ? ORDER BY position",
        )
        .bind(setlist_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(entries)
    }

    async fn all_entries(&self) -> Result<Vec<SetlistEntry>> {
        let entries = query_as::<_, SetlistEntry>(
            r#"
            SELECT e.* FROM setlist_entries e
            JOIN setlists s ON s.id = e.setlist_id
            WHERE s.deleted_at IS NULL
            ORDER BY e.setlist_id, e.position
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(entries)
    }

    async fn dangling_entries(&self, setlist_id: &str) -> Result<Vec<SetlistEntry>> {
        let entries = query_as::<_, SetlistEntry>(
            r#"
            SELECT e.* FROM setlist_entries e
            LEFT JOIN songs s ON s.id = e.song_id
            WHERE e.setlist_id = ? AND s.id IS NULL
            ORDER BY e.position
            "#,
        )
        .bind(setlist_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(entries)
    }

    async fn remove_dangling_entries(&self, setlist_id: &str) -> Result<u64> {
        let result = query(
            r#"
            DELETE FROM setlist_entries
            WHERE setlist_id = ?
              AND song_id NOT IN (SELECT id FROM songs)
            "#,
        )
        .bind(setlist_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn bump_local_version(&self, id: &str, now: i64) -> Result<bool> {
        let result = query(
            "UPDATE setlists SET local_version = local_version + 1, updated_at = ? WHERE id = ?",
        )
        .bind(now)
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn mark_synced(&self, id: &str, version: i64) -> Result<bool> {
        let result = query("UPDATE setlists SET remote_version = MAX(remote_version, ?) WHERE id = ?")
            .bind(version)
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn count(&self) -> Result<i64> {
        let count: (i64,) =
            query_as("SELECT COUNT(*) FROM setlists WHERE deleted_at IS NULL")
                .fetch_one(&self.pool)
                .await?;

        Ok(count.0)
    }
}

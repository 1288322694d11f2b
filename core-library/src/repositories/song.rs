//! Song repository trait and implementation

use crate::error::{LibraryError, Result};
use crate::models::Song;
use async_trait::async_trait;
use sqlx::{query_as, SqlitePool};

/// Song repository interface for data access operations
#[async_trait]
pub trait SongRepository: Send + Sync {
    /// Find a song by its ID, including soft-deleted songs
    ///
    /// # Returns
    /// - `Ok(Some(song))` if found
    /// - `Ok(None)` if not found
    /// - `Err` if database error occurs
    async fn find_by_id(&self, id: &str) -> Result<Option<Song>>;

    /// Insert a new song
    ///
    /// # Errors
    /// Returns `InvalidInput` if the song fails validation
    async fn insert(&self, song: &Song) -> Result<()>;

    /// Update an existing song
    ///
    /// # Errors
    /// Returns `NotFound` if no row has the song's id
    async fn update(&self, song: &Song) -> Result<()>;

    /// Hard delete a song
    async fn delete(&self, id: &str) -> Result<bool>;

    /// Mark a song deleted without removing the row
    async fn soft_delete(&self, id: &str, now: i64) -> Result<bool>;

    /// All songs that are not soft-deleted, oldest first
    async fn list_active(&self) -> Result<Vec<Song>>;

    /// Ids of every song row, deleted or not
    async fn all_ids(&self) -> Result<Vec<String>>;

    /// Increment `local_version` after a local edit
    async fn bump_local_version(&self, id: &str, now: i64) -> Result<bool>;

    /// Record that the remote replica holds `version`
    ///
    /// `remote_version` never moves backwards. Returns false when the song
    /// does not exist.
    async fn mark_synced(&self, id: &str, version: i64) -> Result<bool>;

    /// Count songs that are not soft-deleted
    async fn count(&self) -> Result<i64>;
}

/// SQLite implementation of SongRepository
pub struct SqliteSongRepository {
    pool: SqlitePool,
}

impl SqliteSongRepository {
    /// Create a new SQLite song repository
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SongRepository for SqliteSongRepository {
    async fn find_by_id(&self, id: &str) -> Result<Option<Song>> {
        let song = query_as::<_, Song>("SELECT * FROM songs WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(song)
    }

    async fn insert(&self, song: &Song) -> Result<()> {
        song.validate().map_err(|msg| LibraryError::InvalidInput {
            field: "song".to_string(),
            message: msg,
        })?;

        sqlx::query(
            r#"
            INSERT INTO songs (
                id, title, artist, song_key, tempo, content, metadata, checksum,
                local_version, remote_version, created_at, updated_at, deleted_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&song.id)
        .bind(&song.title)
        .bind(&song.artist)
        .bind(&song.song_key)
        .bind(song.tempo)
        .bind(&song.content)
        .bind(&song.metadata)
        .bind(&song.checksum)
        .bind(song.local_version)
        .bind(song.remote_version)
        .bind(song.created_at)
        .bind(song.updated_at)
        .bind(song.deleted_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn update(&self, song: &Song) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE songs SET
                title = ?, artist = ?, song_key = ?, tempo = ?,
                content = ?, metadata = ?, checksum = ?,
                local_version = ?, remote_version = ?,
                updated_at = ?, deleted_at = ?
            WHERE id = ?
            "#,
        )
        .bind(&song.title)
        .bind(&song.artist)
        .bind(&song.song_key)
        .bind(song.tempo)
        .bind(&song.content)
        .bind(&song.metadata)
        .bind(&song.checksum)
        .bind(song.local_version)
        .bind(song.remote_version)
        .bind(song.updated_at)
        .bind(song.deleted_at)
        .bind(&song.id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(LibraryError::NotFound {
                entity_type: "Song".to_string(),
                id: song.id.clone(),
            });
        }

        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM songs WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn soft_delete(&self, id: &str, now: i64) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE songs
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

    async fn list_active(&self) -> Result<Vec<Song>> {
        let songs = query_as::<_, Song>(
            "SELECT * FROM songs WHERE deleted_at IS NULL ORDER BY created_at, id",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(songs)
    }

    async fn all_ids(&self) -> Result<Vec<String>> {
        let ids: Vec<(String,)> = sqlx::query_as("SELECT id FROM songs")
            .fetch_all(&self.pool)
            .await?;

        Ok(ids.into_iter().map(|(id,)| id).collect())
    }

    async fn bump_local_version(&self, id: &str, now: i64) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE songs SET local_version = local_version + 1, updated_at = ? WHERE id = ?",
        )
        .bind(now)
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn mark_synced(&self, id: &str, version: i64) -> Result<bool> {
        let result =
            sqlx::query("UPDATE songs SET remote_version = MAX(remote_version, ?) WHERE id = ?")
                .bind(version)
                .bind(id)
                .execute(&self.pool)
                .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn count(&self) -> Result<i64> {
        let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM songs WHERE deleted_at IS NULL")
            .fetch_one(&self.pool)
            .await?;

        Ok(count.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::create_test_pool;

    fn test_song(id: &str) -> Song {
        Song::new("Blackbird", "[G]Blackbird singing", 1_700_000_000)
            .with_id(id)
            .with_artist("The Beatles")
            .with_key("G")
            .with_tempo(94)
    }

    #[tokio::test]
    async fn test_insert_and_find_song() {
        let pool = create_test_pool().await.unwrap();
        let repo = SqliteSongRepository::new(pool);

        repo.insert(&test_song("song-1")).await.unwrap();

        let found = repo.find_by_id("song-1").await.unwrap().unwrap();
        assert_eq!(found.title, "Blackbird");
        assert_eq!(found.song_key.as_deref(), Some("G"));
        assert_eq!(found.tempo, Some(94));
        assert!(repo.find_by_id("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_insert_rejects_invalid_song() {
        let pool = create_test_pool().await.unwrap();
        let repo = SqliteSongRepository::new(pool);

        let mut song = test_song("song-1");
        song.title = String::new();

        let result = repo.insert(&song).await;
        assert!(matches!(result, Err(LibraryError::InvalidInput { .. })));
    }

    #[tokio::test]
    async fn test_update_missing_song_is_not_found() {
        let pool = create_test_pool().await.unwrap();
        let repo = SqliteSongRepository::new(pool);

        let result = repo.update(&test_song("ghost")).await;
        assert!(matches!(result, Err(LibraryError::NotFound { .. })));
    }

    #[tokio::test]
    async fn test_version_bookkeeping() {
        let pool = create_test_pool().await.unwrap();
        let repo = SqliteSongRepository::new(pool);
        repo.insert(&test_song("song-1")).await.unwrap();

        assert!(repo.bump_local_version("song-1", 1_700_000_100).await.unwrap());
        let song = repo.find_by_id("song-1").await.unwrap().unwrap();
        assert_eq!(song.local_version, 2);
        assert_eq!(song.updated_at, 1_700_000_100);
        assert!(song.has_unsynced_changes());

        assert!(repo.mark_synced("song-1", 2).await.unwrap());
        let song = repo.find_by_id("song-1").await.unwrap().unwrap();
        assert_eq!(song.remote_version, 2);
        assert!(!song.has_unsynced_changes());

        // An edit that landed after version 2 was pushed stays unsynced
        repo.bump_local_version("song-1", 1_700_000_200).await.unwrap();
        assert!(repo.mark_synced("song-1", 2).await.unwrap());
        assert!(repo.mark_synced("song-1", 1).await.unwrap());
        let song = repo.find_by_id("song-1").await.unwrap().unwrap();
        assert_eq!(song.local_version, 3);
        assert_eq!(song.remote_version, 2);
        assert!(song.has_unsynced_changes());

        assert!(!repo.mark_synced("ghost", 1).await.unwrap());
    }

    #[tokio::test]
    async fn test_soft_delete_keeps_row() {
        let pool = create_test_pool().await.unwrap();
        let repo = SqliteSongRepository::new(pool);
        repo.insert(&test_song("song-1")).await.unwrap();
        repo.insert(&test_song("song-2")).await.unwrap();

        assert!(repo.soft_delete("song-1", 1_700_000_500).await.unwrap());
        assert!(!repo.soft_delete("song-1", 1_700_000_600).await.unwrap());

        assert_eq!(repo.count().await.unwrap(), 1);
        assert_eq!(repo.list_active().await.unwrap().len(), 1);
        assert_eq!(repo.all_ids().await.unwrap().len(), 2);

        let deleted = repo.find_by_id("song-1").await.unwrap().unwrap();
        assert_eq!(deleted.deleted_at, Some(1_700_000_500));

        assert!(repo.delete("song-1").await.unwrap());
        assert_eq!(repo.all_ids().await.unwrap(), vec!["song-2".to_string()]);
    }
}

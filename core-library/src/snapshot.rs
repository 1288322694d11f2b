//! # Library Snapshots
//!
//! Capture and apply point-in-time copies of the library. Applying a
//! snapshot is a single transaction: either every record lands or none do.
//! Applying the same snapshot twice leaves the store unchanged the second
//! time.

use crate::error::Result;
use crate::models::{LibrarySnapshot, SetlistEntry};
use crate::repositories::{
    SetlistRepository, SongRepository, SqliteSetlistRepository, SqliteSongRepository,
};
use sqlx::{query, SqlitePool};
use tracing::{debug, info};

/// Capture every live song, setlist and entry
pub async fn capture_snapshot(pool: &SqlitePool, now: i64) -> Result<LibrarySnapshot> {
    let songs = SqliteSongRepository::new(pool.clone()).list_active().await?;
    let setlist_repo = SqliteSetlistRepository::new(pool.clone());
    let setlists = setlist_repo.list_active().await?;
    let entries = setlist_repo.all_entries().await?;

    debug!(
        songs = songs.len(),
        setlists = setlists.len(),
        entries = entries.len(),
        "Captured library snapshot"
    );

    Ok(LibrarySnapshot {
        songs,
        setlists,
        entries,
        captured_at: now,
    })
}

/// Upsert the snapshot's records and replace the entries of its setlists
///
/// Returns the number of songs and setlists written.
pub async fn apply_snapshot(pool: &SqlitePool, snapshot: &LibrarySnapshot) -> Result<usize> {
    let mut tx = pool.begin().await?;

    for song in &snapshot.songs {
        query(
            r#"
            INSERT INTO songs (
                id, title, artist, song_key, tempo, content, metadata, checksum,
                local_version, remote_version, created_at, updated_at, deleted_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                title = excluded.title,
                artist = excluded.artist,
                song_key = excluded.song_key,
                tempo = excluded.tempo,
                content = excluded.content,
                metadata = excluded.metadata,
                checksum = excluded.checksum,
                local_version = excluded.local_version,
                remote_version = excluded.remote_version,
                created_at = excluded.created_at,
                updated_at = excluded.updated_at,
                deleted_at = excluded.deleted_at
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
        .execute(&mut *tx)
        .await?;
    }

    for setlist in &snapshot.setlists {
        query(
            r#"
            INSERT INTO setlists (
                id, name, venue, scheduled_for, local_version, remote_version,
                created_at, updated_at, deleted_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                venue = excluded.venue,
                scheduled_for = excluded.scheduled_for,
                local_version = excluded.local_version,
                remote_version = excluded.remote_version,
                created_at = excluded.created_at,
                updated_at = excluded.updated_at,
                deleted_at = excluded.deleted_at
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
        .execute(&mut *tx)
        .await?;

        query("DELETE FROM setlist_entries WHERE setlist_id = ?")
            .bind(&setlist.id)
            .execute(&mut *tx)
            .await?;

        let entries: Vec<&SetlistEntry> = snapshot
            .entries
            .iter()
            .filter(|e| e.setlist_id == setlist.id)
            .collect();

        for entry in entries {
            query("INSERT INTO setlist_entries (setlist_id, song_id, position) VALUES (?, ?, ?)")
                .bind(&entry.setlist_id)
                .bind(&entry.song_id)
                .bind(entry.position)
                .execute(&mut *tx)
                .await?;
        }
    }

    tx.commit().await?;

    let written = snapshot.record_count();
    info!(records = written, "Applied library snapshot");
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::create_test_pool;
    use crate::models::{Setlist, Song};

    const NOW: i64 = 1_700_000_000;

    async fn seed(pool: &SqlitePool) {
        let songs = SqliteSongRepository::new(pool.clone());
        songs
            .insert(&Song::new("Autumn Leaves", "[Am7]The falling", NOW).with_id("s1"))
            .await
            .unwrap();
        songs
            .insert(&Song::new("So What", "[Dm7]", NOW).with_id("s2"))
            .await
            .unwrap();

        let setlists = SqliteSetlistRepository::new(pool.clone());
        setlists
            .insert(&Setlist::new("Jazz Night", Some(NOW + 86_400), NOW).with_id("l1"))
            .await
            .unwrap();
        setlists
            .set_entries("l1", &["s2".into(), "s1".into()])
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_capture_skips_deleted_records() {
        let pool = create_test_pool().await.unwrap();
        seed(&pool).await;
        SqliteSongRepository::new(pool.clone())
            .soft_delete("s2", NOW)
            .await
            .unwrap();

        let snapshot = capture_snapshot(&pool, NOW).await.unwrap();
        assert_eq!(snapshot.songs.len(), 1);
        assert_eq!(snapshot.setlists.len(), 1);
        assert_eq!(snapshot.entries.len(), 2);
        assert_eq!(snapshot.captured_at, NOW);
    }

    #[tokio::test]
    async fn test_apply_restores_deleted_and_edited_records() {
        let pool = create_test_pool().await.unwrap();
        seed(&pool).await;
        let snapshot = capture_snapshot(&pool, NOW).await.unwrap();

        let songs = SqliteSongRepository::new(pool.clone());
        let setlists = SqliteSetlistRepository::new(pool.clone());
        songs.delete("s1").await.unwrap();
        let mut edited = songs.find_by_id("s2").await.unwrap().unwrap();
        edited.title = "Edited".to_string();
        songs.update(&edited).await.unwrap();
        setlists.set_entries("l1", &[]).await.unwrap();

        let written = apply_snapshot(&pool, &snapshot).await.unwrap();
        assert_eq!(written, 3);

        assert!(songs.find_by_id("s1").await.unwrap().is_some());
        assert_eq!(songs.find_by_id("s2").await.unwrap().unwrap().title, "So What");
        assert_eq!(setlists.entries("l1").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_apply_is_idempotent() {
        let pool = create_test_pool().await.unwrap();
        seed(&pool).await;
        let snapshot = capture_snapshot(&pool, NOW).await.unwrap();

        apply_snapshot(&pool, &snapshot).await.unwrap();
        let first = capture_snapshot(&pool, NOW).await.unwrap();
        apply_snapshot(&pool, &snapshot).await.unwrap();
        let second = capture_snapshot(&pool, NOW).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(first, snapshot);
    }
}

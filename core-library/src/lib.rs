//! # Library Management Module
//!
//! Owns the local library database and provides repository patterns
//! for data access.
//!
//! ## Overview
//!
//! This module manages:
//! - SQLite database schema and migrations (library and sync engine tables)
//! - Repository patterns for songs, setlists and usage history
//! - Whole-library snapshots used by backups and restores

pub mod db;
pub mod error;
pub mod models;
pub mod repositories;
pub mod snapshot;

pub use error::{LibraryError, Result};
pub use models::{
    is_valid_key, LibrarySnapshot, RecordRef, RecordType, Setlist, SetlistEntry, SetlistId, Song,
    SongId, SongUsage, TEMPO_RANGE,
};
pub use repositories::{
    SetlistRepository, SongRepository, SqliteSetlistRepository, SqliteSongRepository,
    SqliteUsageRepository, UsageRepository,
};
pub use snapshot::{apply_snapshot, capture_snapshot};

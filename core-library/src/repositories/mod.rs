//! # Repository Pattern Implementation
//!
//! Repository traits and SQLite implementations for library data access.
//!
//! ## Architecture
//!
//! - Traits define the interface for each repository
//! - SQLite implementations use sqlx for async database access
//! - All operations return `Result<T>` for error handling
//!
//! ## Available Repositories
//!
//! - `SongRepository` - Chord charts with version bookkeeping
//! - `SetlistRepository` - Scheduled setlists and their ordered entries
//! - `UsageRepository` - Song view/performance history

pub mod setlist;
pub mod song;
pub mod usage;

pub use setlist::{SetlistRepository, SqliteSetlistRepository};
pub use song::{SongRepository, SqliteSongRepository};
pub use usage::{SqliteUsageRepository, UsageRepository};

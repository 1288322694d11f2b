//! # Library Domain Models
//!
//! Songs (chord charts), setlists and the usage history that feeds
//! prediction. Every timestamp is Unix epoch seconds.
//!
//! ## Versioning
//!
//! Each syncable record carries a `local_version` that is bumped on every
//! local edit and a `remote_version` that records the last version the remote
//! replica acknowledged. A record whose versions differ has unsynced changes.

use crate::error::{LibraryError, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use sqlx::FromRow;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

// ============================================================================
// ID Types
// ============================================================================

/// Unique identifier for a song
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SongId(Uuid);

impl SongId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_string(s: &str) -> std::result::Result<Self, uuid::Error> {
        Ok(Self(Uuid::parse_str(s)?))
    }

    pub fn as_str(&self) -> String {
        self.0.to_string()
    }
}

impl Default for SongId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SongId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for a setlist
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SetlistId(Uuid);

impl SetlistId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_string(s: &str) -> std::result::Result<Self, uuid::Error> {
        Ok(Self(Uuid::parse_str(s)?))
    }

    pub fn as_str(&self) -> String {
        self.0.to_string()
    }
}

impl Default for SetlistId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SetlistId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// Record Type
// ============================================================================

/// Kind of syncable library record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordType {
    Song,
    Setlist,
}

impl RecordType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordType::Song => "song",
            RecordType::Setlist => "setlist",
        }
    }
}

impl FromStr for RecordType {
    type Err = LibraryError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "song" => Ok(RecordType::Song),
            "setlist" => Ok(RecordType::Setlist),
            _ => Err(LibraryError::InvalidInput {
                field: "record_type".to_string(),
                message: format!("Unknown record type: {}", s),
            }),
        }
    }
}

impl fmt::Display for RecordType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Reference to a single library record
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RecordRef {
    pub record_id: String,
    pub record_type: RecordType,
}

impl RecordRef {
    pub fn song(id: impl Into<String>) -> Self {
        Self {
            record_id: id.into(),
            record_type: RecordType::Song,
        }
    }

    pub fn setlist(id: impl Into<String>) -> Self {
        Self {
            record_id: id.into(),
            record_type: RecordType::Setlist,
        }
    }
}

// ============================================================================
// Song
// ============================================================================

/// Tempo range accepted for a song, in BPM
pub const TEMPO_RANGE: std::ops::RangeInclusive<i64> = 20..=400;

/// Song (chord chart) with sync bookkeeping
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct Song {
    pub id: String,
    pub title: String,
    pub artist: Option<String>,
    /// Musical key, e.g. `C`, `F#m`, `Bb`
    pub song_key: Option<String>,
    pub tempo: Option<i64>,
    /// Chart body (ChordPro or plain text)
    pub content: String,
    /// Free-form JSON object
    pub metadata: String,
    /// SHA-256 of `content`, lowercase hex
    pub checksum: Option<String>,
    pub local_version: i64,
    pub remote_version: i64,
    pub created_at: i64,
    pub updated_at: i64,
    pub deleted_at: Option<i64>,
}

impl Song {
    /// Create a new song with a fresh id and a checksum over `content`
    pub fn new(title: impl Into<String>, content: impl Into<String>, now: i64) -> Self {
        let content = content.into();
        let checksum = Some(Self::compute_checksum(&content));

        Self {
            id: SongId::new().as_str(),
            title: title.into(),
            artist: None,
            song_key: None,
            tempo: None,
            content,
            metadata: "{}".to_string(),
            checksum,
            local_version: 1,
            remote_version: 0,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_artist(mut self, artist: impl Into<String>) -> Self {
        self.artist = Some(artist.into());
        self
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.song_key = Some(key.into());
        self
    }

    pub fn with_tempo(mut self, tempo: i64) -> Self {
        self.tempo = Some(tempo);
        self
    }

    /// SHA-256 of the chart content as lowercase hex
    pub fn compute_checksum(content: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(content.as_bytes());
        format!("{:x}", hasher.finalize())
    }

    /// Recompute the stored checksum from the current content
    pub fn refresh_checksum(&mut self) {
        self.checksum = Some(Self::compute_checksum(&self.content));
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    /// True when local edits have not been acknowledged by the remote
    pub fn has_unsynced_changes(&self) -> bool {
        self.local_version != self.remote_version
    }

    /// Validate song data
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.title.trim().is_empty() {
            return Err("Song title cannot be empty".to_string());
        }

        if let Some(tempo) = self.tempo {
            if !TEMPO_RANGE.contains(&tempo) {
                return Err(format!("Song tempo {} is out of valid range", tempo));
            }
        }

        if let Some(key) = &self.song_key {
            if !is_valid_key(key) {
                return Err(format!("Song key '{}' is not a valid key name", key));
            }
        }

        Ok(())
    }
}

/// Check a key name such as `C`, `F#`, `Bb`, `Ebm` or `G#min`
pub fn is_valid_key(key: &str) -> bool {
    let mut chars = key.trim().chars().peekable();

    match chars.next() {
        Some('A'..='G') => {}
        _ => return false,
    }

    if matches!(chars.peek(), Some('#') | Some('b')) {
        chars.next();
    }

    let rest: String = chars.collect();
    matches!(rest.as_str(), "" | "m" | "min" | "maj")
}

// ============================================================================
// Setlist
// ============================================================================

/// Ordered set of songs for a scheduled performance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct Setlist {
    pub id: String,
    pub name: String,
    pub venue: Option<String>,
    /// Performance start time
    pub scheduled_for: Option<i64>,
    pub local_version: i64,
    pub remote_version: i64,
    pub created_at: i64,
    pub updated_at: i64,
    pub deleted_at: Option<i64>,
}

impl Setlist {
    pub fn new(name: impl Into<String>, scheduled_for: Option<i64>, now: i64) -> Self {
        Self {
            id: SetlistId::new().as_str(),
            name: name.into(),
            venue: None,
            scheduled_for,
            local_version: 1,
            remote_version: 0,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_venue(mut self, venue: impl Into<String>) -> Self {
        self.venue = Some(venue.into());
        self
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    pub fn has_unsynced_changes(&self) -> bool {
        self.local_version != self.remote_version
    }

    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.name.trim().is_empty() {
            return Err("Setlist name cannot be empty".to_string());
        }

        if let Some(at) = self.scheduled_for {
            if at < 0 {
                return Err("Setlist schedule time cannot be negative".to_string());
            }
        }

        Ok(())
    }
}

/// Position of a song within a setlist
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct SetlistEntry {
    pub setlist_id: String,
    pub song_id: String,
    pub position: i64,
}

// ============================================================================
// Usage
// ============================================================================

/// One view or performance of a song
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct SongUsage {
    pub id: String,
    pub song_id: String,
    pub used_at: i64,
    /// Where the song was opened, e.g. `rehearsal` or a setlist id
    pub context: Option<String>,
}

impl SongUsage {
    pub fn new(song_id: impl Into<String>, used_at: i64, context: Option<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            song_id: song_id.into(),
            used_at,
            context,
        }
    }
}

// ============================================================================
// Snapshot
// ============================================================================

/// Point-in-time copy of every live library record
///
/// This is the payload stored inside backup blobs.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct LibrarySnapshot {
    pub songs: Vec<Song>,
    pub setlists: Vec<Setlist>,
    pub entries: Vec<SetlistEntry>,
    pub captured_at: i64,
}

impl LibrarySnapshot {
    /// Number of songs and setlists in the snapshot
    pub fn record_count(&self) -> usize {
        self.songs.len() + self.setlists.len()
    }

    pub fn record_refs(&self) -> Vec<RecordRef> {
        self.songs
            .iter()
            .map(|s| RecordRef::song(s.id.clone()))
            .chain(self.setlists.iter().map(|s| RecordRef::setlist(s.id.clone())))
            .collect()
    }

    pub fn contains(&self, record_id: &str) -> bool {
        self.songs.iter().any(|s| s.id == record_id)
            || self.setlists.iter().any(|s| s.id == record_id)
    }

    /// Narrow the snapshot to a single record and, for setlists, its entries
    pub fn only(&self, record_id: &str) -> LibrarySnapshot {
        LibrarySnapshot {
            songs: self
                .songs
                .iter()
                .filter(|s| s.id == record_id)
                .cloned()
                .collect(),
            setlists: self
                .setlists
                .iter()
                .filter(|s| s.id == record_id)
                .cloned()
                .collect(),
            entries: self
                .entries
                .iter()
                .filter(|e| e.setlist_id == record_id)
                .cloned()
                .collect(),
            captured_at: self.captured_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_song_checksum_matches_content() {
        let song = Song::new("Amazing Grace", "[G]Amazing [C]grace", 1_700_000_000);
        assert_eq!(
            song.checksum.as_deref(),
            Some(Song::compute_checksum("[G]Amazing [C]grace").as_str())
        );
        assert_eq!(song.local_version, 1);
        assert_eq!(song.remote_version, 0);
        assert!(song.has_unsynced_changes());
    }

    #[test]
    fn test_song_validation() {
        let song = Song::new("Hallelujah", "", 0).with_key("C").with_tempo(72);
        assert!(song.validate().is_ok());

        let untitled = Song::new("   ", "", 0);
        assert!(untitled.validate().is_err());

        let too_fast = Song::new("Flight", "", 0).with_tempo(900);
        assert!(too_fast.validate().is_err());

        let bad_key = Song::new("Odd", "", 0).with_key("H#");
        assert!(bad_key.validate().is_err());
    }

    #[test]
    fn test_key_names() {
        for key in ["C", "F#", "Bb", "Ebm", "G#min", "Dmaj", " A "] {
            assert!(is_valid_key(key), "{key} should be valid");
        }
        for key in ["", "H", "c", "C##", "Cx", "Bbb"] {
            assert!(!is_valid_key(key), "{key} should be invalid");
        }
    }

    #[test]
    fn test_setlist_validation() {
        let setlist = Setlist::new("Friday Gig", Some(1_700_000_000), 0);
        assert!(setlist.validate().is_ok());

        let negative = Setlist::new("Past", Some(-5), 0);
        assert!(negative.validate().is_err());

        let unnamed = Setlist::new("", None, 0);
        assert!(unnamed.validate().is_err());
    }

    #[test]
    fn test_record_type_round_trip() {
        assert_eq!("song".parse::<RecordType>().unwrap(), RecordType::Song);
        assert_eq!("SETLIST".parse::<RecordType>().unwrap(), RecordType::Setlist);
        assert!("album".parse::<RecordType>().is_err());
        assert_eq!(RecordType::Setlist.to_string(), "setlist");
    }

    #[test]
    fn test_snapshot_only_narrows_to_record() {
        let song = Song::new("One", "", 0).with_id("s1");
        let setlist = Setlist::new("Set", None, 0).with_id("l1");
        let snapshot = LibrarySnapshot {
            songs: vec![song, Song::new("Two", "", 0).with_id("s2")],
            setlists: vec![setlist],
            entries: vec![SetlistEntry {
                setlist_id: "l1".to_string(),
                song_id: "s1".to_string(),
                position: 0,
            }],
            captured_at: 10,
        };

        assert_eq!(snapshot.record_count(), 3);
        assert!(snapshot.contains("s2"));
        assert!(!snapshot.contains("missing"));

        let only_setlist = snapshot.only("l1");
        assert_eq!(only_setlist.setlists.len(), 1);
        assert_eq!(only_setlist.entries.len(), 1);
        assert!(only_setlist.songs.is_empty());
    }
}

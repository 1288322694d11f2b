//! # Event Bus System
//!
//! Provides an event-driven architecture for the sync core using `tokio::sync::broadcast`.
//!
//! ## Overview
//!
//! Engines publish typed events as they lock records, take backups, detect
//! corruption or finish a pipeline stage. Hosts subscribe to drive UI state
//! ("locked by …", "backup restored") without polling the store.
//!
//! ```text
//! ┌──────────────┐     emit      ┌───────────┐     subscribe    ┌────────────┐
//! │ Orchestrator ├──────────────>│           ├─────────────────>│ UI binding │
//! └──────────────┘               │ EventBus  │                  └────────────┘
//! ┌──────────────┐     emit      │ (broadcast│     subscribe    ┌────────────┐
//! │   Engines    ├──────────────>│  channel) ├─────────────────>│ Telemetry  │
//! └──────────────┘               └───────────┘                  └────────────┘
//! ```
//!
//! ## Usage
//!
//! ```rust
//! use core_runtime::events::{CoreEvent, EventBus, SyncEvent};
//!
//! # #[tokio::main]
//! # async fn main() {
//! let event_bus = EventBus::new(100);
//! let mut stream = event_bus.subscribe();
//!
//! event_bus
//!     .emit(CoreEvent::Sync(SyncEvent::LockReleased {
//!         record_id: "song-42".to_string(),
//!         lock_id: "lock-1".to_string(),
//!     }))
//!     .ok();
//!
//! let event = stream.recv().await.unwrap();
//! assert_eq!(event.description(), "Edit lock released");
//! # }
//! ```
//!
//! ## Error Handling
//!
//! - **`RecvError::Lagged(n)`**: the subscriber missed `n` events; it can keep receiving.
//! - **`RecvError::Closed`**: all senders were dropped, treat as shutdown.
//!
//! Emitting with no subscribers returns an error; engines call `.ok()` on the
//! result because an unobserved event is not a failure.

use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::broadcast;

pub use tokio::sync::broadcast::error::{RecvError, SendError};
pub use tokio::sync::broadcast::Receiver;

/// Default buffer size for the event bus channel.
pub const DEFAULT_EVENT_BUFFER_SIZE: usize = 100;

// ============================================================================
// Core Event Types
// ============================================================================

/// Top-level event enum encompassing all event categories.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "payload")]
pub enum CoreEvent {
    /// Sync pipeline and engine events
    Sync(SyncEvent),
    /// Library content events
    Library(LibraryEvent),
}

impl CoreEvent {
    /// Returns a human-readable description of the event.
    pub fn description(&self) -> &str {
        match self {
            CoreEvent::Sync(e) => e.description(),
            CoreEvent::Library(e) => e.description(),
        }
    }

    /// Returns the severity level of the event.
    pub fn severity(&self) -> EventSeverity {
        match self {
            CoreEvent::Sync(SyncEvent::Failed { .. })
            | CoreEvent::Sync(SyncEvent::DataLossDetected { .. }) => EventSeverity::Error,
            CoreEvent::Sync(SyncEvent::LockDenied { .. })
            | CoreEvent::Sync(SyncEvent::ConflictDetected { .. })
            | CoreEvent::Sync(SyncEvent::IntegrityIssue { .. })
            | CoreEvent::Sync(SyncEvent::SyncSuspended { .. }) => EventSeverity::Warning,
            CoreEvent::Sync(SyncEvent::Completed { .. })
            | CoreEvent::Sync(SyncEvent::BackupRestored { .. })
            | CoreEvent::Sync(SyncEvent::RecoveryCompleted { .. })
            | CoreEvent::Sync(SyncEvent::SyncResumed)
            | CoreEvent::Library(LibraryEvent::SnapshotRestored { .. }) => EventSeverity::Info,
            _ => EventSeverity::Debug,
        }
    }
}

/// Event severity levels for filtering and logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EventSeverity {
    Debug,
    Info,
    Warning,
    Error,
}

// ============================================================================
// Sync Events
// ============================================================================

/// Events raised by the sync pipeline and its engines.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event")]
pub enum SyncEvent {
    /// A sync run started.
    Started {
        run_id: String,
        user_id: String,
    },
    /// A pipeline stage finished (successfully or not).
    StageCompleted {
        run_id: String,
        /// Stage name, e.g. "pre_sync_backup"
        stage: String,
        success: bool,
        /// Position of the stage in the pipeline (1-based).
        step: u8,
        total_steps: u8,
    },
    /// The run finished successfully.
    Completed {
        run_id: String,
        records_synced: u64,
        duration_ms: u64,
        health_score: Option<f64>,
    },
    /// The run stopped at a critical stage.
    Failed {
        run_id: String,
        stage: String,
        message: String,
        /// Whether the next cycle is expected to retry.
        recoverable: bool,
    },
    LockAcquired {
        record_id: String,
        device_id: String,
        /// Unix epoch seconds
        expires_at: i64,
    },
    /// Another device holds the record.
    LockDenied {
        record_id: String,
        locked_by: String,
        expires_at: i64,
    },
    LockReleased {
        record_id: String,
        lock_id: String,
    },
    /// A risky record was found during a conflict scan, or the user must be told.
    ConflictDetected {
        record_id: String,
        risk_level: String,
        message: String,
    },
    BackupCreated {
        backup_id: String,
        importance: String,
        record_count: u64,
    },
    BackupRestored {
        backup_id: String,
        record_count: u64,
    },
    IntegrityIssue {
        record_id: String,
        corruption_type: String,
        can_auto_repair: bool,
    },
    DataLossDetected {
        event_id: String,
        loss_type: String,
        affected_records: u64,
    },
    RecoveryCompleted {
        event_id: String,
        success: bool,
        message: String,
    },
    /// Sync was disabled as emergency containment.
    SyncSuspended {
        reason: String,
    },
    SyncResumed,
}

impl SyncEvent {
    fn description(&self) -> &str {
        match self {
            SyncEvent::Started { .. } => "Sync started",
            SyncEvent::StageCompleted { .. } => "Sync stage completed",
            SyncEvent::Completed { .. } => "Sync completed successfully",
            SyncEvent::Failed { .. } => "Sync failed",
            SyncEvent::LockAcquired { .. } => "Edit lock acquired",
            SyncEvent::LockDenied { .. } => "Edit lock denied",
            SyncEvent::LockReleased { .. } => "Edit lock released",
            SyncEvent::ConflictDetected { .. } => "Conflict risk detected",
            SyncEvent::BackupCreated { .. } => "Backup created",
            SyncEvent::BackupRestored { .. } => "Backup restored",
            SyncEvent::IntegrityIssue { .. } => "Integrity issue found",
            SyncEvent::DataLossDetected { .. } => "Data loss detected",
            SyncEvent::RecoveryCompleted { .. } => "Recovery finished",
            SyncEvent::SyncSuspended { .. } => "Sync suspended",
            SyncEvent::SyncResumed => "Sync resumed",
        }
    }
}

// ============================================================================
// Library Events
// ============================================================================

/// Events related to library content changes made by the core itself.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "event")]
pub enum LibraryEvent {
    /// A song was rewritten by repair or restore.
    SongUpdated { song_id: String },
    SetlistUpdated { setlist_id: String },
    /// A whole snapshot was applied to the library.
    SnapshotRestored { backup_id: String, record_count: u64 },
}

impl LibraryEvent {
    fn description(&self) -> &str {
        match self {
            LibraryEvent::SongUpdated { .. } => "Song updated",
            LibraryEvent::SetlistUpdated { .. } => "Setlist updated",
            LibraryEvent::SnapshotRestored { .. } => "Library snapshot restored",
        }
    }
}

// ============================================================================
// Event Bus
// ============================================================================

/// Central event bus for publishing and subscribing to events.
///
/// Cloning the bus is cheap; all clones share the same channel.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<CoreEvent>,
}

impl EventBus {
    /// Creates a new event bus with the specified buffer size.
    ///
    /// A subscriber that falls behind by more than `capacity` events receives
    /// `RecvError::Lagged`.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publishes an event to all subscribers.
    ///
    /// Returns the number of subscribers that received the event, or an error
    /// if there are none.
    pub fn emit(&self, event: CoreEvent) -> Result<usize, SendError<CoreEvent>> {
        self.sender.send(event)
    }

    /// Creates a new subscriber. Past events are not replayed.
    pub fn subscribe(&self) -> Receiver<CoreEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_BUFFER_SIZE)
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("subscriber_count", &self.subscriber_count())
            .finish()
    }
}

// ============================================================================
// Event Stream Wrapper
// ============================================================================

type EventFilter = Box<dyn Fn(&CoreEvent) -> bool + Send + Sync>;

/// A wrapper around `broadcast::Receiver` with optional filtering.
///
/// ```rust
/// use core_runtime::events::{CoreEvent, EventBus, EventSeverity, EventStream};
///
/// let event_bus = EventBus::new(100);
/// let warnings = EventStream::new(event_bus.subscribe())
///     .filter(|event| event.severity() >= EventSeverity::Warning);
/// ```
pub struct EventStream {
    receiver: Receiver<CoreEvent>,
    filter: Option<EventFilter>,
}

impl EventStream {
    pub fn new(receiver: Receiver<CoreEvent>) -> Self {
        Self {
            receiver,
            filter: None,
        }
    }

    /// Only events matching `predicate` are returned by `recv()`.
    pub fn filter<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&CoreEvent) -> bool + Send + Sync + 'static,
    {
        self.filter = Some(Box::new(predicate));
        self
    }

    fn matches(&self, event: &CoreEvent) -> bool {
        self.filter.as_ref().map_or(true, |filter| filter(event))
    }

    /// Receives the next event that passes the filter.
    ///
    /// # Errors
    ///
    /// Returns `RecvError::Lagged(n)` if the subscriber fell behind by `n` events.
    /// Returns `RecvError::Closed` if all senders have been dropped.
    pub async fn recv(&mut self) -> Result<CoreEvent, RecvError> {
        loop {
            let event = self.receiver.recv().await?;
            if self.matches(&event) {
                return Ok(event);
            }
        }
    }

    /// Attempts to receive a matching event without waiting.
    ///
    /// Returns `None` if no matching events are currently available.
    pub fn try_recv(&mut self) -> Option<Result<CoreEvent, RecvError>> {
        loop {
            match self.receiver.try_recv() {
                Ok(event) => {
                    if self.matches(&event) {
                        return Some(Ok(event));
                    }
                }
                Err(broadcast::error::TryRecvError::Empty) => return None,
                Err(broadcast::error::TryRecvError::Lagged(n)) => {
                    return Some(Err(RecvError::Lagged(n)))
                }
                Err(broadcast::error::TryRecvError::Closed) => return Some(Err(RecvError::Closed)),
            }
        }
    }
}

impl fmt::Debug for EventStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventStream")
            .field("has_filter", &self.filter.is_some())
            .finish()
    }
}

// ============================================================================
// Tests
// ============================================================================

//! # Sync Orchestration Module
//!
//! Keeps a musician's songs and setlists in sync across devices without
//! losing edits, even mid-performance.
//!
//! ## Overview
//!
//! This module manages:
//! - Edit locks and editing sessions for concurrent multi-device editing
//! - Conflict risk detection and resolution
//! - Payload compression, delta sizing and network speed estimation
//! - Versioned, compressed backups with importance-based retention
//! - Post-sync integrity verification and auto-repair
//! - Data-loss detection and recovery
//! - Predictive prefetch of songs likely to be needed next
//! - Sync statistics, health scoring and optimization tips
//!
//! ## Components
//!
//! - **Edit Locks** (`edit_lock`): Exclusive, expiring per-record locks
//! - **Sessions** (`session`): Editing sessions and the edit activity log
//! - **Conflicts** (`conflict`): Risk scoring and resolution strategies
//! - **Network** (`network`): Compression, deltas and throughput tiers
//! - **Backups** (`backup`): Snapshot blobs, retention and restores
//! - **Integrity** (`integrity`): Checksum and reference verification
//! - **Recovery** (`recovery`): Data-loss events and recovery actions
//! - **Prefetch** (`prefetch`): Usage-driven predictions and cache warming
//! - **Insights** (`insights`): Health score and optimization tips
//! - **Orchestrator** (`orchestrator`): The ten-stage sync pipeline

pub mod backup;
pub mod config;
pub mod conflict;
pub mod edit_lock;
pub mod error;
pub mod insights;
pub mod integrity;
pub mod network;
pub mod orchestrator;
pub mod pending;
pub mod prefetch;
pub mod recovery;
pub mod session;
pub mod settings;
pub mod statistics;

#[cfg(test)]
mod test_support;

pub use backup::{
    assess_importance, Backup, BackupEngine, BackupImportance, BackupTrigger, BackupType,
    CleanupReport, RestoreResult,
};
pub use config::SyncEngineConfig;
pub use conflict::{
    recommended_strategy, ConflictDetection, ConflictEngine, ResolutionOutcome,
    ResolutionStrategy, RiskAssessment, RiskLevel,
};
pub use edit_lock::{EditLock, EditLockManager, LockOutcome};
pub use error::{Result, SyncError};
pub use insights::{InsightsEngine, OptimizationTip, SyncHealthScore, TipCategory, TipSeverity};
pub use integrity::{
    CorruptionType, IntegrityCheckResult, IntegrityEngine, IntegrityVerificationResult,
};
pub use network::{
    calculate_optimal_batch_size, determine_adaptive_quality, AdaptiveQuality,
    CompressionAlgorithm, CompressionResult, DeltaResult, NetworkOptimizer, NetworkSpeed,
};
pub use orchestrator::{
    MaintenanceReport, SyncBridges, SyncDecision, SyncOrchestrator, SyncResult, SyncStage,
};
pub use pending::{ChangeStatus, PendingChange, PendingChangeRepository};
pub use prefetch::{Prediction, PredictionReason, PredictedSongUsage, PrefetchEngine, PrefetchReport};
pub use recovery::{
    DataLossEvent, DataLossType, RecoveryAction, RecoveryActionKind, RecoveryEngine,
    RecoveryOutcome, RecoveryResult,
};
pub use session::{EditActivity, EditingSession};
pub use statistics::{StatisticsPeriod, SyncStatisticsRecord, SyncStatisticsSummary};

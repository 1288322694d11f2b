//! # Sync Orchestrator
//!
//! Owns the engine graph and runs the intelligent sync pipeline.
//!
//! ## Pipeline
//!
//! Every run walks ten stages in order:
//!
//! 1. **TimingCheck** - `should_sync_now`; a negative decision ends the run
//! 2. **PreSyncBackup** - incremental safety backup
//! 3. **ConflictResolution** - scan, then apply the recommended strategy
//! 4. **PredictivePrefetch** - refresh predictions and warm the cache
//! 5. **NetworkProbe** - speed estimate, compression and deltas
//! 6. **RemoteSync** - the only stage whose failure aborts the run
//! 7. **IntegrityVerification** - verify and auto-repair synced records
//! 8. **PostSyncBackup** - backup of the freshly synced state
//! 9. **StatisticsRecording** - one `sync_statistics` row
//! 10. **HealthScoreRefresh** - recompute the health score
//!
//! Stages other than the timing check and the remote sync are best-effort:
//! failures are logged, reported through `StageCompleted { success: false }`
//! and the run continues.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use core_sync::{SyncBridges, SyncEngineConfig, SyncOrchestrator};
//!
//! let orchestrator = SyncOrchestrator::new(
//!     pool,
//!     event_bus,
//!     bridges,
//!     &data_dir,
//!     SyncEngineConfig::default(),
//!     FeatureFlags::default(),
//! )?;
//!
//! let result = orchestrator.perform_intelligent_sync("user-1").await?;
//! if !result.success {
//!     println!("Sync stopped at {}: {}", result.stage, result.message);
//! }
//! ```

use crate::backup::{
    Backup, BackupEngine, BackupTrigger, BackupType, CleanupReport, RestoreResult,
};
use crate::config::{secs, SyncEngineConfig};
use crate::conflict::{recommended_strategy, ConflictEngine};
use crate::edit_lock::{EditLockManager, LockOutcome};
use crate::insights::{InsightsEngine, OptimizationTip, SyncHealthScore};
use crate::integrity::IntegrityEngine;
use crate::network::{calculate_optimal_batch_size, NetworkOptimizer, NetworkSpeed};
use crate::pending::{ChangeStatus, PendingChange, PendingChangeRepository, SqlitePendingChangeRepository};
use crate::prefetch::{PrefetchEngine, PrefetchReport};
use crate::recovery::{
    DataLossEvent, DataLossType, RecoveryAction, RecoveryEngine, RecoveryResult,
};
use crate::session::{
    EditActivity, EditActivityRepository, EditingSession, EditingSessionRepository,
    SqliteEditActivityRepository, SqliteEditingSessionRepository,
};
use crate::settings::{SqliteSyncSettingsRepository, SyncSettingsRepository};
use crate::statistics::{
    SqliteSyncStatisticsRepository, StatisticsPeriod, SyncStatisticsRecord,
    SyncStatisticsRepository, SyncStatisticsSummary,
};
use crate::{Result, SyncError};
use bridge_traits::network::{NetworkMonitor, NetworkStatus};
use bridge_traits::storage::FileSystemAccess;
use bridge_traits::sync::{
    ContentMerger, DeviceIdentity, IncrementalSyncRequest, RemoteSyncTransport,
};
use bridge_traits::time::Clock;
use core_library::{
    RecordRef, RecordType, SetlistRepository, SongRepository, SongUsage, SqliteSetlistRepository,
    SqliteSongRepository,
};
use core_runtime::config::FeatureFlags;
use core_runtime::events::{CoreEvent, EventBus, LibraryEvent, SyncEvent};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

/// Retry delay while another run for the same user is in flight
const IN_PROGRESS_RETRY: i64 = 60;
/// Retry delay while the network is down
const OFFLINE_RETRY: i64 = 5 * 60;
/// Batch size used when the network probe fails
const FALLBACK_BATCH_SIZE: usize = 10;

// ============================================================================
// Types
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SyncStage {
    TimingCheck,
    PreSyncBackup,
    ConflictResolution,
    PredictivePrefetch,
    NetworkProbe,
    RemoteSync,
    IntegrityVerification,
    PostSyncBackup,
    StatisticsRecording,
    HealthScoreRefresh,
}

impl SyncStage {
    pub const COUNT: u8 = 10;

    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStage::TimingCheck => "timing_check",
            SyncStage::PreSyncBackup => "pre_sync_backup",
            SyncStage::ConflictResolution => "conflict_resolution",
            SyncStage::PredictivePrefetch => "predictive_prefetch",
            SyncStage::NetworkProbe => "network_probe",
            SyncStage::RemoteSync => "remote_sync",
            SyncStage::IntegrityVerification => "integrity_verification",
            SyncStage::PostSyncBackup => "post_sync_backup",
            SyncStage::StatisticsRecording => "statistics_recording",
            SyncStage::HealthScoreRefresh => "health_score_refresh",
        }
    }

    /// 1-based position in the pipeline
    pub fn step(&self) -> u8 {
        match self {
            SyncStage::TimingCheck => 1,
            SyncStage::PreSyncBackup => 2,
            SyncStage::ConflictResolution => 3,
            SyncStage::PredictivePrefetch => 4,
            SyncStage::NetworkProbe => 5,
            SyncStage::RemoteSync => 6,
            SyncStage::IntegrityVerification => 7,
            SyncStage::PostSyncBackup => 8,
            SyncStage::StatisticsRecording => 9,
            SyncStage::HealthScoreRefresh => 10,
        }
    }
}

impl std::fmt::Display for SyncStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncResult {
    /// Set once the run passed the timing check
    pub run_id: Option<String>,
    pub success: bool,
    /// Last stage reached
    pub stage: SyncStage,
    pub message: String,
    pub records_synced: u64,
    pub health_score: Option<f64>,
    pub duration: Duration,
}

impl SyncResult {
    fn stopped(stage: SyncStage, message: impl Into<String>, started: Instant) -> Self {
        Self {
            run_id: None,
            success: false,
            stage,
            message: message.into(),
            records_synced: 0,
            health_score: None,
            duration: started.elapsed(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncDecision {
    pub should_sync: bool,
    pub reason: String,
    pub next_recommended_time: Option<i64>,
}

impl SyncDecision {
    fn go(reason: &str) -> Self {
        Self {
            should_sync: true,
            reason: reason.to_string(),
            next_recommended_time: None,
        }
    }

    fn wait(reason: impl Into<String>, next: Option<i64>) -> Self {
        Self {
            should_sync: false,
            reason: reason.into(),
            next_recommended_time: next,
        }
    }
}

/// Outcome of one maintenance pass; every step is best-effort
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaintenanceReport {
    pub locks_expired: u64,
    pub sessions_closed: u64,
    pub backups_removed: usize,
    pub songs_prefetched: usize,
    pub data_loss_events: usize,
    pub events_recovered: usize,
    pub errors: Vec<String>,
}

impl MaintenanceReport {
    fn failed(&mut self, step: &str, error: SyncError) {
        warn!(step, error = %error, "Maintenance step failed");
        self.errors.push(format!("{}: {}", step, error));
    }
}

/// Host capabilities the orchestrator depends on
#[derive(Clone)]
pub struct SyncBridges {
    pub clock: Arc<dyn Clock>,
    pub file_system: Arc<dyn FileSystemAccess>,
    pub transport: Arc<dyn RemoteSyncTransport>,
    pub device_identity: Arc<dyn DeviceIdentity>,
    pub network_monitor: Option<Arc<dyn NetworkMonitor>>,
    pub content_merger: Option<Arc<dyn ContentMerger>>,
}

struct NetworkProbe {
    speed: NetworkSpeed,
    batch_size: usize,
    bytes_original: u64,
    bytes_transferred: u64,
}

/// A pending change frozen into the bytes handed to the remote replica
struct OutgoingRecord {
    change: PendingChange,
    payload: Vec<u8>,
    /// Local version in `payload`; `None` for a deletion tombstone
    version: Option<i64>,
}

impl OutgoingRecord {
    fn is_tombstone(&self) -> bool {
        self.version.is_none()
    }
}

// ============================================================================
// Orchestrator
// ============================================================================

pub struct SyncOrchestrator {
    config: SyncEngineConfig,
    features: FeatureFlags,
    clock: Arc<dyn Clock>,
    event_bus: EventBus,
    transport: Arc<dyn RemoteSyncTransport>,
    device_identity: Arc<dyn DeviceIdentity>,
    network_monitor: Option<Arc<dyn NetworkMonitor>>,

    locks: Arc<EditLockManager>,
    conflicts: ConflictEngine,
    network: Arc<NetworkOptimizer>,
    backups: Arc<BackupEngine>,
    integrity: Arc<IntegrityEngine>,
    recovery: RecoveryEngine,
    prefetch: PrefetchEngine,
    insights: InsightsEngine,

    sessions: SqliteEditingSessionRepository,
    activity: SqliteEditActivityRepository,
    pending: SqlitePendingChangeRepository,
    settings: SqliteSyncSettingsRepository,
    statistics: SqliteSyncStatisticsRepository,
    songs: SqliteSongRepository,
    setlists: SqliteSetlistRepository,

    /// Run id per user with a sync in flight
    active_syncs: Mutex<HashMap<String, String>>,
}

impl SyncOrchestrator {
    pub fn new(
        pool: SqlitePool,
        event_bus: EventBus,
        bridges: SyncBridges,
        data_dir: &Path,
        config: SyncEngineConfig,
        features: FeatureFlags,
    ) -> Result<Self> {
        config.validate()?;
        let clock = bridges.clock;

        let locks = Arc::new(EditLockManager::new(
            pool.clone(),
            clock.clone(),
            event_bus.clone(),
            config.lock_ttl,
        ));
        let conflicts = ConflictEngine::new(
            pool.clone(),
            clock.clone(),
            event_bus.clone(),
            locks.clone(),
            bridges.content_merger,
            config.activity_window,
        );
        let network = Arc::new(NetworkOptimizer::new(
            pool.clone(),
            clock.clone(),
            bridges.network_monitor.clone(),
            config.compression_threshold_bytes,
            config.throughput_window,
        ));
        let backups = Arc::new(BackupEngine::new(
            pool.clone(),
            clock.clone(),
            event_bus.clone(),
            bridges.file_system.clone(),
            data_dir,
            &config,
        ));
        let integrity = Arc::new(IntegrityEngine::new(
            pool.clone(),
            clock.clone(),
            event_bus.clone(),
            backups.clone(),
        ));
        let recovery = RecoveryEngine::new(
            pool.clone(),
            clock.clone(),
            event_bus.clone(),
            backups.clone(),
            integrity.clone(),
            bridges.transport.clone(),
            config.remote_sync_timeout,
        );
        let prefetch = PrefetchEngine::new(
            pool.clone(),
            clock.clone(),
            bridges.file_system,
            data_dir,
            config.prefetch_concurrency,
        );
        let insights = InsightsEngine::new(
            pool.clone(),
            clock.clone(),
            backups.clone(),
            integrity.clone(),
            network.clone(),
            &config,
        );

        Ok(Self {
            features,
            clock,
            event_bus,
            transport: bridges.transport,
            device_identity: bridges.device_identity,
            network_monitor: bridges.network_monitor,
            locks,
            conflicts,
            network,
            backups,
            integrity,
            recovery,
            prefetch,
            insights,
            sessions: SqliteEditingSessionRepository::new(pool.clone()),
            activity: SqliteEditActivityRepository::new(pool.clone()),
            pending: SqlitePendingChangeRepository::new(pool.clone()),
            settings: SqliteSyncSettingsRepository::new(pool.clone()),
            statistics: SqliteSyncStatisticsRepository::new(pool.clone()),
            songs: SqliteSongRepository::new(pool.clone()),
            setlists: SqliteSetlistRepository::new(pool),
            active_syncs: Mutex::new(HashMap::new()),
            config,
        })
    }

    pub fn config(&self) -> &SyncEngineConfig {
        &self.config
    }

    pub fn device_id(&self) -> String {
        self.device_identity.device_id()
    }

    pub async fn is_sync_running(&self, user_id: &str) -> bool {
        self.active_syncs.lock().await.contains_key(user_id)
    }

    fn emit(&self, event: SyncEvent) {
        self.event_bus.emit(CoreEvent::Sync(event)).ok();
    }

    fn stage_done(&self, run_id: &str, stage: SyncStage, success: bool) {
        debug!(run_id, stage = %stage, success, "Stage finished");
        self.emit(SyncEvent::StageCompleted {
            run_id: run_id.to_string(),
            stage: stage.as_str().to_string(),
            success,
            step: stage.step(),
            total_steps: SyncStage::COUNT,
        });
    }

    // ------------------------------------------------------------------------
    // Timing
    // ------------------------------------------------------------------------

    /// Decide whether a sync should start now
    pub async fn should_sync_now(&self, user_id: &str) -> Result<SyncDecision> {
        let running = self.is_sync_running(user_id).await;
        self.decide(user_id, running).await
    }

    async fn decide(&self, user_id: &str, running: bool) -> Result<SyncDecision> {
        let now = self.clock.unix_timestamp();

        if !self.settings.is_sync_enabled().await? {
            return Ok(SyncDecision::wait("Sync is disabled", None));
        }

        if running {
            return Ok(SyncDecision::wait(
                "Sync already in progress",
                Some(now + IN_PROGRESS_RETRY),
            ));
        }

        if self.features.enable_network_awareness {
            if let Some(monitor) = &self.network_monitor {
                match monitor.get_network_info().await {
                    Ok(info) if info.status == NetworkStatus::Disconnected => {
                        return Ok(SyncDecision::wait(
                            "Network is disconnected",
                            Some(now + OFFLINE_RETRY),
                        ));
                    }
                    Ok(_) => {}
                    Err(e) => warn!(error = %e, "Network status unavailable"),
                }
            }
        }

        if let Some(last_edit) = self.sessions.latest_active_edit().await? {
            let quiet = secs(self.config.edit_quiet_period);
            if now - last_edit < quiet {
                return Ok(SyncDecision::wait(
                    "Editing in progress",
                    Some(last_edit + quiet),
                ));
            }
        }

        if self.pending.count_by_status(ChangeStatus::Pending).await? > 0 {
            return Ok(SyncDecision::go("Local changes are waiting"));
        }

        let Some(last) = self.statistics.last_successful(user_id).await? else {
            return Ok(SyncDecision::go("No previous sync"));
        };

        let interval = secs(self.config.min_sync_interval);
        if now - last.completed_at >= interval {
            Ok(SyncDecision::go("Sync interval elapsed"))
        } else {
            Ok(SyncDecision::wait(
                "Synced recently",
                Some(last.completed_at + interval),
            ))
        }
    }

    // ------------------------------------------------------------------------
    // Pipeline
    // ------------------------------------------------------------------------

    /// Run the full sync pipeline for `user_id`
    #[instrument(skip(self))]
    pub async fn perform_intelligent_sync(&self, user_id: &str) -> Result<SyncResult> {
        let started = Instant::now();
        let run_id = Uuid::new_v4().to_string();

        {
            let mut active = self.active_syncs.lock().await;
            if active.contains_key(user_id) {
                info!(user_id, "Sync already in progress");
                return Ok(SyncResult::stopped(
                    SyncStage::TimingCheck,
                    SyncError::SyncInProgress {
                        user_id: user_id.to_string(),
                    }
                    .to_string(),
                    started,
                ));
            }
            active.insert(user_id.to_string(), run_id.clone());
        }

        let mut stage = None;
        let result = self.run_pipeline(&run_id, user_id, started, &mut stage).await;
        self.active_syncs.lock().await.remove(user_id);

        if let Err(e) = &result {
            error!(run_id = %run_id, error = %e, "Sync run aborted");
            // Nothing to report for a run that never got past the timing check
            if let Some(stage) = stage {
                self.emit(SyncEvent::Failed {
                    run_id: run_id.clone(),
                    stage: stage.as_str().to_string(),
                    message: e.to_string(),
                    recoverable: true,
                });
            }
        }
        result
    }

    /// `stage` tracks the stage in progress once the run has started
    async fn run_pipeline(
        &self,
        run_id: &str,
        user_id: &str,
        started: Instant,
        stage: &mut Option<SyncStage>,
    ) -> Result<SyncResult> {
        // 1. Timing
        let decision = self.decide(user_id, false).await?;
        if !decision.should_sync {
            debug!(user_id, reason = %decision.reason, "Sync skipped");
            return Ok(SyncResult::stopped(
                SyncStage::TimingCheck,
                decision.reason,
                started,
            ));
        }

        info!(run_id, user_id, reason = %decision.reason, "Sync started");
        self.emit(SyncEvent::Started {
            run_id: run_id.to_string(),
            user_id: user_id.to_string(),
        });

        let mut stats = SyncStatisticsRecord::new(user_id, self.clock.unix_timestamp());
        stats.id = run_id.to_string();
        stats.during_active_editing = self.sessions.has_active().await.unwrap_or(false);
        self.stage_done(run_id, SyncStage::TimingCheck, true);

        // 2. Pre-sync backup
        *stage = Some(SyncStage::PreSyncBackup);
        let pre_backup = self
            .backup_now(BackupTrigger::Scheduled, BackupType::Incremental)
            .await;
        if let Err(e) = &pre_backup {
            warn!(run_id, error = %e, "Pre-sync backup failed");
        } else {
            stats.backups_created += 1;
        }
        self.stage_done(run_id, SyncStage::PreSyncBackup, pre_backup.is_ok());

        // 3. Conflicts
        match self.resolve_conflicts().await {
            Ok((detected, resolved)) => {
                stats.conflicts_detected = detected as i64;
                stats.conflicts_resolved = resolved as i64;
                self.stage_done(run_id, SyncStage::ConflictResolution, true);
            }
            Err(e) => {
                warn!(run_id, error = %e, "Conflict resolution failed");
                self.stage_done(run_id, SyncStage::ConflictResolution, false);
            }
        }

        // 4. Prefetch
        if self.features.enable_prefetch {
            let prefetched = self.predict_and_prefetch().await;
            if let Err(e) = &prefetched {
                warn!(run_id, error = %e, "Predictive prefetch failed");
            }
            self.stage_done(run_id, SyncStage::PredictivePrefetch, prefetched.is_ok());
        } else {
            self.stage_done(run_id, SyncStage::PredictivePrefetch, true);
        }

        // 5. Network
        *stage = Some(SyncStage::NetworkProbe);
        let changes = self.pending.list_open().await?;
        let outgoing = self.collect_outgoing(changes).await?;
        let batch_size = match self.probe_network(&outgoing).await {
            Ok(probe) => {
                stats.bytes_original = probe.bytes_original as i64;
                stats.bytes_transferred = probe.bytes_transferred as i64;
                debug!(run_id, speed = %probe.speed, batch_size = probe.batch_size, "Network probed");
                self.stage_done(run_id, SyncStage::NetworkProbe, true);
                probe.batch_size
            }
            Err(e) => {
                warn!(run_id, error = %e, "Network probe failed");
                self.stage_done(run_id, SyncStage::NetworkProbe, false);
                FALLBACK_BATCH_SIZE
            }
        };

        // 6. Remote sync
        *stage = Some(SyncStage::RemoteSync);
        let record_ids: Vec<String> = outgoing.iter().map(|r| r.change.record_id.clone()).collect();
        let request = IncrementalSyncRequest::new(user_id)
            .with_records(record_ids.clone())
            .with_batch_size(batch_size);

        let call_started = Instant::now();
        let call = tokio::time::timeout(
            self.config.remote_sync_timeout,
            self.transport.perform_incremental_sync(&request),
        )
        .await;

        let report = match call {
            Ok(Ok(report)) => report,
            Ok(Err(e)) => {
                return self
                    .abort_remote_sync(run_id, &record_ids, stats, started, SyncError::Transport(e.to_string()))
                    .await
            }
            Err(_) => {
                let error = SyncError::Timeout(self.config.remote_sync_timeout.as_secs());
                return self
                    .abort_remote_sync(run_id, &record_ids, stats, started, error)
                    .await;
            }
        };

        self.network
            .record_transfer_sample(stats.bytes_transferred.max(0) as u64, call_started.elapsed())
            .await;

        let now = self.clock.unix_timestamp();
        let pushed: Vec<PendingChange> = outgoing.iter().map(|r| r.change.clone()).collect();
        let closed = self.pending.mark_synced(&pushed, now).await?;
        if (closed as usize) < pushed.len() {
            debug!(
                run_id,
                requeued = pushed.len() - closed as usize,
                "Records edited during sync stay queued"
            );
        }

        for record in &outgoing {
            let change = &record.change;
            if let Some(version) = record.version {
                let id = &change.record_id;
                match change.record_type {
                    RecordType::Song => self.songs.mark_synced(id, version).await?,
                    RecordType::Setlist => self.setlists.mark_synced(id, version).await?,
                };
            }
            if let Err(e) = self
                .network
                .compute_delta(&change.record_id, change.record_type, &record.payload)
                .await
            {
                warn!(run_id, record_id = %change.record_id, error = %e, "Delta baseline not saved");
            }
        }
        stats.records_synced = record_ids.len() as i64;
        info!(
            run_id,
            pushed = report.records_pushed,
            pulled = report.records_pulled,
            "Remote sync finished"
        );
        self.stage_done(run_id, SyncStage::RemoteSync, true);

        // 7. Integrity; pushed deletions are gone on purpose
        *stage = Some(SyncStage::IntegrityVerification);
        let refs: Vec<RecordRef> = outgoing
            .iter()
            .filter(|r| !r.is_tombstone())
            .map(|r| record_ref(&r.change))
            .collect();
        match self.integrity.verify_and_repair(&refs).await {
            Ok(verification) => {
                if !verification.is_clean() {
                    warn!(
                        run_id,
                        corrupted = verification.corrupted_count,
                        repaired = verification.repaired_count,
                        "Integrity issues after sync"
                    );
                }
                self.stage_done(run_id, SyncStage::IntegrityVerification, true);
            }
            Err(e) => {
                warn!(run_id, error = %e, "Integrity verification failed");
                self.stage_done(run_id, SyncStage::IntegrityVerification, false);
            }
        }

        // 8. Post-sync backup
        let post_backup = self
            .backup_now(BackupTrigger::DataChange, BackupType::Incremental)
            .await;
        if let Err(e) = &post_backup {
            warn!(run_id, error = %e, "Post-sync backup failed");
        } else {
            stats.backups_created += 1;
        }
        self.stage_done(run_id, SyncStage::PostSyncBackup, post_backup.is_ok());

        // 9. Statistics
        stats.success = true;
        stats.stage = SyncStage::StatisticsRecording.as_str().to_string();
        self.finish_stats(&mut stats, started);
        let recorded = self.statistics.insert(&stats).await;
        if let Err(e) = &recorded {
            warn!(run_id, error = %e, "Recording sync statistics failed");
        }
        self.stage_done(run_id, SyncStage::StatisticsRecording, recorded.is_ok());

        // 10. Health
        let health_score = match self.insights.calculate_sync_health_score().await {
            Ok(score) => Some(score.overall),
            Err(e) => {
                warn!(run_id, error = %e, "Health score refresh failed");
                None
            }
        };
        self.stage_done(run_id, SyncStage::HealthScoreRefresh, health_score.is_some());

        let duration = started.elapsed();
        info!(
            run_id,
            records = stats.records_synced,
            duration_ms = duration.as_millis() as u64,
            "Sync completed"
        );
        self.emit(SyncEvent::Completed {
            run_id: run_id.to_string(),
            records_synced: stats.records_synced as u64,
            duration_ms: duration.as_millis() as u64,
            health_score,
        });

        Ok(SyncResult {
            run_id: Some(run_id.to_string()),
            success: true,
            stage: SyncStage::HealthScoreRefresh,
            message: format!("Synced {} records", stats.records_synced),
            records_synced: stats.records_synced as u64,
            health_score,
            duration,
        })
    }

    fn finish_stats(&self, stats: &mut SyncStatisticsRecord, started: Instant) {
        stats.completed_at = self.clock.unix_timestamp();
        stats.duration_ms = started.elapsed().as_millis() as i64;
    }

    async fn abort_remote_sync(
        &self,
        run_id: &str,
        record_ids: &[String],
        mut stats: SyncStatisticsRecord,
        started: Instant,
        error: SyncError,
    ) -> Result<SyncResult> {
        error!(run_id, error = %error, "Remote sync failed");
        let message = error.to_string();

        if let Err(e) = self
            .pending
            .mark_failed(record_ids, &message, self.clock.unix_timestamp())
            .await
        {
            warn!(run_id, error = %e, "Marking changes failed did not persist");
        }

        stats.success = false;
        stats.stage = SyncStage::RemoteSync.as_str().to_string();
        stats.error_message = Some(message.clone());
        self.finish_stats(&mut stats, started);
        if let Err(e) = self.statistics.insert(&stats).await {
            warn!(run_id, error = %e, "Recording sync statistics failed");
        }

        self.stage_done(run_id, SyncStage::RemoteSync, false);
        self.emit(SyncEvent::Failed {
            run_id: run_id.to_string(),
            stage: SyncStage::RemoteSync.as_str().to_string(),
            message: message.clone(),
            recoverable: true,
        });

        Ok(SyncResult {
            run_id: Some(run_id.to_string()),
            success: false,
            stage: SyncStage::RemoteSync,
            message,
            records_synced: 0,
            health_score: None,
            duration: started.elapsed(),
        })
    }

    async fn backup_now(&self, trigger: BackupTrigger, backup_type: BackupType) -> Result<Backup> {
        let snapshot = self.backups.capture_snapshot().await?;
        self.backups
            .create_backup(trigger, backup_type, &snapshot)
            .await
    }

    /// Returns (detected, resolved)
    async fn resolve_conflicts(&self) -> Result<(usize, usize)> {
        let device_id = self.device_id();
        let detected = self.conflicts.scan_for_conflicts(&device_id).await?.len();

        let mut resolved = 0;
        for detection in self.conflicts.unresolved_conflicts().await? {
            let strategy = recommended_strategy(detection.risk_level);
            match self
                .conflicts
                .resolve_conflict(&detection.id, strategy, &device_id)
                .await
            {
                Ok(outcome) if outcome.resolved => resolved += 1,
                Ok(outcome) => debug!(
                    record_id = %detection.record_id,
                    message = %outcome.message,
                    "Conflict left open"
                ),
                Err(e) => warn!(record_id = %detection.record_id, error = %e, "Conflict resolution failed"),
            }
        }
        Ok((detected, resolved))
    }

    async fn predict_and_prefetch(&self) -> Result<PrefetchReport> {
        self.prefetch
            .predict_upcoming_songs(self.config.prediction_limit)
            .await?;
        self.prefetch.prefetch_predicted_songs().await
    }

    /// Freeze each change into its wire payload before anything is sent
    async fn collect_outgoing(&self, changes: Vec<PendingChange>) -> Result<Vec<OutgoingRecord>> {
        let mut outgoing = Vec::with_capacity(changes.len());
        for change in changes {
            let (payload, version) = self.record_payload(&change).await?;
            outgoing.push(OutgoingRecord {
                change,
                payload,
                version,
            });
        }
        Ok(outgoing)
    }

    async fn probe_network(&self, outgoing: &[OutgoingRecord]) -> Result<NetworkProbe> {
        let speed = self.network.estimate_network_speed().await;
        let mut probe = NetworkProbe {
            speed,
            batch_size: calculate_optimal_batch_size(speed),
            bytes_original: 0,
            bytes_transferred: 0,
        };

        for record in outgoing {
            let compressed = self
                .network
                .compress(&record.payload, record.change.record_type)?;
            let delta = self
                .network
                .preview_delta(&record.change.record_id, &record.payload)
                .await?;

            probe.bytes_original += record.payload.len() as u64;
            probe.bytes_transferred += if delta.has_delta {
                delta.delta_size.min(compressed.compressed_size)
            } else {
                compressed.compressed_size
            } as u64;
        }
        Ok(probe)
    }

    /// Wire form of a pending record and the local version it carries
    ///
    /// A record whose row is gone goes out as a tombstone with no version.
    async fn record_payload(&self, change: &PendingChange) -> Result<(Vec<u8>, Option<i64>)> {
        let tombstone = || serde_json::json!({ "id": change.record_id, "deleted": true });
        let (value, version) = match change.record_type {
            RecordType::Song => match self.songs.find_by_id(&change.record_id).await? {
                Some(song) => (serde_json::to_value(&song), Some(song.local_version)),
                None => (Ok(tombstone()), None),
            },
            RecordType::Setlist => match self.setlists.find_by_id(&change.record_id).await? {
                Some(setlist) => {
                    let entries = self.setlists.entries(&setlist.id).await?;
                    let version = setlist.local_version;
                    (
                        Ok(serde_json::json!({ "setlist": setlist, "entries": entries })),
                        Some(version),
                    )
                }
                None => (Ok(tombstone()), None),
            },
        };

        let value = value.map_err(|e| SyncError::Serialization(e.to_string()))?;
        let payload = serde_json::to_vec(&value).map_err(|e| SyncError::Serialization(e.to_string()))?;
        Ok((payload, version))
    }

    // ------------------------------------------------------------------------
    // Editing
    // ------------------------------------------------------------------------

    pub async fn acquire_edit_lock(
        &self,
        record_id: &str,
        record_type: RecordType,
    ) -> Result<LockOutcome> {
        self.locks
            .acquire(record_id, record_type, &self.device_id())
            .await
    }

    pub async fn release_edit_lock(&self, lock_id: &str) -> Result<bool> {
        self.locks.release(lock_id).await
    }

    pub async fn start_editing_session(
        &self,
        record_id: &str,
        record_type: RecordType,
        user_id: &str,
    ) -> Result<EditingSession> {
        let session = EditingSession::new(
            record_id,
            record_type,
            self.device_id(),
            user_id,
            self.clock.unix_timestamp(),
        );
        self.sessions.insert(&session).await?;
        debug!(session_id = %session.id, record_id, "Editing session started");
        Ok(session)
    }

    pub async fn end_editing_session(&self, session_id: &str) -> Result<bool> {
        self.sessions
            .end(session_id, self.clock.unix_timestamp())
            .await
    }

    /// Register one save inside an editing session
    #[instrument(skip(self))]
    pub async fn record_edit(&self, session_id: &str) -> Result<EditActivity> {
        let session = self
            .sessions
            .find_by_id(session_id)
            .await?
            .filter(|s| s.is_active)
            .ok_or_else(|| SyncError::not_found("EditingSession", session_id))?;

        let now = self.clock.unix_timestamp();
        let activity = EditActivity::new(
            &session.record_id,
            session.record_type,
            &session.device_id,
            Some(session.id.clone()),
            now,
        );
        self.activity.insert(&activity).await?;
        self.sessions.touch(&session.id, now).await?;

        let event = match session.record_type {
            RecordType::Song => {
                self.songs.bump_local_version(&session.record_id, now).await?;
                LibraryEvent::SongUpdated {
                    song_id: session.record_id.clone(),
                }
            }
            RecordType::Setlist => {
                self.setlists
                    .bump_local_version(&session.record_id, now)
                    .await?;
                LibraryEvent::SetlistUpdated {
                    setlist_id: session.record_id.clone(),
                }
            }
        };
        self.pending
            .enqueue(&session.record_id, session.record_type, now)
            .await?;
        self.event_bus.emit(CoreEvent::Library(event)).ok();

        Ok(activity)
    }

    pub async fn record_song_usage(
        &self,
        song_id: &str,
        context: Option<String>,
    ) -> Result<SongUsage> {
        self.prefetch.record_usage(song_id, context).await
    }

    // ------------------------------------------------------------------------
    // Backups and recovery
    // ------------------------------------------------------------------------

    pub async fn create_manual_backup(&self) -> Result<Backup> {
        self.backup_now(BackupTrigger::Manual, BackupType::Full)
            .await
    }

    /// Backup taken right before a performance; never expires
    pub async fn create_performance_backup(&self) -> Result<Backup> {
        self.backup_now(BackupTrigger::BeforePerformance, BackupType::Snapshot)
            .await
    }

    pub async fn list_backups(&self) -> Result<Vec<Backup>> {
        self.backups.list_backups().await
    }

    pub async fn restore_backup(&self, backup_id: &str) -> Result<RestoreResult> {
        self.backups.restore_backup(backup_id).await
    }

    pub async fn detect_data_loss(&self) -> Result<Vec<DataLossEvent>> {
        self.recovery.detect_data_loss().await
    }

    pub async fn auto_recover(&self, event_id: &str) -> Result<RecoveryResult> {
        self.recovery.auto_recover(event_id).await
    }

    pub async fn suggest_recovery_actions(&self, event_id: &str) -> Result<Vec<RecoveryAction>> {
        self.recovery.suggest_recovery_actions(event_id).await
    }

    pub async fn minimize_data_loss(&self, event_id: &str) -> Result<Backup> {
        self.recovery.minimize_data_loss(event_id).await
    }

    pub async fn report_device_failure(
        &self,
        device_id: &str,
        affected_records: Vec<String>,
    ) -> Result<DataLossEvent> {
        self.recovery
            .report_device_failure(device_id, affected_records)
            .await
    }

    pub async fn resume_sync(&self) -> Result<()> {
        self.recovery.resume_sync().await
    }

    // ------------------------------------------------------------------------
    // Insights
    // ------------------------------------------------------------------------

    pub async fn get_sync_health_score(&self) -> Result<SyncHealthScore> {
        self.insights.get_sync_health_score().await
    }

    pub async fn get_optimization_tips(&self) -> Result<Vec<OptimizationTip>> {
        self.insights.generate_optimization_tips().await
    }

    pub async fn get_sync_statistics(&self, period: StatisticsPeriod) -> Result<SyncStatisticsSummary> {
        let since = period.start(self.clock.unix_timestamp());
        let records = self.statistics.list_since(since).await?;
        Ok(SyncStatisticsSummary::from_records(&records))
    }

    // ------------------------------------------------------------------------
    // Maintenance
    // ------------------------------------------------------------------------

    /// One best-effort housekeeping pass
    #[instrument(skip(self))]
    pub async fn run_background_maintenance(&self) -> MaintenanceReport {
        let mut report = MaintenanceReport::default();
        let now = self.clock.unix_timestamp();

        match self.locks.sweep_expired().await {
            Ok(n) => report.locks_expired = n,
            Err(e) => report.failed("lock sweep", e),
        }

        let cutoff = now - secs(self.config.idle_session_timeout);
        match self.sessions.close_idle(cutoff, now).await {
            Ok(n) => report.sessions_closed = n,
            Err(e) => report.failed("idle sessions", e),
        }

        match self.backups.cleanup_old_backups().await {
            Ok(CleanupReport {
                expired, evicted, ..
            }) => report.backups_removed = expired + evicted,
            Err(e) => report.failed("backup cleanup", e),
        }

        if self.features.enable_prefetch {
            match self.predict_and_prefetch().await {
                Ok(prefetch) => report.songs_prefetched = prefetch.prefetched,
                Err(e) => report.failed("prefetch", e),
            }
        }

        match self.recovery.detect_data_loss().await {
            Ok(events) => {
                report.data_loss_events = events.len();
                if self.features.enable_auto_recovery {
                    for event in events.iter().filter(|e| {
                        e.can_recover && e.loss_type != DataLossType::DeviceFailure
                    }) {
                        match self.recovery.auto_recover(&event.id).await {
                            Ok(result) if result.success => report.events_recovered += 1,
                            Ok(_) => {}
                            Err(e) => report.failed("auto recovery", e),
                        }
                    }
                }
            }
            Err(e) => report.failed("data loss detection", e),
        }

        info!(
            locks_expired = report.locks_expired,
            sessions_closed = report.sessions_closed,
            backups_removed = report.backups_removed,
            data_loss_events = report.data_loss_events,
            errors = report.errors.len(),
            "Maintenance pass finished"
        );
        report
    }

    /// Run maintenance every `interval` until `token` is cancelled
    ///
    /// Returns `None` when background maintenance is disabled.
    pub fn spawn_background_maintenance(
        self: &Arc<Self>,
        interval: Duration,
        token: CancellationToken,
    ) -> Option<JoinHandle<()>> {
        if !self.features.enable_background_maintenance {
            debug!("Background maintenance disabled");
            return None;
        }

        let orchestrator = Arc::clone(self);
        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = token.cancelled() => {
                        debug!("Background maintenance stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        orchestrator.run_background_maintenance().await;
                    }
                }
            }
        }))
    }
}

fn record_ref(change: &PendingChange) -> RecordRef {
    match change.record_type {
        RecordType::Song => RecordRef::song(change.record_id.clone()),
        RecordType::Setlist => RecordRef::setlist(change.record_id.clone()),
    }
}

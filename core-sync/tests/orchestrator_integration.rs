//! End-to-end runs of the sync pipeline against a real SQLite file and the
//! desktop file system.

use async_trait::async_trait;
use bridge_desktop::TokioFileSystem;
use bridge_traits::error::{BridgeError, Result as BridgeResult};
use bridge_traits::storage::FileSystemAccess;
use bridge_traits::sync::{
    IncrementalSyncRequest, RemoteSyncTransport, StaticDeviceIdentity, SyncTransportReport,
};
use bridge_traits::time::ManualClock;
use core_library::db::{create_pool, DatabaseConfig};
use core_library::{
    RecordType, Setlist, SetlistRepository, Song, SongRepository, SqliteSetlistRepository,
    SqliteSongRepository,
};
use core_runtime::config::FeatureFlags;
use core_runtime::events::{CoreEvent, EventBus, SyncEvent};
use core_sync::{
    BackupTrigger, DataLossType, PendingChangeRepository, RecoveryOutcome, StatisticsPeriod,
    SyncBridges, SyncEngineConfig, SyncOrchestrator, SyncStage, TipCategory,
};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

const NOW: i64 = 1_700_000_000;
const USER: &str = "drummer";

/// Remote replica that records every request and can be switched offline
#[derive(Default)]
struct RecordingTransport {
    requests: Mutex<Vec<IncrementalSyncRequest>>,
    offline: AtomicBool,
}

impl RecordingTransport {
    fn requests(&self) -> Vec<IncrementalSyncRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl RemoteSyncTransport for RecordingTransport {
    async fn perform_incremental_sync(
        &self,
        request: &IncrementalSyncRequest,
    ) -> BridgeResult<SyncTransportReport> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(BridgeError::Transport("connection refused".to_string()));
        }
        self.requests.lock().unwrap().push(request.clone());
        Ok(SyncTransportReport {
            records_pushed: request.record_ids.len() as u64,
            records_pulled: 0,
        })
    }
}

struct Harness {
    _dir: TempDir,
    data_dir: PathBuf,
    clock: Arc<ManualClock>,
    bus: EventBus,
    transport: Arc<RecordingTransport>,
    songs: SqliteSongRepository,
    setlists: SqliteSetlistRepository,
    pending: core_sync::pending::SqlitePendingChangeRepository,
    orchestrator: SyncOrchestrator,
}

async fn harness() -> Harness {
    let dir = TempDir::new().unwrap();
    let data_dir = dir.path().join("data");
    let pool = create_pool(DatabaseConfig::new(dir.path().join("library.db")))
        .await
        .unwrap();

    let clock = Arc::new(ManualClock::at_timestamp(NOW));
    let bus = EventBus::new(512);
    let transport = Arc::new(RecordingTransport::default());
    let fs = Arc::new(TokioFileSystem::with_directories(
        dir.path().join("cache"),
        data_dir.clone(),
    ));

    let bridges = SyncBridges {
        clock: clock.clone(),
        file_system: fs,
        transport: transport.clone(),
        device_identity: Arc::new(StaticDeviceIdentity::new("laptop")),
        network_monitor: None,
        content_merger: None,
    };
    let orchestrator = SyncOrchestrator::new(
        pool.clone(),
        bus.clone(),
        bridges,
        &data_dir,
        SyncEngineConfig::default(),
        FeatureFlags::default(),
    )
    .unwrap();

    Harness {
        _dir: dir,
        data_dir,
        clock,
        bus,
        transport,
        songs: SqliteSongRepository::new(pool.clone()),
        setlists: SqliteSetlistRepository::new(pool.clone()),
        pending: core_sync::pending::SqlitePendingChangeRepository::new(pool),
        orchestrator,
    }
}

async fn seed_library(h: &Harness) {
    for (id, title) in [("song-a", "Intro Jam"), ("song-b", "Ballad"), ("song-c", "Encore")] {
        let song = Song::new(title, format!("{{title: {}}}\n[G]Verse", title), NOW).with_id(id);
        h.songs.insert(&song).await.unwrap();
        h.pending.enqueue(id, RecordType::Song, NOW).await.unwrap();
    }

    let setlist = Setlist::new("Saturday Gig", Some(NOW + 2 * 3_600), NOW)
        .with_id("set-1")
        .with_venue("The Anchor");
    h.setlists.insert(&setlist).await.unwrap();
    h.setlists
        .set_entries("set-1", &["song-a".to_string(), "song-b".to_string()])
        .await
        .unwrap();
    h.pending
        .enqueue("set-1", RecordType::Setlist, NOW)
        .await
        .unwrap();
}

#[tokio::test]
async fn test_sync_persists_backups_and_prefetch_cache() {
    let h = harness().await;
    let mut rx = h.bus.subscribe();
    seed_library(&h).await;

    let result = h.orchestrator.perform_intelligent_sync(USER).await.unwrap();
    assert!(result.success, "{}", result.message);
    assert_eq!(result.records_synced, 4);

    let requests = h.transport.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].user_id, USER);
    assert_eq!(requests[0].record_ids.len(), 4);
    assert!(requests[0].batch_size >= 1);

    for id in ["song-a", "song-b", "song-c"] {
        let song = h.songs.find_by_id(id).await.unwrap().unwrap();
        assert!(!song.has_unsynced_changes(), "{} still dirty", id);
    }

    // Backup blobs land on disk
    let backups = h.orchestrator.list_backups().await.unwrap();
    assert_eq!(backups.len(), 2);
    for backup in &backups {
        assert!(PathBuf::from(&backup.blob_path).exists());
        assert!(backup.blob_path.starts_with(h.data_dir.to_string_lossy().as_ref()));
    }

    // Songs of the upcoming setlist were prefetched
    let prefetch_dir = h.data_dir.join("prefetch");
    assert!(prefetch_dir.join("song-a.json").exists());
    assert!(prefetch_dir.join("song-b.json").exists());

    let mut completed = false;
    while let Ok(event) = rx.try_recv() {
        if let CoreEvent::Sync(SyncEvent::Completed { records_synced, .. }) = event {
            assert_eq!(records_synced, 4);
            completed = true;
        }
    }
    assert!(completed);
}

#[tokio::test]
async fn test_second_sync_waits_for_interval() {
    let h = harness().await;
    seed_library(&h).await;

    assert!(h.orchestrator.perform_intelligent_sync(USER).await.unwrap().success);

    let early = h.orchestrator.perform_intelligent_sync(USER).await.unwrap();
    assert!(!early.success);
    assert_eq!(early.stage, SyncStage::TimingCheck);

    h.clock.advance(chrono::Duration::minutes(16));
    let later = h.orchestrator.perform_intelligent_sync(USER).await.unwrap();
    assert!(later.success, "{}", later.message);
    assert_eq!(later.records_synced, 0);
    assert_eq!(h.transport.requests().len(), 2);

    let stats = h
        .orchestrator
        .get_sync_statistics(StatisticsPeriod::Day)
        .await
        .unwrap();
    assert_eq!(stats.total_syncs, 2);
    assert_eq!(stats.success_rate, 1.0);
}

#[tokio::test]
async fn test_offline_failure_then_recovery_resync() {
    let h = harness().await;
    seed_library(&h).await;

    h.transport.offline.store(true, Ordering::SeqCst);
    let failed = h.orchestrator.perform_intelligent_sync(USER).await.unwrap();
    assert!(!failed.success);
    assert_eq!(failed.stage, SyncStage::RemoteSync);

    let events = h.orchestrator.detect_data_loss().await.unwrap();
    let sync_failure = events
        .iter()
        .find(|e| e.loss_type == DataLossType::SyncFailure)
        .expect("sync failure event");
    assert_eq!(sync_failure.affected_records.len(), 4);

    h.transport.offline.store(false, Ordering::SeqCst);
    let recovered = h.orchestrator.auto_recover(&sync_failure.id).await.unwrap();
    assert!(recovered.success);
    assert!(matches!(
        recovered.outcome,
        RecoveryOutcome::Resynced { record_count: 4 }
    ));
    assert!(h.pending.list_open().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_deleted_song_restored_from_backup() {
    let h = harness().await;
    seed_library(&h).await;

    let backup = h.orchestrator.create_manual_backup().await.unwrap();
    assert_eq!(backup.trigger, BackupTrigger::Manual);

    h.songs.delete("song-c").await.unwrap();
    h.clock.advance(chrono::Duration::minutes(10));

    let events = h.orchestrator.detect_data_loss().await.unwrap();
    let deletion = events
        .iter()
        .find(|e| e.loss_type == DataLossType::Deletion)
        .expect("deletion event");
    assert_eq!(deletion.affected_records, vec!["song-c".to_string()]);

    let actions = h
        .orchestrator
        .suggest_recovery_actions(&deletion.id)
        .await
        .unwrap();
    assert!(!actions.is_empty());

    let result = h.orchestrator.auto_recover(&deletion.id).await.unwrap();
    assert!(result.success, "{}", result.message());
    let restored = h.songs.find_by_id("song-c").await.unwrap().unwrap();
    assert_eq!(restored.title, "Encore");

    // Nothing left to detect
    assert!(h.orchestrator.detect_data_loss().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_minimize_data_loss_suspends_until_resumed() {
    let h = harness().await;
    seed_library(&h).await;

    let event = h
        .orchestrator
        .report_device_failure("tablet", vec!["song-a".to_string()])
        .await
        .unwrap();
    let emergency = h.orchestrator.minimize_data_loss(&event.id).await.unwrap();
    assert_eq!(emergency.trigger, BackupTrigger::Emergency);

    let decision = h.orchestrator.should_sync_now(USER).await.unwrap();
    assert!(!decision.should_sync);

    h.orchestrator.resume_sync().await.unwrap();
    assert!(h.orchestrator.should_sync_now(USER).await.unwrap().should_sync);
}

#[tokio::test]
async fn test_health_score_and_tips_after_sync() {
    let h = harness().await;
    seed_library(&h).await;
    h.orchestrator.perform_intelligent_sync(USER).await.unwrap();

    let score = h.orchestrator.get_sync_health_score().await.unwrap();
    assert!((0.0..=100.0).contains(&score.overall));
    assert_eq!(score.reliability, 100.0);

    // Cached until the TTL passes
    let again = h.orchestrator.get_sync_health_score().await.unwrap();
    assert_eq!(again.calculated_at, score.calculated_at);

    let tips = h.orchestrator.get_optimization_tips().await.unwrap();
    // Fresh backups from the run itself
    assert!(!tips.iter().any(|t| t.category == TipCategory::Backups));
}

#[tokio::test]
async fn test_backup_round_trip_through_disk() {
    let h = harness().await;
    seed_library(&h).await;

    let backup = h.orchestrator.create_manual_backup().await.unwrap();
    h.songs.delete("song-a").await.unwrap();
    h.songs.delete("song-b").await.unwrap();

    let restored = h.orchestrator.restore_backup(&backup.id).await.unwrap();
    assert!(restored.success, "{}", restored.message);
    assert!(h.songs.find_by_id("song-a").await.unwrap().is_some());
    assert!(h.songs.find_by_id("song-b").await.unwrap().is_some());

    let fs = TokioFileSystem::with_directories(h.data_dir.join("c"), h.data_dir.clone());
    let blob = fs
        .read_file(&PathBuf::from(&backup.blob_path))
        .await
        .unwrap();
    assert_eq!(blob.len() as i64, backup.compressed_size);
}

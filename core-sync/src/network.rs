//! # Network Optimization Engine
//!
//! Shrinks what goes over the wire and sizes batches to the link.
//!
//! ## Overview
//!
//! - **Compression**: payloads below the threshold are sent as-is; larger
//!   ones use Zstd for songs and Lz4 for setlists.
//! - **Deltas**: each record keeps its last synced payload as a baseline.
//!   The next payload is diffed against it by trimming the common prefix and
//!   suffix; the replaced span plus a small header is the delta.
//! - **Speed tiers**: measured throughput when samples exist, otherwise the
//!   host's [`NetworkMonitor`] view of the link.

use crate::{Result, SyncError};
use bridge_traits::network::{NetworkMonitor, NetworkStatus, NetworkType};
use bridge_traits::time::Clock;
use bytes::Bytes;
use core_library::RecordType;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use sqlx::{FromRow, SqlitePool};
use std::collections::VecDeque;
use std::io::Cursor;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, instrument};
use uuid::Uuid;

/// Fixed overhead of an encoded delta (offsets and lengths)
pub const DELTA_HEADER_BYTES: usize = 16;

/// Shortest transfer that counts as a throughput sample
const MIN_SAMPLE_DURATION: Duration = Duration::from_millis(1);

// ============================================================================
// Compression
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionAlgorithm {
    None,
    Zstd,
    Lz4,
}

impl CompressionAlgorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            CompressionAlgorithm::None => "none",
            CompressionAlgorithm::Zstd => "zstd",
            CompressionAlgorithm::Lz4 => "lz4",
        }
    }

    /// Algorithm used for a record type's payloads
    pub fn for_record_type(record_type: RecordType) -> Self {
        match record_type {
            RecordType::Song => CompressionAlgorithm::Zstd,
            RecordType::Setlist => CompressionAlgorithm::Lz4,
        }
    }
}

impl FromStr for CompressionAlgorithm {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "none" => Ok(CompressionAlgorithm::None),
            "zstd" => Ok(CompressionAlgorithm::Zstd),
            "lz4" => Ok(CompressionAlgorithm::Lz4),
            _ => Err(SyncError::invalid_value("compression", s)),
        }
    }
}

impl std::fmt::Display for CompressionAlgorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CompressionResult {
    pub algorithm: CompressionAlgorithm,
    pub original_size: usize,
    pub compressed_size: usize,
    /// original / compressed, 1.0 when uncompressed
    pub ratio: f64,
    pub data: Bytes,
}

impl CompressionResult {
    fn uncompressed(payload: &[u8]) -> Self {
        Self {
            algorithm: CompressionAlgorithm::None,
            original_size: payload.len(),
            compressed_size: payload.len(),
            ratio: 1.0,
            data: Bytes::copy_from_slice(payload),
        }
    }
}

/// Encode `payload` with a specific algorithm
pub fn compress_with(payload: &[u8], algorithm: CompressionAlgorithm) -> Result<Vec<u8>> {
    match algorithm {
        CompressionAlgorithm::None => Ok(payload.to_vec()),
        CompressionAlgorithm::Zstd => zstd::stream::encode_all(Cursor::new(payload), 0)
            .map_err(|e| SyncError::Compression(format!("zstd encode: {}", e))),
        CompressionAlgorithm::Lz4 => Ok(lz4_flex::compress_prepend_size(payload)),
    }
}

/// Inverse of [`compress_with`]
pub fn decompress(data: &[u8], algorithm: CompressionAlgorithm) -> Result<Vec<u8>> {
    match algorithm {
        CompressionAlgorithm::None => Ok(data.to_vec()),
        CompressionAlgorithm::Zstd => zstd::stream::decode_all(Cursor::new(data))
            .map_err(|e| SyncError::Compression(format!("zstd decode: {}", e))),
        CompressionAlgorithm::Lz4 => lz4_flex::decompress_size_prepended(data)
            .map_err(|e| SyncError::Compression(format!("lz4 decode: {}", e))),
    }
}

/// Compress a record payload, skipping small or incompressible ones
pub fn compress(
    payload: &[u8],
    record_type: RecordType,
    threshold_bytes: usize,
) -> Result<CompressionResult> {
    if payload.len() < threshold_bytes {
        return Ok(CompressionResult::uncompressed(payload));
    }

    let algorithm = CompressionAlgorithm::for_record_type(record_type);
    let data = compress_with(payload, algorithm)?;

    if data.len() >= payload.len() {
        return Ok(CompressionResult::uncompressed(payload));
    }

    Ok(CompressionResult {
        algorithm,
        original_size: payload.len(),
        compressed_size: data.len(),
        ratio: payload.len() as f64 / data.len() as f64,
        data: Bytes::from(data),
    })
}

// ============================================================================
// Deltas
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct DeltaResult {
    pub record_id: String,
    pub version: i64,
    /// False when there was no baseline and the full payload must be sent
    pub has_delta: bool,
    pub full_size: usize,
    pub delta_size: usize,
    pub bytes_saved: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct DeltaSyncRecord {
    pub id: String,
    pub record_id: String,
    pub record_type: String,
    pub version: i64,
    pub delta_size: i64,
    pub full_size: i64,
    pub compression_ratio: f64,
    pub sync_time: i64,
    pub payload_hash: String,
}

/// Bytes of `new` that differ from `old` once the shared prefix and suffix
/// are trimmed
pub fn changed_span(old: &[u8], new: &[u8]) -> usize {
    let prefix = old.iter().zip(new).take_while(|(a, b)| a == b).count();
    let max_suffix = old.len().min(new.len()) - prefix;
    let suffix = old[prefix..]
        .iter()
        .rev()
        .zip(new[prefix..].iter().rev())
        .take(max_suffix)
        .take_while(|(a, b)| a == b)
        .count();

    new.len() - prefix - suffix
}

/// Encoded delta size, never larger than the full payload
pub fn delta_size(old: &[u8], new: &[u8]) -> usize {
    (changed_span(old, new) + DELTA_HEADER_BYTES).min(new.len())
}

fn diff_against(record_id: &str, baseline: Option<&(i64, Vec<u8>)>, payload: &[u8]) -> DeltaResult {
    let full_size = payload.len();
    let (version, has_delta, delta) = match baseline {
        Some((previous, old)) => (previous + 1, true, delta_size(old, payload)),
        None => (1, false, full_size),
    };

    DeltaResult {
        record_id: record_id.to_string(),
        version,
        has_delta,
        full_size,
        delta_size: delta,
        bytes_saved: full_size - delta,
    }
}

// ============================================================================
// Network speed
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum NetworkSpeed {
    VeryPoor,
    Poor,
    Moderate,
    Good,
    Excellent,
}

impl NetworkSpeed {
    pub fn as_str(&self) -> &'static str {
        match self {
            NetworkSpeed::Excellent => "excellent",
            NetworkSpeed::Good => "good",
            NetworkSpeed::Moderate => "moderate",
            NetworkSpeed::Poor => "poor",
            NetworkSpeed::VeryPoor => "very_poor",
        }
    }

    /// Tier for a measured throughput
    pub fn from_kbps(kbps: f64) -> Self {
        if kbps >= 10_000.0 {
            NetworkSpeed::Excellent
        } else if kbps >= 2_000.0 {
            NetworkSpeed::Good
        } else if kbps >= 500.0 {
            NetworkSpeed::Moderate
        } else if kbps >= 100.0 {
            NetworkSpeed::Poor
        } else {
            NetworkSpeed::VeryPoor
        }
    }
}

impl std::fmt::Display for NetworkSpeed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AdaptiveQuality {
    Full,
    High,
    Medium,
    Low,
    Essential,
}

pub fn determine_adaptive_quality(speed: NetworkSpeed) -> AdaptiveQuality {
    match speed {
        NetworkSpeed::Excellent => AdaptiveQuality::Full,
        NetworkSpeed::Good => AdaptiveQuality::High,
        NetworkSpeed::Moderate => AdaptiveQuality::Medium,
        NetworkSpeed::Poor => AdaptiveQuality::Low,
        NetworkSpeed::VeryPoor => AdaptiveQuality::Essential,
    }
}

pub fn calculate_optimal_batch_size(speed: NetworkSpeed) -> usize {
    match determine_adaptive_quality(speed) {
        AdaptiveQuality::Full => 50,
        AdaptiveQuality::High => 25,
        AdaptiveQuality::Medium => 10,
        AdaptiveQuality::Low => 5,
        AdaptiveQuality::Essential => 1,
    }
}

// ============================================================================
// Engine
// ============================================================================

pub struct NetworkOptimizer {
    pool: SqlitePool,
    clock: Arc<dyn Clock>,
    network_monitor: Option<Arc<dyn NetworkMonitor>>,
    compression_threshold: usize,
    throughput_window: usize,
    samples: Mutex<VecDeque<f64>>,
}

impl NetworkOptimizer {
    pub fn new(
        pool: SqlitePool,
        clock: Arc<dyn Clock>,
        network_monitor: Option<Arc<dyn NetworkMonitor>>,
        compression_threshold: usize,
        throughput_window: usize,
    ) -> Self {
        Self {
            pool,
            clock,
            network_monitor,
            compression_threshold,
            throughput_window: throughput_window.max(1),
            samples: Mutex::new(VecDeque::new()),
        }
    }

    pub fn compress(&self, payload: &[u8], record_type: RecordType) -> Result<CompressionResult> {
        compress(payload, record_type, self.compression_threshold)
    }

    /// Diff `payload` against the record's baseline without persisting it
    ///
    /// The reported version is the one [`compute_delta`](Self::compute_delta)
    /// would assign.
    pub async fn preview_delta(&self, record_id: &str, payload: &[u8]) -> Result<DeltaResult> {
        let baseline: Option<(i64, Vec<u8>)> =
            sqlx::query_as("SELECT version, payload FROM delta_baselines WHERE record_id = ?")
                .bind(record_id)
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| SyncError::Database(e.to_string()))?;

        Ok(diff_against(record_id, baseline.as_ref(), payload))
    }

    /// Diff `payload` against the record's baseline and persist it as the
    /// new baseline
    ///
    /// Call only once the remote replica holds `payload`.
    #[instrument(skip(self, payload), fields(full_size = payload.len()))]
    pub async fn compute_delta(
        &self,
        record_id: &str,
        record_type: RecordType,
        payload: &[u8],
    ) -> Result<DeltaResult> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| SyncError::Database(e.to_string()))?;

        let baseline: Option<(i64, Vec<u8>)> =
            sqlx::query_as("SELECT version, payload FROM delta_baselines WHERE record_id = ?")
                .bind(record_id)
                .fetch_optional(&mut *tx)
                .await
                .map_err(|e| SyncError::Database(e.to_string()))?;

        let delta = diff_against(record_id, baseline.as_ref(), payload);
        let ratio = if delta.delta_size == 0 {
            1.0
        } else {
            delta.full_size as f64 / delta.delta_size as f64
        };

        sqlx::query(
            r#"
            INSERT INTO delta_sync_records (
                id, record_id, record_type, version, delta_size,
                full_size, compression_ratio, sync_time, payload_hash
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(Uuid::new_v4().to_string())
        .bind(record_id)
        .bind(record_type.as_str())
        .bind(delta.version)
        .bind(delta.delta_size as i64)
        .bind(delta.full_size as i64)
        .bind(ratio)
        .bind(self.clock.unix_timestamp())
        .bind(format!("{:x}", Sha256::digest(payload)))
        .execute(&mut *tx)
        .await
        .map_err(|e| SyncError::Database(e.to_string()))?;

        sqlx::query(
            r#"
            INSERT INTO delta_baselines (record_id, version, payload) VALUES (?, ?, ?)
            ON CONFLICT(record_id) DO UPDATE SET
                version = excluded.version,
                payload = excluded.payload
            "#,
        )
        .bind(record_id)
        .bind(delta.version)
        .bind(payload)
        .execute(&mut *tx)
        .await
        .map_err(|e| SyncError::Database(e.to_string()))?;

        tx.commit()
            .await
            .map_err(|e| SyncError::Database(e.to_string()))?;

        debug!(record_id, version = delta.version, delta_size = delta.delta_size, "Computed delta");

        Ok(delta)
    }

    /// Delta records for one record, oldest version first
    pub async fn delta_history(&self, record_id: &str) -> Result<Vec<DeltaSyncRecord>> {
        sqlx::query_as::<_, DeltaSyncRecord>(
            "SELECT * FROM delta_sync_records WHERE record_id = ? ORDER BY version",
        )
        .bind(record_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| SyncError::Database(e.to_string()))
    }

    /// Mean delta compression ratio and record count since `since`
    pub async fn compression_summary(&self, since: i64) -> Result<(f64, i64)> {
        let (avg, count): (Option<f64>, i64) = sqlx::query_as(
            "SELECT AVG(compression_ratio), COUNT(*) FROM delta_sync_records WHERE sync_time >= ?",
        )
        .bind(since)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| SyncError::Database(e.to_string()))?;

        Ok((avg.unwrap_or(1.0), count))
    }

    /// Feed one completed transfer into the rolling throughput window
    ///
    /// Transfers that moved nothing, or finished too fast to time, say nothing
    /// about the link and are dropped.
    pub async fn record_transfer_sample(&self, bytes: u64, elapsed: Duration) {
        let secs = elapsed.as_secs_f64();
        if bytes == 0 || elapsed < MIN_SAMPLE_DURATION {
            return;
        }

        let kbps = bytes as f64 * 8.0 / 1000.0 / secs;
        let mut samples = self.samples.lock().await;
        samples.push_back(kbps);
        while samples.len() > self.throughput_window {
            samples.pop_front();
        }
    }

    pub async fn estimate_network_speed(&self) -> NetworkSpeed {
        {
            let samples = self.samples.lock().await;
            if !samples.is_empty() {
                let mean = samples.iter().sum::<f64>() / samples.len() as f64;
                return NetworkSpeed::from_kbps(mean);
            }
        }

        let Some(monitor) = &self.network_monitor else {
            return NetworkSpeed::Moderate;
        };

        match monitor.get_network_info().await {
            Ok(info) => match (info.status, info.network_type) {
                (NetworkStatus::Disconnected, _) => NetworkSpeed::VeryPoor,
                (_, Some(NetworkType::Cellular)) if info.is_metered || info.is_expensive => {
                    NetworkSpeed::Poor
                }
                (_, Some(NetworkType::Cellular)) => NetworkSpeed::Moderate,
                (_, Some(NetworkType::WiFi)) => NetworkSpeed::Good,
                (_, Some(NetworkType::Ethernet)) => NetworkSpeed::Excellent,
                _ => NetworkSpeed::Moderate,
            },
            Err(e) => {
                debug!(error = %e, "Network info unavailable");
                NetworkSpeed::Moderate
            }
        }
    }
}

//! # Sync Engine Configuration
//!
//! Tunables shared by every engine in the crate. All values have defaults
//! suited to a single musician with a few devices; hosts override individual
//! values with the `with_*` builders.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use core_sync::SyncEngineConfig;
//! use std::time::Duration;
//!
//! let config = SyncEngineConfig::default()
//!     .with_lock_ttl(Duration::from_secs(600))
//!     .with_min_sync_interval(Duration::from_secs(300));
//! config.validate()?;
//! ```

use crate::{Result, SyncError};
use std::time::Duration;

/// Engine tunables
#[derive(Debug, Clone, PartialEq)]
pub struct SyncEngineConfig {
    /// Lifetime of a freshly acquired or renewed edit lock
    pub lock_ttl: Duration,

    /// Window in which edits from several devices count as concurrent
    pub activity_window: Duration,

    /// Sync waits this long after the last edit in an active session
    pub edit_quiet_period: Duration,

    /// Sessions without an edit for this long are closed by maintenance
    pub idle_session_timeout: Duration,

    /// Payloads smaller than this are sent uncompressed
    pub compression_threshold_bytes: usize,

    /// Number of throughput samples kept for speed estimation
    pub throughput_window: usize,

    /// The most recent backups are never deleted by cleanup
    pub recent_backups_to_keep: usize,

    /// Cleanup evicts unprotected backups above this count
    pub max_backups: usize,

    /// Minimum time between two successful syncs when nothing is pending
    pub min_sync_interval: Duration,

    /// Timeout for the remote transport call
    pub remote_sync_timeout: Duration,

    /// Number of songs kept in the prediction table
    pub prediction_limit: usize,

    /// Concurrent prefetch writes
    pub prefetch_concurrency: usize,

    /// Trailing window used for health scoring and tips
    pub health_window: Duration,

    /// How long a computed health score is served from cache
    pub health_cache_ttl: Duration,

    /// Backup storage above this many bytes raises a tip
    pub storage_budget_bytes: u64,
}

impl Default for SyncEngineConfig {
    fn default() -> Self {
        Self {
            lock_ttl: Duration::from_secs(5 * 60),
            activity_window: Duration::from_secs(10 * 60),
            edit_quiet_period: Duration::from_secs(2 * 60),
            idle_session_timeout: Duration::from_secs(30 * 60),
            compression_threshold_bytes: 1024,
            throughput_window: 20,
            recent_backups_to_keep: 10,
            max_backups: 50,
            min_sync_interval: Duration::from_secs(15 * 60),
            remote_sync_timeout: Duration::from_secs(5 * 60),
            prediction_limit: 20,
            prefetch_concurrency: 4,
            health_window: Duration::from_secs(30 * 24 * 3600),
            health_cache_ttl: Duration::from_secs(5 * 60),
            storage_budget_bytes: 500 * 1024 * 1024, // 500 MB
        }
    }
}

impl SyncEngineConfig {
    pub fn with_lock_ttl(mut self, ttl: Duration) -> Self {
        self.lock_ttl = ttl;
        self
    }

    pub fn with_activity_window(mut self, window: Duration) -> Self {
        self.activity_window = window;
        self
    }

    pub fn with_edit_quiet_period(mut self, period: Duration) -> Self {
        self.edit_quiet_period = period;
        self
    }

    pub fn with_idle_session_timeout(mut self, timeout: Duration) -> Self {
        self.idle_session_timeout = timeout;
        self
    }

    pub fn with_compression_threshold(mut self, bytes: usize) -> Self {
        self.compression_threshold_bytes = bytes;
        self
    }

    pub fn with_throughput_window(mut self, samples: usize) -> Self {
        self.throughput_window = samples;
        self
    }

    pub fn with_backup_limits(mut self, keep_recent: usize, max_backups: usize) -> Self {
        self.recent_backups_to_keep = keep_recent;
        self.max_backups = max_backups;
        self
    }

    pub fn with_min_sync_interval(mut self, interval: Duration) -> Self {
        self.min_sync_interval = interval;
        self
    }

    pub fn with_remote_sync_timeout(mut self, timeout: Duration) -> Self {
        self.remote_sync_timeout = timeout;
        self
    }

    pub fn with_prediction_limit(mut self, limit: usize) -> Self {
        self.prediction_limit = limit;
        self
    }

    pub fn with_prefetch_concurrency(mut self, concurrency: usize) -> Self {
        self.prefetch_concurrency = concurrency;
        self
    }

    pub fn with_health_window(mut self, window: Duration) -> Self {
        self.health_window = window;
        self
    }

    pub fn with_health_cache_ttl(mut self, ttl: Duration) -> Self {
        self.health_cache_ttl = ttl;
        self
    }

    pub fn with_storage_budget(mut self, bytes: u64) -> Self {
        self.storage_budget_bytes = bytes;
        self
    }

    /// Reject values that would make an engine misbehave
    pub fn validate(&self) -> Result<()> {
        if self.lock_ttl.is_zero() {
            return Err(invalid("lock_ttl", "must be greater than zero"));
        }

        if self.max_backups < self.recent_backups_to_keep {
            return Err(invalid(
                "max_backups",
                "must be at least the number of recent backups kept",
            ));
        }

        if self.throughput_window == 0 {
            return Err(invalid("throughput_window", "must hold at least one sample"));
        }

        if self.prediction_limit == 0 {
            return Err(invalid("prediction_limit", "must be greater than zero"));
        }

        if self.prefetch_concurrency == 0 {
            return Err(invalid("prefetch_concurrency", "must be greater than zero"));
        }

        if self.remote_sync_timeout.is_zero() {
            return Err(invalid("remote_sync_timeout", "must be greater than zero"));
        }

        Ok(())
    }
}

fn invalid(field: &str, message: &str) -> SyncError {
    SyncError::InvalidInput {
        field: field.to_string(),
        message: message.to_string(),
    }
}

/// Whole seconds of a duration as a timestamp offset
pub(crate) fn secs(duration: Duration) -> i64 {
    duration.as_secs() as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = SyncEngineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.lock_ttl, Duration::from_secs(300));
        assert_eq!(config.recent_backups_to_keep, 10);
        assert_eq!(config.max_backups, 50);
        assert_eq!(config.prediction_limit, 20);
    }

    #[test]
    fn test_backup_limits_must_be_consistent() {
        let config = SyncEngineConfig::default().with_backup_limits(20, 5);
        assert!(matches!(
            config.validate(),
            Err(SyncError::InvalidInput { field, .. }) if field == "max_backups"
        ));
    }

    #[test]
    fn test_zero_values_rejected() {
        assert!(SyncEngineConfig::default()
            .with_lock_ttl(Duration::ZERO)
            .validate()
            .is_err());
        assert!(SyncEngineConfig::default()
            .with_prefetch_concurrency(0)
            .validate()
            .is_err());
        assert!(SyncEngineConfig::default()
            .with_throughput_window(0)
            .validate()
            .is_err());
    }
}

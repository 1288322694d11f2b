//! # Core Configuration Module
//!
//! Provides configuration management for the sync core.
//!
//! ## Overview
//!
//! The configuration system uses a builder pattern to construct a `CoreConfig`
//! holding every host bridge and setting the core needs. It fails fast when a
//! required bridge is missing so hosts get an actionable message at startup
//! instead of a failed sync later.
//!
//! ## Required Dependencies
//!
//! - `RemoteSyncTransport` - The host's remote sync protocol
//! - `FileSystemAccess` - Backup blobs and prefetch cache (desktop default: tokio fs)
//!
//! ## Optional Dependencies
//!
//! - `NetworkMonitor` - Connectivity detection (desktop default: TCP probe)
//! - `DeviceIdentity` - Resolved at bootstrap when absent (desktop: persisted UUID)
//! - `ContentMerger` - Enables the `merge` conflict strategy
//! - `Clock` - Defaults to the system clock
//!
//! ## Usage
//!
//! ```ignore
//! use core_runtime::config::CoreConfig;
//! use std::sync::Arc;
//!
//! let config = CoreConfig::builder()
//!     .database_path("/path/to/library.db")
//!     .data_dir("/path/to/data")
//!     .remote_transport(Arc::new(MyTransport::new()))
//!     .enable_prefetch(true)
//!     .build()?;
//! ```

use crate::error::{Error, Result};
use crate::events::DEFAULT_EVENT_BUFFER_SIZE;
use crate::logging::LoggingConfig;
use bridge_traits::{
    ContentMerger, DeviceIdentity, FileSystemAccess, NetworkMonitor, RemoteSyncTransport,
};
use bridge_traits::time::{Clock, SystemClock};
use std::path::PathBuf;
use std::sync::Arc;

/// Main configuration for the sync core.
#[derive(Clone)]
pub struct CoreConfig {
    /// Path to the SQLite library database
    pub database_path: PathBuf,

    /// Directory for backup blobs and the prefetch cache
    pub data_dir: PathBuf,

    pub file_system: Arc<dyn FileSystemAccess>,

    pub remote_transport: Arc<dyn RemoteSyncTransport>,

    pub network_monitor: Option<Arc<dyn NetworkMonitor>>,

    pub device_identity: Option<Arc<dyn DeviceIdentity>>,

    pub content_merger: Option<Arc<dyn ContentMerger>>,

    pub clock: Arc<dyn Clock>,

    pub features: FeatureFlags,

    pub logging: LoggingConfig,

    /// Capacity of the event bus channel
    pub event_buffer_size: usize,
}

impl std::fmt::Debug for CoreConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoreConfig")
            .field("database_path", &self.database_path)
            .field("data_dir", &self.data_dir)
            .field("file_system", &"<FileSystemAccess>")
            .field("remote_transport", &"<RemoteSyncTransport>")
            .field(
                "network_monitor",
                &self.network_monitor.as_ref().map(|_| "<NetworkMonitor>"),
            )
            .field(
                "device_identity",
                &self.device_identity.as_ref().map(|id| id.device_id()),
            )
            .field(
                "content_merger",
                &self.content_merger.as_ref().map(|_| "<ContentMerger>"),
            )
            .field("features", &self.features)
            .field("logging", &self.logging)
            .field("event_buffer_size", &self.event_buffer_size)
            .finish()
    }
}

/// Feature flags for optional engine behaviour.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeatureFlags {
    /// Run predictive prefetch during sync and maintenance
    pub enable_prefetch: bool,

    /// Allow hosts to spawn the periodic maintenance task
    pub enable_background_maintenance: bool,

    /// Let maintenance run `auto_recover` on recoverable data-loss events
    pub enable_auto_recovery: bool,

    /// Consult the `NetworkMonitor` before syncing (requires a monitor)
    pub enable_network_awareness: bool,
}

impl Default for FeatureFlags {
    fn default() -> Self {
        Self {
            enable_prefetch: true,
            enable_background_maintenance: true,
            enable_auto_recovery: false,
            enable_network_awareness: false,
        }
    }
}

impl CoreConfig {
    pub fn builder() -> CoreConfigBuilder {
        CoreConfigBuilder::default()
    }

    /// Validates the configuration and returns an error if invalid.
    ///
    /// This checks:
    /// - Paths are not empty
    /// - The event buffer can hold at least one event
    /// - Feature flags are consistent with available bridges
    pub fn validate(&self) -> Result<()> {
        if self.database_path.as_os_str().is_empty() {
            return Err(Error::Config("Database path cannot be empty".to_string()));
        }

        if self.data_dir.as_os_str().is_empty() {
            return Err(Error::Config("Data directory cannot be empty".to_string()));
        }

        if self.event_buffer_size == 0 {
            return Err(Error::Config(
                "Event buffer size must be greater than 0".to_string(),
            ));
        }

        if self.features.enable_network_awareness && self.network_monitor.is_none() {
            return Err(Error::Config(
                "Network awareness enabled but no NetworkMonitor provided. \
                 Disable the feature or inject a NetworkMonitor implementation."
                    .to_string(),
            ));
        }

        Ok(())
    }
}

fn transport_missing_error() -> Error {
    Error::CapabilityMissing {
        capability: "RemoteSyncTransport".to_string(),
        message: "A remote sync transport is required to reach the remote replica. \
                 Inject the host's transport with .remote_transport()."
            .to_string(),
    }
}

#[cfg(feature = "desktop-shims")]
fn provide_default_file_system(data_dir: &std::path::Path) -> Result<Arc<dyn FileSystemAccess>> {
    use bridge_desktop::TokioFileSystem;

    let fs: Arc<dyn FileSystemAccess> = Arc::new(TokioFileSystem::with_directories(
        data_dir.join("cache"),
        data_dir.to_path_buf(),
    ));
    Ok(fs)
}

#[cfg(not(feature = "desktop-shims"))]
fn provide_default_file_system(_data_dir: &std::path::Path) -> Result<Arc<dyn FileSystemAccess>> {
    Err(Error::CapabilityMissing {
        capability: "FileSystemAccess".to_string(),
        message: "FileSystemAccess implementation is required for backup blobs. \
                 Desktop: enable the 'desktop-shims' feature to use TokioFileSystem. \
                 Mobile: inject the platform's sandboxed file access."
            .to_string(),
    })
}

#[cfg(feature = "desktop-shims")]
fn provide_default_network_monitor() -> Option<Arc<dyn NetworkMonitor>> {
    let monitor: Arc<dyn NetworkMonitor> = Arc::new(bridge_desktop::DesktopNetworkMonitor::new());
    Some(monitor)
}

#[cfg(not(feature = "desktop-shims"))]
fn provide_default_network_monitor() -> Option<Arc<dyn NetworkMonitor>> {
    None
}

/// Builder for `CoreConfig`.
#[derive(Default)]
pub struct CoreConfigBuilder {
    database_path: Option<PathBuf>,
    data_dir: Option<PathBuf>,
    file_system: Option<Arc<dyn FileSystemAccess>>,
    remote_transport: Option<Arc<dyn RemoteSyncTransport>>,
    network_monitor: Option<Arc<dyn NetworkMonitor>>,
    device_identity: Option<Arc<dyn DeviceIdentity>>,
    content_merger: Option<Arc<dyn ContentMerger>>,
    clock: Option<Arc<dyn Clock>>,
    features: FeatureFlags,
    logging: Option<LoggingConfig>,
    event_buffer_size: Option<usize>,
}

impl CoreConfigBuilder {
    /// Sets the database file path (required).
    pub fn database_path<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.database_path = Some(path.into());
        self
    }

    /// Sets the data directory (required).
    pub fn data_dir<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.data_dir = Some(path.into());
        self
    }

    pub fn file_system(mut self, fs: Arc<dyn FileSystemAccess>) -> Self {
        self.file_system = Some(fs);
        self
    }

    /// Sets the remote sync transport (required).
    pub fn remote_transport(mut self, transport: Arc<dyn RemoteSyncTransport>) -> Self {
        self.remote_transport = Some(transport);
        self
    }

    pub fn network_monitor(mut self, monitor: Arc<dyn NetworkMonitor>) -> Self {
        self.network_monitor = Some(monitor);
        self
    }

    pub fn device_identity(mut self, identity: Arc<dyn DeviceIdentity>) -> Self {
        self.device_identity = Some(identity);
        self
    }

    pub fn content_merger(mut self, merger: Arc<dyn ContentMerger>) -> Self {
        self.content_merger = Some(merger);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn enable_prefetch(mut self, enabled: bool) -> Self {
        self.features.enable_prefetch = enabled;
        self
    }

    pub fn enable_background_maintenance(mut self, enabled: bool) -> Self {
        self.features.enable_background_maintenance = enabled;
        self
    }

    pub fn enable_auto_recovery(mut self, enabled: bool) -> Self {
        self.features.enable_auto_recovery = enabled;
        self
    }

    /// Requires a `NetworkMonitor` (injected, or the desktop default).
    pub fn enable_network_awareness(mut self, enabled: bool) -> Self {
        self.features.enable_network_awareness = enabled;
        self
    }

    pub fn features(mut self, features: FeatureFlags) -> Self {
        self.features = features;
        self
    }

    pub fn logging(mut self, logging: LoggingConfig) -> Self {
        self.logging = Some(logging);
        self
    }

    pub fn event_buffer_size(mut self, size: usize) -> Self {
        self.event_buffer_size = Some(size);
        self
    }

    /// Builds the final `CoreConfig` instance.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - `database_path` or `data_dir` is missing
    /// - No `RemoteSyncTransport` was provided
    /// - No `FileSystemAccess` was provided and no platform default exists
    /// - Feature flags are inconsistent with available bridges
    pub fn build(self) -> Result<CoreConfig> {
        let database_path = self.database_path.ok_or_else(|| {
            Error::Config("Database path is required. Use .database_path() to set it.".to_string())
        })?;

        let data_dir = self.data_dir.ok_or_else(|| {
            Error::Config("Data directory is required. Use .data_dir() to set it.".to_string())
        })?;

        let remote_transport = self.remote_transport.ok_or_else(transport_missing_error)?;

        let file_system = match self.file_system {
            Some(fs) => fs,
            None => provide_default_file_system(&data_dir)?,
        };

        let network_monitor = self
            .network_monitor
            .or_else(provide_default_network_monitor);

        let config = CoreConfig {
            database_path,
            data_dir,
            file_system,
            remote_transport,
            network_monitor,
            device_identity: self.device_identity,
            content_merger: self.content_merger,
            clock: self.clock.unwrap_or_else(|| Arc::new(SystemClock)),
            features: self.features,
            logging: self.logging.unwrap_or_default(),
            event_buffer_size: self.event_buffer_size.unwrap_or(DEFAULT_EVENT_BUFFER_SIZE),
        };

        config.validate()?;

        Ok(config)
    }
}

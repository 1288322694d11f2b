//! # Host Bridge Traits
//!
//! Platform abstraction traits that must be implemented by each host platform.
//!
//! ## Overview
//!
//! This crate defines the contract between the sync core and platform-specific
//! implementations. Each trait represents a capability the core needs but that a
//! host provides differently per platform (desktop, iOS, Android).
//!
//! ## Traits
//!
//! ### Remote Sync
//! - [`RemoteSyncTransport`](sync::RemoteSyncTransport) - Opaque incremental sync against the remote replica
//! - [`DeviceIdentity`](sync::DeviceIdentity) - Stable per-device identifier used for edit locks
//! - [`ContentMerger`](sync::ContentMerger) - Optional content-level merge of conflicting edits
//!
//! ### I/O
//! - [`FileSystemAccess`](storage::FileSystemAccess) - Backup blobs and the prefetch cache
//! - [`NetworkMonitor`](network::NetworkMonitor) - Connectivity and metered network detection
//!
//! ### Utilities
//! - [`Clock`](time::Clock) - Time source for deterministic testing
//! - [`LoggerSink`](time::LoggerSink) - Forward structured logs to host logging
//!
//! ## Fail-Fast Strategy
//!
//! The core fails fast with a descriptive error when a required capability is missing:
//!
//! ```ignore
//! let transport = config.remote_transport
//!     .ok_or_else(|| Error::CapabilityMissing {
//!         capability: "RemoteSyncTransport".to_string(),
//!         message: "Inject the host's remote sync transport.".to_string(),
//!     })?;
//! ```
//!
//! ## Error Handling
//!
//! All bridge traits use [`BridgeError`](error::BridgeError). Implementations should
//! convert platform-specific errors into it and include context such as file paths.
//!
//! ## Thread Safety
//!
//! All bridge traits require `Send + Sync` so handles can be shared across tasks.

pub mod error;
pub mod network;
pub mod storage;
pub mod sync;
pub mod time;

pub use error::BridgeError;

// Re-export commonly used types
pub use network::{NetworkInfo, NetworkMonitor, NetworkStatus, NetworkType};
pub use storage::{FileMetadata, FileSystemAccess};
pub use sync::{
    ContentMerger, DeviceIdentity, IncrementalSyncRequest, RemoteSyncTransport,
    StaticDeviceIdentity, SyncTransportReport,
};
pub use time::{Clock, LogEntry, LogLevel, LoggerSink, ManualClock, SystemClock};

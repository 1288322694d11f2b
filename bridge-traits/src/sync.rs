//! Remote Sync Collaborators
//!
//! The core never speaks the remote protocol itself. Hosts inject a
//! [`RemoteSyncTransport`] that pushes and pulls changes, a [`DeviceIdentity`]
//! that names the current device, and optionally a [`ContentMerger`] for
//! content-level merges of conflicting edits.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Parameters for one incremental sync call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IncrementalSyncRequest {
    pub user_id: String,
    /// Records with local changes to push. Empty means "whatever is pending".
    pub record_ids: Vec<String>,
    /// Maximum records per round-trip, derived from the network tier.
    pub batch_size: usize,
}

impl IncrementalSyncRequest {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            record_ids: Vec::new(),
            batch_size: 1,
        }
    }

    pub fn with_records(mut self, record_ids: Vec<String>) -> Self {
        self.record_ids = record_ids;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }
}

/// What the transport reports back after a successful call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncTransportReport {
    pub records_pushed: u64,
    pub records_pulled: u64,
}

/// Remote replica transport.
///
/// Retry, paging and authentication are the transport's business; an `Err`
/// means the whole call failed and nothing should be treated as synced.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RemoteSyncTransport: Send + Sync {
    async fn perform_incremental_sync(
        &self,
        request: &IncrementalSyncRequest,
    ) -> Result<SyncTransportReport>;
}

/// Stable per-device identifier.
pub trait DeviceIdentity: Send + Sync {
    fn device_id(&self) -> String;
}

/// Fixed identity, handy for hosts that already know their device id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaticDeviceIdentity(String);

impl StaticDeviceIdentity {
    pub fn new(device_id: impl Into<String>) -> Self {
        Self(device_id.into())
    }
}

impl DeviceIdentity for StaticDeviceIdentity {
    fn device_id(&self) -> String {
        self.0.clone()
    }
}

/// Content-level merge of a record edited on several devices.
///
/// Returns `Ok(true)` when the merge produced a reconciled record.
#[async_trait]
pub trait ContentMerger: Send + Sync {
    async fn merge(&self, record_id: &str, record_type: &str) -> Result<bool>;
}

//! Device Identity Implementation

use bridge_traits::{
    error::{BridgeError, Result},
    storage::FileSystemAccess,
    sync::DeviceIdentity,
};
use bytes::Bytes;
use tracing::{debug, info};
use uuid::Uuid;

const DEVICE_ID_FILE: &str = "device_id";

/// Device identity persisted as a UUID in the application's data directory.
///
/// The id is generated on first launch and reused afterwards, so locks taken
/// before a restart are still recognised as this device's own.
#[derive(Debug, Clone)]
pub struct DesktopDeviceIdentity {
    device_id: String,
}

impl DesktopDeviceIdentity {
    /// Load the stored id, or create and persist a new one.
    pub async fn load_or_create(fs: &dyn FileSystemAccess) -> Result<Self> {
        let path = fs.get_data_directory().await?.join(DEVICE_ID_FILE);

        if fs.exists(&path).await? {
            let raw = fs.read_file(&path).await?;
            let stored = String::from_utf8_lossy(&raw).trim().to_string();
            if Uuid::parse_str(&stored).is_ok() {
                debug!(device_id = %stored, "Loaded device identity");
                return Ok(Self { device_id: stored });
            }
            return Err(BridgeError::OperationFailed(format!(
                "Stored device id is not a UUID: {stored}"
            )));
        }

        let device_id = Uuid::new_v4().to_string();
        fs.write_file(&path, Bytes::from(device_id.clone())).await?;
        info!(device_id = %device_id, "Created new device identity");

        Ok(Self { device_id })
    }
}

impl DeviceIdentity for DesktopDeviceIdentity {
    fn device_id(&self) -> String {
        self.device_id.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::TokioFileSystem;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_identity_is_stable_across_loads() {
        let root = TempDir::new().unwrap();
        let fs = TokioFileSystem::with_directories(root.path().join("c"), root.path().join("d"));

        let first = DesktopDeviceIdentity::load_or_create(&fs).await.unwrap();
        let second = DesktopDeviceIdentity::load_or_create(&fs).await.unwrap();

        assert_eq!(first.device_id(), second.device_id());
        assert!(Uuid::parse_str(&first.device_id()).is_ok());
    }

    #[tokio::test]
    async fn test_garbage_id_is_rejected() {
        let root = TempDir::new().unwrap();
        let fs = TokioFileSystem::with_directories(root.path().join("c"), root.path().join("d"));
        let path = fs.get_data_directory().await.unwrap().join(DEVICE_ID_FILE);
        fs.write_file(&path, Bytes::from_static(b"not-a-uuid"))
            .await
            .unwrap();

        assert!(DesktopDeviceIdentity::load_or_create(&fs).await.is_err());
    }
}

//! Test doubles shared by the engine tests

use async_trait::async_trait;
use bridge_traits::error::{BridgeError, Result};
use bridge_traits::storage::{FileMetadata, FileSystemAccess};
use bridge_traits::sync::{IncrementalSyncRequest, RemoteSyncTransport, SyncTransportReport};
use bytes::Bytes;
use mockall::mock;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// `FileSystemAccess` backed by a map of paths to bytes
#[derive(Default)]
pub struct MemoryFileSystem {
    files: Mutex<HashMap<PathBuf, Bytes>>,
    fail_writes_under: Mutex<Option<PathBuf>>,
}

impl MemoryFileSystem {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, path: &Path) -> Option<Bytes> {
        self.files.lock().unwrap().get(path).cloned()
    }

    pub fn put(&self, path: &Path, data: impl Into<Bytes>) {
        self.files
            .lock()
            .unwrap()
            .insert(path.to_path_buf(), data.into());
    }

    pub fn remove(&self, path: &Path) {
        self.files.lock().unwrap().remove(path);
    }

    /// Flip one bit of a stored file
    pub fn corrupt(&self, path: &Path, offset: usize) {
        let mut files = self.files.lock().unwrap();
        let data = files.get_mut(path).expect("file to corrupt");
        let mut bytes = data.to_vec();
        bytes[offset] ^= 0x01;
        *data = Bytes::from(bytes);
    }

    /// Make every write below `dir` fail
    pub fn fail_writes_under(&self, dir: &Path) {
        *self.fail_writes_under.lock().unwrap() = Some(dir.to_path_buf());
    }

    pub fn paths_under(&self, dir: &Path) -> Vec<PathBuf> {
        let mut paths: Vec<PathBuf> = self
            .files
            .lock()
            .unwrap()
            .keys()
            .filter(|p| p.starts_with(dir))
            .cloned()
            .collect();
        paths.sort();
        paths
    }
}

#[async_trait]
impl FileSystemAccess for MemoryFileSystem {
    async fn get_cache_directory(&self) -> Result<PathBuf> {
        Ok(PathBuf::from("/mem/cache"))
    }

    async fn get_data_directory(&self) -> Result<PathBuf> {
        Ok(PathBuf::from("/mem/data"))
    }

    async fn exists(&self, path: &Path) -> Result<bool> {
        Ok(self.files.lock().unwrap().contains_key(path))
    }

    async fn metadata(&self, path: &Path) -> Result<FileMetadata> {
        let files = self.files.lock().unwrap();
        let data = files
            .get(path)
            .ok_or_else(|| BridgeError::OperationFailed(format!("{} not found", path.display())))?;
        Ok(FileMetadata {
            size: data.len() as u64,
            created_at: None,
            modified_at: None,
            is_directory: false,
        })
    }

    async fn create_dir_all(&self, _path: &Path) -> Result<()> {
        Ok(())
    }

    async fn read_file(&self, path: &Path) -> Result<Bytes> {
        self.get(path)
            .ok_or_else(|| BridgeError::OperationFailed(format!("{} not found", path.display())))
    }

    async fn write_file(&self, path: &Path, data: Bytes) -> Result<()> {
        if let Some(dir) = self.fail_writes_under.lock().unwrap().as_ref() {
            if path.starts_with(dir) {
                return Err(BridgeError::OperationFailed("disk full".to_string()));
            }
        }
        self.put(path, data);
        Ok(())
    }

    async fn delete_file(&self, path: &Path) -> Result<()> {
        self.remove(path);
        Ok(())
    }

    async fn list_directory(&self, path: &Path) -> Result<Vec<PathBuf>> {
        Ok(self.paths_under(path))
    }
}

mock! {
    pub Transport {}

    #[async_trait]
    impl RemoteSyncTransport for Transport {
        async fn perform_incremental_sync(
            &self,
            request: &IncrementalSyncRequest,
        ) -> Result<SyncTransportReport>;
    }
}

/// Transport that acknowledges every request
pub fn accepting_transport() -> MockTransport {
    let mut transport = MockTransport::new();
    transport
        .expect_perform_incremental_sync()
        .returning(|request| {
            Ok(SyncTransportReport {
                records_pushed: request.record_ids.len() as u64,
                records_pulled: 0,
            })
        });
    transport
}

//! File System Access Implementation using Tokio

use async_trait::async_trait;
use bridge_traits::{
    error::{BridgeError, Result},
    storage::{FileMetadata, FileSystemAccess},
};
use bytes::Bytes;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::debug;

const APP_DIR_NAME: &str = "setlist-sync";

/// Tokio-based file system implementation
///
/// Writes go through a sibling `.tmp` file followed by a rename, so a crash
/// mid-write never leaves a truncated backup blob under its final name.
pub struct TokioFileSystem {
    cache_dir: PathBuf,
    data_dir: PathBuf,
}

impl TokioFileSystem {
    /// Create a new file system accessor with the platform's default directories
    pub fn new() -> Self {
        let cache_dir = dirs::cache_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join(APP_DIR_NAME);

        let data_dir = dirs::data_dir()
            .unwrap_or_else(|| {
                dirs::home_dir()
                    .unwrap_or_else(|| PathBuf::from("."))
                    .join(".local")
                    .join("share")
            })
            .join(APP_DIR_NAME);

        Self {
            cache_dir,
            data_dir,
        }
    }

    /// Create a new file system accessor with custom directories
    pub fn with_directories(cache_dir: PathBuf, data_dir: PathBuf) -> Self {
        Self {
            cache_dir,
            data_dir,
        }
    }

    fn map_io_error(e: std::io::Error) -> BridgeError {
        BridgeError::Io(e)
    }

    async fn ensure_dir(dir: &Path) -> Result<()> {
        if !fs::try_exists(dir).await.map_err(Self::map_io_error)? {
            fs::create_dir_all(dir).await.map_err(Self::map_io_error)?;
            debug!(path = ?dir, "Created directory");
        }
        Ok(())
    }
}

impl Default for TokioFileSystem {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl FileSystemAccess for TokioFileSystem {
    async fn get_cache_directory(&self) -> Result<PathBuf> {
        Self::ensure_dir(&self.cache_dir).await?;
        Ok(self.cache_dir.clone())
    }

    async fn get_data_directory(&self) -> Result<PathBuf> {
        Self::ensure_dir(&self.data_dir).await?;
        Ok(self.data_dir.clone())
    }

    async fn exists(&self, path: &Path) -> Result<bool> {
        fs::try_exists(path).await.map_err(Self::map_io_error)
    }

    async fn metadata(&self, path: &Path) -> Result<FileMetadata> {
        let metadata = fs::metadata(path).await.map_err(Self::map_io_error)?;

        Ok(FileMetadata {
            size: metadata.len(),
            created_at: metadata
                .created()
                .ok()
                .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
                .map(|d| d.as_secs() as i64),
            modified_at: metadata
                .modified()
                .ok()
                .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
                .map(|d| d.as_secs() as i64),
            is_directory: metadata.is_dir(),
        })
    }

    async fn create_dir_all(&self, path: &Path) -> Result<()> {
        fs::create_dir_all(path)
            .await
            .map_err(Self::map_io_error)?;
        debug!(path = ?path, "Created directory");
        Ok(())
    }

    async fn read_file(&self, path: &Path) -> Result<Bytes> {
        let data = fs::read(path).await.map_err(Self::map_io_error)?;
        debug!(path = ?path, size = data.len(), "Read file");
        Ok(Bytes::from(data))
    }

    async fn write_file(&self, path: &Path, data: Bytes) -> Result<()> {
        if let Some(parent) = path.parent() {
            Self::ensure_dir(parent).await?;
        }

        let mut tmp = path.as_os_str().to_owned();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);

        fs::write(&tmp, data.as_ref())
            .await
            .map_err(Self::map_io_error)?;
        fs::rename(&tmp, path).await.map_err(Self::map_io_error)?;

        debug!(path = ?path, size = data.len(), "Wrote file");
        Ok(())
    }

    async fn delete_file(&self, path: &Path) -> Result<()> {
        fs::remove_file(path).await.map_err(Self::map_io_error)?;
        debug!(path = ?path, "Deleted file");
        Ok(())
    }

    async fn list_directory(&self, path: &Path) -> Result<Vec<PathBuf>> {
        let mut entries = Vec::new();
        let mut read_dir = fs::read_dir(path).await.map_err(Self::map_io_error)?;

        while let Some(entry) = read_dir
            .next_entry()
            .await
            .map_err(Self::map_io_error)?
        {
            entries.push(entry.path());
        }

        debug!(path = ?path, count = entries.len(), "Listed directory");
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn temp_fs() -> (TempDir, TokioFileSystem) {
        let root = TempDir::new().unwrap();
        let fs = TokioFileSystem::with_directories(
            root.path().join("cache"),
            root.path().join("data"),
        );
        (root, fs)
    }

    #[tokio::test]
    async fn test_directories_are_created_on_demand() {
        let (root, fs) = temp_fs();

        let data_dir = fs.get_data_directory().await.unwrap();
        assert_eq!(data_dir, root.path().join("data"));
        assert!(fs.exists(&data_dir).await.unwrap());

        let cache_dir = fs.get_cache_directory().await.unwrap();
        assert_eq!(cache_dir, root.path().join("cache"));
    }

    #[tokio::test]
    async fn test_write_read_delete() {
        let (_root, fs) = temp_fs();
        let blob = fs
            .get_data_directory()
            .await
            .unwrap()
            .join("backups")
            .join("b-1.bak");

        let data = Bytes::from_static(b"compressed snapshot bytes");
        fs.write_file(&blob, data.clone()).await.unwrap();

        assert_eq!(fs.read_file(&blob).await.unwrap(), data);
        assert_eq!(fs.metadata(&blob).await.unwrap().size, data.len() as u64);

        fs.delete_file(&blob).await.unwrap();
        assert!(!fs.exists(&blob).await.unwrap());
    }

    #[tokio::test]
    async fn test_write_leaves_no_temp_file() {
        let (_root, fs) = temp_fs();
        let dir = fs.get_data_directory().await.unwrap().join("prefetch");
        let file = dir.join("song-1.json");

        fs.write_file(&file, Bytes::from_static(b"{}")).await.unwrap();
        fs.write_file(&file, Bytes::from_static(b"{\"v\":2}"))
            .await
            .unwrap();

        let entries = fs.list_directory(&dir).await.unwrap();
        assert_eq!(entries, vec![file.clone()]);
        assert_eq!(fs.read_file(&file).await.unwrap(), Bytes::from_static(b"{\"v\":2}"));
    }

    #[tokio::test]
    async fn test_directory_size_sums_files() {
        let (_root, fs) = temp_fs();
        let dir = fs.get_data_directory().await.unwrap().join("backups");

        fs.write_file(&dir.join("a.bak"), Bytes::from(vec![0u8; 100]))
            .await
            .unwrap();
        fs.write_file(&dir.join("b.bak"), Bytes::from(vec![0u8; 28]))
            .await
            .unwrap();

        assert_eq!(fs.directory_size(&dir).await.unwrap(), 128);
    }
}

//! Local byte storage for attachments.
//!
//! Path-keyed: the engine addresses files through
//! [`LocalStorageAdapter::local_uri`] so adapters control their own layout.
//! Deleting a missing file and creating an existing directory are both
//! non-errors — reconciliation retries must be idempotent.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;

use crate::error::AttachmentError;

/// Directory (relative to the adapter root) where attachment bytes live.
const ATTACHMENTS_DIR: &str = "attachments";

// ============================================================================
// LocalStorageAdapter
// ============================================================================

#[async_trait]
pub trait LocalStorageAdapter: Send + Sync {
    /// Write `data` to `path`, creating parent directories. Returns the
    /// number of bytes written.
    async fn save_file(&self, path: &str, data: &[u8]) -> Result<u64, AttachmentError>;

    /// Read the full contents of `path`. Missing files are
    /// [`AttachmentError::NotFound`].
    async fn read_file(&self, path: &str) -> Result<Vec<u8>, AttachmentError>;

    /// Delete `path`. Missing files are fine.
    async fn delete_file(&self, path: &str) -> Result<(), AttachmentError>;

    async fn file_exists(&self, path: &str) -> Result<bool, AttachmentError>;

    async fn make_dir(&self, path: &str) -> Result<(), AttachmentError>;

    async fn rm_dir(&self, path: &str) -> Result<(), AttachmentError>;

    /// Remove every stored attachment byte. The store's records are not
    /// touched; callers pair this with `disconnect_and_clear`.
    async fn clear(&self) -> Result<(), AttachmentError>;

    /// The storage path for an attachment filename.
    fn local_uri(&self, filename: &str) -> String {
        format!("{ATTACHMENTS_DIR}/{filename}")
    }
}

// ============================================================================
// FilesystemStorage
// ============================================================================

/// `LocalStorageAdapter` backed by a directory on the local filesystem.
///
/// File I/O is synchronous `std::fs` under the hood — attachment payloads
/// are small and the engine calls these off the hot path.
pub struct FilesystemStorage {
    base_dir: PathBuf,
}

impl FilesystemStorage {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    fn resolve(&self, path: &str) -> PathBuf {
        self.base_dir.join(path)
    }

    fn ensure_parent(path: &Path) -> Result<(), AttachmentError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Ok(())
    }
}

#[async_trait]
impl LocalStorageAdapter for FilesystemStorage {
    async fn save_file(&self, path: &str, data: &[u8]) -> Result<u64, AttachmentError> {
        let full = self.resolve(path);
        Self::ensure_parent(&full)?;
        std::fs::write(&full, data)?;
        Ok(data.len() as u64)
    }

    async fn read_file(&self, path: &str) -> Result<Vec<u8>, AttachmentError> {
        match std::fs::read(self.resolve(path)) {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                Err(AttachmentError::NotFound(path.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn delete_file(&self, path: &str) -> Result<(), AttachmentError> {
        match std::fs::remove_file(self.resolve(path)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn file_exists(&self, path: &str) -> Result<bool, AttachmentError> {
        Ok(self.resolve(path).exists())
    }

    async fn make_dir(&self, path: &str) -> Result<(), AttachmentError> {
        std::fs::create_dir_all(self.resolve(path))?;
        Ok(())
    }

    async fn rm_dir(&self, path: &str) -> Result<(), AttachmentError> {
        match std::fs::remove_dir_all(self.resolve(path)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn clear(&self) -> Result<(), AttachmentError> {
        self.rm_dir(ATTACHMENTS_DIR).await?;
        self.make_dir(ATTACHMENTS_DIR).await
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn storage() -> (tempfile::TempDir, FilesystemStorage) {
        let dir = tempfile::tempdir().unwrap();
        let storage = FilesystemStorage::new(dir.path());
        (dir, storage)
    }

    #[tokio::test]
    async fn save_and_read_round_trip() {
        let (_dir, storage) = storage();
        let uri = storage.local_uri("p1.jpeg");
        let written = storage.save_file(&uri, b"bigfoot bytes").await.unwrap();
        assert_eq!(written, 13);
        assert_eq!(storage.read_file(&uri).await.unwrap(), b"bigfoot bytes");
    }

    #[tokio::test]
    async fn read_missing_file_is_not_found() {
        let (_dir, storage) = storage();
        let err = storage.read_file("attachments/nope.jpeg").await.unwrap_err();
        assert!(matches!(err, AttachmentError::NotFound(_)));
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let (_dir, storage) = storage();
        let uri = storage.local_uri("p1.jpeg");
        storage.save_file(&uri, b"x").await.unwrap();
        storage.delete_file(&uri).await.unwrap();
        assert!(!storage.file_exists(&uri).await.unwrap());
        // Second delete of a missing file succeeds.
        storage.delete_file(&uri).await.unwrap();
    }

    #[tokio::test]
    async fn clear_wipes_and_recreates_the_attachments_dir() {
        let (_dir, storage) = storage();
        let uri = storage.local_uri("p1.jpeg");
        storage.save_file(&uri, b"x").await.unwrap();
        storage.clear().await.unwrap();
        assert!(!storage.file_exists(&uri).await.unwrap());
        // Directory exists again, so saves work immediately.
        storage.save_file(&uri, b"y").await.unwrap();
    }
}

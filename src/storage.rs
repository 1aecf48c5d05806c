// ==============================================================================
// storage.rs - Object Storage
// ==============================================================================
// Description: Keyed object storage contract and a filesystem-backed store
// Created: 2025-11-25
// Modified: 2025-12-02
// Version: 1.1.0
// ==============================================================================

use async_trait::async_trait;
use std::io::ErrorKind;
use std::ops::Range;
use std::path::{Component, Path, PathBuf};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::debug;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Object not found: {0}")]
    NotFound(String),

    #[error("Invalid object key: {0}")]
    InvalidKey(String),

    #[error("Invalid range {start}..{end} for {key} ({size} bytes)")]
    InvalidRange {
        key: String,
        start: u64,
        end: u64,
        size: u64,
    },

    #[error("IO error on {key}: {source}")]
    Io {
        key: String,
        #[source]
        source: std::io::Error,
    },
}

impl StorageError {
    fn from_io(key: &str, source: std::io::Error) -> Self {
        if source.kind() == ErrorKind::NotFound {
            StorageError::NotFound(key.to_string())
        } else {
            StorageError::Io {
                key: key.to_string(),
                source,
            }
        }
    }
}

/// Keyed blob storage
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Object bytes, or the `[start, end)` slice of them; `end` is clamped to the size
    async fn get(&self, key: &str, range: Option<Range<u64>>) -> Result<Vec<u8>, StorageError>;

    async fn put(&self, key: &str, body: Vec<u8>) -> Result<(), StorageError>;

    /// Store a local file under `key`, returning its size
    async fn upload_file(&self, key: &str, path: &Path) -> Result<u64, StorageError>;

    /// Copy an object to a local file, returning its size
    async fn download_file(&self, key: &str, path: &Path) -> Result<u64, StorageError>;

    /// Remove an object; removing a missing object succeeds
    async fn delete(&self, key: &str) -> Result<(), StorageError>;

    /// Object size in bytes
    async fn head(&self, key: &str) -> Result<u64, StorageError>;
}

/// Object store rooted at a local directory; keys are relative paths
#[derive(Debug, Clone)]
pub struct LocalObjectStore {
    root: PathBuf,
}

impl LocalObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn object_path(&self, key: &str) -> Result<PathBuf, StorageError> {
        let relative = Path::new(key);
        let valid = !key.is_empty()
            && relative
                .components()
                .all(|component| matches!(component, Component::Normal(_)));
        if !valid {
            return Err(StorageError::InvalidKey(key.to_string()));
        }
        Ok(self.root.join(relative))
    }

    async fn ensure_parent(key: &str, path: &Path) -> Result<(), StorageError> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| StorageError::from_io(key, e))?;
        }
        Ok(())
    }
}

#[async_trait]
impl ObjectStore for LocalObjectStore {
    async fn get(&self, key: &str, range: Option<Range<u64>>) -> Result<Vec<u8>, StorageError> {
        let path = self.object_path(key)?;

        let Some(range) = range else {
            return tokio::fs::read(&path)
                .await
                .map_err(|e| StorageError::from_io(key, e));
        };

        let mut file = tokio::fs::File::open(&path)
            .await
            .map_err(|e| StorageError::from_io(key, e))?;
        let size = file
            .metadata()
            .await
            .map_err(|e| StorageError::from_io(key, e))?
            .len();

        if range.start > range.end || range.start > size {
            return Err(StorageError::InvalidRange {
                key: key.to_string(),
                start: range.start,
                end: range.end,
                size,
            });
        }
        let end = range.end.min(size);

        file.seek(std::io::SeekFrom::Start(range.start))
            .await
            .map_err(|e| StorageError::from_io(key, e))?;

        let mut body = Vec::with_capacity((end - range.start) as usize);
        file.take(end - range.start)
            .read_to_end(&mut body)
            .await
            .map_err(|e| StorageError::from_io(key, e))?;

        debug!("Read {} bytes of {} from offset {}", body.len(), key, range.start);
        Ok(body)
    }

    async fn put(&self, key: &str, body: Vec<u8>) -> Result<(), StorageError> {
        let path = self.object_path(key)?;
        Self::ensure_parent(key, &path).await?;
        tokio::fs::write(&path, body)
            .await
            .map_err(|e| StorageError::from_io(key, e))
    }

    async fn upload_file(&self, key: &str, path: &Path) -> Result<u64, StorageError> {
        let destination = self.object_path(key)?;
        Self::ensure_parent(key, &destination).await?;
        tokio::fs::copy(path, &destination)
            .await
            .map_err(|e| StorageError::Io {
                key: key.to_string(),
                source: e,
            })
    }

    async fn download_file(&self, key: &str, path: &Path) -> Result<u64, StorageError> {
        let source = self.object_path(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| StorageError::Io {
                    key: key.to_string(),
                    source: e,
                })?;
        }
        tokio::fs::copy(&source, path)
            .await
            .map_err(|e| StorageError::from_io(key, e))
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        let path = self.object_path(key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StorageError::from_io(key, e)),
        }
    }

    async fn head(&self, key: &str) -> Result<u64, StorageError> {
        let path = self.object_path(key)?;
        let metadata = tokio::fs::metadata(&path)
            .await
            .map_err(|e| StorageError::from_io(key, e))?;
        if !metadata.is_file() {
            return Err(StorageError::NotFound(key.to_string()));
        }
        Ok(metadata.len())
    }
}

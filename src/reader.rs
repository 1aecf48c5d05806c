// ==============================================================================
// reader.rs - Paged Artifact Retrieval
// ==============================================================================
// Description: Serve one page of a flattened artifact with a single range read
// Created: 2025-11-26
// Modified: 2025-12-02
// Version: 1.1.0
// ==============================================================================

use crate::config::{index_key, ReaderConfig};
use crate::pagination::{PageIndex, PaginationError};
use crate::storage::{ObjectStore, StorageError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Error, Debug)]
pub enum RetrievalError {
    #[error("Page {page} not found ({pages} pages available)")]
    PageNotFound { page: u32, pages: usize },

    #[error("No page index for {0}")]
    IndexNotFound(String),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Corrupt page index: {0}")]
    CorruptIndex(#[from] PaginationError),

    #[error("Page {page} is not valid UTF-8")]
    Decode { page: u32 },
}

impl RetrievalError {
    /// Errors caused by the request rather than the stored data
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            RetrievalError::PageNotFound { .. } | RetrievalError::IndexNotFound(_)
        )
    }
}

/// Response to a page request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageResponse {
    /// Decoded text of the page
    pub content: String,
    /// Resolved page number
    pub page: u32,
    /// Page number -> record count, for every page
    pub pages: BTreeMap<u32, u64>,
}

/// Answers page requests against stored artifacts
pub struct PagedReader {
    store: Arc<dyn ObjectStore>,
    config: ReaderConfig,
}

impl PagedReader {
    pub fn new(store: Arc<dyn ObjectStore>, config: ReaderConfig) -> Self {
        Self { store, config }
    }

    /// Fetch `page` (default 1) of the artifact at `artifact_key`
    pub async fn read_page(&self, artifact_key: &str, page: Option<u32>) -> Result<PageResponse, RetrievalError> {
        let page = page.unwrap_or(1);
        let size = self.store.head(artifact_key).await?;

        if size <= self.config.small_artifact_threshold {
            return self.read_whole(artifact_key, page, size).await;
        }

        let index = self.load_index(artifact_key).await?;
        let entry = *index.get(page).ok_or(RetrievalError::PageNotFound {
            page,
            pages: index.len(),
        })?;

        debug!(
            "Page {} of {}: bytes {}..{} ({} bytes)",
            page,
            artifact_key,
            entry.start,
            entry.end,
            entry.len()
        );
        let bytes = self
            .store
            .get(artifact_key, Some(entry.start..entry.end))
            .await?;
        let content = String::from_utf8(bytes).map_err(|_| RetrievalError::Decode { page })?;

        Ok(PageResponse {
            content,
            page,
            pages: index.record_counts(),
        })
    }

    /// Small artifacts are served whole as a synthetic single page
    async fn read_whole(&self, artifact_key: &str, page: u32, size: u64) -> Result<PageResponse, RetrievalError> {
        if page != 1 {
            return Err(RetrievalError::PageNotFound { page, pages: 1 });
        }

        let bytes = if size == 0 {
            Vec::new()
        } else {
            self.store.get(artifact_key, None).await?
        };
        let content = String::from_utf8(bytes).map_err(|_| RetrievalError::Decode { page })?;
        let records = content.lines().filter(|line| !line.trim().is_empty()).count() as u64;

        info!("Serving {} whole ({} bytes, {} records)", artifact_key, size, records);
        Ok(PageResponse {
            content,
            page,
            pages: PageIndex::single_page(size, records).record_counts(),
        })
    }

    async fn load_index(&self, artifact_key: &str) -> Result<PageIndex, RetrievalError> {
        let key = index_key(artifact_key);
        let compressed = match self.store.get(&key, None).await {
            Ok(bytes) => bytes,
            Err(StorageError::NotFound(_)) => return Err(RetrievalError::IndexNotFound(key)),
            Err(e) => return Err(e.into()),
        };
        Ok(PageIndex::from_compressed(&compressed)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PageLimits;
    use crate::pagination::PagedWriter;
    use crate::storage::LocalObjectStore;
    use tempfile::TempDir;

    const KEY: &str = "projects/p/clinical-workflows/job.jsonl";

    async fn store_artifact(store: &LocalObjectStore, records: usize, limits: PageLimits) -> Vec<u8> {
        let mut writer = PagedWriter::new(Vec::new(), limits);
        for i in 0..records {
            let line = serde_json::to_vec(&serde_json::json!({ "type": "variant", "n": i })).unwrap();
            writer.write_record(&line).unwrap();
        }
        let (bytes, index) = writer.finish().unwrap();
        store.put(KEY, bytes.clone()).await.unwrap();
        store
            .put(&index_key(KEY), index.to_compressed().unwrap())
            .await
            .unwrap();
        bytes
    }

    fn reader(store: LocalObjectStore, threshold: u64) -> PagedReader {
        PagedReader::new(
            Arc::new(store),
            ReaderConfig {
                small_artifact_threshold: threshold,
            },
        )
    }

    #[tokio::test]
    async fn test_reads_requested_page() {
        let dir = TempDir::new().unwrap();
        let store = LocalObjectStore::new(dir.path());
        let bytes = store_artifact(&store, 25, PageLimits::new(10, 1_000_000).unwrap()).await;
        let reader = reader(store, 0);

        let response = reader.read_page(KEY, Some(2)).await.unwrap();
        assert_eq!(response.page, 2);
        assert_eq!(response.pages, BTreeMap::from([(1, 10), (2, 10), (3, 5)]));

        let text = String::from_utf8(bytes).unwrap();
        let expected: String = text.lines().skip(10).take(10).map(|l| format!("{}\n", l)).collect();
        assert_eq!(response.content, expected);

        // Default is page 1
        let first = reader.read_page(KEY, None).await.unwrap();
        assert_eq!(first.page, 1);
        assert!(first.content.contains("\"n\":0"));
    }

    #[tokio::test]
    async fn test_out_of_range_is_client_error() {
        let dir = TempDir::new().unwrap();
        let store = LocalObjectStore::new(dir.path());
        store_artifact(&store, 5, PageLimits::new(2, 1_000_000).unwrap()).await;
        let reader = reader(store, 0);

        for page in [0, 4] {
            let err = reader.read_page(KEY, Some(page)).await.unwrap_err();
            assert!(matches!(err, RetrievalError::PageNotFound { pages: 3, .. }));
            assert!(err.is_client_error());
        }
    }

    #[tokio::test]
    async fn test_small_artifact_bypass() {
        let dir = TempDir::new().unwrap();
        let store = LocalObjectStore::new(dir.path());
        // No index is stored for small artifacts
        store.put(KEY, b"{\"a\":1}\n{\"a\":2}\n".to_vec()).await.unwrap();
        let reader = reader(store, 5_000_000);

        let response = reader.read_page(KEY, None).await.unwrap();
        assert_eq!(response.content, "{\"a\":1}\n{\"a\":2}\n");
        assert_eq!(response.pages, BTreeMap::from([(1, 2)]));

        assert!(reader.read_page(KEY, Some(2)).await.unwrap_err().is_client_error());
    }

    #[tokio::test]
    async fn test_missing_index() {
        let dir = TempDir::new().unwrap();
        let store = LocalObjectStore::new(dir.path());
        store.put(KEY, b"{}\n".to_vec()).await.unwrap();
        let reader = reader(store, 0);

        let err = reader.read_page(KEY, Some(1)).await.unwrap_err();
        assert!(matches!(err, RetrievalError::IndexNotFound(_)));
    }

    #[tokio::test]
    async fn test_missing_artifact() {
        let dir = TempDir::new().unwrap();
        let reader = reader(LocalObjectStore::new(dir.path()), 0);
        let err = reader.read_page(KEY, None).await.unwrap_err();
        assert!(matches!(err, RetrievalError::Storage(StorageError::NotFound(_))));
        assert!(!err.is_client_error());
    }
}

// ==============================================================================
// error.rs - Pipeline Error Taxonomy
// ==============================================================================
// Description: Umbrella error for one post-processing invocation
// Created: 2025-11-26
// Modified: 2025-12-02
// Version: 1.1.0
// ==============================================================================

use crate::extract::ExtractError;
use crate::jobs::JobStatusError;
use crate::join_store::JoinStoreError;
use crate::pagination::PaginationError;
use crate::storage::StorageError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Extraction failed: {0}")]
    Extract(#[from] ExtractError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Join store error: {0}")]
    JoinStore(#[from] JoinStoreError),

    #[error("Pagination error: {0}")]
    Pagination(#[from] PaginationError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Job status error: {0}")]
    JobStatus(#[from] JobStatusError),

    #[error("Scratch space error: {0:#}")]
    Scratch(anyhow::Error),

    #[error("Blocking task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl PipelineError {
    /// Malformed or incomplete source documents; reported to the caller
    /// without failing the job
    pub fn is_validation(&self) -> bool {
        match self {
            PipelineError::Extract(e) => e.is_validation(),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scanner::ScanError;

    #[test]
    fn test_validation_classification() {
        let malformed = PipelineError::from(ExtractError::Scan(ScanError::UnexpectedEof { offset: 3 }));
        assert!(malformed.is_validation());

        let missing = PipelineError::from(ExtractError::MissingField {
            field: "position",
            context: "genes.CPIC.CYP2C19".to_string(),
        });
        assert!(missing.is_validation());

        let io = PipelineError::from(ExtractError::Scan(ScanError::Io(std::io::Error::other("disk"))));
        assert!(!io.is_validation());

        let storage = PipelineError::from(StorageError::NotFound("k".to_string()));
        assert!(!storage.is_validation());
    }
}

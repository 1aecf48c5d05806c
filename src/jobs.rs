// ==============================================================================
// jobs.rs - Job Status Tracking
// ==============================================================================
// Description: Job status collaborator with idempotent failure marking
// Created: 2025-11-25
// Modified: 2025-12-02
// Version: 1.1.0
// ==============================================================================

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;
use tracing::{error, info};
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum JobStatusError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Unknown job status '{0}'")]
    UnknownStatus(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = JobStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            other => Err(JobStatusError::UnknownStatus(other.to_string())),
        }
    }
}

/// One status transition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusUpdate {
    pub status: JobStatus,
    pub failed_step: Option<String>,
    pub error_message: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl StatusUpdate {
    pub fn pending() -> Self {
        Self {
            status: JobStatus::Pending,
            failed_step: None,
            error_message: None,
            updated_at: Utc::now(),
        }
    }

    pub fn completed() -> Self {
        Self {
            status: JobStatus::Completed,
            ..Self::pending()
        }
    }

    pub fn failed(step: &str, message: &str) -> Self {
        Self {
            status: JobStatus::Failed,
            failed_step: Some(step.to_string()),
            error_message: Some(message.to_string()),
            updated_at: Utc::now(),
        }
    }
}

/// Where job status lives
#[async_trait]
pub trait JobStatusStore: Send + Sync {
    async fn current_status(&self, job_id: Uuid) -> Result<Option<JobStatus>, JobStatusError>;

    async fn update(&self, job_id: Uuid, update: &StatusUpdate) -> Result<(), JobStatusError>;
}

/// Postgres-backed status table
pub struct PgJobStatusStore {
    pool: PgPool,
}

impl PgJobStatusStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create the status table if it does not exist
    pub async fn ensure_schema(&self) -> Result<(), JobStatusError> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS pgx_jobs (
                 job_id UUID PRIMARY KEY,
                 status TEXT NOT NULL,
                 failed_step TEXT,
                 error_message TEXT,
                 updated_at TIMESTAMPTZ NOT NULL
             )",
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl JobStatusStore for PgJobStatusStore {
    async fn current_status(&self, job_id: Uuid) -> Result<Option<JobStatus>, JobStatusError> {
        let row: Option<(String,)> = sqlx::query_as("SELECT status FROM pgx_jobs WHERE job_id = $1")
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(|(status,)| status.parse()).transpose()
    }

    async fn update(&self, job_id: Uuid, update: &StatusUpdate) -> Result<(), JobStatusError> {
        sqlx::query(
            "INSERT INTO pgx_jobs (job_id, status, failed_step, error_message, updated_at)
             VALUES ($1, $2, $3, $4, $5)
             ON CONFLICT (job_id) DO UPDATE
             SET status = EXCLUDED.status,
                 failed_step = EXCLUDED.failed_step,
                 error_message = EXCLUDED.error_message,
                 updated_at = EXCLUDED.updated_at",
        )
        .bind(job_id)
        .bind(update.status.as_str())
        .bind(update.failed_step.as_deref())
        .bind(update.error_message.as_deref())
        .bind(update.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

/// Process-local status store; keeps every update for inspection
#[derive(Debug, Default)]
pub struct InMemoryJobStatusStore {
    statuses: Mutex<HashMap<Uuid, JobStatus>>,
    updates: Mutex<Vec<(Uuid, StatusUpdate)>>,
}

impl InMemoryJobStatusStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Updates applied so far, oldest first
    pub fn updates(&self) -> Vec<(Uuid, StatusUpdate)> {
        self.updates
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl JobStatusStore for InMemoryJobStatusStore {
    async fn current_status(&self, job_id: Uuid) -> Result<Option<JobStatus>, JobStatusError> {
        let statuses = self.statuses.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(statuses.get(&job_id).copied())
    }

    async fn update(&self, job_id: Uuid, update: &StatusUpdate) -> Result<(), JobStatusError> {
        self.statuses
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(job_id, update.status);
        self.updates
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((job_id, update.clone()));
        Ok(())
    }
}

/// Status transitions for jobs run by one processing step
#[derive(Clone)]
pub struct JobTracker {
    store: Arc<dyn JobStatusStore>,
    step: String,
}

impl JobTracker {
    pub fn new(store: Arc<dyn JobStatusStore>, step: impl Into<String>) -> Self {
        Self {
            store,
            step: step.into(),
        }
    }

    pub async fn mark_pending(&self, job_id: Uuid) -> Result<(), JobStatusError> {
        self.store.update(job_id, &StatusUpdate::pending()).await?;
        info!("Job {} pending", job_id);
        Ok(())
    }

    pub async fn mark_completed(&self, job_id: Uuid) -> Result<(), JobStatusError> {
        self.store.update(job_id, &StatusUpdate::completed()).await?;
        info!("Job {} completed", job_id);
        Ok(())
    }

    /// Record a failure unless the job is already failed.
    ///
    /// Returns whether an update was written.
    pub async fn mark_failed(&self, job_id: Uuid, message: &str) -> Result<bool, JobStatusError> {
        if self.store.current_status(job_id).await? == Some(JobStatus::Failed) {
            info!("Job {} already failed, not updating", job_id);
            return Ok(false);
        }

        self.store
            .update(job_id, &StatusUpdate::failed(&self.step, message))
            .await?;
        error!("Job {} failed at {}: {}", job_id, self.step, message);
        Ok(true)
    }

    /// Like `mark_failed`, but a status store error is logged instead of
    /// replacing the failure being reported
    pub async fn record_failure(&self, job_id: Uuid, message: &str) -> bool {
        match self.mark_failed(job_id, message).await {
            Ok(written) => written,
            Err(e) => {
                error!("Could not record failure of job {}: {}", job_id, e);
                false
            }
        }
    }
}

//! `JobStore` trait: the single async interface for job persistence.
//!
//! Clients resynchronize by reading this store directly, so every mutating
//! call must be durable before it returns.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::Result;
use crate::jobs::model::{ItemResult, Job, JobStatus};

/// Backend-agnostic job record store.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Allocate a new queued job and return its id.
    async fn create(&self, total_items: u64) -> Result<Uuid>;

    /// Get a job by id.
    async fn get(&self, id: Uuid) -> Result<Option<Job>>;

    /// Atomically append `result` and increment `processed_items`.
    ///
    /// Fails with `JobError::NotProcessing` unless the job is processing, and
    /// with `JobError::ResultOverflow` once every item has been recorded.
    /// Returns the job as it stands after the write.
    async fn update_progress(&self, id: Uuid, result: ItemResult) -> Result<Job>;

    /// Atomically move the job to `to`, stamping the matching timestamp.
    ///
    /// Invalid transitions are rejected with `JobError::InvalidTransition`.
    async fn transition(&self, id: Uuid, to: JobStatus) -> Result<Job>;

    /// Transition a processing job to failed and record `error` in one write.
    async fn fail(&self, id: Uuid, error: &str) -> Result<Job>;

    /// Record which operation a job runs.
    async fn set_operation(&self, id: Uuid, operation: &str) -> Result<()>;

    /// List jobs, newest first.
    async fn list(&self, limit: usize, offset: usize) -> Result<Vec<Job>>;

    /// List every job currently in `status`.
    async fn list_by_status(&self, status: JobStatus) -> Result<Vec<Job>>;

    /// Delete a job. Returns whether a row was removed.
    async fn delete(&self, id: Uuid) -> Result<bool>;

    /// Delete terminal jobs whose `completed_at` precedes `older_than`.
    /// Returns the number of jobs removed.
    async fn reap(&self, older_than: DateTime<Utc>) -> Result<usize>;
}

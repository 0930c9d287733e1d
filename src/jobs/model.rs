//! Job records and the job state machine.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::JobError;

/// State of a batch job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Created, waiting for `start`.
    Queued,
    /// Items are being dispatched to the worker pool.
    Processing,
    /// Every item was processed (some may have failed individually).
    Completed,
    /// The batch itself failed; see `Job::error`.
    Failed,
    /// Cancelled before every item was dispatched.
    Cancelled,
}

impl JobStatus {
    /// Check if this state allows transitioning to another state.
    pub fn can_transition_to(&self, target: JobStatus) -> bool {
        use JobStatus::*;

        matches!(
            (self, target),
            (Queued, Processing)
                | (Queued, Cancelled)
                | (Processing, Completed)
                | (Processing, Failed)
                | (Processing, Cancelled)
        )
    }

    /// Check if this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Check if the job is active (not terminal).
    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "processing" => Ok(Self::Processing),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(format!("unknown job status: {other}")),
        }
    }
}

/// Outcome of processing one item, as recorded in `Job::results`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemResult {
    /// Identifier of the item (for comic archives, the file path).
    pub item: String,
    pub success: bool,
    pub error: Option<String>,
    pub details: Option<serde_json::Map<String, serde_json::Value>>,
}

impl ItemResult {
    pub fn ok(item: impl Into<String>) -> Self {
        Self {
            item: item.into(),
            success: true,
            error: None,
            details: None,
        }
    }

    pub fn failed(item: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            item: item.into(),
            success: false,
            error: Some(error.into()),
            details: None,
        }
    }

    pub fn with_details(mut self, details: serde_json::Map<String, serde_json::Value>) -> Self {
        self.details = Some(details);
        self
    }
}

/// A persisted batch job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub status: JobStatus,
    pub total_items: u64,
    pub processed_items: u64,
    /// Per-item results in completion order.
    pub results: Vec<ItemResult>,
    /// Batch-fatal error. Per-item failures never land here.
    pub error: Option<String>,
    /// Name of the operation the job was started with.
    pub operation: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Job {
    /// Create a fresh queued job.
    pub fn new(total_items: u64) -> Self {
        Self {
            id: Uuid::new_v4(),
            status: JobStatus::Queued,
            total_items,
            processed_items: 0,
            results: Vec::new(),
            error: None,
            operation: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    /// Move to `target`, stamping `started_at`/`completed_at`.
    ///
    /// Used by the in-memory store; the libSQL store performs the same
    /// stamping in SQL.
    pub fn transition_to(&mut self, target: JobStatus) -> Result<(), JobError> {
        if !self.status.can_transition_to(target) {
            return Err(JobError::InvalidTransition {
                id: self.id,
                from: self.status,
                to: target,
            });
        }

        let now = Utc::now();
        self.status = target;
        match target {
            JobStatus::Processing => self.started_at = Some(now),
            s if s.is_terminal() => self.completed_at = Some(now),
            _ => {}
        }
        Ok(())
    }

    /// Append a result and bump `processed_items`.
    pub fn record(&mut self, result: ItemResult) -> Result<(), JobError> {
        if self.status != JobStatus::Processing {
            return Err(JobError::NotProcessing {
                id: self.id,
                state: self.status,
            });
        }
        if self.processed_items >= self.total_items {
            return Err(JobError::ResultOverflow {
                id: self.id,
                processed: self.processed_items,
                total: self.total_items,
            });
        }
        self.results.push(result);
        self.processed_items += 1;
        Ok(())
    }

    pub fn success_count(&self) -> u64 {
        self.results.iter().filter(|r| r.success).count() as u64
    }

    pub fn error_count(&self) -> u64 {
        self.results.iter().filter(|r| !r.success).count() as u64
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// Parse a client-supplied job id.
pub fn parse_job_id(raw: &str) -> Result<Uuid, JobError> {
    Uuid::parse_str(raw.trim()).map_err(|_| JobError::InvalidId {
        raw: raw.to_string(),
    })
}

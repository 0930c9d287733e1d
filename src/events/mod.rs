//! Job progress events and their publish/subscribe fan-out.

pub mod broadcaster;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::jobs::model::{Job, JobStatus};

pub use broadcaster::{Broadcaster, Subscription};

/// Fan-out topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    /// Events for a single job (`job-<id>`).
    Job(Uuid),
    /// Every job's events.
    Global,
}

impl std::fmt::Display for Topic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Job(id) => write!(f, "job-{id}"),
            Self::Global => f.write_str("global"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// Current state sent when a push connection opens.
    Snapshot,
    /// An item finished.
    Progress,
    /// The job reached a terminal state.
    Terminal,
}

/// Progress counters carried by every event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Progress {
    pub processed: u64,
    pub total: u64,
    pub success: u64,
    pub errors: u64,
}

/// Ephemeral view of a job at publish time. Never authoritative: clients
/// that doubt it re-read the job record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobEvent {
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub job_id: Uuid,
    pub status: JobStatus,
    pub progress: Progress,
    pub error: Option<String>,
}

impl JobEvent {
    pub fn from_job(kind: EventKind, job: &Job) -> Self {
        Self {
            kind,
            job_id: job.id,
            status: job.status,
            progress: Progress {
                processed: job.processed_items,
                total: job.total_items,
                success: job.success_count(),
                errors: job.error_count(),
            },
            error: job.error.clone(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

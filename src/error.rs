//! Error types for comic-batch.

use std::time::Duration;

use uuid::Uuid;

use crate::jobs::model::JobStatus;

/// Top-level error type for the service.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Job error: {0}")]
    Job(#[from] JobError),

    #[error("Processor error: {0}")]
    Process(#[from] ProcessError),

    #[error("Client error: {0}")]
    Client(#[from] ClientError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Job validation and lifecycle errors.
///
/// Every one of these is returned to the immediate caller; none of them is
/// ever logged-and-swallowed.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("Malformed job id: {raw}")]
    InvalidId { raw: String },

    #[error("Job {id} not found")]
    NotFound { id: Uuid },

    #[error("Job {id} is not in queued state (currently {state})")]
    NotQueued { id: Uuid, state: JobStatus },

    #[error("Job {id} already in state {from}, cannot transition to {to}")]
    InvalidTransition {
        id: Uuid,
        from: JobStatus,
        to: JobStatus,
    },

    #[error("Job {id} is not processing (currently {state})")]
    NotProcessing { id: Uuid, state: JobStatus },

    #[error("Job {id} expects {expected} items, got {actual}")]
    ItemCountMismatch {
        id: Uuid,
        expected: u64,
        actual: usize,
    },

    #[error("Job {id} cannot record more results ({processed}/{total} processed)")]
    ResultOverflow { id: Uuid, processed: u64, total: u64 },

    #[error("Job {id} is still processing; cancel it before deleting")]
    StillProcessing { id: Uuid },

    #[error("Job {id} already finished as {state}")]
    AlreadyTerminal { id: Uuid, state: JobStatus },

    #[error("A job needs at least one item")]
    NoItems,

    #[error("Unknown operation: {name}")]
    UnknownOperation { name: String },
}

/// Batch-level failures raised by an item processor.
///
/// Expected per-item failures are reported as data in `ItemOutcome`; these
/// variants abort the whole batch.
#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("Processor {name} failed fatally: {reason}")]
    Fatal { name: String, reason: String },

    #[error("Processor task panicked: {0}")]
    Panicked(String),
}

/// Errors raised by the job watcher client.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("Status request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Server returned {status} for job {id}")]
    UnexpectedStatus { id: Uuid, status: u16 },

    #[error("Watch on job {id} timed out after {elapsed:?}")]
    Timeout { id: Uuid, elapsed: Duration },
}

/// Result type alias for the service.
pub type Result<T> = std::result::Result<T, Error>;

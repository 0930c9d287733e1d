//! Item processors: the per-item work a job runs.
//!
//! A processor turns one item into an `ItemOutcome`. Expected per-item
//! failures (missing file, corrupt archive) are returned as data; an `Err`
//! means the batch cannot continue and the job fails.

pub mod inspect;
pub mod registry;

use std::future::Future;

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::error::ProcessError;
use crate::jobs::model::ItemResult;

pub use inspect::ArchiveInspector;
pub use registry::ProcessorRegistry;

/// Result of processing one item.
#[derive(Debug, Clone, PartialEq)]
pub struct ItemOutcome {
    pub success: bool,
    pub error: Option<String>,
    pub details: Option<Map<String, Value>>,
}

impl ItemOutcome {
    pub fn ok() -> Self {
        Self {
            success: true,
            error: None,
            details: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            details: None,
        }
    }

    pub fn with_details(mut self, details: Map<String, Value>) -> Self {
        self.details = Some(details);
        self
    }

    /// Attach the item identifier to produce a storable result.
    pub fn into_result(self, item: impl Into<String>) -> ItemResult {
        ItemResult {
            item: item.into(),
            success: self.success,
            error: self.error,
            details: self.details,
        }
    }
}

/// Work performed on each item of a job.
#[async_trait]
pub trait ItemProcessor: Send + Sync {
    /// Operation name, as used in `POST /api/jobs`.
    fn name(&self) -> &str;

    /// Short human-readable description.
    fn description(&self) -> &str {
        ""
    }

    /// Process a single item.
    async fn process(&self, item: &str) -> Result<ItemOutcome, ProcessError>;
}

/// Processor backed by an async closure.
pub struct FnProcessor<F> {
    name: String,
    f: F,
}

impl<F, Fut> FnProcessor<F>
where
    F: Fn(String) -> Fut + Send + Sync,
    Fut: Future<Output = Result<ItemOutcome, ProcessError>> + Send,
{
    pub fn new(name: impl Into<String>, f: F) -> Self {
        Self {
            name: name.into(),
            f,
        }
    }
}

#[async_trait]
impl<F, Fut> ItemProcessor for FnProcessor<F>
where
    F: Fn(String) -> Fut + Send + Sync,
    Fut: Future<Output = Result<ItemOutcome, ProcessError>> + Send,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn process(&self, item: &str) -> Result<ItemOutcome, ProcessError> {
        (self.f)(item.to_string()).await
    }
}

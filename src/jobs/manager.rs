//! Job manager: validates, starts, runs and cancels batch jobs.
//!
//! Each started job gets its own dispatch task. Items are handed to the
//! processor through a semaphore-bounded `JoinSet`; every completion is
//! written to the store before its progress event is published, so the
//! store is always at least as fresh as anything a client has seen.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, Semaphore};
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::ManagerConfig;
use crate::error::{Error, JobError, ProcessError, Result};
use crate::events::{Broadcaster, EventKind, JobEvent, Topic};
use crate::jobs::model::{Job, JobStatus, parse_job_id};
use crate::processors::ItemProcessor;
use crate::store::JobStore;

/// Error recorded on jobs orphaned by a restart.
pub const INTERRUPTED_ERROR: &str = "interrupted by service restart";

/// Summary returned by `submit`.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct Submission {
    pub job_id: Uuid,
    pub total_items: u64,
}

/// Owns the worker pool and every job state transition.
///
/// Cheap to clone; clones share the same store, broadcaster and run table.
#[derive(Clone)]
pub struct JobManager {
    store: Arc<dyn JobStore>,
    broadcaster: Arc<Broadcaster>,
    config: ManagerConfig,
    /// Cancellation handles of jobs with a live dispatch task.
    running: Arc<Mutex<HashMap<Uuid, CancellationToken>>>,
}

impl JobManager {
    pub fn new(
        store: Arc<dyn JobStore>,
        broadcaster: Arc<Broadcaster>,
        config: ManagerConfig,
    ) -> Self {
        Self {
            store,
            broadcaster,
            config,
            running: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    pub fn broadcaster(&self) -> &Arc<Broadcaster> {
        &self.broadcaster
    }

    /// Create a queued job expecting `total_items` items.
    pub async fn create(&self, total_items: u64) -> Result<Uuid> {
        let id = self.store.create(total_items).await?;
        info!(job_id = %id, total_items, "Job created");
        Ok(id)
    }

    /// Start a queued job.
    ///
    /// Returns once the job is persisted as processing; items run in the
    /// background. Fails without dispatching anything when the id is
    /// malformed or unknown, the job is not queued, or the item count does
    /// not match.
    pub async fn start(
        &self,
        raw_id: &str,
        items: Vec<String>,
        processor: Arc<dyn ItemProcessor>,
    ) -> Result<Job> {
        let id = parse_job_id(raw_id)?;
        let job = self
            .store
            .get(id)
            .await?
            .ok_or(JobError::NotFound { id })?;

        if job.status != JobStatus::Queued {
            return Err(JobError::NotQueued {
                id,
                state: job.status,
            }
            .into());
        }
        if items.len() as u64 != job.total_items {
            return Err(JobError::ItemCountMismatch {
                id,
                expected: job.total_items,
                actual: items.len(),
            }
            .into());
        }

        // Claim the run slot before the store transition so a cancel that
        // lands right after the transition always finds the token.
        let token = CancellationToken::new();
        {
            let mut running = self.running.lock().await;
            if running.contains_key(&id) {
                return Err(JobError::NotQueued {
                    id,
                    state: JobStatus::Processing,
                }
                .into());
            }
            running.insert(id, token.clone());
        }

        let job = match self.claim(id, processor.name()).await {
            Ok(job) => job,
            Err(e) => {
                self.running.lock().await.remove(&id);
                return Err(e);
            }
        };

        info!(
            job_id = %id,
            total_items = job.total_items,
            operation = processor.name(),
            max_workers = self.config.max_workers,
            "Job started"
        );
        self.broadcaster
            .publish_job_event(JobEvent::from_job(EventKind::Progress, &job));

        let this = self.clone();
        tokio::spawn(async move {
            this.run(id, items, processor, token).await;
        });

        Ok(job)
    }

    /// QUEUED→PROCESSING compare-and-set. Losing the race reads as "not
    /// queued".
    async fn claim(&self, id: Uuid, operation: &str) -> Result<Job> {
        self.store.set_operation(id, operation).await?;
        match self.store.transition(id, JobStatus::Processing).await {
            Ok(job) => Ok(job),
            Err(Error::Job(JobError::InvalidTransition { from, .. })) => {
                Err(JobError::NotQueued { id, state: from }.into())
            }
            Err(e) => Err(e),
        }
    }

    /// Create and start a job in one call.
    pub async fn submit(
        &self,
        items: Vec<String>,
        processor: Arc<dyn ItemProcessor>,
    ) -> Result<Submission> {
        if items.is_empty() {
            return Err(JobError::NoItems.into());
        }
        let total_items = items.len() as u64;
        let job_id = self.create(total_items).await?;
        self.start(&job_id.to_string(), items, processor).await?;
        Ok(Submission {
            job_id,
            total_items,
        })
    }

    /// Request cancellation.
    ///
    /// A queued job, or a processing job whose dispatcher is gone, is
    /// cancelled immediately. A running job is signalled and stops after its
    /// in-flight items are recorded; the returned job is still processing in
    /// that case.
    pub async fn cancel(&self, raw_id: &str) -> Result<Job> {
        let id = parse_job_id(raw_id)?;

        // A queued job may be started between our read and our write; one
        // retry sees it as processing.
        for _ in 0..2 {
            let job = self.get_by_id(id).await?;
            match job.status {
                s if s.is_terminal() => {
                    return Err(JobError::AlreadyTerminal { id, state: s }.into());
                }
                JobStatus::Processing => {
                    if let Some(token) = self.running.lock().await.get(&id) {
                        token.cancel();
                        info!(job_id = %id, "Cancellation requested");
                        return Ok(job);
                    }
                    warn!(job_id = %id, "Cancelling processing job with no dispatcher");
                }
                _ => {}
            }

            match self.store.transition(id, JobStatus::Cancelled).await {
                Ok(job) => {
                    info!(job_id = %id, "Job cancelled");
                    let this = self.clone();
                    let terminal = job.clone();
                    tokio::spawn(async move { this.publish_terminal(&terminal).await });
                    return Ok(job);
                }
                Err(Error::Job(JobError::InvalidTransition { .. })) => continue,
                Err(e) => return Err(e),
            }
        }

        let job = self.get_by_id(id).await?;
        Err(JobError::InvalidTransition {
            id,
            from: job.status,
            to: JobStatus::Cancelled,
        }
        .into())
    }

    /// Fetch a job by client-supplied id.
    pub async fn get(&self, raw_id: &str) -> Result<Job> {
        self.get_by_id(parse_job_id(raw_id)?).await
    }

    async fn get_by_id(&self, id: Uuid) -> Result<Job> {
        self.store
            .get(id)
            .await?
            .ok_or_else(|| JobError::NotFound { id }.into())
    }

    /// List jobs, newest first.
    pub async fn list(&self, limit: usize, offset: usize) -> Result<Vec<Job>> {
        self.store.list(limit, offset).await
    }

    /// Delete a job that is not processing.
    pub async fn delete(&self, raw_id: &str) -> Result<()> {
        let id = parse_job_id(raw_id)?;
        let job = self.get_by_id(id).await?;
        if job.status == JobStatus::Processing {
            return Err(JobError::StillProcessing { id }.into());
        }
        if !self.store.delete(id).await? {
            return Err(JobError::NotFound { id }.into());
        }
        info!(job_id = %id, status = %job.status, "Job deleted");
        Ok(())
    }

    /// Fail jobs left processing by a previous process.
    ///
    /// Run once at startup, before any job is started. Queued jobs are left
    /// alone. Returns the number of jobs failed.
    pub async fn recover_interrupted(&self) -> Result<usize> {
        let orphans = self.store.list_by_status(JobStatus::Processing).await?;
        let mut recovered = 0;
        for job in orphans {
            if self.running.lock().await.contains_key(&job.id) {
                continue;
            }
            match self.store.fail(job.id, INTERRUPTED_ERROR).await {
                Ok(_) => {
                    warn!(
                        job_id = %job.id,
                        processed = job.processed_items,
                        total = job.total_items,
                        "Marked interrupted job as failed"
                    );
                    recovered += 1;
                }
                Err(e) => error!(job_id = %job.id, "Failed to recover interrupted job: {e}"),
            }
        }
        Ok(recovered)
    }

    /// Whether a dispatch task is live for `id`.
    pub async fn is_running(&self, id: Uuid) -> bool {
        self.running.lock().await.contains_key(&id)
    }

    // ── Dispatch ────────────────────────────────────────────────────

    async fn run(
        &self,
        id: Uuid,
        items: Vec<String>,
        processor: Arc<dyn ItemProcessor>,
        cancel: CancellationToken,
    ) {
        // Tripped by user cancellation or by the first batch-fatal error.
        let stop = cancel.child_token();
        let semaphore = Arc::new(Semaphore::new(self.config.max_workers.max(1)));
        let mut in_flight: JoinSet<std::result::Result<(), String>> = JoinSet::new();
        let mut fatal: Option<String> = None;
        let mut dispatched = 0usize;
        let total = items.len();
        // Highest processed count already published for this job.
        let published = Arc::new(std::sync::Mutex::new(0u64));

        for item in items {
            let permit = tokio::select! {
                biased;
                _ = stop.cancelled() => break,
                permit = Arc::clone(&semaphore).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            while let Some(joined) = in_flight.try_join_next() {
                absorb(id, joined, &mut fatal, &stop);
            }
            if stop.is_cancelled() {
                break;
            }

            let store = Arc::clone(&self.store);
            let broadcaster = Arc::clone(&self.broadcaster);
            let processor = Arc::clone(&processor);
            let task_stop = stop.clone();
            let published = Arc::clone(&published);
            dispatched += 1;
            in_flight.spawn(async move {
                let _permit = permit;
                let outcome = match processor.process(&item).await {
                    Ok(outcome) => outcome,
                    Err(e) => {
                        task_stop.cancel();
                        return Err(e.to_string());
                    }
                };
                match store.update_progress(id, outcome.into_result(item.as_str())).await {
                    Ok(job) => {
                        // Tasks finish out of order; a count lower than one
                        // already sent is superseded and never published.
                        if let Ok(mut last) = published.lock()
                            && job.processed_items > *last
                        {
                            *last = job.processed_items;
                            broadcaster
                                .publish_job_event(JobEvent::from_job(EventKind::Progress, &job));
                        }
                        Ok(())
                    }
                    Err(e) => {
                        task_stop.cancel();
                        Err(format!("failed to record result for {item}: {e}"))
                    }
                }
            });
        }

        while let Some(joined) = in_flight.join_next().await {
            absorb(id, joined, &mut fatal, &stop);
        }

        debug!(job_id = %id, dispatched, total, "Dispatch loop drained");

        let finished = match fatal {
            Some(reason) => {
                error!(job_id = %id, error = %reason, "Job failed");
                self.store.fail(id, &reason).await
            }
            None if cancel.is_cancelled() => {
                info!(job_id = %id, dispatched, skipped = total - dispatched, "Job cancelled");
                self.store.transition(id, JobStatus::Cancelled).await
            }
            None => self.store.transition(id, JobStatus::Completed).await,
        };

        self.running.lock().await.remove(&id);

        match finished {
            Ok(job) => {
                info!(
                    job_id = %id,
                    status = %job.status,
                    success = job.success_count(),
                    errors = job.error_count(),
                    "Job finished"
                );
                self.publish_terminal(&job).await;
            }
            Err(e) => error!(job_id = %id, "Failed to persist terminal state: {e}"),
        }
    }

    /// Publish the terminal event, retrying while the job topic has no
    /// subscribers. The global topic gets it once.
    async fn publish_terminal(&self, job: &Job) {
        let event = JobEvent::from_job(EventKind::Terminal, job);
        self.broadcaster.publish(Topic::Global, event.clone());

        let attempts = self.config.terminal_retries.max(1);
        for attempt in 1..=attempts {
            let reached = self.broadcaster.publish(Topic::Job(job.id), event.clone());
            if reached > 0 {
                debug!(job_id = %job.id, attempt, reached, "Terminal event delivered");
                return;
            }
            if attempt < attempts {
                tokio::time::sleep(self.config.terminal_retry_delay).await;
            }
        }
        debug!(job_id = %job.id, attempts, "Terminal event had no subscribers");
    }
}

/// Fold one finished item task into the batch outcome. The first fatal
/// error wins.
fn absorb(
    id: Uuid,
    joined: std::result::Result<std::result::Result<(), String>, JoinError>,
    fatal: &mut Option<String>,
    stop: &CancellationToken,
) {
    let failure = match joined {
        Ok(Ok(())) => return,
        Ok(Err(reason)) => reason,
        Err(e) if e.is_panic() => ProcessError::Panicked(e.to_string()).to_string(),
        Err(e) => format!("item task aborted: {e}"),
    };
    warn!(job_id = %id, error = %failure, "Batch-fatal item failure");
    stop.cancel();
    if fatal.is_none() {
        *fatal = Some(failure);
    }
}

//! In-memory `JobStore` for tests and ephemeral deployments.
//!
//! Each job sits behind its own mutex so updates to one record are
//! serialized without blocking writers of other jobs.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::{DatabaseError, JobError, Result};
use crate::jobs::model::{ItemResult, Job, JobStatus};
use crate::store::traits::JobStore;

type Record = Arc<Mutex<Job>>;

/// Volatile job store. Contents are lost when the process exits.
#[derive(Default)]
pub struct MemoryJobStore {
    jobs: RwLock<HashMap<Uuid, Record>>,
}

fn poisoned<T>(_: T) -> DatabaseError {
    DatabaseError::Pool("in-memory job store lock poisoned".to_string())
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn record(&self, id: Uuid) -> Result<Record> {
        let jobs = self.jobs.read().map_err(poisoned)?;
        jobs.get(&id)
            .cloned()
            .ok_or_else(|| JobError::NotFound { id }.into())
    }

    /// Run `f` with the job locked.
    fn with_job<T>(
        &self,
        id: Uuid,
        f: impl FnOnce(&mut Job) -> std::result::Result<T, JobError>,
    ) -> Result<T> {
        let record = self.record(id)?;
        let mut job = record.lock().map_err(poisoned)?;
        Ok(f(&mut job)?)
    }

    fn snapshot(&self) -> Result<Vec<Job>> {
        let jobs = self.jobs.read().map_err(poisoned)?;
        jobs.values()
            .map(|r| r.lock().map(|j| j.clone()).map_err(|e| poisoned(e).into()))
            .collect()
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn create(&self, total_items: u64) -> Result<Uuid> {
        let job = Job::new(total_items);
        let id = job.id;
        self.jobs
            .write()
            .map_err(poisoned)?
            .insert(id, Arc::new(Mutex::new(job)));
        Ok(id)
    }

    async fn get(&self, id: Uuid) -> Result<Option<Job>> {
        match self.record(id) {
            Ok(record) => Ok(Some(record.lock().map_err(poisoned)?.clone())),
            Err(crate::error::Error::Job(JobError::NotFound { .. })) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn update_progress(&self, id: Uuid, result: ItemResult) -> Result<Job> {
        self.with_job(id, |job| {
            job.record(result)?;
            Ok(job.clone())
        })
    }

    async fn transition(&self, id: Uuid, to: JobStatus) -> Result<Job> {
        self.with_job(id, |job| {
            job.transition_to(to)?;
            Ok(job.clone())
        })
    }

    async fn fail(&self, id: Uuid, error: &str) -> Result<Job> {
        self.with_job(id, |job| {
            job.transition_to(JobStatus::Failed)?;
            job.error = Some(error.to_string());
            Ok(job.clone())
        })
    }

    async fn set_operation(&self, id: Uuid, operation: &str) -> Result<()> {
        self.with_job(id, |job| {
            job.operation = Some(operation.to_string());
            Ok(())
        })
    }

    async fn list(&self, limit: usize, offset: usize) -> Result<Vec<Job>> {
        let mut jobs = self.snapshot()?;
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(jobs.into_iter().skip(offset).take(limit).collect())
    }

    async fn list_by_status(&self, status: JobStatus) -> Result<Vec<Job>> {
        let mut jobs: Vec<Job> = self
            .snapshot()?
            .into_iter()
            .filter(|j| j.status == status)
            .collect();
        jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(jobs)
    }

    async fn delete(&self, id: Uuid) -> Result<bool> {
        Ok(self.jobs.write().map_err(poisoned)?.remove(&id).is_some())
    }

    async fn reap(&self, older_than: DateTime<Utc>) -> Result<usize> {
        let mut jobs = self.jobs.write().map_err(poisoned)?;
        let before = jobs.len();
        jobs.retain(|_, record| match record.lock() {
            Ok(job) => !(job.is_terminal() && job.completed_at.is_some_and(|t| t < older_than)),
            Err(_) => true,
        });
        Ok(before - jobs.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    #[tokio::test]
    async fn lifecycle_matches_state_machine() {
        let store = MemoryJobStore::new();
        let id = store.create(2).await.unwrap();

        store.transition(id, JobStatus::Processing).await.unwrap();
        store.update_progress(id, ItemResult::ok("a.cbz")).await.unwrap();
        let job = store
            .update_progress(id, ItemResult::failed("b.cbr", "truncated"))
            .await
            .unwrap();
        assert_eq!(job.processed_items, 2);

        let err = store.update_progress(id, ItemResult::ok("c.cbz")).await.unwrap_err();
        assert!(matches!(err, Error::Job(JobError::ResultOverflow { .. })));

        let job = store.transition(id, JobStatus::Completed).await.unwrap();
        assert!(job.completed_at.is_some());
        assert_eq!(job.success_count(), 1);
        assert_eq!(job.error_count(), 1);
    }

    #[tokio::test]
    async fn missing_job_errors() {
        let store = MemoryJobStore::new();
        let id = Uuid::new_v4();
        assert!(store.get(id).await.unwrap().is_none());
        let err = store.transition(id, JobStatus::Processing).await.unwrap_err();
        assert!(matches!(err, Error::Job(JobError::NotFound { .. })));
        assert!(!store.delete(id).await.unwrap());
    }

    #[tokio::test]
    async fn concurrent_progress_is_serialized_per_job() {
        let store = Arc::new(MemoryJobStore::new());
        let id = store.create(50).await.unwrap();
        store.transition(id, JobStatus::Processing).await.unwrap();

        let mut set = tokio::task::JoinSet::new();
        for i in 0..50 {
            let store = Arc::clone(&store);
            set.spawn(async move {
                store
                    .update_progress(id, ItemResult::ok(format!("{i}.cbz")))
                    .await
                    .unwrap();
            });
        }
        while let Some(res) = set.join_next().await {
            res.unwrap();
        }

        let job = store.get(id).await.unwrap().unwrap();
        assert_eq!(job.processed_items, 50);
        assert_eq!(job.results.len(), 50);
    }

    #[tokio::test]
    async fn fail_and_reap() {
        let store = MemoryJobStore::new();
        let failed = store.create(1).await.unwrap();
        store.transition(failed, JobStatus::Processing).await.unwrap();
        let job = store.fail(failed, "library unmounted").await.unwrap();
        assert_eq!(job.error.as_deref(), Some("library unmounted"));

        let running = store.create(1).await.unwrap();
        store.transition(running, JobStatus::Processing).await.unwrap();

        assert_eq!(store.reap(Utc::now() - chrono::Duration::minutes(5)).await.unwrap(), 0);
        assert_eq!(store.reap(Utc::now() + chrono::Duration::seconds(1)).await.unwrap(), 1);
        assert!(store.get(failed).await.unwrap().is_none());
        assert!(store.get(running).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn list_orders_and_filters() {
        let store = MemoryJobStore::new();
        let a = store.create(1).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(2)).await;
        let b = store.create(1).await.unwrap();
        store.transition(b, JobStatus::Cancelled).await.unwrap();

        let all = store.list(10, 0).await.unwrap();
        assert_eq!(all.iter().map(|j| j.id).collect::<Vec<_>>(), vec![b, a]);

        let queued = store.list_by_status(JobStatus::Queued).await.unwrap();
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].id, a);
    }
}

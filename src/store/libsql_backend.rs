//! libSQL backend: durable `JobStore` implementation.
//!
//! Supports local file and in-memory databases. Every mutation is a single
//! SQL statement guarded by a status predicate, so concurrent writers for the
//! same job can never interleave halfway through an update.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{DatabaseError, JobError, Result};
use crate::jobs::model::{ItemResult, Job, JobStatus};
use crate::store::migrations;
use crate::store::traits::JobStore;

/// libSQL job store.
///
/// Stores a single connection that is reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> std::result::Result<Self, DatabaseError> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let backend = Self::from_database(db).await?;
        info!(path = %path.display(), "Job database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> std::result::Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;
        Self::from_database(db).await
    }

    async fn from_database(db: LibSqlDatabase) -> std::result::Result<Self, DatabaseError> {
        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;
        migrations::run_migrations(&conn).await?;
        Ok(Self {
            db: Arc::new(db),
            conn,
        })
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }

    /// Fetch a job that a guarded write just touched, or explain why the
    /// guard rejected it.
    async fn reload(&self, id: Uuid) -> Result<Job> {
        self.get(id)
            .await?
            .ok_or_else(|| JobError::NotFound { id }.into())
    }

    async fn query_jobs(&self, sql: &str, params: impl libsql::params::IntoParams) -> Result<Vec<Job>> {
        let mut rows = self
            .conn()
            .query(sql, params)
            .await
            .map_err(|e| DatabaseError::Query(format!("list jobs: {e}")))?;

        let mut jobs = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("list jobs row: {e}")))?
        {
            match row_to_job(&row) {
                Ok(job) => jobs.push(job),
                Err(e) => tracing::warn!("Skipping job row: {e}"),
            }
        }
        Ok(jobs)
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Canonical timestamp format. Fixed precision keeps lexical order equal to
/// chronological order, which `reap` relies on.
fn fmt_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_datetime(s: &str) -> std::result::Result<DateTime<Utc>, DatabaseError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| DatabaseError::Serialization(format!("bad timestamp {s:?}: {e}")))
}

fn parse_optional_datetime(
    s: Option<String>,
) -> std::result::Result<Option<DateTime<Utc>>, DatabaseError> {
    s.as_deref().map(parse_datetime).transpose()
}

/// Convert `Option<&str>` to libsql Value.
fn opt_text(s: Option<&str>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s.to_string()),
        None => libsql::Value::Null,
    }
}

/// SQL list of statuses that may move to `to`.
fn predecessors(to: JobStatus) -> String {
    [
        JobStatus::Queued,
        JobStatus::Processing,
        JobStatus::Completed,
        JobStatus::Failed,
        JobStatus::Cancelled,
    ]
    .iter()
    .filter(|from| from.can_transition_to(to))
    .map(|from| format!("'{}'", from.as_str()))
    .collect::<Vec<_>>()
    .join(", ")
}

/// Map a libsql Row to a Job.
///
/// Column order matches JOB_COLUMNS.
fn row_to_job(row: &libsql::Row) -> std::result::Result<Job, DatabaseError> {
    let col = |e: libsql::Error| DatabaseError::Query(format!("job row: {e}"));

    let id_str: String = row.get(0).map_err(col)?;
    let status_str: String = row.get(1).map_err(col)?;
    let total: i64 = row.get(2).map_err(col)?;
    let processed: i64 = row.get(3).map_err(col)?;
    let results_str: String = row.get(4).map_err(col)?;
    let error: Option<String> = row.get::<String>(5).ok();
    let operation: Option<String> = row.get::<String>(6).ok();
    let created_str: String = row.get(7).map_err(col)?;
    let started_str: Option<String> = row.get::<String>(8).ok();
    let completed_str: Option<String> = row.get::<String>(9).ok();

    let results: Vec<ItemResult> = serde_json::from_str(&results_str)
        .map_err(|e| DatabaseError::Serialization(format!("job results: {e}")))?;

    Ok(Job {
        id: Uuid::parse_str(&id_str)
            .map_err(|e| DatabaseError::Serialization(format!("job id: {e}")))?,
        status: status_str.parse().map_err(DatabaseError::Serialization)?,
        total_items: total.max(0) as u64,
        processed_items: processed.max(0) as u64,
        results,
        error,
        operation,
        created_at: parse_datetime(&created_str)?,
        started_at: parse_optional_datetime(started_str)?,
        completed_at: parse_optional_datetime(completed_str)?,
    })
}

// ── Trait implementation ────────────────────────────────────────────

const JOB_COLUMNS: &str = "id, status, total_items, processed_items, results, error, operation, created_at, started_at, completed_at";

const TERMINAL_STATUSES: &str = "'completed', 'failed', 'cancelled'";

#[async_trait]
impl JobStore for LibSqlBackend {
    async fn create(&self, total_items: u64) -> Result<Uuid> {
        let job = Job::new(total_items);
        self.conn()
            .execute(
                "INSERT INTO jobs (id, status, total_items, processed_items, results, created_at) VALUES (?1, ?2, ?3, 0, '[]', ?4)",
                params![
                    job.id.to_string(),
                    job.status.as_str(),
                    total_items as i64,
                    fmt_ts(job.created_at),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("create job: {e}")))?;

        debug!(job_id = %job.id, total_items, "Job inserted into DB");
        Ok(job.id)
    }

    async fn get(&self, id: Uuid) -> Result<Option<Job>> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1"),
                params![id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get job: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_job(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get job: {e}")).into()),
        }
    }

    async fn update_progress(&self, id: Uuid, result: ItemResult) -> Result<Job> {
        let result_json = serde_json::to_string(&result)
            .map_err(|e| DatabaseError::Serialization(format!("item result: {e}")))?;

        let changed = self
            .conn()
            .execute(
                "UPDATE jobs SET results = json_insert(results, '$[#]', json(?1)), processed_items = processed_items + 1 \
                 WHERE id = ?2 AND status = 'processing' AND processed_items < total_items",
                params![result_json, id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("update_progress: {e}")))?;

        let job = self.reload(id).await?;
        if changed == 0 {
            if job.status != JobStatus::Processing {
                return Err(JobError::NotProcessing {
                    id,
                    state: job.status,
                }
                .into());
            }
            return Err(JobError::ResultOverflow {
                id,
                processed: job.processed_items,
                total: job.total_items,
            }
            .into());
        }

        debug!(
            job_id = %id,
            item = %result.item,
            success = result.success,
            processed = job.processed_items,
            "Item result recorded"
        );
        Ok(job)
    }

    async fn transition(&self, id: Uuid, to: JobStatus) -> Result<Job> {
        apply_transition(self, id, to, None).await
    }

    async fn fail(&self, id: Uuid, error: &str) -> Result<Job> {
        apply_transition(self, id, JobStatus::Failed, Some(error)).await
    }

    async fn set_operation(&self, id: Uuid, operation: &str) -> Result<()> {
        let changed = self
            .conn()
            .execute(
                "UPDATE jobs SET operation = ?1 WHERE id = ?2",
                params![operation, id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("set_operation: {e}")))?;
        if changed == 0 {
            return Err(JobError::NotFound { id }.into());
        }
        Ok(())
    }

    async fn list(&self, limit: usize, offset: usize) -> Result<Vec<Job>> {
        self.query_jobs(
            &format!(
                "SELECT {JOB_COLUMNS} FROM jobs ORDER BY created_at DESC, rowid DESC LIMIT ?1 OFFSET ?2"
            ),
            params![limit as i64, offset as i64],
        )
        .await
    }

    async fn list_by_status(&self, status: JobStatus) -> Result<Vec<Job>> {
        self.query_jobs(
            &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE status = ?1 ORDER BY created_at ASC"),
            params![status.as_str()],
        )
        .await
    }

    async fn delete(&self, id: Uuid) -> Result<bool> {
        let changed = self
            .conn()
            .execute("DELETE FROM jobs WHERE id = ?1", params![id.to_string()])
            .await
            .map_err(|e| DatabaseError::Query(format!("delete job: {e}")))?;
        Ok(changed > 0)
    }

    async fn reap(&self, older_than: DateTime<Utc>) -> Result<usize> {
        let count = self
            .conn()
            .execute(
                &format!(
                    "DELETE FROM jobs WHERE status IN ({TERMINAL_STATUSES}) AND completed_at IS NOT NULL AND completed_at < ?1"
                ),
                params![fmt_ts(older_than)],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("reap jobs: {e}")))?;

        if count > 0 {
            info!(count, "Reaped old jobs");
        }
        Ok(count as usize)
    }
}

/// Guarded status update shared by `transition` and `fail`.
async fn apply_transition(
    store: &LibSqlBackend,
    id: Uuid,
    to: JobStatus,
    error: Option<&str>,
) -> Result<Job> {
    let now = fmt_ts(Utc::now());
    let sql = format!(
        "UPDATE jobs SET status = ?1, \
         started_at = CASE WHEN ?1 = 'processing' THEN ?2 ELSE started_at END, \
         completed_at = CASE WHEN ?1 IN ({TERMINAL_STATUSES}) THEN ?2 ELSE completed_at END, \
         error = COALESCE(?3, error) \
         WHERE id = ?4 AND status IN ({})",
        predecessors(to)
    );

    let changed = store
        .conn()
        .execute(
            &sql,
            params![to.as_str(), now, opt_text(error), id.to_string()],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("transition job: {e}")))?;

    let job = store.reload(id).await?;
    if changed == 0 {
        return Err(JobError::InvalidTransition {
            id,
            from: job.status,
            to,
        }
        .into());
    }

    debug!(job_id = %id, status = %to, "Job status updated in DB");
    Ok(job)
}

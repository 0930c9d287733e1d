//! Periodic removal of old terminal jobs.
//!
//! Runs on a fixed `tokio::time::interval` until cancelled. Non-terminal
//! jobs are never touched, however old they are.

use std::sync::Arc;

use chrono::Utc;
use tokio_util::sync::CancellationToken;

use crate::config::ReaperConfig;
use crate::error::Result;
use crate::store::JobStore;

/// Delete terminal jobs that finished more than `config.retention` ago.
pub async fn reap_once(store: &dyn JobStore, config: &ReaperConfig) -> Result<usize> {
    let retention = chrono::Duration::from_std(config.retention)
        .unwrap_or_else(|_| chrono::Duration::days(36500));
    store.reap(Utc::now() - retention).await
}

/// Run the reaper loop until `cancel` fires.
pub async fn run(store: Arc<dyn JobStore>, config: ReaperConfig, cancel: CancellationToken) {
    tracing::info!(
        retention_secs = config.retention.as_secs(),
        interval_secs = config.interval.as_secs(),
        "Job reaper started"
    );

    let mut interval = tokio::time::interval(config.interval);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::info!("Job reaper stopping");
                break;
            }
            _ = interval.tick() => {
                match reap_once(store.as_ref(), &config).await {
                    Ok(deleted) if deleted > 0 => {
                        tracing::info!(deleted, "Job reaper: purged finished jobs");
                    }
                    Ok(_) => tracing::debug!("Job reaper: nothing to purge"),
                    Err(e) => tracing::error!(error = %e, "Job reaper: cleanup failed"),
                }
            }
        }
    }
}

/// Spawn the reaper as a background task.
pub fn spawn_reaper(
    store: Arc<dyn JobStore>,
    config: ReaperConfig,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(run(store, config, cancel))
}

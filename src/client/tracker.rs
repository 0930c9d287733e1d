//! Client-side view of one job, independent of any transport.
//!
//! Every applied event or resync read replaces the view wholesale, so
//! duplicated, reordered or missing events never leave it inconsistent once
//! the next authoritative read lands.

use std::time::Duration;

use tokio::time::Instant;
use uuid::Uuid;

use crate::events::{EventKind, JobEvent};
use crate::jobs::model::Job;

/// Local state of a watched job plus the watchdog clock.
#[derive(Debug, Clone)]
pub struct ProgressTracker {
    job_id: Uuid,
    view: Option<JobEvent>,
    last_activity: Instant,
    inactivity_window: Duration,
}

impl ProgressTracker {
    pub fn new(job_id: Uuid, inactivity_window: Duration, now: Instant) -> Self {
        Self {
            job_id,
            view: None,
            last_activity: now,
            inactivity_window,
        }
    }

    pub fn job_id(&self) -> Uuid {
        self.job_id
    }

    /// Latest known state, if any has arrived.
    pub fn view(&self) -> Option<&JobEvent> {
        self.view.as_ref()
    }

    /// Apply a pushed event. Events for other jobs are ignored, as is a
    /// progress event older than the active view. Snapshots and terminal
    /// events always replace it.
    ///
    /// Returns whether the view changed.
    pub fn apply_event(&mut self, event: JobEvent, now: Instant) -> bool {
        if event.job_id != self.job_id {
            return false;
        }
        if event.kind == EventKind::Progress
            && let Some(current) = &self.view
            && !current.is_terminal()
            && event.progress.processed < current.progress.processed
        {
            return false;
        }
        self.view = Some(event);
        self.last_activity = now;
        true
    }

    /// Redefine the view from an authoritative read.
    pub fn resync(&mut self, job: &Job, now: Instant) {
        self.view = Some(JobEvent::from_job(EventKind::Snapshot, job));
        self.last_activity = now;
    }

    /// Restart the inactivity clock without changing the view. Used when a
    /// watchdog read fails so the next attempt waits a full window.
    pub fn touch(&mut self, now: Instant) {
        self.last_activity = now;
    }

    /// Unknown or non-terminal.
    pub fn is_active(&self) -> bool {
        self.view.as_ref().is_none_or(|v| v.status.is_active())
    }

    /// True when an active job has been silent for the whole window.
    pub fn watchdog_due(&self, now: Instant) -> bool {
        self.is_active() && now.saturating_duration_since(self.last_activity) >= self.inactivity_window
    }
}

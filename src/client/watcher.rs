//! Resilient job watcher: push stream first, direct reads as the fallback.
//!
//! The watcher keeps a WebSocket open on `/ws/jobs/{id}` and applies every
//! event it receives. When the connection drops it waits
//! `reconnect_delay`, reconnects, and (if the job is still active) reads
//! `GET /api/jobs/{id}` exactly once to replace whatever it missed. A
//! watchdog runs alongside, connected or not: after `inactivity_window` of
//! silence it performs one direct read and restarts its clock.

use std::time::Duration;

use futures_util::StreamExt;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::{self, Message};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::client::tracker::ProgressTracker;
use crate::config::WatcherConfig;
use crate::error::ClientError;
use crate::events::JobEvent;
use crate::jobs::model::Job;

/// Upper bound on one direct status read.
const STATUS_READ_TIMEOUT: Duration = Duration::from_secs(10);

/// `tokio::time::interval` panics on a zero period.
const MIN_WATCHDOG_INTERVAL: Duration = Duration::from_millis(10);

/// Client for following one job to completion.
#[derive(Clone)]
pub struct JobWatcher {
    http: reqwest::Client,
    /// `http://host:port`, no trailing slash.
    base_url: String,
    config: WatcherConfig,
}

/// Why a push connection ended.
enum StreamEnd {
    /// The job reached a terminal state.
    Finished,
    /// The connection dropped while the job was still active.
    Disconnected,
}

impl JobWatcher {
    pub fn new(base_url: impl Into<String>, config: WatcherConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            config,
        }
    }

    fn ws_url(&self, id: Uuid) -> String {
        let base = match self.base_url.strip_prefix("http") {
            Some(rest) => format!("ws{rest}"),
            None => self.base_url.clone(),
        };
        format!("{base}/ws/jobs/{id}")
    }

    /// Direct, authoritative read of a job.
    pub async fn fetch(&self, id: Uuid) -> Result<Job, ClientError> {
        let resp = self
            .http
            .get(format!("{}/api/jobs/{id}", self.base_url))
            .timeout(STATUS_READ_TIMEOUT)
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(ClientError::UnexpectedStatus {
                id,
                status: resp.status().as_u16(),
            });
        }
        Ok(resp.json::<Job>().await?)
    }

    /// Follow `id` until it is terminal and return the final view.
    pub async fn watch(&self, id: Uuid) -> Result<JobEvent, ClientError> {
        self.watch_with(id, |_| {}).await
    }

    /// Like `watch`, failing with `ClientError::Timeout` after `limit`.
    pub async fn watch_for(&self, id: Uuid, limit: Duration) -> Result<JobEvent, ClientError> {
        tokio::time::timeout(limit, self.watch(id))
            .await
            .map_err(|_| ClientError::Timeout { id, elapsed: limit })?
    }

    /// Follow `id`, calling `on_update` with every new local view.
    pub async fn watch_with<F>(&self, id: Uuid, mut on_update: F) -> Result<JobEvent, ClientError>
    where
        F: FnMut(&JobEvent) + Send,
    {
        let mut tracker = ProgressTracker::new(id, self.config.inactivity_window, Instant::now());
        let mut watchdog =
            tokio::time::interval(self.config.watchdog_interval.max(MIN_WATCHDOG_INTERVAL));
        watchdog.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // First tick completes immediately.
        watchdog.tick().await;

        let mut connected_before = false;

        loop {
            // The watchdog keeps running while the handshake is pending.
            let attempt = {
                let connecting = connect_async(self.ws_url(id));
                tokio::pin!(connecting);
                loop {
                    tokio::select! {
                        result = &mut connecting => break Some(result),
                        _ = watchdog.tick() => {
                            self.check_watchdog(&mut tracker, &mut on_update).await?;
                            if !tracker.is_active() {
                                break None;
                            }
                        }
                    }
                }
            };

            let end = match attempt {
                None => StreamEnd::Finished,
                Some(Ok((stream, _))) => {
                    info!(job_id = %id, "Watching job over WebSocket");
                    if connected_before && tracker.is_active() {
                        self.resync(&mut tracker, &mut on_update).await?;
                    }
                    connected_before = true;
                    if tracker.is_active() {
                        self.pump(stream, &mut tracker, &mut watchdog, &mut on_update)
                            .await?
                    } else {
                        StreamEnd::Finished
                    }
                }
                Some(Err(tungstenite::Error::Http(resp))) if resp.status().as_u16() == 404 => {
                    return Err(ClientError::UnexpectedStatus { id, status: 404 });
                }
                Some(Err(e)) => {
                    warn!(job_id = %id, error = %e, "WebSocket connect failed");
                    connected_before = true;
                    StreamEnd::Disconnected
                }
            };

            if let StreamEnd::Finished = end {
                break;
            }

            // Back off before reconnecting; the watchdog keeps running.
            let backoff = tokio::time::sleep(self.config.reconnect_delay);
            tokio::pin!(backoff);
            loop {
                tokio::select! {
                    _ = &mut backoff => break,
                    _ = watchdog.tick() => {
                        self.check_watchdog(&mut tracker, &mut on_update).await?;
                    }
                }
            }
            if !tracker.is_active() {
                break;
            }
            debug!(job_id = %id, "Reconnecting");
        }

        match tracker.view() {
            Some(view) => Ok(view.clone()),
            None => {
                let job = self.fetch(id).await?;
                Ok(JobEvent::from_job(crate::events::EventKind::Snapshot, &job))
            }
        }
    }

    async fn pump<S, F>(
        &self,
        mut stream: S,
        tracker: &mut ProgressTracker,
        watchdog: &mut tokio::time::Interval,
        on_update: &mut F,
    ) -> Result<StreamEnd, ClientError>
    where
        S: futures_util::Stream<Item = Result<Message, tungstenite::Error>> + Unpin,
        F: FnMut(&JobEvent) + Send,
    {
        let id = tracker.job_id();
        loop {
            tokio::select! {
                frame = stream.next() => match frame {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<JobEvent>(text.as_str()) {
                            Ok(event) => {
                                if tracker.apply_event(event, Instant::now())
                                    && let Some(view) = tracker.view()
                                {
                                    on_update(view);
                                }
                                if !tracker.is_active() {
                                    return Ok(StreamEnd::Finished);
                                }
                            }
                            Err(e) => debug!(job_id = %id, error = %e, "Ignoring unrecognized frame"),
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        debug!(job_id = %id, "Push stream closed");
                        return Ok(StreamEnd::Disconnected);
                    }
                    Some(Err(e)) => {
                        warn!(job_id = %id, error = %e, "Push stream error");
                        return Ok(StreamEnd::Disconnected);
                    }
                    Some(Ok(_)) => {}
                },
                _ = watchdog.tick() => {
                    self.check_watchdog(tracker, on_update).await?;
                    if !tracker.is_active() {
                        return Ok(StreamEnd::Finished);
                    }
                }
            }
        }
    }

    /// One direct read if the job has been silent too long.
    async fn check_watchdog<F>(
        &self,
        tracker: &mut ProgressTracker,
        on_update: &mut F,
    ) -> Result<(), ClientError>
    where
        F: FnMut(&JobEvent) + Send,
    {
        if !tracker.watchdog_due(Instant::now()) {
            return Ok(());
        }
        info!(job_id = %tracker.job_id(), "No progress within inactivity window; reading job");
        self.resync(tracker, on_update).await
    }

    /// Replace local state from the server. A missing job is an error; other
    /// read failures only restart the watchdog clock.
    async fn resync<F>(&self, tracker: &mut ProgressTracker, on_update: &mut F) -> Result<(), ClientError>
    where
        F: FnMut(&JobEvent) + Send,
    {
        let id = tracker.job_id();
        match self.fetch(id).await {
            Ok(job) => {
                tracker.resync(&job, Instant::now());
                if let Some(view) = tracker.view() {
                    on_update(view);
                }
                Ok(())
            }
            Err(ClientError::UnexpectedStatus { status: 404, .. }) => {
                Err(ClientError::UnexpectedStatus { id, status: 404 })
            }
            Err(e) => {
                warn!(job_id = %id, error = %e, "Status read failed");
                tracker.touch(Instant::now());
                Ok(())
            }
        }
    }
}

//! WebSocket push streams for job progress.
//!
//! `/ws/jobs/{id}` sends a snapshot of the job as its first frame, then every
//! event published for that job. `/ws/jobs` streams every job's events.
//! Neither stream is authoritative; clients resync from `GET /api/jobs/{id}`.

use axum::{
    extract::{
        Path, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::{IntoResponse, Response},
};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{AppState, error_response};
use crate::events::{EventKind, JobEvent, Subscription, Topic};
use crate::jobs::JobManager;
use crate::jobs::model::JobStatus;

pub async fn job_ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Response {
    // Reject unknown jobs before upgrading so clients get a real status code.
    let job = match state.manager.get(&id).await {
        Ok(job) => job,
        Err(e) => return error_response(&e).into_response(),
    };
    info!(job_id = %job.id, "Job WebSocket client connecting");
    ws.on_upgrade(move |socket| handle_job_socket(socket, state.manager, job.id))
}

pub async fn global_ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    info!("Global WebSocket client connecting");
    ws.on_upgrade(|socket| handle_global_socket(socket, state.manager))
}

async fn send_event(socket: &mut WebSocket, event: &JobEvent) -> bool {
    match serde_json::to_string(event) {
        Ok(json) => socket.send(Message::Text(json.into())).await.is_ok(),
        Err(e) => {
            warn!(error = %e, "Failed to serialize job event");
            true
        }
    }
}

/// Read the job and push it as a snapshot. Returns the job's status, or
/// `None` if the client is gone or the job was deleted.
async fn send_snapshot(socket: &mut WebSocket, manager: &JobManager, id: Uuid) -> Option<JobStatus> {
    let job = match manager.store().get(id).await {
        Ok(Some(job)) => job,
        Ok(None) => {
            debug!(job_id = %id, "Job deleted while watched");
            return None;
        }
        Err(e) => {
            warn!(job_id = %id, error = %e, "Snapshot read failed");
            return None;
        }
    };
    let event = JobEvent::from_job(EventKind::Snapshot, &job);
    if send_event(socket, &event).await {
        Some(job.status)
    } else {
        None
    }
}

async fn handle_job_socket(mut socket: WebSocket, manager: JobManager, id: Uuid) {
    // Subscribe before reading the snapshot so nothing published in between
    // is lost.
    let mut sub = manager.broadcaster().subscribe(Topic::Job(id));

    match send_snapshot(&mut socket, &manager, id).await {
        Some(status) if status.is_terminal() => {
            let _ = socket.send(Message::Close(None)).await;
            return;
        }
        Some(_) => {}
        None => return,
    }

    loop {
        tokio::select! {
            result = sub.recv() => {
                match result {
                    Ok(event) => {
                        if !send_event(&mut socket, &event).await {
                            debug!(job_id = %id, "Client disconnected during send");
                            break;
                        }
                        if event.is_terminal() {
                            let _ = socket.send(Message::Close(None)).await;
                            break;
                        }
                    }
                    Err(RecvError::Lagged(n)) => {
                        warn!(job_id = %id, missed = n, "WS client lagged behind broadcast");
                        match send_snapshot(&mut socket, &manager, id).await {
                            Some(status) if status.is_terminal() => {
                                let _ = socket.send(Message::Close(None)).await;
                                break;
                            }
                            Some(_) => {}
                            None => break,
                        }
                    }
                    Err(RecvError::Closed) => {
                        debug!(job_id = %id, "Broadcast channel closed");
                        break;
                    }
                }
            }

            result = socket.recv() => {
                if !keep_open(&mut socket, result).await {
                    break;
                }
            }
        }
    }

    info!(job_id = %id, "Job WebSocket connection closed");
}

async fn handle_global_socket(mut socket: WebSocket, manager: JobManager) {
    let mut sub: Subscription = manager.broadcaster().subscribe(Topic::Global);

    if !send_active_snapshots(&mut socket, &manager).await {
        return;
    }

    loop {
        tokio::select! {
            result = sub.recv() => {
                match result {
                    Ok(event) => {
                        if !send_event(&mut socket, &event).await {
                            break;
                        }
                    }
                    Err(RecvError::Lagged(n)) => {
                        warn!(missed = n, "Global WS client lagged behind broadcast");
                        if !send_active_snapshots(&mut socket, &manager).await {
                            break;
                        }
                    }
                    Err(RecvError::Closed) => break,
                }
            }

            result = socket.recv() => {
                if !keep_open(&mut socket, result).await {
                    break;
                }
            }
        }
    }

    info!("Global WebSocket connection closed");
}

/// Snapshot every processing job onto the global stream.
async fn send_active_snapshots(socket: &mut WebSocket, manager: &JobManager) -> bool {
    let active = match manager.store().list_by_status(JobStatus::Processing).await {
        Ok(jobs) => jobs,
        Err(e) => {
            warn!(error = %e, "Failed to list active jobs for global snapshot");
            return true;
        }
    };
    for job in &active {
        if !send_event(socket, &JobEvent::from_job(EventKind::Snapshot, job)).await {
            return false;
        }
    }
    true
}

/// Handle one inbound frame. Returns false when the connection should close.
async fn keep_open(
    socket: &mut WebSocket,
    frame: Option<Result<Message, axum::Error>>,
) -> bool {
    match frame {
        Some(Ok(Message::Ping(data))) => socket.send(Message::Pong(data)).await.is_ok(),
        Some(Ok(Message::Close(_))) | None => {
            debug!("WebSocket client disconnected");
            false
        }
        Some(Err(e)) => {
            warn!(error = %e, "WebSocket error");
            false
        }
        Some(Ok(_)) => true,
    }
}

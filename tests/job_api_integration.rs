//! Integration tests for the job REST + WebSocket system.
//!
//! Each test spins up an Axum server on a random port backed by an
//! in-memory libSQL store, then drives it with reqwest and
//! tokio-tungstenite exactly as a browser client would.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use axum::Router;
use axum::extract::ws::{Message as AxumMessage, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;

use futures_util::StreamExt;
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::time::timeout;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use comic_batch::api::{AppState, router};
use comic_batch::client::JobWatcher;
use comic_batch::config::{ManagerConfig, WatcherConfig};
use comic_batch::events::{Broadcaster, EventKind, JobEvent};
use comic_batch::jobs::{Job, JobManager, JobStatus};
use comic_batch::processors::{ArchiveInspector, FnProcessor, ItemOutcome, ProcessorRegistry};
use comic_batch::store::{JobStore, LibSqlBackend};

/// Maximum time any test is allowed to run before we consider it hung.
const TEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Per-item delay of the `slow` operation.
const SLOW_ITEM: Duration = Duration::from_millis(40);

struct TestServer {
    port: u16,
    manager: JobManager,
    http: reqwest::Client,
}

impl TestServer {
    fn url(&self, path: &str) -> String {
        format!("http://127.0.0.1:{}{path}", self.port)
    }

    fn ws_url(&self, path: &str) -> String {
        format!("ws://127.0.0.1:{}{path}", self.port)
    }

    async fn submit(&self, items: Vec<String>, operation: &str) -> Uuid {
        let resp = self
            .http
            .post(self.url("/api/jobs"))
            .json(&json!({"items": items, "operation": operation}))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 201);
        let body: Value = resp.json().await.unwrap();
        body["job_id"].as_str().unwrap().parse().unwrap()
    }

    async fn get_job(&self, id: Uuid) -> Job {
        let resp = self
            .http
            .get(self.url(&format!("/api/jobs/{id}")))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
        resp.json().await.unwrap()
    }

    async fn wait_until(&self, id: Uuid, done: impl Fn(&Job) -> bool) -> Job {
        loop {
            let job = self.get_job(id).await;
            if done(&job) {
                return job;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    async fn wait_terminal(&self, id: Uuid) -> Job {
        let job = self.wait_until(id, |j| j.status.is_terminal()).await;
        // Let the dispatcher release the job before callers act on it.
        while self.manager.is_running(id).await {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        job
    }
}

fn test_processors() -> Arc<ProcessorRegistry> {
    let processors = Arc::new(ProcessorRegistry::new());
    processors.register_sync(Arc::new(ArchiveInspector::new()));
    processors.register_sync(Arc::new(FnProcessor::new("slow", |_item: String| async {
        tokio::time::sleep(SLOW_ITEM).await;
        Ok(ItemOutcome::ok())
    })));
    processors
}

async fn start_server_with(store: Arc<dyn JobStore>, max_workers: usize) -> TestServer {
    let manager = JobManager::new(
        store,
        Arc::new(Broadcaster::new()),
        ManagerConfig {
            max_workers,
            terminal_retries: 3,
            terminal_retry_delay: Duration::from_millis(50),
        },
    );
    let app = router(AppState {
        manager: manager.clone(),
        processors: test_processors(),
    });

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    // Give the server a moment to start accepting connections.
    tokio::time::sleep(Duration::from_millis(50)).await;

    TestServer {
        port,
        manager,
        http: reqwest::Client::new(),
    }
}

async fn start_server(max_workers: usize) -> TestServer {
    let store: Arc<dyn JobStore> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
    start_server_with(store, max_workers).await
}

fn items(n: usize) -> Vec<String> {
    (1..=n).map(|i| format!("vol-{i:02}.cbz")).collect()
}

/// Parse a WS text frame into a JobEvent.
fn parse_event(msg: &Message) -> JobEvent {
    match msg {
        Message::Text(txt) => serde_json::from_str(txt).expect("invalid JSON from server"),
        other => panic!("expected Text frame, got {:?}", other),
    }
}

// ── Scenarios ────────────────────────────────────────────────────────

#[tokio::test]
async fn all_items_succeed_with_live_progress() {
    timeout(TEST_TIMEOUT, async {
        let server = start_server(2).await;
        let id = server.submit(items(5), "slow").await;

        let (mut ws, _) = connect_async(server.ws_url(&format!("/ws/jobs/{id}")))
            .await
            .expect("WS connect failed");

        let first = parse_event(&ws.next().await.unwrap().unwrap());
        assert_eq!(first.kind, EventKind::Snapshot);
        assert_eq!(first.job_id, id);

        let mut last = first;
        while !last.is_terminal() {
            let next = parse_event(&ws.next().await.unwrap().unwrap());
            assert!(next.progress.processed >= last.progress.processed);
            last = next;
        }

        assert_eq!(last.status, JobStatus::Completed);
        assert_eq!(last.progress.processed, 5);
        assert_eq!(last.progress.success, 5);

        let job = server.get_job(id).await;
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.results.len(), 5);
        assert!(job.results.iter().all(|r| r.success));
        assert!(job.started_at.is_some() && job.completed_at.is_some());
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn failing_archive_is_recorded_and_batch_completes() {
    timeout(TEST_TIMEOUT, async {
        let dir = tempfile::tempdir().unwrap();
        let good_a = dir.path().join("a.cbz");
        let broken = dir.path().join("b.cbz");
        let good_c = dir.path().join("c.cbr");
        std::fs::write(&good_a, b"PK\x03\x04data").unwrap();
        std::fs::write(&broken, b"this is not a zip").unwrap();
        std::fs::write(&good_c, b"Rar!\x1a\x07\x00data").unwrap();

        // One worker keeps completion order equal to submission order.
        let server = start_server(1).await;
        let paths: Vec<String> = [&good_a, &broken, &good_c]
            .iter()
            .map(|p| p.to_string_lossy().into_owned())
            .collect();
        let id = server.submit(paths, "inspect").await;

        let job = server.wait_terminal(id).await;
        assert_eq!(job.status, JobStatus::Completed);
        assert!(job.error.is_none());
        let flags: Vec<bool> = job.results.iter().map(|r| r.success).collect();
        assert_eq!(flags, vec![true, false, true]);
        assert!(job.results[1].error.is_some());
        assert_eq!(job.results[2].details.as_ref().unwrap()["format"], "rar");
        assert_eq!(job.operation.as_deref(), Some("inspect"));
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn cancel_mid_run_keeps_only_dispatched_results() {
    timeout(TEST_TIMEOUT, async {
        let server = start_server(2).await;
        let id = server.submit(items(10), "slow").await;

        server.wait_until(id, |j| j.processed_items >= 4).await;

        let resp = server
            .http
            .post(server.url(&format!("/api/jobs/{id}/cancel")))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 202);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["status"], "cancelling");

        let job = server.wait_terminal(id).await;
        assert_eq!(job.status, JobStatus::Cancelled);
        assert!(job.processed_items >= 4);
        assert!(job.processed_items < 10);
        assert_eq!(job.processed_items as usize, job.results.len());

        // Terminal jobs cannot be cancelled again.
        let resp = server
            .http
            .post(server.url(&format!("/api/jobs/{id}/cancel")))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 409);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn second_start_is_rejected_and_job_runs_once() {
    timeout(TEST_TIMEOUT, async {
        let server = start_server(2).await;
        let processors = test_processors();
        let slow = processors.get("slow").await.unwrap();

        let id = server.manager.create(3).await.unwrap();
        server
            .manager
            .start(&id.to_string(), items(3), Arc::clone(&slow))
            .await
            .unwrap();
        let err = server
            .manager
            .start(&id.to_string(), items(3), slow)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("not in queued state"));

        let job = server.wait_terminal(id).await;
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.processed_items, 3);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn reconnect_after_completion_matches_store() {
    timeout(TEST_TIMEOUT, async {
        let server = start_server(2).await;
        let id = server.submit(items(4), "slow").await;

        let (mut global, _) = connect_async(server.ws_url("/ws/jobs")).await.unwrap();

        // Watch briefly, then drop the connection before the job finishes.
        {
            let (mut ws, _) = connect_async(server.ws_url(&format!("/ws/jobs/{id}")))
                .await
                .unwrap();
            let snapshot = parse_event(&ws.next().await.unwrap().unwrap());
            assert_eq!(snapshot.kind, EventKind::Snapshot);
            assert!(snapshot.status.is_active());
        }

        let broadcast_terminal = loop {
            let event = parse_event(&global.next().await.unwrap().unwrap());
            if event.job_id == id && event.kind == EventKind::Terminal {
                break event;
            }
        };

        // Reconnect: the snapshot is the terminal record, then the server closes.
        let (mut ws, _) = connect_async(server.ws_url(&format!("/ws/jobs/{id}")))
            .await
            .unwrap();
        let snapshot = parse_event(&ws.next().await.unwrap().unwrap());
        assert_eq!(snapshot.status, JobStatus::Completed);

        let stored = server.get_job(id).await;
        let from_store = JobEvent::from_job(EventKind::Terminal, &stored);
        assert_eq!(from_store, broadcast_terminal);
        assert_eq!(snapshot.progress, broadcast_terminal.progress);

        // Repeated reads of a terminal job are identical.
        assert_eq!(server.get_job(id).await, stored);
    })
    .await
    .expect("test timed out");
}

// ── REST contract ────────────────────────────────────────────────────

#[tokio::test]
async fn delete_requires_cancel_or_completion() {
    timeout(TEST_TIMEOUT, async {
        let server = start_server(1).await;
        let id = server.submit(items(3), "slow").await;
        let url = server.url(&format!("/api/jobs/{id}"));

        let resp = server.http.delete(&url).send().await.unwrap();
        assert_eq!(resp.status(), 409);

        server.wait_terminal(id).await;
        let resp = server.http.delete(&url).send().await.unwrap();
        assert_eq!(resp.status(), 204);

        let resp = server.http.get(&url).send().await.unwrap();
        assert_eq!(resp.status(), 404);
        let resp = server.http.delete(&url).send().await.unwrap();
        assert_eq!(resp.status(), 404);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn bad_requests_are_explicit() {
    timeout(TEST_TIMEOUT, async {
        let server = start_server(1).await;

        let resp = server.http.get(server.url("/api/jobs/not-a-uuid")).send().await.unwrap();
        assert_eq!(resp.status(), 400);

        let resp = server
            .http
            .post(server.url("/api/jobs"))
            .json(&json!({"items": ["a.cbz"], "operation": "transcode"}))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 400);

        let resp = server
            .http
            .post(server.url("/api/jobs"))
            .json(&json!({"items": [], "operation": "slow"}))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 400);

        // Unknown jobs are refused before the WebSocket upgrade.
        let missing = Uuid::new_v4();
        assert!(
            connect_async(server.ws_url(&format!("/ws/jobs/{missing}")))
                .await
                .is_err()
        );
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn list_returns_newest_first() {
    timeout(TEST_TIMEOUT, async {
        let server = start_server(2).await;
        let first = server.submit(items(1), "slow").await;
        let second = server.submit(items(1), "slow").await;

        let body: Value = server
            .http
            .get(server.url("/api/jobs?limit=1"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(body["limit"], 1);
        assert_eq!(body["jobs"].as_array().unwrap().len(), 1);
        assert_eq!(body["jobs"][0]["id"], second.to_string());

        let body: Value = server
            .http
            .get(server.url("/api/jobs?limit=1&offset=1"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(body["jobs"][0]["id"], first.to_string());
    })
    .await
    .expect("test timed out");
}

// ── Client protocol ──────────────────────────────────────────────────

#[tokio::test]
async fn watcher_follows_job_to_completion() {
    timeout(TEST_TIMEOUT, async {
        let server = start_server(2).await;
        let id = server.submit(items(6), "slow").await;

        let watcher = JobWatcher::new(server.url(""), WatcherConfig::default());
        let mut seen = Vec::new();
        let last = watcher
            .watch_with(id, |view| seen.push(view.progress.processed))
            .await
            .unwrap();

        assert_eq!(last.status, JobStatus::Completed);
        assert_eq!(last.progress.processed, 6);
        assert!(seen.windows(2).all(|w| w[0] <= w[1]));
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn watchdog_recovers_when_push_is_silent() {
    timeout(TEST_TIMEOUT, async {
        let store: Arc<dyn JobStore> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let server = start_server_with(Arc::clone(&store), 2).await;

        // A second manager on its own broadcaster runs the job, so the
        // server's push stream never hears about it.
        let silent = JobManager::new(
            Arc::clone(&store),
            Arc::new(Broadcaster::new()),
            ManagerConfig::default(),
        );
        let slow = test_processors().get("slow").await.unwrap();
        let id = silent.create(3).await.unwrap();
        silent.start(&id.to_string(), items(3), slow).await.unwrap();

        let watcher = JobWatcher::new(
            server.url(""),
            WatcherConfig {
                reconnect_delay: Duration::from_millis(100),
                inactivity_window: Duration::from_millis(200),
                watchdog_interval: Duration::from_millis(50),
            },
        );
        let last = watcher.watch_for(id, Duration::from_secs(5)).await.unwrap();
        assert_eq!(last.status, JobStatus::Completed);
        assert_eq!(last.kind, EventKind::Snapshot);
        assert_eq!(last.progress.processed, 3);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn watcher_reports_missing_job() {
    timeout(TEST_TIMEOUT, async {
        let server = start_server(1).await;
        let watcher = JobWatcher::new(server.url(""), WatcherConfig::default());
        let err = watcher.watch(Uuid::new_v4()).await.unwrap_err();
        assert!(err.to_string().contains("404"));
    })
    .await
    .expect("test timed out");
}

// ── Unreliable push path ─────────────────────────────────────────────

/// How the front server treats push connections.
#[derive(Clone, Copy)]
enum PushMode {
    /// Forward the first frame of the first connection, then hang up.
    /// Later connections are forwarded in full.
    DropFirst,
    /// Never complete the WebSocket handshake.
    Stall,
}

/// Front server between the watcher and the real one. Status reads are
/// forwarded and counted.
struct FrontServer {
    upstream_port: u16,
    mode: PushMode,
    http: reqwest::Client,
    reads: AtomicUsize,
    connects: AtomicUsize,
}

async fn front_get_job(State(front): State<Arc<FrontServer>>, Path(id): Path<String>) -> Response {
    front.reads.fetch_add(1, Ordering::SeqCst);
    let resp = front
        .http
        .get(format!("http://127.0.0.1:{}/api/jobs/{id}", front.upstream_port))
        .send()
        .await
        .unwrap();
    let status = StatusCode::from_u16(resp.status().as_u16()).unwrap();
    let body: Value = resp.json().await.unwrap();
    (status, axum::Json(body)).into_response()
}

async fn front_job_ws(
    State(front): State<Arc<FrontServer>>,
    Path(id): Path<String>,
    ws: WebSocketUpgrade,
) -> Response {
    let attempt = front.connects.fetch_add(1, Ordering::SeqCst);
    if let PushMode::Stall = front.mode {
        return std::future::pending::<Response>().await;
    }
    let port = front.upstream_port;
    ws.on_upgrade(move |mut socket| async move {
        let (mut upstream, _) = connect_async(format!("ws://127.0.0.1:{port}/ws/jobs/{id}"))
            .await
            .unwrap();
        while let Some(Ok(Message::Text(text))) = upstream.next().await {
            if socket
                .send(AxumMessage::Text(text.as_str().into()))
                .await
                .is_err()
            {
                return;
            }
            if attempt == 0 {
                let _ = socket.send(AxumMessage::Close(None)).await;
                return;
            }
        }
    })
}

async fn start_front(upstream_port: u16, mode: PushMode) -> (Arc<FrontServer>, String) {
    let front = Arc::new(FrontServer {
        upstream_port,
        mode,
        http: reqwest::Client::new(),
        reads: AtomicUsize::new(0),
        connects: AtomicUsize::new(0),
    });
    let app = Router::new()
        .route("/api/jobs/{id}", get(front_get_job))
        .route("/ws/jobs/{id}", get(front_job_ws))
        .with_state(Arc::clone(&front));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    (front, format!("http://127.0.0.1:{port}"))
}

#[tokio::test]
async fn watcher_reconnects_and_resyncs_once_after_drop() {
    timeout(TEST_TIMEOUT, async {
        let server = start_server(1).await;
        let (front, base_url) = start_front(server.port, PushMode::DropFirst).await;
        let id = server.submit(items(8), "slow").await;

        // A long inactivity window keeps the watchdog out of the picture.
        let watcher = JobWatcher::new(
            base_url,
            WatcherConfig {
                reconnect_delay: Duration::from_millis(100),
                inactivity_window: Duration::from_secs(60),
                watchdog_interval: Duration::from_secs(15),
            },
        );
        let last = watcher.watch(id).await.unwrap();

        assert_eq!(front.connects.load(Ordering::SeqCst), 2);
        assert_eq!(front.reads.load(Ordering::SeqCst), 1);

        let job = server.wait_terminal(id).await;
        assert_eq!(last.status, JobStatus::Completed);
        assert_eq!(last.status, job.status);
        assert_eq!(last.progress.processed, job.processed_items);
        assert_eq!(last.progress.success, job.success_count());
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn watchdog_runs_while_handshake_stalls() {
    timeout(TEST_TIMEOUT, async {
        let server = start_server(2).await;
        let (front, base_url) = start_front(server.port, PushMode::Stall).await;
        let id = server.submit(items(3), "slow").await;

        let watcher = JobWatcher::new(
            base_url,
            WatcherConfig {
                reconnect_delay: Duration::from_millis(100),
                inactivity_window: Duration::from_millis(200),
                watchdog_interval: Duration::from_millis(50),
            },
        );
        let last = watcher.watch_for(id, Duration::from_secs(5)).await.unwrap();

        assert_eq!(last.status, JobStatus::Completed);
        assert_eq!(last.kind, EventKind::Snapshot);
        assert_eq!(last.progress.processed, 3);
        assert_eq!(front.connects.load(Ordering::SeqCst), 1);
        assert!(front.reads.load(Ordering::SeqCst) >= 1);
    })
    .await
    .expect("test timed out");
}

// ── Restart recovery ─────────────────────────────────────────────────

#[tokio::test]
async fn restart_fails_interrupted_jobs() {
    timeout(TEST_TIMEOUT, async {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("jobs.db");

        let (orphan, queued) = {
            let store = LibSqlBackend::new_local(&db_path).await.unwrap();
            let orphan = store.create(2).await.unwrap();
            store.transition(orphan, JobStatus::Processing).await.unwrap();
            let queued = store.create(1).await.unwrap();
            (orphan, queued)
        };

        let store: Arc<dyn JobStore> = Arc::new(LibSqlBackend::new_local(&db_path).await.unwrap());
        let server = start_server_with(store, 1).await;
        assert_eq!(server.manager.recover_interrupted().await.unwrap(), 1);

        let job = server.get_job(orphan).await;
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.error.as_deref(), Some("interrupted by service restart"));
        assert_eq!(server.get_job(queued).await.status, JobStatus::Queued);
    })
    .await
    .expect("test timed out");
}

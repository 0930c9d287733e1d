use std::sync::Arc;

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

use comic_batch::api::{AppState, router};
use comic_batch::config::ServiceConfig;
use comic_batch::events::Broadcaster;
use comic_batch::jobs::JobManager;
use comic_batch::jobs::reaper;
use comic_batch::processors::{ArchiveInspector, ProcessorRegistry};
use comic_batch::store::{JobStore, LibSqlBackend};

/// Initialize tracing. The returned guard must live as long as the process
/// so buffered file logs are flushed.
fn init_tracing(config: &ServiceConfig) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let stderr = fmt::layer().with_target(false).with_writer(std::io::stderr);

    match &config.log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "comic-batch.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::registry()
                .with(filter)
                .with(stderr)
                .with(fmt::layer().with_ansi(false).with_writer(writer))
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::registry().with(filter).with(stderr).init();
            None
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = ServiceConfig::from_env().context("invalid configuration")?;
    let _log_guard = init_tracing(&config);

    eprintln!("📚 Comic Batch v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   API: http://0.0.0.0:{}/api/jobs", config.port);
    eprintln!("   Job WS: ws://0.0.0.0:{}/ws/jobs/{{id}}", config.port);
    eprintln!("   Workers per job: {}", config.manager.max_workers);

    // ── Database ─────────────────────────────────────────────────────────
    let store: Arc<dyn JobStore> = Arc::new(
        LibSqlBackend::new_local(&config.db_path)
            .await
            .with_context(|| format!("failed to open database at {}", config.db_path.display()))?,
    );
    eprintln!("   Database: {}", config.db_path.display());

    // ── Jobs ─────────────────────────────────────────────────────────────
    let broadcaster = Arc::new(Broadcaster::new());
    let manager = JobManager::new(
        Arc::clone(&store),
        Arc::clone(&broadcaster),
        config.manager.clone(),
    );

    // Startup recovery: nothing can still be running for jobs a previous
    // process left behind.
    let recovered = manager.recover_interrupted().await?;
    if recovered > 0 {
        eprintln!("   Recovered {recovered} interrupted jobs (marked failed)");
    }

    let shutdown = CancellationToken::new();
    let reaper_handle =
        reaper::spawn_reaper(Arc::clone(&store), config.reaper.clone(), shutdown.clone());

    // ── Operations ───────────────────────────────────────────────────────
    let processors = Arc::new(ProcessorRegistry::new());
    let inspector = match &config.library_root {
        Some(root) => {
            eprintln!("   Library root: {}", root.display());
            ArchiveInspector::with_library_root(root)
        }
        None => ArchiveInspector::new(),
    };
    processors.register_sync(Arc::new(inspector));
    eprintln!("   Operations: {} registered\n", processors.count());

    // ── Server ───────────────────────────────────────────────────────────
    let app = router(AppState {
        manager,
        processors,
    });
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", config.port))
        .await
        .with_context(|| format!("failed to bind port {}", config.port))?;
    tracing::info!(port = config.port, "Job server started");

    let server_shutdown = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Shutdown requested");
            server_shutdown.cancel();
        })
        .await
        .context("server error")?;

    shutdown.cancel();
    let _ = reaper_handle.await;
    Ok(())
}

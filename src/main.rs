use std::sync::Arc;
use std::sync::atomic::Ordering;

use anyhow::Context;
use tracing::info;

use mail_ingest::config::{IngestConfig, ServerConfig};
use mail_ingest::ingest::routes::{IngestRouteState, ingest_routes};
use mail_ingest::ingest::{IngestService, spawn_poller};
use mail_ingest::mail::ImapConnector;
use mail_ingest::store::StoreHandle;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _log_guard = setup_logging();

    let config = IngestConfig::from_env().context("Invalid ingestion configuration")?;
    let server = ServerConfig::from_env().context("Invalid server configuration")?;

    eprintln!("📬 Mail Ingest v{}", env!("CARGO_PKG_VERSION"));
    eprintln!(
        "   Mailbox: {}@{}:{}/{}",
        config.imap.username, config.imap.host, config.imap.port, config.imap.mailbox
    );
    eprintln!("   Store: {}", config.db_path.display());

    // ── Shared service ──────────────────────────────────────────────
    let store = Arc::new(StoreHandle::new(config.db_path.clone()));
    let service = Arc::new(
        IngestService::new(
            Arc::clone(&store),
            Arc::new(ImapConnector::new(config.imap.clone())),
            config.imap.mailbox.clone(),
            config.policy,
        )
        .with_log_retention(config.log_retention),
    );

    // ── Mode selection ──────────────────────────────────────────────
    match (server.port, config.poll_interval) {
        (Some(port), interval) => {
            let poller = interval.map(|i| spawn_poller(Arc::clone(&service), i));

            let app = ingest_routes(IngestRouteState {
                service: Arc::clone(&service),
                auth: Arc::new(server.auth),
            });
            let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{port}"))
                .await
                .with_context(|| format!("Failed to bind port {port}"))?;
            info!(port, "Ingest HTTP server started");
            axum::serve(listener, app)
                .with_graceful_shutdown(shutdown_signal())
                .await
                .context("HTTP server failed")?;

            if let Some((handle, shutdown)) = poller {
                shutdown.store(true, Ordering::Relaxed);
                handle.abort();
            }
        }
        (None, Some(interval)) => {
            let (handle, shutdown) = spawn_poller(Arc::clone(&service), interval);
            shutdown_signal().await;
            shutdown.store(true, Ordering::Relaxed);
            handle.abort();
        }
        (None, None) => {
            let summary = service.run_once().await?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
    }

    info!("Shutting down");
    Ok(())
}

/// Stderr logging, plus a daily-rotated file when `INGEST_LOG_DIR` is set.
///
/// The returned guard flushes the file writer on drop.
fn setup_logging() -> Option<tracing_appender::non_blocking::WorkerGuard> {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr);

    let log_dir = std::env::var("INGEST_LOG_DIR")
        .ok()
        .filter(|d| !d.trim().is_empty());
    if let Some(dir) = log_dir
        && std::fs::create_dir_all(&dir).is_ok()
    {
        let (writer, guard) =
            tracing_appender::non_blocking(tracing_appender::rolling::daily(&dir, "mail-ingest.log"));
        let file_layer = tracing_subscriber::fmt::layer()
            .with_ansi(false)
            .with_writer(writer);
        tracing_subscriber::registry()
            .with(env_filter)
            .with(stderr_layer)
            .with(file_layer)
            .init();
        return Some(guard);
    }

    tracing_subscriber::registry()
        .with(env_filter)
        .with(stderr_layer)
        .init();
    None
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {e}");
        std::future::pending::<()>().await;
    }
}

//! Amnesia Upload Janitor
//!
//! Long-running process that owns the chunks directory: recovers sessions left
//! on disk and expires idle ones until shut down.

use anyhow::Context;
use tokio::signal;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use amnesia_upload::{Config, Engine};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "amnesia_upload=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    dotenvy::dotenv().ok();
    let config = Config::from_env().context("invalid upload configuration")?;

    tracing::info!("Starting Amnesia upload janitor v{}", env!("CARGO_PKG_VERSION"));
    tracing::info!("Upload path: {}", config.upload_path.display());
    tracing::info!("Chunks directory: {}", config.chunks_directory.display());

    let engine = Engine::new(config)
        .await
        .context("failed to open upload storage")?;

    let sessions = engine.sessions().sessions();
    tracing::info!(sessions = sessions.len(), "Chunk sessions on disk");
    for session in &sessions {
        tracing::debug!(
            session_id = %session.session.session_id,
            file_name = %session.session.target_file_name,
            percent = session.percent,
            "Resumable session"
        );
    }

    let Some(reaper) = engine.start_reaper() else {
        tracing::warn!("SESSION_TTL_HOURS is 0, nothing to do");
        return Ok(());
    };

    shutdown_signal().await;
    reaper.abort();

    tracing::info!("Janitor shutdown complete");
    Ok(())
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, shutting down...");
        },
        _ = terminate => {
            tracing::info!("Received SIGTERM, shutting down...");
        },
    }
}

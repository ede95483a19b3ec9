use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio::signal;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use fmq_broker::config::{LogFormat, Settings};
use fmq_broker::database::DatabasePool;
use fmq_broker::manager::QueueManager;
use fmq_broker::server::{create_app, AppState};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let settings = Settings::new()?;

    // Initialize tracing
    init_tracing(settings.logging.format);
    tracing::info!("Configuration loaded");

    // Connect the shared database pool, if configured
    let database = match &settings.database {
        Some(config) => Some(
            DatabasePool::new(config)
                .await
                .context("Failed to connect to database")?,
        ),
        None => None,
    };

    // Register configured queues
    let manager = Arc::new(QueueManager::from_settings(&settings, database.clone()));
    for definition in &settings.queues {
        manager
            .setup_queue(definition)
            .await
            .with_context(|| format!("Failed to set up queue '{}'", definition.path))?;
    }
    tracing::info!(queues = manager.queue_count(), "Queues registered");

    // Create application state
    let state = AppState::with_manager(settings.clone(), manager, database.clone());

    // Create Axum app
    let app = create_app(state);

    // Start server
    let addr = settings.server_addr();
    let listener = TcpListener::bind(&addr).await?;
    tracing::info!("Server listening on {}", addr);

    // Run server with graceful shutdown
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal_handler())
    .await?;

    if let Some(db) = database {
        db.close().await;
    }

    tracing::info!("Server shutdown complete");
    Ok(())
}

fn init_tracing(format: LogFormat) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let registry = tracing_subscriber::registry().with(env_filter);
    match format {
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).init(),
        LogFormat::Pretty => registry.with(tracing_subscriber::fmt::layer()).init(),
    }
}

async fn shutdown_signal_handler() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install signal handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            tracing::info!("Received terminate signal, initiating graceful shutdown");
        }
    }
}

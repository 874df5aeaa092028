use std::sync::Arc;

use anyhow::Result;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::broadcast;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use ope_queue_service::config::{LoggingConfig, Settings};
use ope_queue_service::queue::OperationQueue;
use ope_queue_service::server::{create_app, AppState};
use ope_queue_service::snapshot::create_blob_store;
use ope_queue_service::store::create_kv_store;
use ope_queue_service::tasks::MaintenanceTask;

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration; missing required values are fatal
    let settings = match Settings::new() {
        Ok(settings) => settings,
        Err(e) => {
            init_tracing(&LoggingConfig::default());
            tracing::error!(error = %e, "Failed to load configuration");
            return Err(e.into());
        }
    };

    // Initialize tracing
    init_tracing(&settings.logging);
    tracing::info!("Configuration loaded");

    // Create stores
    let store = create_kv_store(&settings.store).await?;
    let blobs = create_blob_store(&settings.blob)?;

    // Create the queue engine and application state
    let queue = Arc::new(OperationQueue::from_settings(&settings, store, blobs));
    let state = AppState::new(settings.clone(), queue.clone());
    tracing::info!("Application state initialized");

    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    // Start maintenance task in background
    let maintenance_task = MaintenanceTask::new(
        settings.maintenance.clone(),
        queue.clone(),
        shutdown_tx.subscribe(),
    );
    let maintenance_handle = tokio::spawn(async move {
        maintenance_task.run().await;
    });

    // Create Axum app
    let app = create_app(state);

    // Start server
    let addr = settings.server_addr();
    let listener = TcpListener::bind(&addr).await?;
    tracing::info!("Server listening on {}", addr);

    // Run server with graceful shutdown
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal_handler(shutdown_tx))
        .await?;

    // Wait for background tasks to finish
    tracing::info!("Waiting for background tasks to finish...");
    let _ = maintenance_handle.await;

    tracing::info!("Server shutdown complete");
    Ok(())
}

fn init_tracing(logging: &LoggingConfig) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&logging.level));

    let registry = tracing_subscriber::registry().with(env_filter);

    if logging.format == "json" {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

async fn shutdown_signal_handler(shutdown_tx: broadcast::Sender<()>) {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
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

    // Stop background tasks
    let _ = shutdown_tx.send(());
}

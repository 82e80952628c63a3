use std::net::SocketAddr;

use anyhow::Result;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::{broadcast, watch};

use ssh_tunnel_gateway::config::Settings;
use ssh_tunnel_gateway::server::{create_app, AppState};
use ssh_tunnel_gateway::shutdown::GracefulShutdown;
use ssh_tunnel_gateway::tasks::BucketCleanupTask;
use ssh_tunnel_gateway::telemetry::init_telemetry;

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let settings = Settings::new()?;

    // Initialize tracing; the guard flushes exported spans on exit
    let _telemetry = init_telemetry(&settings.otel)?;
    tracing::info!("Configuration loaded");

    // Create application state
    let state = AppState::new(settings.clone());
    state.start_background_tasks().await;
    tracing::info!("Application state initialized");

    // Background task shutdown signal
    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    let cleanup_task = BucketCleanupTask::new(
        state.limiter.clone(),
        settings.rate_limit.cleanup_interval(),
        shutdown_tx.subscribe(),
    );
    let cleanup_handle = tokio::spawn(cleanup_task.run());

    let graceful = GracefulShutdown::new(
        state.sessions.clone(),
        state.pool.clone(),
        state.reset_manager.clone(),
        shutdown_tx,
    );

    // Create Axum app
    let app = create_app(state);

    // Start server
    let addr = settings.server_addr();
    let listener = TcpListener::bind(&addr).await?;
    tracing::info!("Server listening on {}", addr);

    let (stop_tx, mut stop_rx) = watch::channel(false);
    let server = tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move {
            let _ = stop_rx.wait_for(|stop| *stop).await;
        })
        .await
    });

    let reason = shutdown_signal_handler().await;

    // Stop accepting, then close sessions, drain the pool and stop tasks
    stop_tx.send_replace(true);
    let result = graceful.execute(reason).await;
    if !result.success {
        tracing::warn!(
            timed_out_sessions = result.sessions.timed_out,
            abandoned_channels = result.drain.abandoned_channels,
            "Shutdown finished with leftovers"
        );
    }

    tracing::info!("Waiting for background tasks to finish...");
    let _ = cleanup_handle.await;
    server.await??;

    tracing::info!("Server shutdown complete");
    Ok(())
}

async fn shutdown_signal_handler() -> &'static str {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
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
            "SIGINT"
        }
        _ = terminate => {
            tracing::info!("Received terminate signal, initiating graceful shutdown");
            "SIGTERM"
        }
    }
}

//! Graceful shutdown handling for the tunnel gateway.
//!
//! Runs after the listener has stopped accepting:
//! 1. Closes every WebSocket session with 1001 and waits for the close handshakes
//! 2. Drains the SSH connection pool (in-flight forwards, then force-close)
//! 3. Stops background tasks (breaker reset timers, bucket cleanup)

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::time::timeout;

use crate::circuit_breaker::AutomaticResetManager;
use crate::pool::{ConnectionPool, DrainReport};
use crate::websocket::{CloseAllReport, SessionRegistry};

/// Configuration for graceful shutdown behavior
#[derive(Debug, Clone)]
pub struct ShutdownConfig {
    /// Upper bound for closing all WebSocket sessions (default: 10 seconds)
    pub session_close_timeout: Duration,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            session_close_timeout: Duration::from_secs(10),
        }
    }
}

/// Handles graceful shutdown of the gateway
pub struct GracefulShutdown {
    sessions: Arc<SessionRegistry>,
    pool: Arc<ConnectionPool>,
    reset_manager: Arc<AutomaticResetManager>,
    shutdown_tx: broadcast::Sender<()>,
    config: ShutdownConfig,
}

impl GracefulShutdown {
    pub fn new(
        sessions: Arc<SessionRegistry>,
        pool: Arc<ConnectionPool>,
        reset_manager: Arc<AutomaticResetManager>,
        shutdown_tx: broadcast::Sender<()>,
    ) -> Self {
        Self::with_config(sessions, pool, reset_manager, shutdown_tx, ShutdownConfig::default())
    }

    pub fn with_config(
        sessions: Arc<SessionRegistry>,
        pool: Arc<ConnectionPool>,
        reset_manager: Arc<AutomaticResetManager>,
        shutdown_tx: broadcast::Sender<()>,
        config: ShutdownConfig,
    ) -> Self {
        Self {
            sessions,
            pool,
            reset_manager,
            shutdown_tx,
            config,
        }
    }

    /// Execute graceful shutdown sequence
    #[tracing::instrument(
        name = "graceful_shutdown",
        skip(self),
        fields(open_sessions = self.sessions.len())
    )]
    pub async fn execute(&self, reason: &str) -> ShutdownResult {
        let start = std::time::Instant::now();

        // Phase 1: Close client sessions so no new forwards arrive
        tracing::info!(reason = %reason, "Starting graceful shutdown - Phase 1: Closing WebSocket sessions");
        let sessions = match timeout(self.config.session_close_timeout, self.sessions.close_all()).await {
            Ok(report) => report,
            Err(_) => {
                let remaining = self.sessions.len();
                tracing::warn!(
                    remaining_sessions = remaining,
                    "WebSocket close timeout elapsed"
                );
                CloseAllReport {
                    total: remaining,
                    acknowledged: 0,
                    timed_out: remaining,
                }
            }
        };

        // Phase 2: Drain the pool
        tracing::info!("Phase 2: Draining SSH connection pool");
        let drain = self.pool.shutdown().await;

        // Phase 3: Stop background tasks
        tracing::info!("Phase 3: Stopping background tasks");
        let _ = self.shutdown_tx.send(());
        self.reset_manager.stop().await;

        let result = ShutdownResult {
            success: drain.drained && sessions.timed_out == 0,
            sessions,
            drain,
            duration: start.elapsed(),
        };

        tracing::info!(
            sessions_closed = result.sessions.total,
            sessions_acknowledged = result.sessions.acknowledged,
            ssh_sessions_closed = result.drain.sessions_closed,
            drained = result.drain.drained,
            duration_ms = result.duration.as_millis() as u64,
            "Graceful shutdown completed"
        );

        result
    }
}

/// Result of a graceful shutdown operation
#[derive(Debug)]
pub struct ShutdownResult {
    /// True when every session acknowledged its close and the pool drained in time
    pub success: bool,
    pub sessions: CloseAllReport,
    pub drain: DrainReport,
    /// Total time taken for shutdown
    pub duration: Duration,
}

//! Health check and statistics endpoints.

use axum::{extract::State, Json};
use serde::Serialize;

use crate::circuit_breaker::{BreakerCounters, CircuitBreakerStats, CircuitState};
use crate::pool::PoolStats;
use crate::ratelimit::RateLimiterStats;
use crate::server::AppState;
use crate::websocket::CompressionSnapshot;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub uptime_seconds: u64,
    pub pool: PoolHealthResponse,
    pub breakers: Vec<BreakerHealthResponse>,
    pub websocket: WebSocketHealthResponse,
}

#[derive(Debug, Serialize)]
pub struct PoolHealthResponse {
    pub total_connections: usize,
    pub user_count: usize,
    pub active_channels: u32,
    pub shutting_down: bool,
}

#[derive(Debug, Serialize)]
pub struct BreakerHealthResponse {
    pub name: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
}

#[derive(Debug, Serialize)]
pub struct WebSocketHealthResponse {
    pub open_sessions: usize,
    pub compression: CompressionSnapshot,
}

#[derive(Debug, Serialize)]
pub struct StatsResponse {
    pub pool: PoolStats,
    pub breakers: Vec<CircuitBreakerStats>,
    pub breaker_counters: Vec<BreakerCounters>,
    pub rate_limit: RateLimiterStats,
    pub compression: CompressionSnapshot,
    pub open_sessions: usize,
}

pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let pool_stats = state.pool.stats();
    let shutting_down = state.pool.is_shutting_down();

    let breakers: Vec<BreakerHealthResponse> = state
        .breakers
        .stats()
        .into_iter()
        .map(|b| BreakerHealthResponse {
            name: b.name,
            state: b.state,
            failure_count: b.failure_count,
            success_count: b.success_count,
        })
        .collect();

    let status = if shutting_down {
        "shutting_down"
    } else if breakers.iter().any(|b| b.state != CircuitState::Closed) {
        "degraded"
    } else {
        "healthy"
    };

    Json(HealthResponse {
        status: status.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds: state.start_time.elapsed().as_secs(),
        pool: PoolHealthResponse {
            total_connections: pool_stats.total_connections,
            user_count: pool_stats.user_count,
            active_channels: pool_stats.active_channels,
            shutting_down,
        },
        breakers,
        websocket: WebSocketHealthResponse {
            open_sessions: state.sessions.len(),
            compression: state.compression_stats.snapshot(),
        },
    })
}

pub async fn stats(State(state): State<AppState>) -> Json<StatsResponse> {
    Json(StatsResponse {
        pool: state.pool.stats(),
        breakers: state.breakers.stats(),
        breaker_counters: state.breaker_metrics.all(),
        rate_limit: state.limiter.stats(),
        compression: state.compression_stats.snapshot(),
        open_sessions: state.sessions.len(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;

    #[tokio::test]
    async fn test_health_reports_healthy_when_idle() {
        let state = AppState::new(Settings::with_jwt_secret("secret"));
        let Json(body) = health(State(state)).await;

        assert_eq!(body.status, "healthy");
        assert_eq!(body.pool.total_connections, 0);
        assert_eq!(body.websocket.open_sessions, 0);
        assert_eq!(body.breakers.len(), 1);
        assert_eq!(body.breakers[0].state, CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_health_degraded_while_breaker_open() {
        let state = AppState::new(Settings::with_jwt_secret("secret"));
        for _ in 0..state.settings.circuit_breaker.failure_threshold {
            let _ = state
                .router
                .breaker()
                .execute(|| async { Err::<(), _>("down") })
                .await;
        }

        let Json(body) = health(State(state)).await;
        assert_eq!(body.status, "degraded");
        assert_eq!(body.breakers[0].state, CircuitState::Open);
    }

    #[tokio::test]
    async fn test_stats_include_limiter_and_compression() {
        let state = AppState::new(Settings::with_jwt_secret("secret"));
        let Json(body) = stats(State(state)).await;

        assert_eq!(body.rate_limit.user_buckets, 0);
        assert_eq!(body.compression.attempts, 0);
        assert_eq!(body.breakers.len(), 1);
    }
}

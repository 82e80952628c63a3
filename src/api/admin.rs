//! Operator endpoints, mounted behind the API key middleware.

use axum::{
    extract::{Path, State},
    Json,
};
use serde::Serialize;

use crate::circuit_breaker::CircuitBreakerStats;
use crate::error::AppError;
use crate::server::AppState;
use crate::websocket::ConnectionInfo;

#[derive(Debug, Serialize)]
pub struct ClosedConnectionsResponse {
    pub user_id: String,
    pub closed: usize,
}

/// POST /api/v1/breakers/{name}/reset
pub async fn reset_breaker(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<CircuitBreakerStats>, AppError> {
    let breaker = state
        .breakers
        .get(&name)
        .ok_or_else(|| AppError::NotFound(format!("circuit breaker '{}'", name)))?;

    breaker.reset();
    tracing::info!(breaker = %name, "Circuit breaker reset by operator");
    Ok(Json(breaker.stats()))
}

/// GET /api/v1/breakers
pub async fn list_breakers(State(state): State<AppState>) -> Json<Vec<CircuitBreakerStats>> {
    Json(state.breakers.stats())
}

/// DELETE /api/v1/pool/{user_id}
pub async fn close_user_connections(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> Json<ClosedConnectionsResponse> {
    let closed = state.pool.close_connection(&user_id).await;
    Json(ClosedConnectionsResponse { user_id, closed })
}

/// GET /api/v1/sessions/{user_id}
pub async fn user_sessions(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> Json<Vec<ConnectionInfo>> {
    Json(state.sessions.user_sessions(&user_id))
}

use axum::{
    middleware,
    routing::{delete, get, post},
    Router,
};

use crate::server::{api_key_auth, AppState};

use super::admin::{close_user_connections, list_breakers, reset_breaker, user_sessions};
use super::health::{health, stats};
use super::metrics::prometheus_metrics;

pub fn api_routes(state: AppState) -> Router<AppState> {
    Router::new()
        // Health & Stats
        .route("/health", get(health))
        .route("/stats", get(stats))
        .route("/metrics", get(prometheus_metrics))
        // Operator endpoints
        .nest(
            "/api/v1",
            Router::new()
                .route("/breakers", get(list_breakers))
                .route("/breakers/{name}/reset", post(reset_breaker))
                .route("/pool/{user_id}", delete(close_user_connections))
                .route("/sessions/{user_id}", get(user_sessions))
                .route_layer(middleware::from_fn_with_state(state, api_key_auth)),
        )
}

//! API layer - HTTP endpoint handlers.

mod admin;
mod health;
mod metrics;
mod routes;

pub use admin::{close_user_connections, list_breakers, reset_breaker, user_sessions};
pub use health::{health, stats, HealthResponse, StatsResponse};
pub use metrics::prometheus_metrics;
pub use routes::api_routes;

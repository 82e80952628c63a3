// Shared infrastructure
pub mod config;
pub mod error;
pub mod metrics;
pub mod telemetry;

// Collaborator seams
pub mod audit;
pub mod auth;
pub mod ratelimit;

// Tunnel core
pub mod circuit_breaker;
pub mod pool;
pub mod router;
pub mod ssh;

// Application layer
pub mod api;
pub mod server;
pub mod websocket;

// Supporting modules
pub mod shutdown;
pub mod tasks;

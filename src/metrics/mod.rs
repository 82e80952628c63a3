//! Prometheus metrics for the tunnel gateway.
//!
//! - Pool metrics (pooled SSH sessions, evictions, rejected acquisitions)
//! - Forward metrics (latency and result of relayed requests)
//! - Circuit breaker metrics (state, call outcomes, transitions)
//! - WebSocket metrics (sessions, close codes, heartbeat, frame limits)
//! - Compression metrics
//! - Rate limiting metrics

mod helpers;

pub use helpers::{
    encode_metrics, BreakerMetrics, CompressionMetrics, ForwardMetrics, PoolMetrics,
    RateLimitMetrics, WsMetrics,
};

use lazy_static::lazy_static;
use prometheus::{
    register_histogram, register_int_counter, register_int_counter_vec, register_int_gauge,
    register_int_gauge_vec, Histogram, IntCounter, IntCounterVec, IntGauge, IntGaugeVec,
};

/// Prefix for all metrics
const METRIC_PREFIX: &str = "tunnel";

lazy_static! {
    // ============================================================================
    // Pool Metrics
    // ============================================================================

    /// Pooled SSH sessions across all users
    pub static ref POOL_SESSIONS: IntGauge = register_int_gauge!(
        format!("{}_pool_sessions", METRIC_PREFIX),
        "Number of pooled SSH sessions"
    ).unwrap();

    pub static ref POOL_SESSIONS_CREATED_TOTAL: IntCounter = register_int_counter!(
        format!("{}_pool_sessions_created_total", METRIC_PREFIX),
        "Total SSH sessions opened by the pool"
    ).unwrap();

    /// Evictions by reason (idle, unhealthy)
    pub static ref POOL_SESSIONS_EVICTED_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_pool_sessions_evicted_total", METRIC_PREFIX),
        "Total SSH sessions evicted from the pool",
        &["reason"]
    ).unwrap();

    pub static ref POOL_ACQUIRE_REJECTED_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_pool_acquire_rejected_total", METRIC_PREFIX),
        "Total acquisitions rejected by the pool",
        &["reason"]
    ).unwrap();

    pub static ref POOL_CONNECT_FAILURES_TOTAL: IntCounter = register_int_counter!(
        format!("{}_pool_connect_failures_total", METRIC_PREFIX),
        "Total failed SSH session establishments"
    ).unwrap();

    // ============================================================================
    // Forward Metrics
    // ============================================================================

    /// Time spent on the SSH channel for one forward
    pub static ref FORWARD_DURATION: Histogram = register_histogram!(
        format!("{}_forward_duration_seconds", METRIC_PREFIX),
        "Forward round-trip duration in seconds",
        vec![0.005, 0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]
    ).unwrap();

    /// Forward results as answered to clients
    pub static ref FORWARDS_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_forwards_total", METRIC_PREFIX),
        "Total forward requests by result",
        &["result"]
    ).unwrap();

    // ============================================================================
    // Circuit Breaker Metrics
    // ============================================================================

    /// Breaker state (0=closed, 1=open, 2=half-open)
    pub static ref BREAKER_STATE: IntGaugeVec = register_int_gauge_vec!(
        format!("{}_circuit_breaker_state", METRIC_PREFIX),
        "Circuit breaker state (0=closed, 1=open, 2=half-open)",
        &["breaker"]
    ).unwrap();

    pub static ref BREAKER_CALLS_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_circuit_breaker_calls_total", METRIC_PREFIX),
        "Calls through circuit breakers by outcome",
        &["breaker", "outcome"]
    ).unwrap();

    pub static ref BREAKER_TRANSITIONS_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_circuit_breaker_transitions_total", METRIC_PREFIX),
        "Circuit breaker state transitions",
        &["breaker", "from", "to"]
    ).unwrap();

    // ============================================================================
    // WebSocket Metrics
    // ============================================================================

    pub static ref WS_SESSIONS_ACTIVE: IntGauge = register_int_gauge!(
        format!("{}_ws_sessions_active", METRIC_PREFIX),
        "Number of open WebSocket sessions"
    ).unwrap();

    pub static ref WS_CONNECTIONS_TOTAL: IntCounter = register_int_counter!(
        format!("{}_ws_connections_total", METRIC_PREFIX),
        "Total accepted WebSocket upgrades"
    ).unwrap();

    pub static ref WS_UPGRADES_REJECTED_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_ws_upgrades_rejected_total", METRIC_PREFIX),
        "Total rejected WebSocket upgrades",
        &["reason"]
    ).unwrap();

    /// Inbound messages by type
    pub static ref WS_MESSAGES_RECEIVED: IntCounterVec = register_int_counter_vec!(
        format!("{}_ws_messages_received_total", METRIC_PREFIX),
        "Total WebSocket messages received",
        &["type"]
    ).unwrap();

    pub static ref WS_CLOSES_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_ws_closes_total", METRIC_PREFIX),
        "Total WebSocket closes by close code",
        &["code"]
    ).unwrap();

    pub static ref WS_MISSED_PONGS_TOTAL: IntCounter = register_int_counter!(
        format!("{}_ws_missed_pongs_total", METRIC_PREFIX),
        "Total heartbeat pings without a pong in time"
    ).unwrap();

    pub static ref WS_FRAME_WARNINGS_TOTAL: IntCounter = register_int_counter!(
        format!("{}_ws_frame_warnings_total", METRIC_PREFIX),
        "Inbound frames above the warning threshold"
    ).unwrap();

    pub static ref WS_FRAMES_REJECTED_TOTAL: IntCounter = register_int_counter!(
        format!("{}_ws_frames_rejected_total", METRIC_PREFIX),
        "Inbound frames above the maximum frame size"
    ).unwrap();

    /// Outbound frames at or above the warning threshold, by verdict
    pub static ref WS_OUTBOUND_LARGE_FRAMES_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_ws_outbound_large_frames_total", METRIC_PREFIX),
        "Outbound frames above the warning threshold or maximum frame size",
        &["verdict"]
    ).unwrap();

    // ============================================================================
    // Compression Metrics
    // ============================================================================

    /// Compression attempts (compressed, skipped, fallback)
    pub static ref COMPRESSION_ATTEMPTS_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_compression_attempts_total", METRIC_PREFIX),
        "Outbound compression attempts by result",
        &["result"]
    ).unwrap();

    /// Compressed size divided by original size
    pub static ref COMPRESSION_RATIO: Histogram = register_histogram!(
        format!("{}_compression_ratio", METRIC_PREFIX),
        "Compressed to original size ratio",
        vec![0.05, 0.1, 0.2, 0.3, 0.4, 0.5, 0.6, 0.7, 0.8, 0.9, 1.0]
    ).unwrap();

    pub static ref COMPRESSION_BYTES_SAVED: IntCounter = register_int_counter!(
        format!("{}_compression_bytes_saved_total", METRIC_PREFIX),
        "Bytes saved by outbound compression"
    ).unwrap();

    // ============================================================================
    // Rate Limiting Metrics
    // ============================================================================

    pub static ref RATELIMIT_ALLOWED_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_ratelimit_allowed_total", METRIC_PREFIX),
        "Total inbound messages allowed by rate limiter",
        &["scope"]
    ).unwrap();

    pub static ref RATELIMIT_DENIED_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_ratelimit_denied_total", METRIC_PREFIX),
        "Total inbound messages denied by rate limiter",
        &["scope"]
    ).unwrap();
}

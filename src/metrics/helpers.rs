//! Metrics helper structs for convenient metric recording

use prometheus::{Encoder, TextEncoder};

use super::{
    BREAKER_CALLS_TOTAL, BREAKER_STATE, BREAKER_TRANSITIONS_TOTAL, COMPRESSION_ATTEMPTS_TOTAL,
    COMPRESSION_BYTES_SAVED, COMPRESSION_RATIO, FORWARDS_TOTAL, FORWARD_DURATION,
    POOL_ACQUIRE_REJECTED_TOTAL, POOL_CONNECT_FAILURES_TOTAL, POOL_SESSIONS,
    POOL_SESSIONS_CREATED_TOTAL, POOL_SESSIONS_EVICTED_TOTAL, RATELIMIT_ALLOWED_TOTAL,
    RATELIMIT_DENIED_TOTAL, WS_CLOSES_TOTAL, WS_CONNECTIONS_TOTAL, WS_FRAMES_REJECTED_TOTAL,
    WS_FRAME_WARNINGS_TOTAL, WS_MESSAGES_RECEIVED, WS_MISSED_PONGS_TOTAL,
    WS_OUTBOUND_LARGE_FRAMES_TOTAL, WS_SESSIONS_ACTIVE, WS_UPGRADES_REJECTED_TOTAL,
};

/// Encode all metrics to Prometheus text format
pub fn encode_metrics() -> Result<String, prometheus::Error> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(String::from_utf8(buffer).unwrap_or_default())
}

/// Helper struct for recording pool metrics
pub struct PoolMetrics;

impl PoolMetrics {
    pub fn set_size(sessions: usize) {
        POOL_SESSIONS.set(sessions as i64);
    }

    pub fn session_created() {
        POOL_SESSIONS_CREATED_TOTAL.inc();
    }

    pub fn session_evicted(reason: &str) {
        POOL_SESSIONS_EVICTED_TOTAL.with_label_values(&[reason]).inc();
    }

    pub fn acquire_rejected(reason: &str) {
        POOL_ACQUIRE_REJECTED_TOTAL.with_label_values(&[reason]).inc();
    }

    pub fn connect_failed() {
        POOL_CONNECT_FAILURES_TOTAL.inc();
    }
}

/// Helper struct for recording forward metrics
pub struct ForwardMetrics;

impl ForwardMetrics {
    pub fn observe_duration(seconds: f64) {
        FORWARD_DURATION.observe(seconds);
    }

    /// Record how a forward was answered (success, error, timeout, unavailable, ...)
    pub fn record_result(result: &str) {
        FORWARDS_TOTAL.with_label_values(&[result]).inc();
    }
}

/// Helper struct for recording circuit breaker metrics
pub struct BreakerMetrics;

impl BreakerMetrics {
    pub fn record_call(breaker: &str, outcome: &str) {
        BREAKER_CALLS_TOTAL
            .with_label_values(&[breaker, outcome])
            .inc();
    }

    pub fn record_transition(breaker: &str, from: &str, to: &str) {
        BREAKER_TRANSITIONS_TOTAL
            .with_label_values(&[breaker, from, to])
            .inc();
    }

    pub fn set_state(breaker: &str, state: i64) {
        BREAKER_STATE.with_label_values(&[breaker]).set(state);
    }
}

/// Helper struct for recording WebSocket metrics
pub struct WsMetrics;

impl WsMetrics {
    pub fn connection_opened() {
        WS_CONNECTIONS_TOTAL.inc();
        WS_SESSIONS_ACTIVE.inc();
    }

    pub fn connection_closed(code: u16) {
        WS_SESSIONS_ACTIVE.dec();
        WS_CLOSES_TOTAL.with_label_values(&[&code.to_string()]).inc();
    }

    pub fn upgrade_rejected(reason: &str) {
        WS_UPGRADES_REJECTED_TOTAL.with_label_values(&[reason]).inc();
    }

    pub fn message_received(kind: &str) {
        WS_MESSAGES_RECEIVED.with_label_values(&[kind]).inc();
    }

    pub fn missed_pong() {
        WS_MISSED_PONGS_TOTAL.inc();
    }

    pub fn frame_warning() {
        WS_FRAME_WARNINGS_TOTAL.inc();
    }

    pub fn frame_rejected() {
        WS_FRAMES_REJECTED_TOTAL.inc();
    }

    pub fn outbound_frame(verdict: &str) {
        WS_OUTBOUND_LARGE_FRAMES_TOTAL.with_label_values(&[verdict]).inc();
    }
}

/// Helper struct for recording compression metrics
pub struct CompressionMetrics;

impl CompressionMetrics {
    pub fn record_compressed(original: usize, compressed: usize) {
        COMPRESSION_ATTEMPTS_TOTAL.with_label_values(&["compressed"]).inc();
        if original > 0 {
            COMPRESSION_RATIO.observe(compressed as f64 / original as f64);
        }
        COMPRESSION_BYTES_SAVED.inc_by(original.saturating_sub(compressed) as u64);
    }

    /// Below threshold, or compression did not shrink the payload
    pub fn record_skipped() {
        COMPRESSION_ATTEMPTS_TOTAL.with_label_values(&["skipped"]).inc();
    }

    pub fn record_fallback() {
        COMPRESSION_ATTEMPTS_TOTAL.with_label_values(&["fallback"]).inc();
    }
}

/// Helper struct for recording rate limit metrics
pub struct RateLimitMetrics;

impl RateLimitMetrics {
    pub fn record_allowed(scope: &str) {
        RATELIMIT_ALLOWED_TOTAL.with_label_values(&[scope]).inc();
    }

    pub fn record_denied(scope: &str) {
        RATELIMIT_DENIED_TOTAL.with_label_values(&[scope]).inc();
    }
}

//! Audit trail for WebSocket upgrade attempts.

use std::net::IpAddr;

/// Receives one event per upgrade attempt
pub trait AuditSink: Send + Sync {
    fn upgrade_succeeded(&self, user_id: &str, connection_id: &str, ip: Option<IpAddr>);

    fn upgrade_failed(&self, reason: &str, ip: Option<IpAddr>);
}

/// Emits audit events as structured `tracing` records on the `audit` target
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn upgrade_succeeded(&self, user_id: &str, connection_id: &str, ip: Option<IpAddr>) {
        tracing::info!(
            target: "audit",
            action = "ws_upgrade",
            result = "success",
            user_id = %user_id,
            connection_id = %connection_id,
            ip = ?ip,
            "AUDIT: WebSocket upgrade accepted"
        );
    }

    fn upgrade_failed(&self, reason: &str, ip: Option<IpAddr>) {
        tracing::warn!(
            target: "audit",
            action = "ws_upgrade",
            result = "failure",
            reason = %reason,
            ip = ?ip,
            "AUDIT: WebSocket upgrade rejected"
        );
    }
}

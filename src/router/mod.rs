//! Turns inbound client messages into circuit-protected pooled SSH forwards.

use std::net::IpAddr;
use std::sync::Arc;

use crate::circuit_breaker::{BreakerError, CircuitBreaker};
use crate::metrics::{ForwardMetrics, WsMetrics};
use crate::pool::{ConnectionPool, PoolError, QuotaResolver, ReleaseOutcome};
use crate::ratelimit::{LimitChecker, RateLimitResult};
use crate::ssh::ForwardRequest;
use crate::websocket::{ClientMessage, ServerMessage, WebSocketSession};

/// Retry hint sent with backpressure responses
const BACKPRESSURE_RETRY_MS: u64 = 500;

const HTTP_METHODS: &[&str] = &[
    "GET", "HEAD", "POST", "PUT", "DELETE", "PATCH", "OPTIONS", "TRACE", "CONNECT",
];

pub struct TunnelRouter {
    pool: Arc<ConnectionPool>,
    breaker: Arc<CircuitBreaker>,
    limiter: Arc<dyn LimitChecker>,
    quotas: QuotaResolver,
}

impl TunnelRouter {
    pub fn new(
        pool: Arc<ConnectionPool>,
        breaker: Arc<CircuitBreaker>,
        limiter: Arc<dyn LimitChecker>,
        quotas: QuotaResolver,
    ) -> Self {
        Self {
            pool,
            breaker,
            limiter,
            quotas,
        }
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    /// Handle one parsed client message. Forwards run on their own task and
    /// answer on the session when done.
    pub async fn handle(
        self: &Arc<Self>,
        session: &Arc<WebSocketSession>,
        message: ClientMessage,
        ip: Option<IpAddr>,
    ) {
        WsMetrics::message_received(message.kind());

        if let RateLimitResult::Denied { retry_after_ms, .. } =
            self.limiter.check(session.user_id(), ip)
        {
            let id = match &message {
                ClientMessage::Forward(request) => {
                    ForwardMetrics::record_result("rate_limited");
                    Some(request.id.clone())
                }
                ClientMessage::Ping => None,
            };
            session
                .send(ServerMessage::RateLimited { id, retry_after_ms })
                .await;
            return;
        }

        match message {
            ClientMessage::Ping => {
                session.send(ServerMessage::Pong).await;
            }
            ClientMessage::Forward(request) => {
                if let Err(reason) = validate_request(&request) {
                    ForwardMetrics::record_result("invalid");
                    let id = (!request.id.is_empty()).then(|| request.id.clone());
                    session
                        .send(ServerMessage::error(id, "INVALID_REQUEST", reason))
                        .await;
                    return;
                }

                let router = Arc::clone(self);
                let session = Arc::clone(session);
                tokio::spawn(async move {
                    let reply = router
                        .forward(session.user_id(), session.tier(), request)
                        .await;
                    if !session.send(reply).await {
                        tracing::debug!(
                            connection_id = %session.id(),
                            "Session closed before the forward result could be delivered"
                        );
                    }
                });
            }
        }
    }

    /// Run one forward through the breaker and map the outcome to the reply
    #[tracing::instrument(
        name = "router.forward",
        skip_all,
        fields(user_id = %user_id, request_id = %request.id)
    )]
    pub async fn forward(
        &self,
        user_id: &str,
        tier: Option<&str>,
        request: ForwardRequest,
    ) -> ServerMessage {
        let quota = self.quotas.resolve(tier);
        let pool = &self.pool;
        let req = &request;

        let result = self
            .breaker
            .execute_classified(
                move || async move {
                    let lease = pool.acquire(user_id, quota).await?;
                    match lease.forward(req).await {
                        Ok(response) => {
                            pool.release(lease, ReleaseOutcome::Healthy);
                            Ok(response)
                        }
                        Err(e) => {
                            pool.release(lease, ReleaseOutcome::Recheck);
                            Err(e)
                        }
                    }
                },
                counts_as_failure,
            )
            .await;

        let reply = match result {
            Ok(response) => ServerMessage::response(request.id, response),
            Err(e) => reply_for_error(request.id, e),
        };
        ForwardMetrics::record_result(reply.result_label());
        reply
    }
}

/// Capacity limits and shutdown say nothing about the endpoint's health
fn counts_as_failure(error: &PoolError) -> bool {
    !error.is_backpressure() && !matches!(error, PoolError::ShuttingDown)
}

fn reply_for_error(id: String, error: BreakerError<PoolError>) -> ServerMessage {
    match error {
        BreakerError::CircuitOpen { name } => {
            tracing::debug!(breaker = %name, "Forward rejected by open circuit");
            ServerMessage::Unavailable {
                id,
                message: "Endpoint temporarily unavailable".to_string(),
            }
        }
        BreakerError::Timeout { timeout, .. } => ServerMessage::error(
            Some(id),
            "FORWARD_TIMEOUT",
            format!("Forward timed out after {} ms", timeout.as_millis()),
        ),
        BreakerError::Inner(e) if e.is_backpressure() => ServerMessage::Backpressure {
            id,
            retry_after_ms: BACKPRESSURE_RETRY_MS,
            message: e.to_string(),
        },
        BreakerError::Inner(PoolError::ShuttingDown) => ServerMessage::Unavailable {
            id,
            message: "Relay is shutting down".to_string(),
        },
        BreakerError::Inner(e) if e.is_timeout() => {
            ServerMessage::error(Some(id), "FORWARD_TIMEOUT", e.to_string())
        }
        BreakerError::Inner(e) => {
            tracing::warn!(error = %e, "Forward failed");
            ServerMessage::error(Some(id), "FORWARD_FAILED", e.to_string())
        }
    }
}

/// Framing checks applied before a request reaches the pool
pub fn validate_request(request: &ForwardRequest) -> Result<(), String> {
    if request.id.trim().is_empty() {
        return Err("Request id must not be empty".to_string());
    }
    if !HTTP_METHODS.contains(&request.method.as_str()) {
        return Err(format!("Unsupported method: {}", request.method));
    }
    if !request.path.starts_with('/') {
        return Err(format!("Path must start with '/': {}", request.path));
    }
    Ok(())
}

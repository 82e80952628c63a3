//! Cross-component integration tests
//!
//! Router, pool and circuit breaker wired together the way `AppState` wires
//! them, with an in-process SSH connector instead of real endpoints.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use ssh_tunnel_gateway::circuit_breaker::{
    AutomaticResetManager, CircuitBreaker, CircuitBreakerConfig, CircuitState,
};
use ssh_tunnel_gateway::config::{PoolConfig, RateLimitConfig};
use ssh_tunnel_gateway::pool::{ConnectionPool, QuotaResolver, UserQuota};
use ssh_tunnel_gateway::ratelimit::{LimitChecker, MessageRateLimiter};
use ssh_tunnel_gateway::router::TunnelRouter;
use ssh_tunnel_gateway::ssh::{
    ForwardRequest, ForwardResponse, SessionOptions, SshConnector, SshError, SshTransport,
};
use ssh_tunnel_gateway::websocket::ServerMessage;

/// Endpoint shared by every transport the connector hands out
struct FakeEndpoint {
    delay: Duration,
    failing: AtomicBool,
    connects: AtomicUsize,
}

struct FakeTransport {
    endpoint: Arc<FakeEndpoint>,
}

#[async_trait]
impl SshTransport for FakeTransport {
    async fn round_trip(&self, request: &ForwardRequest) -> Result<ForwardResponse, SshError> {
        tokio::time::sleep(self.endpoint.delay).await;
        if self.endpoint.failing.load(Ordering::SeqCst) {
            return Err(SshError::Channel("connection reset by peer".to_string()));
        }
        Ok(ForwardResponse {
            status_code: 200,
            headers: HashMap::new(),
            body: format!("{} {}", request.method, request.path),
        })
    }

    async fn keepalive(&self) -> Result<(), SshError> {
        Ok(())
    }

    async fn disconnect(&self) {}
}

struct FakeConnector {
    endpoint: Arc<FakeEndpoint>,
}

#[async_trait]
impl SshConnector for FakeConnector {
    async fn connect(&self, _user_id: &str) -> Result<Arc<dyn SshTransport>, SshError> {
        self.endpoint.connects.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(FakeTransport {
            endpoint: Arc::clone(&self.endpoint),
        }))
    }
}

struct TestEnvironment {
    endpoint: Arc<FakeEndpoint>,
    pool: Arc<ConnectionPool>,
    breaker: Arc<CircuitBreaker>,
    router: Arc<TunnelRouter>,
}

fn create_test_environment(quota: UserQuota, delay: Duration) -> TestEnvironment {
    let endpoint = Arc::new(FakeEndpoint {
        delay,
        failing: AtomicBool::new(false),
        connects: AtomicUsize::new(0),
    });

    let pool = ConnectionPool::new(
        PoolConfig {
            max_idle_time_ms: 1_000,
            ..PoolConfig::default()
        },
        SessionOptions::default(),
        Arc::new(FakeConnector {
            endpoint: Arc::clone(&endpoint),
        }),
    );

    let breaker = Arc::new(CircuitBreaker::new(
        "ssh_forward",
        CircuitBreakerConfig {
            failure_threshold: 2,
            success_threshold: 1,
            timeout: Duration::from_secs(5),
            reset_timeout: Duration::from_secs(30),
            half_open_max_probes: 1,
        },
    ));

    let limiter: Arc<dyn LimitChecker> = Arc::new(MessageRateLimiter::new(RateLimitConfig {
        enabled: false,
        ..RateLimitConfig::default()
    }));

    let router = Arc::new(TunnelRouter::new(
        Arc::clone(&pool),
        Arc::clone(&breaker),
        limiter,
        QuotaResolver::new(quota, HashMap::new()),
    ));

    TestEnvironment {
        endpoint,
        pool,
        breaker,
        router,
    }
}

fn request(id: &str) -> ForwardRequest {
    ForwardRequest {
        id: id.to_string(),
        method: "GET".to_string(),
        path: "/orders".to_string(),
        headers: HashMap::new(),
        body: String::new(),
    }
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_forwards_share_single_session() {
    let env = create_test_environment(
        UserQuota {
            max_connections: 1,
            max_channels: 4,
        },
        Duration::from_millis(100),
    );

    let (a, b) = tokio::join!(
        env.router.forward("alice", None, request("a")),
        env.router.forward("alice", None, request("b")),
    );

    assert!(matches!(a, ServerMessage::Response { ref id, .. } if id == "a"));
    assert!(matches!(b, ServerMessage::Response { ref id, .. } if id == "b"));
    assert_eq!(env.endpoint.connects.load(Ordering::SeqCst), 1);
    assert_eq!(env.pool.session_count("alice"), 1);
    assert_eq!(env.pool.active_channels(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_saturated_session_answers_with_backpressure() {
    let env = create_test_environment(
        UserQuota {
            max_connections: 1,
            max_channels: 1,
        },
        Duration::from_millis(100),
    );

    let (a, b) = tokio::join!(
        env.router.forward("alice", None, request("a")),
        env.router.forward("alice", None, request("b")),
    );

    // Exactly one goes through; the other is answered, never dropped
    let replies = [a, b];
    let responses = replies
        .iter()
        .filter(|r| matches!(r, ServerMessage::Response { .. }))
        .count();
    let backpressure = replies
        .iter()
        .filter(|r| matches!(r, ServerMessage::Backpressure { .. }))
        .count();
    assert_eq!(responses, 1);
    assert_eq!(backpressure, 1);

    assert_eq!(env.pool.total_connections(), 1);
    assert_eq!(env.breaker.state(), CircuitState::Closed);
    assert_eq!(env.breaker.stats().failure_count, 0);
}

#[tokio::test(start_paused = true)]
async fn test_failing_endpoint_is_isolated_then_recovers() {
    let env = create_test_environment(
        UserQuota {
            max_connections: 2,
            max_channels: 4,
        },
        Duration::from_millis(10),
    );
    let reset_manager = AutomaticResetManager::new();
    reset_manager.watch(Arc::clone(&env.breaker)).await;

    env.endpoint.failing.store(true, Ordering::SeqCst);
    for id in ["f1", "f2"] {
        let reply = env.router.forward("alice", None, request(id)).await;
        assert!(matches!(reply, ServerMessage::Error { ref code, .. } if code == "FORWARD_FAILED"));
    }
    assert_eq!(env.breaker.state(), CircuitState::Open);

    let connects_before = env.endpoint.connects.load(Ordering::SeqCst);
    let rejected = env.router.forward("alice", None, request("r1")).await;
    assert!(matches!(rejected, ServerMessage::Unavailable { .. }));
    assert_eq!(env.endpoint.connects.load(Ordering::SeqCst), connects_before);

    // No traffic during the reset timeout
    tokio::time::sleep(Duration::from_secs(31)).await;
    assert_eq!(env.breaker.state(), CircuitState::HalfOpen);

    env.endpoint.failing.store(false, Ordering::SeqCst);
    let probe = env.router.forward("alice", None, request("p1")).await;
    assert!(matches!(probe, ServerMessage::Response { .. }));
    assert_eq!(env.breaker.state(), CircuitState::Closed);

    reset_manager.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_idle_session_evicted_by_sweep() {
    let env = create_test_environment(
        UserQuota {
            max_connections: 2,
            max_channels: 4,
        },
        Duration::from_millis(10),
    );

    let reply = env.router.forward("alice", None, request("a")).await;
    assert!(matches!(reply, ServerMessage::Response { .. }));
    assert_eq!(env.pool.session_count("alice"), 1);

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(env.pool.sweep_now().await, 0);
    assert_eq!(env.pool.session_count("alice"), 1);

    tokio::time::sleep(Duration::from_millis(600)).await;
    assert_eq!(env.pool.sweep_now().await, 1);
    assert_eq!(env.pool.session_count("alice"), 0);
}

#[tokio::test]
async fn test_pool_shutdown_refuses_new_forwards() {
    let env = create_test_environment(
        UserQuota {
            max_connections: 1,
            max_channels: 4,
        },
        Duration::ZERO,
    );

    let reply = env.router.forward("alice", None, request("a")).await;
    assert!(matches!(reply, ServerMessage::Response { .. }));

    let report = env.pool.shutdown().await;
    assert_eq!(report.sessions_closed, 1);
    assert!(report.drained);

    let reply = env.router.forward("alice", None, request("b")).await;
    assert!(matches!(reply, ServerMessage::Unavailable { .. }));
    assert_eq!(env.breaker.state(), CircuitState::Closed);
}

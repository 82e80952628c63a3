use std::sync::Arc;
use std::time::Instant;

use crate::audit::{AuditSink, TracingAuditSink};
use crate::auth::{JwtValidator, TokenValidator};
use crate::circuit_breaker::{
    AutomaticResetManager, BreakerMetricsCollector, BreakerObserver, BreakerRegistry,
    CircuitBreakerConfig, SSH_FORWARD_BREAKER,
};
use crate::config::Settings;
use crate::pool::{ConnectionPool, QuotaResolver};
use crate::ratelimit::{LimitChecker, MessageRateLimiter};
use crate::router::TunnelRouter;
use crate::ssh::{RusshConnector, SessionOptions, SshConnector};
use crate::websocket::{CompressionStats, SessionRegistry};

#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<Settings>,
    pub token_validator: Arc<dyn TokenValidator>,
    pub audit: Arc<dyn AuditSink>,
    pub limiter: Arc<MessageRateLimiter>,
    pub pool: Arc<ConnectionPool>,
    pub breakers: Arc<BreakerRegistry>,
    pub breaker_metrics: Arc<BreakerMetricsCollector>,
    pub reset_manager: Arc<AutomaticResetManager>,
    pub router: Arc<TunnelRouter>,
    pub sessions: Arc<SessionRegistry>,
    pub compression_stats: Arc<CompressionStats>,
    pub start_time: Instant,
}

impl AppState {
    pub fn new(settings: Settings) -> Self {
        let connector = Arc::new(RusshConnector::new(settings.ssh.clone()));
        Self::with_connector(settings, connector)
    }

    /// Build the state around an arbitrary SSH connector
    pub fn with_connector(settings: Settings, connector: Arc<dyn SshConnector>) -> Self {
        let token_validator: Arc<dyn TokenValidator> = Arc::new(JwtValidator::new(&settings.jwt));
        let limiter = Arc::new(MessageRateLimiter::new(settings.rate_limit.clone()));

        let pool = ConnectionPool::new(
            settings.pool.clone(),
            SessionOptions::from_config(&settings.ssh),
            connector,
        );

        let breaker_metrics = Arc::new(BreakerMetricsCollector::new());
        let breakers = Arc::new(BreakerRegistry::new(
            CircuitBreakerConfig::from(&settings.circuit_breaker),
            vec![breaker_metrics.clone() as Arc<dyn BreakerObserver>],
        ));
        let breaker = breakers.get_or_create(SSH_FORWARD_BREAKER);

        let router = Arc::new(TunnelRouter::new(
            Arc::clone(&pool),
            breaker,
            limiter.clone() as Arc<dyn LimitChecker>,
            QuotaResolver::from_settings(&settings),
        ));

        Self {
            settings: Arc::new(settings),
            token_validator,
            audit: Arc::new(TracingAuditSink),
            limiter,
            pool,
            breakers,
            breaker_metrics,
            reset_manager: Arc::new(AutomaticResetManager::new()),
            router,
            sessions: Arc::new(SessionRegistry::new()),
            compression_stats: Arc::new(CompressionStats::new()),
            start_time: Instant::now(),
        }
    }

    /// Start the pool sweep and automatic breaker reset timers
    pub async fn start_background_tasks(&self) {
        self.pool.start_cleanup().await;
        for breaker in self.breakers.all() {
            self.reset_manager.watch(breaker).await;
        }
    }
}

//! One pooled SSH connection exposed as a request/response forwarder.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{watch, Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use uuid::Uuid;

use super::error::SshError;
use super::transport::SshTransport;
use super::types::{ForwardRequest, ForwardResponse, SessionStats};
use crate::config::SshConfig;
use crate::metrics::ForwardMetrics;

/// Per-session tuning, resolved from `SshConfig` and the user's tier
#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub max_channels: u32,
    pub forward_timeout: Duration,
    pub keep_alive_interval: Duration,
    pub keep_alive_timeout: Duration,
    pub keep_alive_max_missed: u32,
    pub close_grace: Duration,
}

impl SessionOptions {
    pub fn from_config(config: &SshConfig) -> Self {
        Self {
            max_channels: config.max_channels,
            forward_timeout: config.forward_timeout(),
            keep_alive_interval: config.keep_alive_interval(),
            keep_alive_timeout: config.keep_alive_timeout(),
            keep_alive_max_missed: config.keep_alive_max_missed,
            close_grace: config.close_grace(),
        }
    }

    pub fn with_max_channels(mut self, max_channels: u32) -> Self {
        self.max_channels = max_channels;
        self
    }
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self::from_config(&SshConfig::default())
    }
}

pub struct SshSession {
    id: Uuid,
    user_id: String,
    transport: Arc<dyn SshTransport>,
    options: SessionOptions,
    active_channels: AtomicU32,
    healthy: AtomicBool,
    closing: AtomicBool,
    missed_keepalives: AtomicU32,
    total_forwards: AtomicU64,
    created_at: DateTime<Utc>,
    created_instant: Instant,
    /// Milliseconds after `created_instant` of the last channel release
    last_used_ms: AtomicU64,
    drained: Notify,
    keepalive_stop: watch::Sender<bool>,
    keepalive_task: Mutex<Option<JoinHandle<()>>>,
}

impl SshSession {
    pub fn new(
        user_id: impl Into<String>,
        transport: Arc<dyn SshTransport>,
        options: SessionOptions,
    ) -> Arc<Self> {
        let (keepalive_stop, _) = watch::channel(false);
        Arc::new(Self {
            id: Uuid::new_v4(),
            user_id: user_id.into(),
            transport,
            options,
            active_channels: AtomicU32::new(0),
            healthy: AtomicBool::new(true),
            closing: AtomicBool::new(false),
            missed_keepalives: AtomicU32::new(0),
            total_forwards: AtomicU64::new(0),
            created_at: Utc::now(),
            created_instant: Instant::now(),
            last_used_ms: AtomicU64::new(0),
            drained: Notify::new(),
            keepalive_stop,
            keepalive_task: Mutex::new(None),
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn max_channels(&self) -> u32 {
        self.options.max_channels
    }

    pub fn channel_count(&self) -> u32 {
        self.active_channels.load(Ordering::Acquire)
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Acquire)
    }

    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }

    /// Healthy, not closing, and with a free channel slot
    pub fn is_available(&self) -> bool {
        self.is_healthy() && !self.is_closing() && self.channel_count() < self.options.max_channels
    }

    /// Flag the session so the pool stops handing it out. In-flight channels
    /// are not interrupted.
    pub fn mark_unhealthy(&self) {
        if self.healthy.swap(false, Ordering::AcqRel) {
            tracing::warn!(
                session_id = %self.id,
                user_id = %self.user_id,
                "SSH session marked unhealthy"
            );
        }
    }

    /// Time since the last forward finished (or since creation)
    pub fn idle_for(&self) -> Duration {
        let last_used = Duration::from_millis(self.last_used_ms.load(Ordering::Acquire));
        self.created_instant
            .elapsed()
            .saturating_sub(last_used)
    }

    fn touch(&self) {
        let now = self.created_instant.elapsed().as_millis() as u64;
        self.last_used_ms.fetch_max(now, Ordering::AcqRel);
    }

    /// Reserve a channel slot. Check and increment are one atomic step.
    pub fn try_open_channel(self: &Arc<Self>) -> Result<ChannelPermit, SshError> {
        if self.is_closing() {
            return Err(SshError::SessionClosed);
        }

        let max = self.options.max_channels;
        self.active_channels
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < max).then_some(n + 1)
            })
            .map_err(|_| SshError::ChannelLimitExceeded { max })?;

        let permit = ChannelPermit {
            session: Arc::clone(self),
        };

        // close() may have started between the first check and the increment
        if self.is_closing() {
            drop(permit);
            return Err(SshError::SessionClosed);
        }

        Ok(permit)
    }

    /// Forward one request over a fresh channel
    pub async fn forward(
        self: &Arc<Self>,
        request: &ForwardRequest,
    ) -> Result<ForwardResponse, SshError> {
        let permit = self.try_open_channel()?;
        permit.forward(request).await
    }

    pub fn stats(&self) -> SessionStats {
        let last_used = Duration::from_millis(self.last_used_ms.load(Ordering::Acquire));
        let last_used_at = self.created_at
            + chrono::Duration::from_std(last_used).unwrap_or_else(|_| chrono::Duration::zero());

        SessionStats {
            id: self.id,
            user_id: self.user_id.clone(),
            channel_count: self.channel_count(),
            created_at: self.created_at,
            last_used_at,
            is_healthy: self.is_healthy(),
            total_forwards: self.total_forwards.load(Ordering::Relaxed),
        }
    }

    /// Start the background keep-alive. The task holds only a weak reference
    /// and stops on `close()` or when the session is dropped.
    pub async fn start_keep_alive(self: &Arc<Self>) {
        let mut slot = self.keepalive_task.lock().await;
        if slot.is_some() || self.is_closing() {
            return;
        }

        let weak = Arc::downgrade(self);
        let stop = self.keepalive_stop.subscribe();
        let interval = self.options.keep_alive_interval;
        *slot = Some(tokio::spawn(run_keep_alive(weak, stop, interval)));
    }

    /// Returns true once the miss limit is reached
    fn record_keepalive_miss(&self) -> bool {
        let missed = self.missed_keepalives.fetch_add(1, Ordering::AcqRel) + 1;
        tracing::debug!(
            session_id = %self.id,
            missed = missed,
            "SSH keep-alive missed"
        );
        if missed >= self.options.keep_alive_max_missed {
            self.mark_unhealthy();
            return true;
        }
        false
    }

    /// Stop keep-alive, refuse new forwards, wait for in-flight channels up
    /// to the grace period, then disconnect. Calling it again is a no-op.
    pub async fn close(&self) {
        self.close_within(self.options.close_grace).await
    }

    /// `close()` with an explicit grace period; zero forces the disconnect
    pub async fn close_within(&self, grace: Duration) {
        if self.closing.swap(true, Ordering::AcqRel) {
            return;
        }

        self.keepalive_stop.send_replace(true);
        if let Some(task) = self.keepalive_task.lock().await.take() {
            let _ = task.await;
        }

        let drained = async {
            loop {
                let notified = self.drained.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();
                if self.channel_count() == 0 {
                    break;
                }
                notified.await;
            }
        };

        if tokio::time::timeout(grace, drained)
            .await
            .is_err()
        {
            tracing::warn!(
                session_id = %self.id,
                user_id = %self.user_id,
                in_flight = self.channel_count(),
                "Close grace period elapsed, forcing SSH disconnect"
            );
        }

        self.healthy.store(false, Ordering::Release);
        self.transport.disconnect().await;

        tracing::info!(
            session_id = %self.id,
            user_id = %self.user_id,
            forwards = self.total_forwards.load(Ordering::Relaxed),
            "SSH session closed"
        );
    }
}

async fn run_keep_alive(
    session: Weak<SshSession>,
    mut stop: watch::Receiver<bool>,
    interval: Duration,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // First tick completes immediately
    ticker.tick().await;

    loop {
        if *stop.borrow() {
            break;
        }

        tokio::select! {
            _ = stop.changed() => break,
            _ = ticker.tick() => {}
        }

        let Some(session) = session.upgrade() else {
            break;
        };

        let reply = tokio::select! {
            _ = stop.changed() => break,
            result = tokio::time::timeout(
                session.options.keep_alive_timeout,
                session.transport.keepalive(),
            ) => result,
        };

        match reply {
            Ok(Ok(())) => {
                session.missed_keepalives.store(0, Ordering::Release);
            }
            Ok(Err(e)) => {
                tracing::debug!(session_id = %session.id, error = %e, "SSH keep-alive failed");
                if session.record_keepalive_miss() {
                    break;
                }
            }
            Err(_) => {
                if session.record_keepalive_miss() {
                    break;
                }
            }
        }
    }
}

/// A reserved channel slot. Dropping it releases the slot and refreshes
/// the session's last-used time, whatever the forward's outcome.
pub struct ChannelPermit {
    session: Arc<SshSession>,
}

impl ChannelPermit {
    pub fn session(&self) -> &Arc<SshSession> {
        &self.session
    }

    pub async fn forward(&self, request: &ForwardRequest) -> Result<ForwardResponse, SshError> {
        let session = &self.session;
        session.total_forwards.fetch_add(1, Ordering::Relaxed);
        let timeout = session.options.forward_timeout;
        let start = std::time::Instant::now();

        let result = match tokio::time::timeout(timeout, session.transport.round_trip(request)).await
        {
            Ok(result) => result,
            Err(_) => Err(SshError::ForwardTimeout(timeout)),
        };

        ForwardMetrics::observe_duration(start.elapsed().as_secs_f64());
        if let Err(e) = &result {
            tracing::debug!(
                session_id = %session.id,
                request_id = %request.id,
                error = %e,
                "Forward failed"
            );
        }
        result
    }
}

impl Drop for ChannelPermit {
    fn drop(&mut self) {
        self.session.touch();
        let previous = self.session.active_channels.fetch_sub(1, Ordering::AcqRel);
        if previous == 1 {
            self.session.drained.notify_waiters();
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use async_trait::async_trait;

    /// Transport whose latency and failures are controlled by the test
    pub(crate) struct MockTransport {
        pub delay: Duration,
        pub fail: AtomicBool,
        pub keepalive_ok: AtomicBool,
        pub remote_gone: AtomicBool,
        pub round_trips: AtomicU32,
        pub disconnected: AtomicBool,
    }

    impl MockTransport {
        pub(crate) fn new(delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                delay,
                fail: AtomicBool::new(false),
                keepalive_ok: AtomicBool::new(true),
                remote_gone: AtomicBool::new(false),
                round_trips: AtomicU32::new(0),
                disconnected: AtomicBool::new(false),
            })
        }
    }

    #[async_trait]
    impl SshTransport for MockTransport {
        async fn round_trip(
            &self,
            request: &ForwardRequest,
        ) -> Result<ForwardResponse, SshError> {
            self.round_trips.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            if self.fail.load(Ordering::SeqCst) {
                return Err(SshError::Channel("remote reset".to_string()));
            }
            Ok(ForwardResponse {
                status_code: 200,
                headers: Default::default(),
                body: format!("{} {}", request.method, request.path),
            })
        }

        async fn keepalive(&self) -> Result<(), SshError> {
            if self.remote_gone.load(Ordering::SeqCst) {
                return Err(SshError::SessionClosed);
            }
            if self.keepalive_ok.load(Ordering::SeqCst) {
                Ok(())
            } else {
                // Never answers; the keep-alive timeout decides
                std::future::pending::<()>().await;
                Ok(())
            }
        }

        async fn disconnect(&self) {
            self.disconnected.store(true, Ordering::SeqCst);
        }
    }

    pub(crate) fn create_test_request(id: &str) -> ForwardRequest {
        ForwardRequest {
            id: id.to_string(),
            method: "GET".to_string(),
            path: "/status".to_string(),
            headers: Default::default(),
            body: String::new(),
        }
    }

    fn create_test_options(max_channels: u32) -> SessionOptions {
        SessionOptions {
            max_channels,
            forward_timeout: Duration::from_secs(4),
            keep_alive_interval: Duration::from_secs(60),
            keep_alive_timeout: Duration::from_secs(10),
            keep_alive_max_missed: 3,
            close_grace: Duration::from_secs(5),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_forward_success_updates_stats() {
        let transport = MockTransport::new(Duration::from_millis(50));
        let session = SshSession::new("alice", transport.clone(), create_test_options(2));

        let response = session.forward(&create_test_request("r1")).await.unwrap();
        assert_eq!(response.status_code, 200);
        assert_eq!(response.body, "GET /status");

        let stats = session.stats();
        assert_eq!(stats.channel_count, 0);
        assert_eq!(stats.total_forwards, 1);
        assert!(stats.is_healthy);
        assert!(stats.last_used_at >= stats.created_at);
    }

    #[tokio::test(start_paused = true)]
    async fn test_channel_limit_is_enforced() {
        let transport = MockTransport::new(Duration::from_secs(1));
        let session = SshSession::new("alice", transport, create_test_options(2));

        let first = session.try_open_channel().unwrap();
        let second = session.try_open_channel().unwrap();
        assert_eq!(session.channel_count(), 2);

        let err = session.try_open_channel().err().unwrap();
        assert!(matches!(err, SshError::ChannelLimitExceeded { max: 2 }));

        drop(first);
        assert_eq!(session.channel_count(), 1);
        assert!(session.try_open_channel().is_ok());
        drop(second);
    }

    #[tokio::test(start_paused = true)]
    async fn test_forward_timeout_releases_channel() {
        let transport = MockTransport::new(Duration::from_secs(30));
        let session = SshSession::new("alice", transport, create_test_options(1));

        let err = session.forward(&create_test_request("slow")).await.unwrap_err();
        assert!(err.is_timeout());
        assert_eq!(session.channel_count(), 0);
        assert!(session.try_open_channel().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_forward_releases_channel() {
        let transport = MockTransport::new(Duration::from_millis(10));
        transport.fail.store(true, Ordering::SeqCst);
        let session = SshSession::new("alice", transport, create_test_options(1));

        let err = session.forward(&create_test_request("r1")).await.unwrap_err();
        assert!(matches!(err, SshError::Channel(_)));
        assert_eq!(session.channel_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_keep_alive_misses_mark_unhealthy() {
        let transport = MockTransport::new(Duration::ZERO);
        transport.keepalive_ok.store(false, Ordering::SeqCst);
        let session = SshSession::new("alice", transport, create_test_options(2));
        session.start_keep_alive().await;

        // Two misses: still healthy
        tokio::time::sleep(Duration::from_secs(2 * 70 + 1)).await;
        assert!(session.is_healthy());

        // Third miss at roughly 3 x (interval + keep-alive timeout)
        tokio::time::sleep(Duration::from_secs(70)).await;
        assert!(!session.is_healthy());

        // Unhealthy sessions are not destroyed
        assert!(!session.is_closing());
    }

    #[tokio::test(start_paused = true)]
    async fn test_keep_alive_errors_count_as_misses() {
        let transport = MockTransport::new(Duration::ZERO);
        transport.remote_gone.store(true, Ordering::SeqCst);
        let session = SshSession::new("alice", transport, create_test_options(2));
        session.start_keep_alive().await;

        // Errors fail fast, so misses land on each tick
        tokio::time::sleep(Duration::from_secs(2 * 60 + 1)).await;
        assert!(session.is_healthy());

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(!session.is_healthy());
    }

    #[tokio::test(start_paused = true)]
    async fn test_keep_alive_replies_keep_session_healthy() {
        let transport = MockTransport::new(Duration::ZERO);
        let session = SshSession::new("alice", transport, create_test_options(2));
        session.start_keep_alive().await;

        tokio::time::sleep(Duration::from_secs(600)).await;
        assert!(session.is_healthy());
        session.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_waits_for_in_flight_and_is_idempotent() {
        let transport = MockTransport::new(Duration::from_secs(2));
        let session = SshSession::new("alice", transport.clone(), create_test_options(2));

        let in_flight = {
            let session = Arc::clone(&session);
            tokio::spawn(async move { session.forward(&create_test_request("r1")).await })
        };
        tokio::task::yield_now().await;
        assert_eq!(session.channel_count(), 1);

        session.close().await;
        assert!(transport.disconnected.load(Ordering::SeqCst));
        assert!(in_flight.await.unwrap().is_ok());

        let err = session.forward(&create_test_request("r2")).await.unwrap_err();
        assert!(matches!(err, SshError::SessionClosed));

        // Second close returns immediately
        session.close().await;
        assert!(!session.is_healthy());
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_forces_after_grace_period() {
        let transport = MockTransport::new(Duration::from_secs(60));
        let mut options = create_test_options(1);
        options.forward_timeout = Duration::from_secs(120);
        let session = SshSession::new("alice", transport.clone(), options);

        let _permit = session.try_open_channel().unwrap();
        let start = Instant::now();
        session.close().await;

        assert!(start.elapsed() >= Duration::from_secs(5));
        assert!(transport.disconnected.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_for_tracks_last_release() {
        let transport = MockTransport::new(Duration::ZERO);
        let session = SshSession::new("alice", transport, create_test_options(1));

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(session.idle_for() >= Duration::from_secs(10));

        drop(session.try_open_channel().unwrap());
        assert!(session.idle_for() < Duration::from_secs(1));
    }
}

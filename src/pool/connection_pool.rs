use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::DashMap;
use futures::future::join_all;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use super::types::{DrainReport, PoolError, PoolLease, PoolStats, ReleaseOutcome, UserQuota};
use crate::config::PoolConfig;
use crate::metrics::PoolMetrics;
use crate::ssh::{ChannelPermit, SessionOptions, SshConnector, SshSession};

/// Interval at which shutdown re-checks in-flight forwards
const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(25);

#[derive(Default)]
struct UserSessions {
    sessions: Vec<Arc<SshSession>>,
    /// Slots reserved by `acquire` calls that are still connecting
    pending: usize,
}

enum Placement {
    Reused(ChannelPermit),
    Create,
    Exhausted,
}

/// Per-user pool of SSH sessions
pub struct ConnectionPool {
    users: DashMap<String, UserSessions>,
    connector: Arc<dyn SshConnector>,
    config: PoolConfig,
    session_options: SessionOptions,
    shutting_down: AtomicBool,
    stop_tx: watch::Sender<bool>,
    cleanup_task: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionPool {
    pub fn new(
        config: PoolConfig,
        session_options: SessionOptions,
        connector: Arc<dyn SshConnector>,
    ) -> Arc<Self> {
        let (stop_tx, _) = watch::channel(false);
        Arc::new(Self {
            users: DashMap::new(),
            connector,
            config,
            session_options,
            shutting_down: AtomicBool::new(false),
            stop_tx,
            cleanup_task: Mutex::new(None),
        })
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }

    /// Borrow a session with a free channel, creating one if the user is under
    /// their cap.
    #[tracing::instrument(skip_all, fields(user_id = %user_id))]
    pub async fn acquire(&self, user_id: &str, quota: UserQuota) -> Result<PoolLease, PoolError> {
        if self.is_shutting_down() {
            return Err(PoolError::ShuttingDown);
        }

        let mut stale = Vec::new();
        let placement = {
            let mut entry = self.users.entry(user_id.to_string()).or_default();
            let user = entry.value_mut();

            // Unhealthy sessions keep their slot until in-flight work drains
            user.sessions.retain(|s| {
                let dead = (!s.is_healthy() || s.is_closing()) && s.channel_count() == 0;
                if dead {
                    stale.push(Arc::clone(s));
                }
                !dead
            });

            let mut candidates: Vec<&Arc<SshSession>> =
                user.sessions.iter().filter(|s| s.is_available()).collect();
            candidates.sort_by_key(|s| s.channel_count());

            let reused = candidates
                .into_iter()
                .find_map(|s| s.try_open_channel().ok());

            match reused {
                Some(permit) => Placement::Reused(permit),
                None if user.sessions.len() + user.pending >= quota.max_connections => {
                    Placement::Exhausted
                }
                None => {
                    user.pending += 1;
                    Placement::Create
                }
            }
        };

        self.close_evicted(stale, "unhealthy");

        match placement {
            Placement::Reused(permit) => {
                tracing::debug!(session_id = %permit.session().id(), "Reusing pooled SSH session");
                Ok(PoolLease::new(permit))
            }
            Placement::Exhausted => {
                PoolMetrics::acquire_rejected("exhausted");
                Err(PoolError::PoolExhausted {
                    user_id: user_id.to_string(),
                    max: quota.max_connections,
                })
            }
            Placement::Create => self.create_session(user_id, quota).await,
        }
    }

    async fn create_session(&self, user_id: &str, quota: UserQuota) -> Result<PoolLease, PoolError> {
        let reservation = Reservation {
            users: &self.users,
            user_id,
        };

        let transport = match self.connector.connect(user_id).await {
            Ok(transport) => transport,
            Err(e) => {
                PoolMetrics::connect_failed();
                tracing::warn!(error = %e, "Failed to open SSH session");
                return Err(PoolError::Connect(e));
            }
        };

        let options = self
            .session_options
            .clone()
            .with_max_channels(quota.max_channels);
        let session = SshSession::new(user_id, transport, options);
        session.start_keep_alive().await;
        let permit = session.try_open_channel().map_err(PoolError::Forward)?;

        let registered = {
            let mut entry = self.users.entry(user_id.to_string()).or_default();
            reservation.release_in(entry.value_mut());
            if self.is_shutting_down() {
                false
            } else {
                entry.sessions.push(Arc::clone(&session));
                true
            }
        };

        if !registered {
            drop(permit);
            session.close_within(Duration::ZERO).await;
            return Err(PoolError::ShuttingDown);
        }

        PoolMetrics::session_created();
        PoolMetrics::set_size(self.total_connections());
        tracing::info!(session_id = %session.id(), "SSH session added to pool");

        Ok(PoolLease::new(permit))
    }

    /// Hand a lease back. `Recheck` keeps the session out of rotation until
    /// the next sweep evicts it.
    pub fn release(&self, lease: PoolLease, outcome: ReleaseOutcome) {
        if outcome == ReleaseOutcome::Recheck {
            lease.session().mark_unhealthy();
        }
        drop(lease);
    }

    /// Evict and close every session of a user. Returns how many were closed.
    pub async fn close_connection(&self, user_id: &str) -> usize {
        let sessions = match self.users.get_mut(user_id) {
            Some(mut entry) => std::mem::take(&mut entry.sessions),
            None => return 0,
        };
        self.users.remove_if(user_id, |_, u| u.sessions.is_empty() && u.pending == 0);

        let closed = sessions.len();
        join_all(sessions.iter().map(|s| s.close())).await;

        PoolMetrics::set_size(self.total_connections());
        tracing::info!(user_id = %user_id, closed = closed, "Closed pooled SSH sessions");
        closed
    }

    /// Evict idle and unhealthy sessions, then close them. Returns the
    /// number evicted.
    pub async fn sweep_now(&self) -> usize {
        let max_idle = self.config.max_idle_time();
        let mut idle = Vec::new();
        let mut unhealthy = Vec::new();

        for mut entry in self.users.iter_mut() {
            entry.sessions.retain(|s| {
                if s.channel_count() > 0 {
                    return true;
                }
                if !s.is_healthy() || s.is_closing() {
                    unhealthy.push(Arc::clone(s));
                    false
                } else if s.idle_for() > max_idle {
                    idle.push(Arc::clone(s));
                    false
                } else {
                    true
                }
            });
        }
        self.users
            .retain(|_, u| !u.sessions.is_empty() || u.pending > 0);

        let evicted = idle.len() + unhealthy.len();
        if evicted > 0 {
            tracing::debug!(
                idle = idle.len(),
                unhealthy = unhealthy.len(),
                "Pool sweep evicted sessions"
            );
            for _ in &idle {
                PoolMetrics::session_evicted("idle");
            }
            for _ in &unhealthy {
                PoolMetrics::session_evicted("unhealthy");
            }
            join_all(idle.iter().chain(unhealthy.iter()).map(|s| s.close())).await;
            PoolMetrics::set_size(self.total_connections());
        }

        evicted
    }

    fn close_evicted(&self, sessions: Vec<Arc<SshSession>>, reason: &'static str) {
        if sessions.is_empty() {
            return;
        }
        for session in sessions {
            PoolMetrics::session_evicted(reason);
            tokio::spawn(async move { session.close().await });
        }
        PoolMetrics::set_size(self.total_connections());
    }

    /// Start the periodic sweep
    pub async fn start_cleanup(self: &Arc<Self>) {
        let mut slot = self.cleanup_task.lock().await;
        if slot.is_some() {
            return;
        }

        let pool = Arc::downgrade(self);
        let stop = self.stop_tx.subscribe();
        let interval = self.config.cleanup_interval();
        *slot = Some(tokio::spawn(run_cleanup(pool, stop, interval)));

        tracing::info!(interval_ms = interval.as_millis() as u64, "Pool cleanup task started");
    }

    /// Stop the periodic sweep
    pub async fn stop(&self) {
        self.stop_tx.send_replace(true);
        if let Some(task) = self.cleanup_task.lock().await.take() {
            let _ = task.await;
        }
    }

    /// Refuse new acquisitions, wait for in-flight forwards up to the drain
    /// timeout, then close everything.
    pub async fn shutdown(&self) -> DrainReport {
        let start = Instant::now();
        self.shutting_down.store(true, Ordering::Release);
        self.stop().await;

        let drain_timeout = self.config.drain_timeout();
        let drained = tokio::time::timeout(drain_timeout, async {
            while self.active_channels() > 0 {
                tokio::time::sleep(DRAIN_POLL_INTERVAL).await;
            }
        })
        .await
        .is_ok();

        let sessions: Vec<Arc<SshSession>> = self
            .users
            .iter_mut()
            .flat_map(|mut entry| std::mem::take(&mut entry.sessions))
            .collect();
        self.users.clear();

        let abandoned_channels: u32 = sessions.iter().map(|s| s.channel_count()).sum();
        join_all(sessions.iter().map(|s| s.close_within(Duration::ZERO))).await;
        PoolMetrics::set_size(0);

        let report = DrainReport {
            sessions_closed: sessions.len(),
            drained,
            abandoned_channels,
            elapsed: start.elapsed(),
        };

        if drained {
            tracing::info!(sessions = report.sessions_closed, "Connection pool drained");
        } else {
            tracing::warn!(
                sessions = report.sessions_closed,
                abandoned_channels = abandoned_channels,
                "Drain timeout elapsed, force-closed SSH sessions"
            );
        }

        report
    }

    pub fn total_connections(&self) -> usize {
        self.users.iter().map(|e| e.sessions.len()).sum()
    }

    pub fn active_channels(&self) -> u32 {
        self.users
            .iter()
            .map(|e| e.sessions.iter().map(|s| s.channel_count()).sum::<u32>())
            .sum()
    }

    pub fn session_count(&self, user_id: &str) -> usize {
        self.users.get(user_id).map(|u| u.sessions.len()).unwrap_or(0)
    }

    pub fn stats(&self) -> PoolStats {
        let mut stats = PoolStats {
            total_connections: 0,
            user_count: 0,
            active_channels: 0,
            per_user: Default::default(),
        };

        for entry in self.users.iter() {
            if entry.sessions.is_empty() {
                continue;
            }
            let sessions: Vec<_> = entry.sessions.iter().map(|s| s.stats()).collect();
            stats.total_connections += sessions.len();
            stats.active_channels += sessions.iter().map(|s| s.channel_count).sum::<u32>();
            stats.user_count += 1;
            stats.per_user.insert(entry.key().clone(), sessions);
        }

        stats
    }
}

/// Releases a pending slot. Also runs when an `acquire` future is dropped
/// mid-connect.
struct Reservation<'a> {
    users: &'a DashMap<String, UserSessions>,
    user_id: &'a str,
}

impl Reservation<'_> {
    fn release_in(self, user: &mut UserSessions) {
        user.pending = user.pending.saturating_sub(1);
        std::mem::forget(self);
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if let Some(mut user) = self.users.get_mut(self.user_id) {
            user.pending = user.pending.saturating_sub(1);
        }
    }
}

async fn run_cleanup(
    pool: Weak<ConnectionPool>,
    mut stop: watch::Receiver<bool>,
    interval: Duration,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = stop.changed() => break,
            _ = ticker.tick() => {
                let Some(pool) = pool.upgrade() else {
                    break;
                };
                pool.sweep_now().await;
            }
        }
    }

    tracing::debug!("Pool cleanup task stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssh::{create_test_request, MockTransport, SshError, SshTransport};
    use async_trait::async_trait;
    use std::sync::atomic::AtomicU32;

    struct MockConnector {
        delay: Duration,
        forward_delay: Duration,
        fail: AtomicBool,
        connects: AtomicU32,
    }

    impl MockConnector {
        fn new(delay: Duration, forward_delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                delay,
                forward_delay,
                fail: AtomicBool::new(false),
                connects: AtomicU32::new(0),
            })
        }
    }

    #[async_trait]
    impl SshConnector for MockConnector {
        async fn connect(&self, _user_id: &str) -> Result<Arc<dyn SshTransport>, SshError> {
            tokio::time::sleep(self.delay).await;
            if self.fail.load(Ordering::SeqCst) {
                return Err(SshError::Connect("connection refused".to_string()));
            }
            self.connects.fetch_add(1, Ordering::SeqCst);
            Ok(MockTransport::new(self.forward_delay))
        }
    }

    fn create_test_pool(connector: Arc<MockConnector>) -> Arc<ConnectionPool> {
        ConnectionPool::new(PoolConfig::default(), SessionOptions::default(), connector)
    }

    fn quota(max_connections: usize, max_channels: u32) -> UserQuota {
        UserQuota {
            max_connections,
            max_channels,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_acquires_respect_cap() {
        let connector = MockConnector::new(Duration::from_millis(100), Duration::ZERO);
        let pool = create_test_pool(connector.clone());

        let attempts = (0..3).map(|_| pool.acquire("alice", quota(2, 1)));
        let results = join_all(attempts).await;

        let leases: Vec<_> = results.iter().filter(|r| r.is_ok()).collect();
        let exhausted = results
            .iter()
            .filter(|r| matches!(r, Err(PoolError::PoolExhausted { max: 2, .. })))
            .count();

        assert_eq!(leases.len(), 2);
        assert_eq!(exhausted, 1);
        assert_eq!(connector.connects.load(Ordering::SeqCst), 2);
        assert_eq!(pool.session_count("alice"), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reuses_session_with_free_channel() {
        let connector = MockConnector::new(Duration::from_millis(10), Duration::ZERO);
        let pool = create_test_pool(connector.clone());

        let first = pool.acquire("alice", quota(3, 2)).await.unwrap();
        let second = pool.acquire("alice", quota(3, 2)).await.unwrap();
        assert_eq!(first.session().id(), second.session().id());
        assert_eq!(connector.connects.load(Ordering::SeqCst), 1);

        // Session saturated: a second session is opened
        let third = pool.acquire("alice", quota(3, 2)).await.unwrap();
        assert_ne!(third.session().id(), first.session().id());
        assert_eq!(pool.stats().active_channels, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_release_returns_channel() {
        let connector = MockConnector::new(Duration::ZERO, Duration::from_millis(5));
        let pool = create_test_pool(connector);

        let lease = pool.acquire("alice", quota(1, 1)).await.unwrap();
        let response = lease.forward(&create_test_request("r1")).await.unwrap();
        assert_eq!(response.status_code, 200);
        pool.release(lease, ReleaseOutcome::Healthy);

        assert_eq!(pool.stats().active_channels, 0);
        assert!(pool.acquire("alice", quota(1, 1)).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_recheck_blocks_reuse_until_sweep() {
        let connector = MockConnector::new(Duration::ZERO, Duration::ZERO);
        let pool = create_test_pool(connector.clone());

        let lease = pool.acquire("alice", quota(2, 1)).await.unwrap();
        let flagged = lease.session().id();
        pool.release(lease, ReleaseOutcome::Recheck);

        let lease = pool.acquire("alice", quota(2, 1)).await.unwrap();
        assert_ne!(lease.session().id(), flagged);
        assert_eq!(connector.connects.load(Ordering::SeqCst), 2);
        drop(lease);

        pool.sweep_now().await;
        assert_eq!(pool.session_count("alice"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_failure_releases_reservation() {
        let connector = MockConnector::new(Duration::ZERO, Duration::ZERO);
        connector.fail.store(true, Ordering::SeqCst);
        let pool = create_test_pool(connector.clone());

        let err = match pool.acquire("alice", quota(1, 1)).await {
            Err(e) => e,
            Ok(_) => panic!("expected connect failure"),
        };
        assert!(matches!(err, PoolError::Connect(SshError::Connect(_))));

        connector.fail.store(false, Ordering::SeqCst);
        assert!(pool.acquire("alice", quota(1, 1)).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_acquire_releases_reservation() {
        let connector = MockConnector::new(Duration::from_secs(30), Duration::ZERO);
        let pool = create_test_pool(connector);

        let attempt =
            tokio::time::timeout(Duration::from_secs(1), pool.acquire("alice", quota(1, 1))).await;
        assert!(attempt.is_err());

        // Slot is free again: this call connects instead of failing fast
        let lease = pool.acquire("alice", quota(1, 1)).await;
        assert!(lease.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_session_evicted_by_sweep() {
        let connector = MockConnector::new(Duration::ZERO, Duration::ZERO);
        let pool = create_test_pool(connector);

        drop(pool.acquire("alice", quota(1, 1)).await.unwrap());
        tokio::time::sleep(Duration::from_secs(301)).await;

        assert_eq!(pool.session_count("alice"), 1);
        assert_eq!(pool.sweep_now().await, 1);
        assert_eq!(pool.session_count("alice"), 0);
        assert_eq!(pool.stats().user_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_busy_session_survives_sweep() {
        let connector = MockConnector::new(Duration::ZERO, Duration::ZERO);
        let pool = create_test_pool(connector);

        let lease = pool.acquire("alice", quota(1, 1)).await.unwrap();
        tokio::time::sleep(Duration::from_secs(301)).await;

        assert_eq!(pool.sweep_now().await, 0);
        assert_eq!(pool.session_count("alice"), 1);
        drop(lease);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cleanup_task_sweeps_periodically() {
        let connector = MockConnector::new(Duration::ZERO, Duration::ZERO);
        let pool = create_test_pool(connector);
        pool.start_cleanup().await;

        drop(pool.acquire("alice", quota(1, 1)).await.unwrap());
        tokio::time::sleep(Duration::from_secs(340)).await;
        assert_eq!(pool.session_count("alice"), 0);

        pool.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_connection_counts_sessions() {
        let connector = MockConnector::new(Duration::ZERO, Duration::ZERO);
        let pool = create_test_pool(connector);

        let a = pool.acquire("alice", quota(3, 1)).await.unwrap();
        let b = pool.acquire("alice", quota(3, 1)).await.unwrap();
        drop((a, b));

        assert_eq!(pool.close_connection("alice").await, 2);
        assert_eq!(pool.close_connection("alice").await, 0);
        assert_eq!(pool.total_connections(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_drains_then_refuses() {
        let connector = MockConnector::new(Duration::ZERO, Duration::from_secs(2));
        let pool = create_test_pool(connector);

        let lease = pool.acquire("alice", quota(1, 1)).await.unwrap();
        let in_flight = tokio::spawn(async move {
            let result = lease.forward(&create_test_request("r1")).await;
            drop(lease);
            result
        });
        tokio::task::yield_now().await;

        let report = pool.shutdown().await;
        assert!(report.drained);
        assert_eq!(report.sessions_closed, 1);
        assert_eq!(report.abandoned_channels, 0);
        assert!(in_flight.await.unwrap().is_ok());

        assert!(matches!(
            pool.acquire("alice", quota(1, 1)).await,
            Err(PoolError::ShuttingDown)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_force_closes_after_timeout() {
        let connector = MockConnector::new(Duration::ZERO, Duration::ZERO);
        let pool = create_test_pool(connector);

        let lease = pool.acquire("alice", quota(1, 1)).await.unwrap();
        let report = pool.shutdown().await;

        assert!(!report.drained);
        assert_eq!(report.abandoned_channels, 1);
        assert!(report.elapsed >= Duration::from_secs(10));
        drop(lease);
    }
}

use std::sync::Arc;

use dashmap::DashMap;
use futures::future::join_all;
use serde::Serialize;
use uuid::Uuid;

use super::frame::WsCloseReason;
use super::session::{CloseOutcome, ConnectionInfo, WebSocketSession};

/// Result of closing every open session
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct CloseAllReport {
    pub total: usize,
    pub acknowledged: usize,
    pub timed_out: usize,
}

/// Open WebSocket sessions by connection id
#[derive(Default)]
pub struct SessionRegistry {
    sessions: DashMap<Uuid, Arc<WebSocketSession>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, session: Arc<WebSocketSession>) {
        self.sessions.insert(session.id(), session);
    }

    pub fn remove(&self, id: Uuid) -> Option<Arc<WebSocketSession>> {
        self.sessions.remove(&id).map(|(_, session)| session)
    }

    pub fn get(&self, id: Uuid) -> Option<Arc<WebSocketSession>> {
        self.sessions.get(&id).map(|s| Arc::clone(&s))
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn user_sessions(&self, user_id: &str) -> Vec<ConnectionInfo> {
        self.sessions
            .iter()
            .filter(|s| s.user_id() == user_id)
            .map(|s| s.info())
            .collect()
    }

    /// Close every session with 1001 concurrently and wait for each
    /// acknowledgment or close timeout
    pub async fn close_all(&self) -> CloseAllReport {
        let sessions: Vec<_> = self.sessions.iter().map(|s| Arc::clone(&s)).collect();
        if sessions.is_empty() {
            return CloseAllReport::default();
        }

        tracing::info!(count = sessions.len(), "Closing all WebSocket sessions");
        let outcomes = join_all(
            sessions
                .iter()
                .map(|session| session.close(WsCloseReason::ServerShutdown)),
        )
        .await;

        let mut report = CloseAllReport {
            total: sessions.len(),
            ..Default::default()
        };
        for outcome in outcomes {
            match outcome {
                CloseOutcome::Acknowledged => report.acknowledged += 1,
                CloseOutcome::TimedOut => report.timed_out += 1,
                CloseOutcome::AlreadyClosing => {}
            }
        }

        for session in &sessions {
            self.sessions.remove(&session.id());
        }

        tracing::info!(
            acknowledged = report.acknowledged,
            timed_out = report.timed_out,
            "WebSocket sessions closed"
        );
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::websocket::{create_test_session, LifecycleState, TestPeer};
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn test_close_all_concurrently() {
        let registry = SessionRegistry::new();

        let (polite, polite_rx) = create_test_session(8);
        let (silent, silent_rx) = create_test_session(8);
        polite.open();
        silent.open();
        let polite_peer = TestPeer::spawn(&polite, polite_rx, true, true);
        let _silent_peer = TestPeer::spawn(&silent, silent_rx, true, false);
        registry.register(Arc::clone(&polite));
        registry.register(Arc::clone(&silent));
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.user_sessions("alice").len(), 2);

        let started = tokio::time::Instant::now();
        let report = registry.close_all().await;

        // Bounded by one close timeout, not one per session
        assert_eq!(started.elapsed(), Duration::from_secs(5));
        assert_eq!(
            report,
            CloseAllReport {
                total: 2,
                acknowledged: 1,
                timed_out: 1
            }
        );
        assert_eq!(polite.state(), LifecycleState::Closed);
        assert_eq!(silent.state(), LifecycleState::Closed);
        assert_eq!(polite_peer.close_codes().await, vec![1001]);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_register_and_remove() {
        let registry = SessionRegistry::new();
        let (session, _rx) = create_test_session(1);
        registry.register(Arc::clone(&session));

        assert!(registry.get(session.id()).is_some());
        assert!(registry.remove(session.id()).is_some());
        assert!(registry.get(session.id()).is_none());
        assert_eq!(registry.close_all().await, CloseAllReport::default());
    }
}

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

use crate::ssh::{ChannelPermit, ForwardRequest, ForwardResponse, SessionStats, SshError, SshSession};

#[derive(Error, Debug, Clone)]
pub enum PoolError {
    #[error("Connection pool exhausted for user {user_id} (max {max} sessions)")]
    PoolExhausted { user_id: String, max: usize },

    #[error("Connection pool is shutting down")]
    ShuttingDown,

    #[error("{0}")]
    Connect(SshError),

    #[error("{0}")]
    Forward(SshError),
}

impl PoolError {
    /// Local capacity limits; the caller should retry later
    pub fn is_backpressure(&self) -> bool {
        match self {
            PoolError::PoolExhausted { .. } => true,
            PoolError::Forward(e) | PoolError::Connect(e) => e.is_backpressure(),
            PoolError::ShuttingDown => false,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, PoolError::Forward(e) if e.is_timeout())
    }
}

/// Per-user limits after tier overrides
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UserQuota {
    pub max_connections: usize,
    pub max_channels: u32,
}

/// How a lease is handed back
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOutcome {
    Healthy,
    /// The forward failed in a way that may implicate the session
    Recheck,
}

/// A session borrowed for one forward. Holds one channel slot until dropped.
pub struct PoolLease {
    permit: ChannelPermit,
}

impl std::fmt::Debug for PoolLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolLease").finish_non_exhaustive()
    }
}

impl PoolLease {
    pub(crate) fn new(permit: ChannelPermit) -> Self {
        Self { permit }
    }

    pub fn session(&self) -> &Arc<SshSession> {
        self.permit.session()
    }

    pub async fn forward(&self, request: &ForwardRequest) -> Result<ForwardResponse, PoolError> {
        self.permit.forward(request).await.map_err(PoolError::Forward)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PoolStats {
    pub total_connections: usize,
    pub user_count: usize,
    pub active_channels: u32,
    pub per_user: HashMap<String, Vec<SessionStats>>,
}

/// Outcome of `ConnectionPool::shutdown`
#[derive(Debug, Clone, Serialize)]
pub struct DrainReport {
    pub sessions_closed: usize,
    /// True when every in-flight forward finished before the drain timeout
    pub drained: bool,
    /// Channels still open when the remaining sessions were force-closed
    pub abandoned_channels: u32,
    #[serde(with = "duration_ms")]
    pub elapsed: Duration,
}

mod duration_ms {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }
}

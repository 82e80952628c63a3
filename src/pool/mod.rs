//! Per-user SSH session pool
//!
//! Sessions are created lazily on `acquire`, shared across forwards while they
//! have free channels, and evicted when idle, unhealthy, explicitly closed, or
//! drained at shutdown.

mod connection_pool;
mod quota;
mod types;

pub use connection_pool::ConnectionPool;
pub use quota::QuotaResolver;
pub use types::{DrainReport, PoolError, PoolLease, PoolStats, ReleaseOutcome, UserQuota};

//! Per-user and per-IP inbound message limiting

use std::net::IpAddr;

use dashmap::DashMap;
use serde::Serialize;

use super::token_bucket::TokenBucket;
use crate::config::RateLimitConfig;
use crate::metrics::RateLimitMetrics;

/// Result of a rate limit check
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RateLimitResult {
    Allowed { remaining: u32, limit: u32 },
    Denied { retry_after_ms: u64, limit: u32 },
}

impl RateLimitResult {
    pub fn is_allowed(&self) -> bool {
        matches!(self, RateLimitResult::Allowed { .. })
    }
}

/// Admission check applied to every inbound WebSocket message
pub trait LimitChecker: Send + Sync {
    fn check(&self, user_id: &str, ip: Option<IpAddr>) -> RateLimitResult;
}

/// In-memory token buckets keyed by user id and by client IP.
///
/// A message must pass both buckets; the user bucket is checked first so a
/// noisy tenant behind a shared address does not drain the IP bucket.
pub struct MessageRateLimiter {
    user_buckets: DashMap<String, TokenBucket>,
    ip_buckets: DashMap<IpAddr, TokenBucket>,
    config: RateLimitConfig,
}

impl MessageRateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            user_buckets: DashMap::new(),
            ip_buckets: DashMap::new(),
            config,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    pub(crate) fn check_at(&self, user_id: &str, ip: Option<IpAddr>, now: i64) -> RateLimitResult {
        if !self.config.enabled {
            return RateLimitResult::Allowed {
                remaining: u32::MAX,
                limit: 0,
            };
        }

        let limit = self.config.messages_per_second;
        let burst = self.config.burst_size.max(1);

        let user_result = {
            let bucket = self
                .user_buckets
                .entry(user_id.to_string())
                .or_insert_with(|| TokenBucket::new_at(burst, limit, now));
            consume(&bucket, limit, now)
        };
        if !user_result.is_allowed() {
            RateLimitMetrics::record_denied("user");
            tracing::debug!(user_id = %user_id, "Message rate limit exceeded for user");
            return user_result;
        }
        RateLimitMetrics::record_allowed("user");

        let Some(ip) = ip else {
            return user_result;
        };

        let ip_result = {
            let bucket = self
                .ip_buckets
                .entry(ip)
                .or_insert_with(|| TokenBucket::new_at(burst, limit, now));
            consume(&bucket, limit, now)
        };
        if ip_result.is_allowed() {
            RateLimitMetrics::record_allowed("ip");
        } else {
            RateLimitMetrics::record_denied("ip");
            tracing::debug!(ip = %ip, "Message rate limit exceeded for address");
        }
        ip_result
    }

    /// Drop buckets unused for longer than the configured TTL
    pub fn cleanup_stale(&self) -> usize {
        self.cleanup_stale_at(TokenBucket::now_millis())
    }

    pub(crate) fn cleanup_stale_at(&self, now: i64) -> usize {
        let ttl_ms = (self.config.bucket_ttl_seconds * 1000) as i64;
        let mut removed = 0;

        self.user_buckets.retain(|_, bucket| {
            let keep = now - bucket.last_activity() < ttl_ms;
            if !keep {
                removed += 1;
            }
            keep
        });
        self.ip_buckets.retain(|_, bucket| {
            let keep = now - bucket.last_activity() < ttl_ms;
            if !keep {
                removed += 1;
            }
            keep
        });

        if removed > 0 {
            tracing::debug!(
                removed = removed,
                user_buckets = self.user_buckets.len(),
                ip_buckets = self.ip_buckets.len(),
                "Cleaned up stale rate limit buckets"
            );
        }

        removed
    }

    pub fn stats(&self) -> RateLimiterStats {
        RateLimiterStats {
            enabled: self.config.enabled,
            user_buckets: self.user_buckets.len(),
            ip_buckets: self.ip_buckets.len(),
            messages_per_second: self.config.messages_per_second,
            burst_size: self.config.burst_size,
        }
    }
}

fn consume(bucket: &TokenBucket, limit: u32, now: i64) -> RateLimitResult {
    if bucket.try_consume_at(now) {
        RateLimitResult::Allowed {
            remaining: bucket.available_at(now),
            limit,
        }
    } else {
        RateLimitResult::Denied {
            retry_after_ms: bucket.retry_after_ms_at(now),
            limit,
        }
    }
}

impl LimitChecker for MessageRateLimiter {
    fn check(&self, user_id: &str, ip: Option<IpAddr>) -> RateLimitResult {
        self.check_at(user_id, ip, TokenBucket::now_millis())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RateLimiterStats {
    pub enabled: bool,
    pub user_buckets: usize,
    pub ip_buckets: usize,
    pub messages_per_second: u32,
    pub burst_size: u32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn create_test_config(per_second: u32, burst: u32) -> RateLimitConfig {
        RateLimitConfig {
            enabled: true,
            messages_per_second: per_second,
            burst_size: burst,
            bucket_ttl_seconds: 60,
            cleanup_interval_seconds: 60,
        }
    }

    fn ip(last: u8) -> Option<IpAddr> {
        Some(IpAddr::V4(Ipv4Addr::new(10, 0, 0, last)))
    }

    #[test]
    fn test_rate_limiter_disabled() {
        let limiter = MessageRateLimiter::new(RateLimitConfig {
            enabled: false,
            ..create_test_config(1, 1)
        });

        for _ in 0..100 {
            assert!(limiter.check("alice", ip(1)).is_allowed());
        }
    }

    #[test]
    fn test_user_burst_then_denied() {
        let limiter = MessageRateLimiter::new(create_test_config(10, 3));

        for _ in 0..3 {
            assert!(limiter.check_at("alice", ip(1), 0).is_allowed());
        }
        match limiter.check_at("alice", ip(1), 0) {
            RateLimitResult::Denied { retry_after_ms, limit } => {
                assert_eq!(limit, 10);
                assert_eq!(retry_after_ms, 100);
            }
            other => panic!("expected denial, got {:?}", other),
        }

        // Other users are unaffected
        assert!(limiter.check_at("bob", ip(2), 0).is_allowed());
        // Refilled after 100 ms
        assert!(limiter.check_at("alice", ip(1), 100).is_allowed());
    }

    #[test]
    fn test_shared_ip_limited_across_users() {
        let limiter = MessageRateLimiter::new(create_test_config(1, 2));

        assert!(limiter.check_at("alice", ip(9), 0).is_allowed());
        assert!(limiter.check_at("bob", ip(9), 0).is_allowed());
        assert!(!limiter.check_at("carol", ip(9), 0).is_allowed());
        // Without an address only the user bucket applies
        assert!(limiter.check_at("carol", None, 0).is_allowed());
    }

    #[test]
    fn test_cleanup_stale() {
        let limiter = MessageRateLimiter::new(create_test_config(10, 10));
        limiter.check_at("alice", ip(1), 0);
        limiter.check_at("bob", None, 50_000);

        let stats = limiter.stats();
        assert_eq!(stats.user_buckets, 2);
        assert_eq!(stats.ip_buckets, 1);

        // alice and her address are past the 60 s TTL, bob is not
        assert_eq!(limiter.cleanup_stale_at(70_000), 2);
        assert_eq!(limiter.stats().user_buckets, 1);
    }
}

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::time::MissedTickBehavior;

use crate::ratelimit::MessageRateLimiter;

/// Periodically drops rate limit buckets nobody has used within their TTL
pub struct BucketCleanupTask {
    limiter: Arc<MessageRateLimiter>,
    interval: Duration,
    shutdown: broadcast::Receiver<()>,
}

impl BucketCleanupTask {
    pub fn new(
        limiter: Arc<MessageRateLimiter>,
        interval: Duration,
        shutdown: broadcast::Receiver<()>,
    ) -> Self {
        Self {
            limiter,
            interval,
            shutdown,
        }
    }

    pub async fn run(mut self) {
        let mut timer = tokio::time::interval(self.interval);
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

        // Skip immediate first tick
        timer.tick().await;

        tracing::info!(
            interval_secs = self.interval.as_secs(),
            "Rate limit bucket cleanup task started"
        );

        loop {
            tokio::select! {
                _ = self.shutdown.recv() => {
                    tracing::info!("Bucket cleanup task received shutdown signal");
                    break;
                }
                _ = timer.tick() => {
                    let removed = self.limiter.cleanup_stale();
                    if removed > 0 {
                        tracing::debug!(removed = removed, "Removed stale rate limit buckets");
                    }
                }
            }
        }

        tracing::info!("Bucket cleanup task stopped");
    }
}

//! Token Bucket algorithm implementation

use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};
use std::time::SystemTime;

/// Token bucket refilled continuously at `refill_rate` tokens per second.
///
/// Lock-free: the token count is updated with a CAS loop and the refill
/// timestamp only moves forward by the time actually converted into tokens,
/// so fractional refill is never lost between calls.
#[derive(Debug)]
pub struct TokenBucket {
    tokens: AtomicU32,
    /// Unix milliseconds up to which elapsed time has been credited
    last_refill: AtomicI64,
    /// Unix milliseconds of the last consume attempt
    last_seen: AtomicI64,
    capacity: u32,
    refill_rate: u32,
}

impl TokenBucket {
    pub fn new(capacity: u32, refill_rate: u32) -> Self {
        Self::new_at(capacity, refill_rate, Self::now_millis())
    }

    pub(crate) fn new_at(capacity: u32, refill_rate: u32, now: i64) -> Self {
        Self {
            tokens: AtomicU32::new(capacity),
            last_refill: AtomicI64::new(now),
            last_seen: AtomicI64::new(now),
            capacity,
            refill_rate: refill_rate.max(1),
        }
    }

    pub fn now_millis() -> i64 {
        SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as i64
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn try_consume(&self) -> bool {
        self.try_consume_at(Self::now_millis())
    }

    pub(crate) fn try_consume_at(&self, now: i64) -> bool {
        self.last_seen.fetch_max(now, Ordering::Relaxed);
        self.refill(now);

        self.tokens
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                current.checked_sub(1)
            })
            .is_ok()
    }

    /// Credit whole tokens for the time elapsed since the last refill
    fn refill(&self, now: i64) {
        let last = self.last_refill.load(Ordering::Acquire);
        let elapsed_ms = (now - last).max(0);
        let earned = elapsed_ms * self.refill_rate as i64 / 1000;
        if earned == 0 {
            return;
        }

        // Advance by the time the earned tokens represent, keeping the remainder
        let credited_ms = earned * 1000 / self.refill_rate as i64;
        if self
            .last_refill
            .compare_exchange(last, last + credited_ms, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            // Another caller credited this interval
            return;
        }

        let earned = earned.min(self.capacity as i64) as u32;
        let _ = self
            .tokens
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                Some(current.saturating_add(earned).min(self.capacity))
            });
    }

    pub fn available(&self) -> u32 {
        self.available_at(Self::now_millis())
    }

    pub(crate) fn available_at(&self, now: i64) -> u32 {
        self.refill(now);
        self.tokens.load(Ordering::Acquire)
    }

    /// Milliseconds until the next token is credited (0 when one is available)
    pub(crate) fn retry_after_ms_at(&self, now: i64) -> u64 {
        if self.available_at(now) > 0 {
            return 0;
        }
        let ms_per_token = (1000 / self.refill_rate as i64).max(1);
        let since_refill = (now - self.last_refill.load(Ordering::Acquire)).max(0);
        (ms_per_token - since_refill).max(1) as u64
    }

    pub fn last_activity(&self) -> i64 {
        self.last_seen.load(Ordering::Relaxed)
    }
}

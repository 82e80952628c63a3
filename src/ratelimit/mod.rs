//! Rate limiting of inbound WebSocket messages using the Token Bucket algorithm.

mod limiter;
mod token_bucket;

pub use limiter::{LimitChecker, MessageRateLimiter, RateLimitResult, RateLimiterStats};
pub use token_bucket::TokenBucket;

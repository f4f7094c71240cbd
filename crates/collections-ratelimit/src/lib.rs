//! Token-bucket rate limiting and exponential backoff (spec §4.4).

pub mod backoff;
pub mod bucket;

pub use backoff::{ExponentialBackoff, DEFAULT_BASE_DELAY, DEFAULT_MAX_DELAY};
pub use bucket::{RateLimitConfig, RateLimiter, RateLimiterStatus};

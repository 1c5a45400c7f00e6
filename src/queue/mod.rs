//! Work queue
//!
//! Deduplicating, rate-limited queue of reconciliation keys plus the rate
//! limiters that pace retries.

pub mod rate_limiter;
mod work_queue;

pub use rate_limiter::{
    default_controller_rate_limiter, BucketRateLimiter, ItemExponentialBackoff,
    MaxOfRateLimiter, RateLimiter,
};
pub use work_queue::WorkQueue;

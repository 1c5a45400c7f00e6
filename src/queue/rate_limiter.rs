//! Requeue Rate Limiters
//!
//! Decide how long a failed key waits before it is handed out again.

use std::hash::Hash;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;

/// Decides requeue delays per item.
pub trait RateLimiter<T>: Send + Sync {
    /// Delay before `item` may be processed again. Counts as one failure.
    fn when(&self, item: &T) -> Duration;

    /// Stop tracking `item` (reset its backoff).
    fn forget(&self, item: &T);

    /// Number of failures recorded for `item`.
    fn num_requeues(&self, item: &T) -> u32;
}

// =============================================================================
// Per-Item Exponential Backoff
// =============================================================================

/// `base * 2^failures`, capped at `max`, tracked per item.
#[derive(Debug)]
pub struct ItemExponentialBackoff<T: Eq + Hash> {
    base: Duration,
    max: Duration,
    failures: DashMap<T, u32>,
}

impl<T: Eq + Hash> ItemExponentialBackoff<T> {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            failures: DashMap::new(),
        }
    }
}

impl<T: Eq + Hash + Clone + Send + Sync> RateLimiter<T> for ItemExponentialBackoff<T> {
    fn when(&self, item: &T) -> Duration {
        let exp = {
            let mut entry = self.failures.entry(item.clone()).or_insert(0);
            let exp = *entry;
            *entry = entry.saturating_add(1);
            exp
        };

        // 2^31 already overflows any sane cap
        if exp >= 31 {
            return self.max;
        }
        self.base
            .checked_mul(1u32 << exp)
            .map_or(self.max, |d| d.min(self.max))
    }

    fn forget(&self, item: &T) {
        self.failures.remove(item);
    }

    fn num_requeues(&self, item: &T) -> u32 {
        self.failures.get(item).map_or(0, |v| *v)
    }
}

// =============================================================================
// Overall Token Bucket
// =============================================================================

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last: Instant,
}

/// Token bucket shared by all items, bounding the overall retry rate.
#[derive(Debug)]
pub struct BucketRateLimiter {
    qps: f64,
    burst: f64,
    bucket: Mutex<Bucket>,
}

impl BucketRateLimiter {
    pub fn new(qps: f64, burst: u32) -> Self {
        Self {
            qps,
            burst: burst as f64,
            bucket: Mutex::new(Bucket {
                tokens: burst as f64,
                last: Instant::now(),
            }),
        }
    }

    /// Reserve one token, returning how long until it is available.
    fn reserve(&self) -> Duration {
        let mut bucket = self.bucket.lock();
        let now = Instant::now();
        let elapsed = now.duration_since(bucket.last).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.qps).min(self.burst);
        bucket.last = now;

        bucket.tokens -= 1.0;
        if bucket.tokens >= 0.0 || self.qps <= 0.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(-bucket.tokens / self.qps)
        }
    }
}

impl<T> RateLimiter<T> for BucketRateLimiter {
    fn when(&self, _item: &T) -> Duration {
        self.reserve()
    }

    fn forget(&self, _item: &T) {}

    fn num_requeues(&self, _item: &T) -> u32 {
        0
    }
}

// =============================================================================
// Combinator
// =============================================================================

/// Returns the longest delay of its members.
pub struct MaxOfRateLimiter<T> {
    limiters: Vec<Box<dyn RateLimiter<T>>>,
}

impl<T> MaxOfRateLimiter<T> {
    pub fn new(limiters: Vec<Box<dyn RateLimiter<T>>>) -> Self {
        Self { limiters }
    }
}

impl<T> std::fmt::Debug for MaxOfRateLimiter<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MaxOfRateLimiter")
            .field("limiter_count", &self.limiters.len())
            .finish()
    }
}

impl<T> RateLimiter<T> for MaxOfRateLimiter<T> {
    fn when(&self, item: &T) -> Duration {
        self.limiters
            .iter()
            .map(|l| l.when(item))
            .max()
            .unwrap_or(Duration::ZERO)
    }

    fn forget(&self, item: &T) {
        for limiter in &self.limiters {
            limiter.forget(item);
        }
    }

    fn num_requeues(&self, item: &T) -> u32 {
        self.limiters
            .iter()
            .map(|l| l.num_requeues(item))
            .max()
            .unwrap_or(0)
    }
}

/// Default limiter for controllers: per-item exponential backoff from 5ms to
/// 1000s, combined with an overall 10 qps / 100 burst bucket.
pub fn default_controller_rate_limiter<T>() -> MaxOfRateLimiter<T>
where
    T: Eq + Hash + Clone + Send + Sync + 'static,
{
    MaxOfRateLimiter::new(vec![
        Box::new(ItemExponentialBackoff::new(
            Duration::from_millis(5),
            Duration::from_secs(1000),
        )),
        Box::new(BucketRateLimiter::new(10.0, 100)),
    ])
}

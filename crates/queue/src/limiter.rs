//! Rate limiters deciding how long a re-added item waits.

use std::hash::Hash;
use std::time::Duration;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

pub trait RateLimiter<T>: Send + Sync {
    /// Delay before `item` may be processed again. Records one more attempt.
    fn when(&self, item: &T) -> Duration;
    /// Drop any history for `item`.
    fn forget(&self, item: &T);
    /// Attempts recorded for `item` since the last `forget`.
    fn num_requeues(&self, item: &T) -> u32;
}

/// Backoff policy knobs. Exposed as configuration; they decide how hard a
/// failing controller hammers its API server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    pub base_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
    /// Overall adds per second across all items; 0 disables the bucket.
    pub qps: f64,
    pub burst: u32,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RateLimitConfigError {
    #[error("backoff multiplier must be a finite number >= 1, got {0}")]
    Multiplier(f64),
    #[error("max delay {max:?} is shorter than base delay {base:?}")]
    MaxBelowBase { base: Duration, max: Duration },
    #[error("qps must be 0 (unlimited) or a finite number >= {MIN_QPS}, got {0}")]
    Qps(f64),
}

/// Slowest refill rate a bucket accepts.
pub const MIN_QPS: f64 = 0.001;

impl RateLimitConfig {
    /// Reject knobs that would make the limiters compute nonsense delays.
    pub fn validate(&self) -> Result<(), RateLimitConfigError> {
        if !self.multiplier.is_finite() || self.multiplier < 1.0 {
            return Err(RateLimitConfigError::Multiplier(self.multiplier));
        }
        if self.max_delay < self.base_delay {
            return Err(RateLimitConfigError::MaxBelowBase { base: self.base_delay, max: self.max_delay });
        }
        if !(self.qps == 0.0 || (self.qps.is_finite() && self.qps >= MIN_QPS)) {
            return Err(RateLimitConfigError::Qps(self.qps));
        }
        Ok(())
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(5),
            multiplier: 2.0,
            max_delay: Duration::from_secs(1000),
            qps: 10.0,
            burst: 100,
        }
    }
}

/// Per-item exponential backoff: `base * multiplier^failures`, capped at `max`.
pub struct ItemExponentialBackoff<T> {
    base: Duration,
    multiplier: f64,
    max: Duration,
    failures: Mutex<FxHashMap<T, u32>>,
}

impl<T: Eq + Hash> ItemExponentialBackoff<T> {
    pub fn new(base: Duration, multiplier: f64, max: Duration) -> Self {
        Self { base, multiplier, max, failures: Mutex::new(FxHashMap::default()) }
    }
}

impl<T> RateLimiter<T> for ItemExponentialBackoff<T>
where
    T: Clone + Eq + Hash + Send + Sync,
{
    fn when(&self, item: &T) -> Duration {
        let exp = {
            let mut failures = self.failures.lock();
            let n = failures.entry(item.clone()).or_insert(0);
            let exp = *n;
            *n = n.saturating_add(1);
            exp
        };
        let secs = self.base.as_secs_f64() * self.multiplier.powi(exp.min(i32::MAX as u32) as i32);
        if secs >= self.max.as_secs_f64() {
            return self.max;
        }
        Duration::try_from_secs_f64(secs).unwrap_or(self.max)
    }

    fn forget(&self, item: &T) {
        self.failures.lock().remove(item);
    }

    fn num_requeues(&self, item: &T) -> u32 {
        self.failures.lock().get(item).copied().unwrap_or(0)
    }
}

/// Longest wait the bucket hands out when the refill rate is too low to
/// express one.
const MAX_BUCKET_DELAY: Duration = Duration::from_secs(1000);

struct Bucket {
    tokens: f64,
    last: Instant,
}

/// Token bucket shared by all items: `qps` refill rate, `burst` capacity.
/// Each call reserves a token; the returned delay is how long until that
/// reservation is covered.
pub struct BucketRateLimiter {
    qps: f64,
    burst: f64,
    bucket: Mutex<Bucket>,
}

impl BucketRateLimiter {
    pub fn new(qps: f64, burst: u32) -> Self {
        let burst = f64::from(burst.max(1));
        Self { qps, burst, bucket: Mutex::new(Bucket { tokens: burst, last: Instant::now() }) }
    }
}

impl<T> RateLimiter<T> for BucketRateLimiter {
    fn when(&self, _item: &T) -> Duration {
        if self.qps <= 0.0 {
            return Duration::ZERO;
        }
        let mut b = self.bucket.lock();
        let now = Instant::now();
        let refill = now.saturating_duration_since(b.last).as_secs_f64() * self.qps;
        b.tokens = (b.tokens + refill).min(self.burst);
        b.last = now;
        b.tokens -= 1.0;
        if b.tokens >= 0.0 {
            Duration::ZERO
        } else {
            Duration::try_from_secs_f64(-b.tokens / self.qps).unwrap_or(MAX_BUCKET_DELAY)
        }
    }

    fn forget(&self, _item: &T) {}

    fn num_requeues(&self, _item: &T) -> u32 {
        0
    }
}

/// Longest delay of all children.
pub struct MaxOfRateLimiter<T> {
    limiters: Vec<Box<dyn RateLimiter<T>>>,
}

impl<T> MaxOfRateLimiter<T> {
    pub fn new(limiters: Vec<Box<dyn RateLimiter<T>>>) -> Self {
        Self { limiters }
    }
}

impl<T> RateLimiter<T> for MaxOfRateLimiter<T> {
    fn when(&self, item: &T) -> Duration {
        self.limiters.iter().map(|l| l.when(item)).max().unwrap_or(Duration::ZERO)
    }

    fn forget(&self, item: &T) {
        for l in &self.limiters {
            l.forget(item);
        }
    }

    fn num_requeues(&self, item: &T) -> u32 {
        self.limiters.iter().map(|l| l.num_requeues(item)).max().unwrap_or(0)
    }
}

/// Per-item exponential backoff combined with an overall token bucket.
pub fn default_controller_rate_limiter<T>(cfg: &RateLimitConfig) -> MaxOfRateLimiter<T>
where
    T: Clone + Eq + Hash + Send + Sync + 'static,
{
    MaxOfRateLimiter::new(vec![
        Box::new(ItemExponentialBackoff::new(cfg.base_delay, cfg.multiplier, cfg.max_delay)),
        Box::new(BucketRateLimiter::new(cfg.qps, cfg.burst)),
    ])
}

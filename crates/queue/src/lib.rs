//! Tabby work queue: a deduplicating FIFO with delayed and rate-limited adds.
//!
//! Semantics follow the classic controller work queue:
//! - an item is queued at most once while it waits (`dirty` set);
//! - an item handed out by [`WorkQueue::get`] is `processing` until
//!   [`WorkQueue::done`]; re-adds during that window are parked and
//!   delivered after `done`, so no two workers ever hold the same item;
//! - after [`WorkQueue::shutdown`] adds are ignored and `get` drains what is
//!   left before returning `None`.

#![forbid(unsafe_code)]

mod limiter;
mod queue;

pub use limiter::{
    default_controller_rate_limiter, BucketRateLimiter, ItemExponentialBackoff, MaxOfRateLimiter, RateLimitConfig,
    RateLimitConfigError, RateLimiter, MIN_QPS,
};
pub use queue::{RateLimitingQueue, WorkQueue};

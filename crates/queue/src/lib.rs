//! Tether queue: failure rate limiter and the rate-limited work queue that
//! feeds reconcile workers.

#![forbid(unsafe_code)]

mod ratelimit;
mod workqueue;

pub use ratelimit::{Clock, FailureRateLimiter, ManualClock, SystemClock};
pub use workqueue::{spawn_workers, Disposition, WorkQueue};

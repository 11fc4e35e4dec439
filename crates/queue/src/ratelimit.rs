//! Per-item exponential failure backoff with time-bounded forgetting.

use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use metrics::histogram;
use rustc_hash::FxHashMap;

/// Time source, injectable so tests can move time forward.
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant { Instant::now() }
}

/// Clock that only moves when told to.
pub struct ManualClock {
    base: Instant,
    offset_ms: AtomicU64,
}

impl ManualClock {
    pub fn new() -> Self { Self { base: Instant::now(), offset_ms: AtomicU64::new(0) } }

    pub fn advance(&self, d: Duration) {
        let ms = u64::try_from(d.as_millis()).unwrap_or(u64::MAX);
        self.offset_ms.fetch_add(ms, Ordering::SeqCst);
    }
}

impl Default for ManualClock {
    fn default() -> Self { Self::new() }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant { self.base + Duration::from_millis(self.offset_ms.load(Ordering::SeqCst)) }
}

#[derive(Debug, Clone, Copy)]
struct FailureRequest {
    attempts: u32,
    last_attempt: Instant,
}

/// Failure bookkeeping shared by every worker. Created once at startup and
/// handed to the queue; it lives until process exit.
///
/// The map mutex is held for map access only.
pub struct FailureRateLimiter<K> {
    base: Duration,
    max: Duration,
    failures: Mutex<FxHashMap<K, FailureRequest>>,
    clock: Arc<dyn Clock>,
}

impl<K: Hash + Eq + Clone> FailureRateLimiter<K> {
    pub fn new(base: Duration, max: Duration) -> Self { Self::with_clock(base, max, Arc::new(SystemClock)) }

    pub fn with_clock(base: Duration, max: Duration, clock: Arc<dyn Clock>) -> Self {
        Self { base, max: max.max(base), failures: Mutex::new(FxHashMap::default()), clock }
    }

    fn lock(&self) -> MutexGuard<'_, FxHashMap<K, FailureRequest>> {
        // A poisoned map is still a valid map; keep going.
        self.failures.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn stale(&self, rec: &FailureRequest, now: Instant) -> bool {
        now.saturating_duration_since(rec.last_attempt) > self.max.saturating_mul(2)
    }

    /// `base * 2^attempts`, saturating at `max`.
    fn backoff(&self, attempts: u32) -> Duration {
        2u32.checked_pow(attempts)
            .and_then(|m| self.base.checked_mul(m))
            .map(|d| d.min(self.max))
            .unwrap_or(self.max)
    }

    /// Record a failure for `key` and return how long to wait before retrying.
    pub fn when(&self, key: &K) -> Duration {
        let now = self.clock.now();
        let delay = {
            let mut map = self.lock();
            match map.get_mut(key) {
                None => {
                    map.insert(key.clone(), FailureRequest { attempts: 1, last_attempt: now });
                    self.base
                }
                // Quiet for long enough: retry right away, the record is left for forget() to drop.
                Some(rec) if self.stale(rec, now) => Duration::ZERO,
                Some(rec) => {
                    let d = self.backoff(rec.attempts);
                    rec.attempts = rec.attempts.saturating_add(1);
                    rec.last_attempt = now;
                    d
                }
            }
        };
        histogram!("ratelimit_delay_ms", delay.as_secs_f64() * 1000.0);
        delay
    }

    pub fn num_requeues(&self, key: &K) -> u32 { self.lock().get(key).map(|r| r.attempts).unwrap_or(0) }

    /// Drop the record, but only once it has gone stale. A failure that raced
    /// a success keeps its backoff.
    pub fn forget(&self, key: &K) {
        let now = self.clock.now();
        let mut map = self.lock();
        if map.get(key).map(|r| self.stale(r, now)).unwrap_or(false) {
            map.remove(key);
        }
    }

    pub fn len(&self) -> usize { self.lock().len() }

    pub fn is_empty(&self) -> bool { self.lock().is_empty() }
}

//! Rate-limited, de-duplicating work queue with a bounded worker pool.
//!
//! One task owns all queue state and hands keys to workers; a key is never
//! processed by two workers at once. Adds that arrive while a key is being
//! processed are held and replayed once that pass finishes.

use std::collections::VecDeque;
use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use metrics::{counter, gauge};
use rustc_hash::{FxHashMap, FxHashSet};
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::time::{delay_queue, DelayQueue};
use tracing::{debug, info};

use crate::FailureRateLimiter;

/// What a worker wants done with the key it just processed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Nothing left to do for this key.
    Done,
    /// Success; check again after the given delay.
    RequeueAfter(Duration),
    /// Transient failure; retry after the rate limiter's delay.
    RateLimited,
}

enum Command<K> {
    Add(K),
    AddAfter(K, Duration),
}

/// Producer handle. Cheap to clone.
pub struct WorkQueue<K> {
    tx: mpsc::UnboundedSender<Command<K>>,
}

impl<K> Clone for WorkQueue<K> {
    fn clone(&self) -> Self { Self { tx: self.tx.clone() } }
}

impl<K> WorkQueue<K> {
    pub fn add(&self, key: K) { let _ = self.tx.send(Command::Add(key)); }

    pub fn add_after(&self, key: K, delay: Duration) { let _ = self.tx.send(Command::AddAfter(key, delay)); }
}

/// Ready FIFO keyed for de-duplication, plus the set of keys in flight.
struct QueueState<K> {
    ready: VecDeque<K>,
    queued: FxHashSet<K>,
    processing: FxHashSet<K>,
    waiting: FxHashMap<K, delay_queue::Key>,
    delayed: DelayQueue<K>,
}

impl<K: Hash + Eq + Clone> QueueState<K> {
    fn new() -> Self {
        Self {
            ready: VecDeque::new(),
            queued: FxHashSet::default(),
            processing: FxHashSet::default(),
            waiting: FxHashMap::default(),
            delayed: DelayQueue::new(),
        }
    }

    fn add(&mut self, key: K) {
        if !self.queued.insert(key.clone()) {
            return;
        }
        if !self.processing.contains(&key) {
            self.ready.push_back(key);
        }
    }

    /// Keeps only the earliest pending deadline per key.
    fn add_after(&mut self, key: K, delay: Duration) {
        if delay.is_zero() {
            self.add(key);
            return;
        }
        match self.waiting.get(&key) {
            Some(dk) => {
                let wanted = tokio::time::Instant::now() + delay;
                if wanted < self.delayed.deadline(dk) {
                    self.delayed.reset(dk, delay);
                }
            }
            None => {
                let dk = self.delayed.insert(key.clone(), delay);
                self.waiting.insert(key, dk);
            }
        }
    }

    fn expire(&mut self, key: K) {
        self.waiting.remove(&key);
        self.add(key);
    }

    fn next(&mut self) -> Option<K> {
        let key = self.ready.pop_front()?;
        self.queued.remove(&key);
        self.processing.insert(key.clone());
        Some(key)
    }

    fn finish(&mut self, key: &K) {
        self.processing.remove(key);
        if self.queued.contains(key) {
            self.ready.push_back(key.clone());
        }
    }
}

/// Spawn the queue task and return a producer handle plus the task handle.
/// The task stops when `shutdown` fires, after in-flight passes complete.
pub fn spawn_workers<K, F, Fut>(
    limiter: Arc<FailureRateLimiter<K>>,
    workers: usize,
    shutdown: CancellationToken,
    handler: F,
) -> (WorkQueue<K>, JoinHandle<()>)
where
    K: Hash + Eq + Clone + Send + Sync + std::fmt::Display + 'static,
    F: Fn(K) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Disposition> + Send + 'static,
{
    let (tx, mut rx) = mpsc::unbounded_channel::<Command<K>>();
    let (done_tx, mut done_rx) = mpsc::unbounded_channel::<(K, Disposition)>();
    let workers = workers.max(1);
    let sem = Arc::new(Semaphore::new(workers));
    let handler = Arc::new(handler);

    let task = tokio::spawn(async move {
        let mut st = QueueState::new();
        info!(workers, "work queue started");
        loop {
            gauge!("queue_depth", st.ready.len() as f64);
            tokio::select! {
                _ = shutdown.cancelled() => break,
                Some(cmd) = rx.recv() => match cmd {
                    Command::Add(k) => st.add(k),
                    Command::AddAfter(k, d) => st.add_after(k, d),
                },
                Some(expired) = st.delayed.next(), if !st.delayed.is_empty() => {
                    st.expire(expired.into_inner());
                }
                Some((k, disposition)) = done_rx.recv() => {
                    st.finish(&k);
                    match disposition {
                        Disposition::Done => limiter.forget(&k),
                        Disposition::RequeueAfter(d) => {
                            limiter.forget(&k);
                            st.add_after(k, d);
                        }
                        Disposition::RateLimited => {
                            let d = limiter.when(&k);
                            debug!(key = %k, delay_ms = d.as_millis() as u64, "requeue with backoff");
                            counter!("queue_retries_total", 1u64);
                            st.add_after(k, d);
                        }
                    }
                }
                permit = sem.clone().acquire_owned(), if !st.ready.is_empty() => {
                    let Ok(permit) = permit else { break };
                    if let Some(k) = st.next() {
                        let handler = Arc::clone(&handler);
                        let done_tx = done_tx.clone();
                        tokio::spawn(async move {
                            let disposition = (*handler)(k.clone()).await;
                            drop(permit);
                            let _ = done_tx.send((k, disposition));
                        });
                    }
                }
            }
        }
        // Wait for in-flight passes to return their permits.
        let _ = sem.acquire_many(workers as u32).await;
        info!("work queue stopped");
    });

    (WorkQueue { tx }, task)
}

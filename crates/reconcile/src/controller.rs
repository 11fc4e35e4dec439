//! Controller runtime: watch and poll feed item keys into the work queue;
//! workers run reconcile passes under a deadline.

use std::sync::Arc;
use std::time::Duration;

use tether_core::{ItemKey, Kind};
use tether_queue::{spawn_workers, Disposition, FailureRateLimiter, WorkQueue};
use tether_store::{Delta, Store};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::ReconcileError;
use crate::reconciler::{Outcome, Reconciler};

const WATCH_RESTART: Duration = Duration::from_secs(1);
/// `interval` panics on a zero period.
const MIN_POLL: Duration = Duration::from_millis(10);

pub struct Controller {
    reconciler: Arc<Reconciler>,
}

impl Controller {
    pub fn new(reconciler: Arc<Reconciler>) -> Self { Self { reconciler } }

    /// Run controllers for `kinds` until `shutdown` fires. In-flight passes
    /// finish before this returns.
    pub async fn run(self, kinds: Vec<Kind>, shutdown: CancellationToken) -> anyhow::Result<()> {
        let cfg = self.reconciler.config().clone();
        let limiter = Arc::new(FailureRateLimiter::new(cfg.base_delay, cfg.max_delay));
        let rec = self.reconciler.clone();
        let (queue, workers) = spawn_workers(limiter, cfg.workers, shutdown.clone(), move |key: ItemKey| {
            let rec = rec.clone();
            async move { process(&rec, key).await }
        });

        let store = self.reconciler.store().clone();
        let mut feeders = Vec::new();
        for kind in kinds.into_iter().filter(|k| k.is_managed()) {
            info!(kind = kind.as_str(), ns = ?cfg.namespace, "starting controller");
            feeders.push(tokio::spawn(watch_kind(store.clone(), kind, cfg.namespace.clone(), queue.clone(), shutdown.clone())));
            feeders.push(tokio::spawn(poll_kind(
                store.clone(),
                kind,
                cfg.namespace.clone(),
                queue.clone(),
                cfg.poll_interval,
                shutdown.clone(),
            )));
        }

        shutdown.cancelled().await;
        for f in feeders {
            let _ = f.await;
        }
        workers.await?;
        info!("controllers stopped");
        Ok(())
    }
}

/// Run one pass for `key` under the configured deadline and decide when to
/// look at it again.
pub async fn process(rec: &Reconciler, key: ItemKey) -> Disposition {
    let cfg = rec.config();
    let res = match tokio::time::timeout(cfg.pass_timeout, rec.reconcile(&key)).await {
        Ok(r) => r,
        Err(_) => {
            warn!(%key, timeout = ?cfg.pass_timeout, "reconcile pass abandoned");
            let err = ReconcileError::Timeout(cfg.pass_timeout);
            if let Err(e) = rec.surface(&key, &err).await {
                warn!(%key, error = %e, "could not record timeout condition");
            }
            Err(err)
        }
    };
    disposition(&res, cfg.poll_interval, cfg.base_delay)
}

pub fn disposition(res: &Result<Outcome, ReconcileError>, poll: Duration, soon: Duration) -> Disposition {
    match res {
        Ok(Outcome::Gone | Outcome::Deleted) => Disposition::Done,
        // Look again shortly so the new resource gets observed.
        Ok(Outcome::Created | Outcome::Adopted | Outcome::Pending) => Disposition::RequeueAfter(soon),
        Ok(_) => Disposition::RequeueAfter(poll),
        Err(e) if e.is_transient() => Disposition::RateLimited,
        Err(_) => Disposition::RequeueAfter(poll),
    }
}

async fn watch_kind(
    store: Arc<dyn Store>,
    kind: Kind,
    namespace: Option<String>,
    queue: WorkQueue<ItemKey>,
    shutdown: CancellationToken,
) {
    loop {
        let (tx, mut rx) = mpsc::channel::<Delta>(256);
        let s = store.clone();
        let ns = namespace.clone();
        let producer = tokio::spawn(async move { s.watch(kind, ns.as_deref(), tx).await });
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    producer.abort();
                    return;
                }
                d = rx.recv() => match d {
                    Some(d) => {
                        debug!(key = %d.key, change = ?d.kind, "watch event");
                        queue.add(d.key);
                    }
                    None => break,
                },
            }
        }
        match producer.await {
            Ok(Ok(())) => warn!(kind = kind.as_str(), "watch ended; restarting"),
            Ok(Err(e)) => warn!(kind = kind.as_str(), error = %e, "watch failed; restarting"),
            Err(e) => warn!(kind = kind.as_str(), error = %e, "watch task failed; restarting"),
        }
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = tokio::time::sleep(WATCH_RESTART) => {}
        }
    }
}

/// Re-enqueue every key of `kind` each `every`, whatever its backoff state,
/// so drift made directly in the external system is noticed.
async fn poll_kind(
    store: Arc<dyn Store>,
    kind: Kind,
    namespace: Option<String>,
    queue: WorkQueue<ItemKey>,
    every: Duration,
    shutdown: CancellationToken,
) {
    let mut tick = tokio::time::interval(every.max(MIN_POLL));
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick fires at once; the watch relist already covers it.
    tick.tick().await;
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = tick.tick() => {}
        }
        match store.list(kind, namespace.as_deref(), None).await {
            Ok(objs) => {
                debug!(kind = kind.as_str(), count = objs.len(), "poll");
                for o in objs {
                    queue.add(o.key());
                }
            }
            Err(e) => warn!(kind = kind.as_str(), error = %e, "poll list failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tether_resolve::ReferenceError;

    #[test]
    fn disposition_follows_outcome_and_error_class() {
        let poll = Duration::from_secs(60);
        let soon = Duration::from_secs(1);
        assert_eq!(disposition(&Ok(Outcome::Idle), poll, soon), Disposition::RequeueAfter(poll));
        assert_eq!(disposition(&Ok(Outcome::Created), poll, soon), Disposition::RequeueAfter(soon));
        assert_eq!(disposition(&Ok(Outcome::Gone), poll, soon), Disposition::Done);
        let not_ready = ReconcileError::Reference(ReferenceError::NotReady { kind: Kind::TeamProject, name: "p".into() });
        assert_eq!(disposition(&Err(not_ready), poll, soon), Disposition::RateLimited);
        assert_eq!(disposition(&Err(ReconcileError::Timeout(poll)), poll, soon), Disposition::RateLimited);
        let invalid = ReconcileError::InvalidSpec("bad".into());
        assert_eq!(disposition(&Err(invalid), poll, soon), Disposition::RequeueAfter(poll));
    }
}

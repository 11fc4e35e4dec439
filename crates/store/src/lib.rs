//! Tether store: the object-store seam the controllers consume, plus an
//! in-RAM implementation with optimistic concurrency and watch fan-out.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;
use chrono::Utc;
use metrics::counter;
use serde::{Deserialize, Serialize};
use tether_core::{ItemKey, Kind, Object, SecretSource, Selector, StoreError, StoreResult};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum DeltaKind {
    Applied,
    Deleted,
}

/// Change notification for one object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Delta {
    pub key: ItemKey,
    pub kind: DeltaKind,
}

/// Read/status-write access to declarative records.
///
/// Writes are conditional on `metadata.resourceVersion`; a stale version
/// yields [`StoreError::Conflict`].
#[async_trait::async_trait]
pub trait Store: Send + Sync {
    async fn get(&self, kind: Kind, name: &str, namespace: Option<&str>) -> StoreResult<Option<Object>>;

    /// List objects of `kind`, optionally restricted to a namespace and a label selector.
    async fn list(&self, kind: Kind, namespace: Option<&str>, selector: Option<&Selector>) -> StoreResult<Vec<Object>>;

    /// Replace the status of `obj`. Only `status` is written, and watchers
    /// are not woken by it.
    async fn update_status(&self, obj: &Object) -> StoreResult<Object>;

    /// Replace `metadata.finalizers` of `obj`.
    async fn update_finalizers(&self, obj: &Object) -> StoreResult<Object>;

    /// Send a delta for every change to objects of `kind` until `tx` closes or
    /// the underlying stream ends. Starts with an `Applied` for every existing object.
    async fn watch(&self, kind: Kind, namespace: Option<&str>, tx: mpsc::Sender<Delta>) -> anyhow::Result<()>;
}

type Objects = BTreeMap<ItemKey, Object>;

/// In-RAM store. Readers load an immutable snapshot; writers swap in a new
/// one with compare-and-swap.
pub struct MemoryStore {
    objects: ArcSwap<Objects>,
    secrets: ArcSwap<BTreeMap<(Option<String>, String), BTreeMap<String, Vec<u8>>>>,
    rv: AtomicU64,
    events: broadcast::Sender<Delta>,
}

impl Default for MemoryStore {
    fn default() -> Self { Self::new() }
}

impl MemoryStore {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(1024);
        Self {
            objects: ArcSwap::from_pointee(BTreeMap::new()),
            secrets: ArcSwap::from_pointee(BTreeMap::new()),
            rv: AtomicU64::new(0),
            events,
        }
    }

    fn next_rv(&self) -> String { (self.rv.fetch_add(1, Ordering::SeqCst) + 1).to_string() }

    fn mutate<R>(&self, f: impl Fn(&mut Objects) -> StoreResult<R>) -> StoreResult<R> {
        loop {
            let cur = self.objects.load_full();
            let mut next = (*cur).clone();
            let out = f(&mut next)?;
            let prev = self.objects.compare_and_swap(&cur, Arc::new(next));
            if Arc::ptr_eq(&prev, &cur) {
                return Ok(out);
            }
        }
    }

    fn emit(&self, key: ItemKey, kind: DeltaKind) {
        let _ = self.events.send(Delta { key, kind });
    }

    /// Create or replace the user-owned parts of an object (metadata + spec).
    /// Status already held by the store is kept.
    pub fn apply(&self, obj: Object) -> StoreResult<Object> {
        let key = obj.key();
        let rv = self.next_rv();
        let stored = self.mutate(|objs| {
            let mut o = obj.clone();
            o.metadata.resource_version = Some(rv.clone());
            match objs.get(&key) {
                Some(prev) => {
                    o.metadata.uid = prev.metadata.uid.clone();
                    o.status = prev.status.clone();
                    let gen = prev.metadata.generation.unwrap_or(1);
                    o.metadata.generation = Some(if prev.spec != o.spec { gen + 1 } else { gen });
                    if o.metadata.finalizers.is_empty() {
                        o.metadata.finalizers = prev.metadata.finalizers.clone();
                    }
                    o.metadata.deletion_timestamp = prev.metadata.deletion_timestamp;
                }
                None => {
                    o.metadata.uid.get_or_insert_with(|| uuid::Uuid::new_v4().to_string());
                    o.metadata.generation = Some(1);
                }
            }
            objs.insert(key.clone(), o.clone());
            Ok(o)
        })?;
        self.emit(key, DeltaKind::Applied);
        Ok(stored)
    }

    /// Request deletion. Objects holding finalizers are only marked.
    pub fn delete(&self, kind: Kind, name: &str, namespace: Option<&str>) -> StoreResult<()> {
        let key = ItemKey::new(kind, name, namespace);
        let rv = self.next_rv();
        let removed = self.mutate(|objs| {
            let Some(o) = objs.get_mut(&key) else { return Err(StoreError::NotFound(key.to_string())) };
            if o.metadata.finalizers.is_empty() {
                objs.remove(&key);
                return Ok(true);
            }
            o.metadata.deletion_timestamp.get_or_insert_with(Utc::now);
            o.metadata.resource_version = Some(rv.clone());
            Ok(false)
        })?;
        self.emit(key, if removed { DeltaKind::Deleted } else { DeltaKind::Applied });
        Ok(())
    }

    pub fn put_secret(&self, name: &str, namespace: Option<&str>, key: &str, value: &[u8]) {
        self.secrets.rcu(|cur| {
            let mut next = (**cur).clone();
            next.entry((namespace.map(|s| s.to_string()), name.to_string()))
                .or_default()
                .insert(key.to_string(), value.to_vec());
            next
        });
    }

    pub fn snapshot(&self) -> Vec<Object> { self.objects.load().values().cloned().collect() }

    fn check_rv(current: &Object, proposed: &Object) -> StoreResult<()> {
        if proposed.metadata.resource_version != current.metadata.resource_version {
            counter!("status_conflicts_total", 1u64);
            return Err(StoreError::Conflict(format!(
                "{}: resourceVersion {:?} is stale (current {:?})",
                current.key(),
                proposed.metadata.resource_version,
                current.metadata.resource_version
            )));
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl Store for MemoryStore {
    async fn get(&self, kind: Kind, name: &str, namespace: Option<&str>) -> StoreResult<Option<Object>> {
        Ok(self.objects.load().get(&ItemKey::new(kind, name, namespace)).cloned())
    }

    async fn list(&self, kind: Kind, namespace: Option<&str>, selector: Option<&Selector>) -> StoreResult<Vec<Object>> {
        let snap = self.objects.load();
        Ok(snap
            .values()
            .filter(|o| o.kind == kind)
            .filter(|o| namespace.is_none() || o.metadata.namespace.as_deref() == namespace)
            .filter(|o| selector.map(|s| s.matches(&o.metadata.labels)).unwrap_or(true))
            .cloned()
            .collect())
    }

    async fn update_status(&self, obj: &Object) -> StoreResult<Object> {
        let key = obj.key();
        let rv = self.next_rv();
        let updated = self.mutate(|objs| {
            let cur = objs.get_mut(&key).ok_or_else(|| StoreError::NotFound(key.to_string()))?;
            Self::check_rv(cur, obj)?;
            cur.status = obj.status.clone();
            cur.metadata.resource_version = Some(rv.clone());
            Ok(cur.clone())
        })?;
        // Status-only writes are not announced.
        Ok(updated)
    }

    async fn update_finalizers(&self, obj: &Object) -> StoreResult<Object> {
        let key = obj.key();
        let rv = self.next_rv();
        let (updated, removed) = self.mutate(|objs| {
            let cur = objs.get_mut(&key).ok_or_else(|| StoreError::NotFound(key.to_string()))?;
            Self::check_rv(cur, obj)?;
            cur.metadata.finalizers = obj.metadata.finalizers.clone();
            cur.metadata.resource_version = Some(rv.clone());
            let out = cur.clone();
            // Last finalizer gone on a deleting object: it is removed for real.
            let removed = out.metadata.is_deleting() && out.metadata.finalizers.is_empty();
            if removed {
                objs.remove(&key);
            }
            Ok((out, removed))
        })?;
        self.emit(key, if removed { DeltaKind::Deleted } else { DeltaKind::Applied });
        Ok(updated)
    }

    async fn watch(&self, kind: Kind, namespace: Option<&str>, tx: mpsc::Sender<Delta>) -> anyhow::Result<()> {
        let mut rx = self.events.subscribe();
        let wanted = |k: &ItemKey| k.kind == kind && (namespace.is_none() || k.namespace.as_deref() == namespace);
        let relist = |snap: &Objects| -> Vec<Delta> {
            snap.keys().filter(|k| wanted(k)).map(|k| Delta { key: k.clone(), kind: DeltaKind::Applied }).collect()
        };
        for d in relist(&self.objects.load()) {
            if tx.send(d).await.is_err() {
                return Ok(());
            }
        }
        info!(kind = kind.as_str(), ns = ?namespace, "memory watch started");
        loop {
            match rx.recv().await {
                Ok(d) if wanted(&d.key) => {
                    if tx.send(d).await.is_err() {
                        break;
                    }
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    debug!(skipped = n, "watch lagged; relisting");
                    for d in relist(&self.objects.load()) {
                        if tx.send(d).await.is_err() {
                            return Ok(());
                        }
                    }
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
        warn!(kind = kind.as_str(), "memory watch ended");
        Ok(())
    }
}

#[async_trait::async_trait]
impl SecretSource for MemoryStore {
    async fn secret_value(&self, name: &str, namespace: Option<&str>, key: &str) -> StoreResult<Option<Vec<u8>>> {
        Ok(self
            .secrets
            .load()
            .get(&(namespace.map(|s| s.to_string()), name.to_string()))
            .and_then(|m| m.get(key).cloned()))
    }
}

/// Write `status` onto the freshest copy of the object, re-reading and
/// retrying on conflict. The status is owned by the caller, so reapplying it
/// on top of a newer object is safe.
pub async fn write_status(
    store: &dyn Store,
    obj: &Object,
    status: &tether_core::ResourceStatus,
    attempts: usize,
) -> StoreResult<Object> {
    let mut cur = obj.clone();
    let mut tries = 0usize;
    loop {
        tries += 1;
        cur.status = status.clone();
        match store.update_status(&cur).await {
            Ok(o) => return Ok(o),
            Err(StoreError::Conflict(msg)) if tries < attempts.max(1) => {
                debug!(key = %obj.key(), tries, %msg, "status conflict; re-reading");
                let key = obj.key();
                cur = store
                    .get(key.kind, &key.name, key.namespace.as_deref())
                    .await?
                    .ok_or_else(|| StoreError::NotFound(key.to_string()))?;
            }
            Err(e) => return Err(e),
        }
    }
}

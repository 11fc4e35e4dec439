//! Tether kubehub: the object store backed by a Kubernetes API server.
//!
//! Records are served as custom resources of the closed kind set under
//! [`tether_core::GROUP`] at the storage version. Status and finalizer writes
//! carry `metadata.resourceVersion` so the server enforces optimistic
//! concurrency.

#![forbid(unsafe_code)]

use anyhow::{Context, Result};
use futures::TryStreamExt;
use k8s_openapi::api::core::v1::{ObjectReference, Secret};
use kube::{
    api::{Api, ListParams, Patch, PatchParams, PostParams},
    core::{ApiResource, DynamicObject, GroupVersionKind},
    runtime::{
        events::{Event as KubeEvent, EventType as KubeEventType, Recorder, Reporter},
        watcher::{self, Event},
    },
    Client,
};
use metrics::counter;
use rustc_hash::FxHashMap;
use tether_core::{
    Event as TetherEvent, EventSink, EventType, ItemKey, Kind, Object, SecretSource, Selector, StoreError, StoreResult,
    GROUP, STORAGE_VERSION,
};
use tether_store::{Delta, DeltaKind, Store};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Name events are reported under.
pub const REPORTER: &str = "tether-controller";

/// API resource for one of our kinds at the storage version.
pub fn api_resource(kind: Kind) -> ApiResource {
    let gvk = GroupVersionKind { group: GROUP.to_string(), version: STORAGE_VERSION.to_string(), kind: kind.as_str().to_string() };
    ApiResource::from_gvk_with_plural(&gvk, kind.plural())
}

fn strip_managed_fields(v: &mut serde_json::Value) {
    if let Some(meta) = v.get_mut("metadata").and_then(|m| m.as_object_mut()) {
        meta.remove("managedFields");
    }
}

/// Decode a served object. Unknown metadata is dropped.
pub fn from_dynamic(obj: &DynamicObject) -> Result<Object> {
    let mut raw = serde_json::to_value(obj).context("serializing DynamicObject")?;
    strip_managed_fields(&mut raw);
    serde_json::from_value(raw).context("decoding object")
}

pub fn to_dynamic(obj: &Object) -> Result<DynamicObject> {
    let raw = serde_json::to_value(obj).context("serializing object")?;
    serde_json::from_value(raw).context("encoding DynamicObject")
}

/// Map API errors onto the store's error classes.
pub fn store_error(key: &ItemKey, e: kube::Error) -> StoreError {
    match e {
        kube::Error::Api(ae) if ae.code == 404 => StoreError::NotFound(key.to_string()),
        kube::Error::Api(ae) if ae.code == 409 => {
            counter!("status_conflicts_total", 1u64);
            StoreError::Conflict(format!("{}: {}", key, ae.message))
        }
        e => StoreError::Other(anyhow::Error::new(e).context(key.to_string())),
    }
}

fn other(key: &ItemKey, e: anyhow::Error) -> StoreError { StoreError::Other(e.context(key.to_string())) }

#[derive(Clone)]
pub struct KubeStore {
    client: Client,
}

impl KubeStore {
    pub fn new(client: Client) -> Self { Self { client } }

    /// Connect with the ambient kubeconfig or in-cluster service account.
    pub async fn try_default() -> Result<Self> {
        let client = Client::try_default().await.context("building kube client")?;
        Ok(Self::new(client))
    }

    pub fn client(&self) -> &Client { &self.client }

    fn api(&self, kind: Kind, namespace: Option<&str>) -> Api<DynamicObject> {
        let ar = api_resource(kind);
        match namespace {
            Some(ns) => Api::namespaced_with(self.client.clone(), ns, &ar),
            None => Api::all_with(self.client.clone(), &ar),
        }
    }

    /// Single-object access needs a namespace; fall back to the client default.
    fn object_api(&self, kind: Kind, namespace: Option<&str>) -> Api<DynamicObject> {
        let ar = api_resource(kind);
        match namespace {
            Some(ns) => Api::namespaced_with(self.client.clone(), ns, &ar),
            None => Api::default_namespaced_with(self.client.clone(), &ar),
        }
    }
}

fn list_params(selector: Option<&Selector>) -> ListParams {
    match selector.map(|s| s.to_query()).filter(|q| !q.is_empty()) {
        Some(q) => ListParams::default().labels(&q),
        None => ListParams::default(),
    }
}

fn delta_from(obj: &DynamicObject, kind: Kind, change: DeltaKind) -> Option<Delta> {
    let name = obj.metadata.name.as_deref()?;
    Some(Delta { key: ItemKey::new(kind, name, obj.metadata.namespace.as_deref()), kind: change })
}

/// Drops watch events that only touched status. Status writes go through the
/// status subresource, which leaves `metadata.generation` alone.
#[derive(Default)]
struct SpecChanges {
    seen: FxHashMap<ItemKey, (Option<i64>, bool)>,
}

impl SpecChanges {
    fn admit(&mut self, d: &Delta, obj: &DynamicObject) -> bool {
        if d.kind == DeltaKind::Deleted {
            self.seen.remove(&d.key);
            return true;
        }
        let mark = (obj.metadata.generation, obj.metadata.deletion_timestamp.is_some());
        self.seen.insert(d.key.clone(), mark) != Some(mark)
    }
}

#[async_trait::async_trait]
impl Store for KubeStore {
    async fn get(&self, kind: Kind, name: &str, namespace: Option<&str>) -> StoreResult<Option<Object>> {
        let key = ItemKey::new(kind, name, namespace);
        let found = self.object_api(kind, namespace).get_opt(name).await.map_err(|e| store_error(&key, e))?;
        found.as_ref().map(from_dynamic).transpose().map_err(|e| other(&key, e))
    }

    async fn list(&self, kind: Kind, namespace: Option<&str>, selector: Option<&Selector>) -> StoreResult<Vec<Object>> {
        let key = ItemKey::new(kind, "*", namespace);
        let list = self.api(kind, namespace).list(&list_params(selector)).await.map_err(|e| store_error(&key, e))?;
        list.items.iter().map(from_dynamic).collect::<Result<Vec<_>>>().map_err(|e| other(&key, e))
    }

    async fn update_status(&self, obj: &Object) -> StoreResult<Object> {
        let key = obj.key();
        let body = serde_json::to_vec(&to_dynamic(obj).map_err(|e| other(&key, e))?).map_err(|e| other(&key, e.into()))?;
        let api = self.object_api(key.kind, key.namespace.as_deref());
        let written = api.replace_status(&key.name, &PostParams::default(), body).await.map_err(|e| store_error(&key, e))?;
        debug!(%key, rv = ?written.metadata.resource_version, "status written");
        from_dynamic(&written).map_err(|e| other(&key, e))
    }

    async fn update_finalizers(&self, obj: &Object) -> StoreResult<Object> {
        let key = obj.key();
        // Carrying resourceVersion makes the merge patch conditional.
        let patch = serde_json::json!({
            "metadata": {
                "finalizers": obj.metadata.finalizers,
                "resourceVersion": obj.metadata.resource_version,
            }
        });
        let api = self.object_api(key.kind, key.namespace.as_deref());
        let written = api.patch(&key.name, &PatchParams::default(), &Patch::Merge(&patch)).await.map_err(|e| store_error(&key, e))?;
        from_dynamic(&written).map_err(|e| other(&key, e))
    }

    async fn watch(&self, kind: Kind, namespace: Option<&str>, tx: mpsc::Sender<Delta>) -> Result<()> {
        let stream = watcher::watcher(self.api(kind, namespace), watcher::Config::default());
        futures::pin_mut!(stream);
        info!(kind = kind.as_str(), ns = ?namespace, "watcher started");
        let mut changes = SpecChanges::default();
        while let Some(ev) = stream.try_next().await? {
            let deltas: Vec<Delta> = match &ev {
                Event::Applied(o) => {
                    delta_from(o, kind, DeltaKind::Applied).filter(|d| changes.admit(d, o)).into_iter().collect()
                }
                Event::Deleted(o) => {
                    delta_from(o, kind, DeltaKind::Deleted).filter(|d| changes.admit(d, o)).into_iter().collect()
                }
                Event::Restarted(list) => {
                    debug!(kind = kind.as_str(), count = list.len(), "watch restart");
                    changes = SpecChanges::default();
                    list.iter().filter_map(|o| delta_from(o, kind, DeltaKind::Applied).filter(|d| changes.admit(d, o))).collect()
                }
            };
            counter!("watch_events_total", deltas.len() as u64, "kind" => kind.as_str());
            for d in deltas {
                if tx.send(d).await.is_err() {
                    return Ok(());
                }
            }
        }
        warn!(kind = kind.as_str(), "watcher stream ended");
        Ok(())
    }
}

#[async_trait::async_trait]
impl SecretSource for KubeStore {
    async fn secret_value(&self, name: &str, namespace: Option<&str>, key: &str) -> StoreResult<Option<Vec<u8>>> {
        let api: Api<Secret> = match namespace {
            Some(ns) => Api::namespaced(self.client.clone(), ns),
            None => Api::default_namespaced(self.client.clone()),
        };
        let secret = api.get_opt(name).await.map_err(|e| StoreError::Other(anyhow::Error::new(e).context(format!("secret {}", name))))?;
        let Some(secret) = secret else {
            return Err(StoreError::NotFound(format!("secret {}", name)));
        };
        Ok(secret.data.and_then(|mut d| d.remove(key)).map(|b| b.0))
    }
}

/// Object reference events are attached to.
pub fn object_reference(obj: &Object) -> ObjectReference {
    ObjectReference {
        api_version: Some(obj.api_version.clone()),
        kind: Some(obj.kind.as_str().to_string()),
        name: Some(obj.metadata.name.clone()),
        namespace: obj.metadata.namespace.clone(),
        uid: obj.metadata.uid.clone(),
        resource_version: obj.metadata.resource_version.clone(),
        ..Default::default()
    }
}

fn kube_event(event: TetherEvent) -> KubeEvent {
    KubeEvent {
        type_: match event.type_ {
            EventType::Normal => KubeEventType::Normal,
            EventType::Warning => KubeEventType::Warning,
        },
        reason: event.reason,
        note: Some(event.note),
        action: event.action,
        secondary: None,
    }
}

/// Publishes events through the cluster event API.
pub struct KubeEvents {
    client: Client,
    reporter: Reporter,
}

impl KubeEvents {
    pub fn new(client: Client, instance: Option<String>) -> Self {
        Self { client, reporter: Reporter { controller: REPORTER.to_string(), instance } }
    }
}

#[async_trait::async_trait]
impl EventSink for KubeEvents {
    async fn publish(&self, on: &Object, event: TetherEvent) {
        let recorder = Recorder::new(self.client.clone(), self.reporter.clone(), object_reference(on));
        let reason = event.reason.clone();
        if let Err(e) = recorder.publish(kube_event(event)).await {
            warn!(key = %on.key(), %reason, error = %e, "event publish failed");
        }
    }
}

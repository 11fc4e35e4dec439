//! One reconcile pass: Connect, Observe, then Create, Update, Delete or nothing.

use std::sync::Arc;
use std::time::Instant;

use metrics::{counter, histogram};
use tether_core::kinds::ConnectorConfigSpec;
use tether_core::prelude::*;
use tether_core::{ControllerConfig, FINALIZER};
use tether_resolve::Resolver;
use tether_store::{write_status, Store};
use tracing::{debug, info, warn};

use crate::error::{ReconcileError, ReconcileResult};
use crate::external::{ConnectionParams, Connector, Credential, DevOpsClient, ExternalError, Metered};
use crate::resources::{CreateOutcome, Decoded, Managed, Pass};

/// What a pass did. Drives the next scheduling decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Observed and in sync.
    Idle,
    Created,
    Adopted,
    /// Create hit "already exists" but the resource is not visible yet.
    Pending,
    Updated,
    /// A mutation was needed but the management policy forbids it.
    Skipped,
    /// External resource deleted (or orphaned) and finalizer released.
    Deleted,
    /// The record no longer exists.
    Gone,
}

impl Outcome {
    pub fn label(self) -> &'static str {
        match self {
            Outcome::Idle => "idle",
            Outcome::Created => "created",
            Outcome::Adopted => "adopted",
            Outcome::Pending => "pending",
            Outcome::Updated => "updated",
            Outcome::Skipped => "skipped",
            Outcome::Deleted => "deleted",
            Outcome::Gone => "gone",
        }
    }

    /// The record is gone or going; status must not be written.
    fn released(self) -> bool { matches!(self, Outcome::Deleted | Outcome::Gone) }
}

pub struct Reconciler {
    store: Arc<dyn Store>,
    resolver: Resolver,
    secrets: Arc<dyn SecretSource>,
    connector: Arc<dyn Connector>,
    events: Arc<dyn EventSink>,
    config: ControllerConfig,
}

impl Reconciler {
    pub fn new(
        store: Arc<dyn Store>,
        secrets: Arc<dyn SecretSource>,
        connector: Arc<dyn Connector>,
        events: Arc<dyn EventSink>,
        config: ControllerConfig,
    ) -> Self {
        Self { resolver: Resolver::new(store.clone()), store, secrets, connector, events, config }
    }

    pub fn config(&self) -> &ControllerConfig { &self.config }

    pub fn store(&self) -> &Arc<dyn Store> { &self.store }

    /// Run one pass for `key`. Errors have already been surfaced as a
    /// Ready=False condition when this returns.
    pub async fn reconcile(&self, key: &ItemKey) -> ReconcileResult<Outcome> {
        let started = Instant::now();
        let res = self.reconcile_inner(key).await;
        let outcome = match &res {
            Ok(o) => o.label(),
            Err(e) if e.is_transient() => "transient_error",
            Err(_) => "permanent_error",
        };
        counter!("reconcile_total", 1u64, "kind" => key.kind.as_str(), "outcome" => outcome);
        histogram!("reconcile_latency_ms", started.elapsed().as_secs_f64() * 1000.0, "kind" => key.kind.as_str());
        res
    }

    async fn reconcile_inner(&self, key: &ItemKey) -> ReconcileResult<Outcome> {
        let Some(mut obj) = self.store.get(key.kind, &key.name, key.namespace.as_deref()).await? else {
            debug!(%key, "record gone; nothing to do");
            return Ok(Outcome::Gone);
        };
        let mut status = obj.status.clone();
        let res = self.run(&mut obj, &mut status).await;
        match &res {
            Ok(o) if o.released() => return res,
            // A policy gate already wrote its own conditions.
            Ok(Outcome::Skipped) => {}
            Ok(_) => status.set_condition(Condition::synced()),
            Err(e) => {
                warn!(%key, reason = e.reason(), error = %e, "reconcile failed");
                status.set_condition(Condition::unavailable(e.reason(), e.to_string()));
                status.set_condition(Condition::sync_failed(e.reason(), e.to_string()));
            }
        }
        self.persist(&mut obj, &status).await?;
        res
    }

    /// Surface a failure raised outside a pass, such as an abandoned one, as
    /// Ready=False on the record.
    pub async fn surface(&self, key: &ItemKey, err: &ReconcileError) -> ReconcileResult<()> {
        let Some(mut obj) = self.store.get(key.kind, &key.name, key.namespace.as_deref()).await? else { return Ok(()) };
        let mut status = obj.status.clone();
        status.set_condition(Condition::unavailable(err.reason(), err.to_string()));
        status.set_condition(Condition::sync_failed(err.reason(), err.to_string()));
        self.persist(&mut obj, &status).await
    }

    async fn run(&self, obj: &mut Object, status: &mut ResourceStatus) -> ReconcileResult<Outcome> {
        // Finalizer bookkeeping does not depend on the spec.
        if obj.metadata.is_deleting() {
            if !obj.metadata.has_finalizer(FINALIZER) {
                return Ok(Outcome::Gone);
            }
            if status.external_id.as_deref().map_or(true, str::is_empty) {
                // Never created externally: nothing to clean up.
                self.release(obj).await?;
                return Ok(Outcome::Deleted);
            }
        }
        let decoded = Managed::decode(obj)?;
        let client = self.connect(obj, &decoded.connector).await?;
        let ns = obj.metadata.namespace.clone();
        let mut cx = Pass::new(client.as_ref(), &self.resolver, ns.as_deref(), std::mem::take(status));
        let res = self.drive(obj, &decoded, &mut cx).await;
        *status = cx.status;
        for field in cx.repointed {
            let bound = status.bound_references.get(&field).map(|b| b.name.clone()).unwrap_or_default();
            let note = format!("spec.{} changed after creation; still bound to {}", field, bound);
            self.events.publish(obj, Event::warning("ReferenceImmutable", "Observe", note)).await;
        }
        res
    }

    /// Resolve the connector config and its credential into a client.
    async fn connect(&self, obj: &Object, r: &Reference) -> ReconcileResult<Arc<dyn DevOpsClient>> {
        let ns = obj.metadata.namespace.as_deref();
        let cfg = self.resolver.fetch(Kind::ConnectorConfig, r, ns).await.map_err(|e| ReconcileError::Connect(e.to_string()))?;
        let spec: ConnectorConfigSpec =
            cfg.spec_as().map_err(|e| ReconcileError::Connect(format!("connector config {}: {}", r.name, e)))?;
        let sel = &spec.credentials.secret_ref;
        let secret_ns = sel.namespace.as_deref().or(cfg.metadata.namespace.as_deref());
        let credential = self
            .secrets
            .secret_value(&sel.name, secret_ns, &sel.key)
            .await
            .map_err(|e| ReconcileError::Connect(e.to_string()))?
            .ok_or_else(|| ReconcileError::Connect(format!("secret {} has no key {}", sel.name, sel.key)))?;
        let params = ConnectionParams {
            organization_url: spec.organization_url.clone(),
            api_version: spec.api_version.clone(),
            credential: Credential(credential),
        };
        let client = self.connector.connect(&params).await.map_err(|e| ReconcileError::Connect(e.to_string()))?;
        Ok(Arc::new(Metered(client)))
    }

    async fn drive(&self, obj: &mut Object, d: &Decoded, cx: &mut Pass<'_>) -> ReconcileResult<Outcome> {
        let h = d.resource.handler();
        if obj.metadata.is_deleting() {
            return self.finalize(obj, d, cx).await;
        }

        let had_id = cx.external_id().is_some();
        let obs = h.observe(cx).await?;
        debug!(key = %obj.key(), exists = obs.resource_exists, up_to_date = obs.resource_up_to_date, "observed");

        if !obs.resource_exists {
            if had_id {
                let note = format!("external resource {} is missing", cx.status.external_id.as_deref().unwrap_or_default());
                self.events.publish(obj, Event::warning("ExternalResourceMissing", "Observe", note)).await;
            }
            if !d.policy.create {
                info!(key = %obj.key(), "creation disabled by management policy");
                cx.status.set_condition(Condition::unavailable("CreationDisallowed", "managementPolicy.create is false"));
                return Ok(Outcome::Skipped);
            }
            self.ensure_finalizer(obj).await?;
            cx.status.set_condition(Condition::creating());
            let created = match h.create(cx).await {
                Ok(c) => c,
                Err(e) => {
                    self.events.publish(obj, Event::warning("CannotCreate", "Create", e.to_string())).await;
                    return Err(e);
                }
            };
            let (reason, outcome) = match created {
                CreateOutcome::Created => ("Created", Outcome::Created),
                CreateOutcome::Adopted => ("Adopted", Outcome::Adopted),
                CreateOutcome::Pending => ("AlreadyExists", Outcome::Pending),
            };
            let note = format!("external id {}", cx.status.external_id.as_deref().unwrap_or("<pending>"));
            self.events.publish(obj, Event::normal(reason, "Create", note)).await;
            cx.status.set_condition(Condition::unavailable("Creating", "waiting for the external resource to be observed"));
            // Identity goes to the store before anything else can fail.
            self.persist(obj, &cx.status).await?;
            return Ok(outcome);
        }

        cx.status.clear_condition(ConditionType::Creating);
        cx.status.set_condition(Condition::available());
        if obs.resource_up_to_date {
            return Ok(Outcome::Idle);
        }
        if !d.policy.update {
            info!(key = %obj.key(), "update disabled by management policy");
            cx.status.set_condition(Condition::sync_failed("UpdateDisallowed", "managementPolicy.update is false"));
            return Ok(Outcome::Skipped);
        }
        match h.update(cx).await {
            Ok(()) => {
                self.events.publish(obj, Event::normal("Updated", "Update", "external resource updated")).await;
                Ok(Outcome::Updated)
            }
            Err(e) => {
                self.events.publish(obj, Event::warning("CannotUpdate", "Update", e.to_string())).await;
                Err(e)
            }
        }
    }

    async fn finalize(&self, obj: &mut Object, d: &Decoded, cx: &mut Pass<'_>) -> ReconcileResult<Outcome> {
        cx.status.set_condition(Condition::deleting());
        if !d.policy.delete {
            info!(key = %obj.key(), "deletion disabled by management policy; leaving external resource");
            self.events.publish(obj, Event::normal("DeleteSkipped", "Delete", "managementPolicy.delete is false")).await;
        } else {
            match d.resource.handler().delete(cx).await {
                Ok(()) | Err(ReconcileError::External(ExternalError::NotFound(_))) => {
                    self.events.publish(obj, Event::normal("Deleted", "Delete", "external resource deleted")).await;
                }
                Err(e) => {
                    self.events.publish(obj, Event::warning("CannotDelete", "Delete", e.to_string())).await;
                    return Err(e);
                }
            }
        }
        self.release(obj).await?;
        Ok(Outcome::Deleted)
    }

    async fn ensure_finalizer(&self, obj: &mut Object) -> ReconcileResult<()> {
        if obj.metadata.has_finalizer(FINALIZER) {
            return Ok(());
        }
        self.edit_finalizers(obj, |f| f.push(FINALIZER.to_string())).await
    }

    async fn release(&self, obj: &mut Object) -> ReconcileResult<()> {
        self.edit_finalizers(obj, |f| f.retain(|x| x != FINALIZER)).await
    }

    /// Apply `edit` to the finalizer list, re-reading on conflict.
    async fn edit_finalizers(&self, obj: &mut Object, edit: impl Fn(&mut Vec<String>)) -> ReconcileResult<()> {
        let key = obj.key();
        let mut tries = 0usize;
        loop {
            tries += 1;
            let mut next = obj.clone();
            edit(&mut next.metadata.finalizers);
            match self.store.update_finalizers(&next).await {
                Ok(stored) => {
                    *obj = stored;
                    return Ok(());
                }
                Err(StoreError::Conflict(_)) if tries < self.config.status_retries.max(1) => {
                    let fresh = self.store.get(key.kind, &key.name, key.namespace.as_deref()).await?;
                    *obj = fresh.ok_or_else(|| StoreError::NotFound(key.to_string()))?;
                }
                Err(StoreError::NotFound(_)) if obj.metadata.is_deleting() => return Ok(()),
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Write `status` when it differs from what the store holds.
    async fn persist(&self, obj: &mut Object, status: &ResourceStatus) -> ReconcileResult<()> {
        if status.same_as(&obj.status) {
            return Ok(());
        }
        let written = write_status(self.store.as_ref(), obj, status, self.config.status_retries).await?;
        *obj = written;
        Ok(())
    }
}

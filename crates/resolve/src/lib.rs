//! Tether reference resolution: turn a symbolic pointer at another declarative
//! record into the plain value (external id or name) that record observed.
//!
//! Resolution only reads the store. A target that does not exist yet, or has
//! not been provisioned by its own controller, is a transient condition the
//! caller retries with backoff.

#![forbid(unsafe_code)]

use std::sync::Arc;

use tether_core::kinds::Link;
use tether_core::{BoundReference, Kind, Object, Reference, ResourceStatus, Selector, StoreError};
use tether_store::Store;
use tracing::{debug, warn};

/// Pulls the plain value out of a resolved target.
pub type ExtractFn = fn(&Object) -> Option<String>;

pub mod extract {
    use tether_core::Object;

    pub fn external_id(o: &Object) -> Option<String> { o.status.external_id.clone().filter(|s| !s.is_empty()) }

    pub fn external_name(o: &Object) -> Option<String> { o.status.external_name.clone().filter(|s| !s.is_empty()) }
}

#[derive(Debug, thiserror::Error)]
pub enum ReferenceError {
    #[error("referenced {kind} {name} not found")]
    NotFound { kind: Kind, name: String },
    #[error("referenced {kind} {name} is not ready")]
    NotReady { kind: Kind, name: String },
    #[error("{kind} selector {selector} matched {matches} objects, want exactly one")]
    Ambiguous { kind: Kind, selector: String, matches: usize },
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl ReferenceError {
    /// Condition reason surfaced on the referencing object.
    pub fn reason(&self) -> &'static str {
        match self {
            ReferenceError::NotFound { .. } => "ReferenceNotFound",
            ReferenceError::NotReady { .. } => "ReferenceNotReady",
            ReferenceError::Ambiguous { .. } => "ReferenceAmbiguous",
            ReferenceError::Store(_) => "ReferenceLookupFailed",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ResolutionRequest<'a> {
    pub current_value: Option<&'a str>,
    pub reference: Option<&'a Reference>,
    pub selector: Option<&'a Selector>,
    pub target_kind: Kind,
    /// Namespace used when the reference names none; selectors search here.
    pub namespace: Option<&'a str>,
    pub extract: ExtractFn,
}

impl<'a> ResolutionRequest<'a> {
    pub fn for_link(link: &'a Link, target_kind: Kind, namespace: Option<&'a str>, extract: ExtractFn) -> Self {
        Self {
            current_value: link.value.as_deref(),
            reference: link.reference.as_ref(),
            selector: link.selector.as_ref(),
            target_kind,
            namespace,
            extract,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolutionResult {
    pub resolved_value: String,
    /// `None` when the literal current value was used.
    pub resolved_reference: Option<Reference>,
}

/// Value for a reference-carrying field after honouring any bound reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Binding {
    pub value: String,
    /// The spec now points somewhere else than the pinned target.
    pub repoint_ignored: bool,
}

#[derive(Clone)]
pub struct Resolver {
    store: Arc<dyn Store>,
}

impl Resolver {
    pub fn new(store: Arc<dyn Store>) -> Self { Self { store } }

    pub fn store(&self) -> &Arc<dyn Store> { &self.store }

    /// Fetch the object a reference points at.
    pub async fn fetch(&self, kind: Kind, r: &Reference, default_ns: Option<&str>) -> Result<Object, ReferenceError> {
        let ns = r.namespace.as_deref().or(default_ns);
        self.store
            .get(kind, &r.name, ns)
            .await?
            .ok_or_else(|| ReferenceError::NotFound { kind, name: r.name.clone() })
    }

    pub async fn resolve(&self, req: &ResolutionRequest<'_>) -> Result<ResolutionResult, ReferenceError> {
        let kind = req.target_kind;
        if let Some(r) = req.reference {
            let target = self.fetch(kind, r, req.namespace).await?;
            let value = (req.extract)(&target).ok_or_else(|| ReferenceError::NotReady { kind, name: r.name.clone() })?;
            return Ok(ResolutionResult { resolved_value: value, resolved_reference: Some(r.clone()) });
        }
        if let Some(v) = req.current_value.filter(|v| !v.is_empty()) {
            return Ok(ResolutionResult { resolved_value: v.to_string(), resolved_reference: None });
        }
        if let Some(sel) = req.selector {
            let mut hits = self.store.list(kind, req.namespace, Some(sel)).await?;
            if hits.len() != 1 {
                return Err(match hits.len() {
                    0 => ReferenceError::NotFound { kind, name: format!("selector {}", sel.to_query()) },
                    n => ReferenceError::Ambiguous { kind, selector: sel.to_query(), matches: n },
                });
            }
            let target = hits.remove(0);
            let name = target.metadata.name.clone();
            let value = (req.extract)(&target).ok_or_else(|| ReferenceError::NotReady { kind, name: name.clone() })?;
            let reference = Reference { name, namespace: target.metadata.namespace.clone() };
            return Ok(ResolutionResult { resolved_value: value, resolved_reference: Some(reference) });
        }
        Err(ReferenceError::NotFound { kind, name: "<unset>".to_string() })
    }

    /// Resolve the reference behind `field`, pinning the result in
    /// `status.bound_references`. Once the owning external resource exists the
    /// pinned value is returned without consulting the store again.
    pub async fn bind(
        &self,
        status: &mut ResourceStatus,
        field: &str,
        req: &ResolutionRequest<'_>,
    ) -> Result<Binding, ReferenceError> {
        if status.external_id.is_some() {
            if let Some(b) = status.bound_references.get(field).filter(|b| b.kind == req.target_kind) {
                let repoint_ignored = req.reference.map(|r| !b.points_at(&qualify(r, req.namespace))).unwrap_or(false);
                if repoint_ignored {
                    warn!(field, bound = %b.name, "reference changed after creation; keeping bound target");
                }
                return Ok(Binding { value: b.value.clone(), repoint_ignored });
            }
        }
        let res = self.resolve(req).await?;
        match res.resolved_reference {
            Some(r) => {
                let r = qualify(&r, req.namespace);
                debug!(field, target = %r.name, value = %res.resolved_value, "reference bound");
                status.bound_references.insert(
                    field.to_string(),
                    BoundReference { kind: req.target_kind, name: r.name, namespace: r.namespace, value: res.resolved_value.clone() },
                );
            }
            None => {
                status.bound_references.remove(field);
            }
        }
        Ok(Binding { value: res.resolved_value, repoint_ignored: false })
    }

    /// Reverse lookup: the single object of `kind` whose extracted value equals `literal`.
    pub async fn find_by_value(
        &self,
        kind: Kind,
        namespace: Option<&str>,
        extract: ExtractFn,
        literal: &str,
    ) -> Result<Reference, ReferenceError> {
        let objs = self.store.list(kind, namespace, None).await?;
        let mut hits: Vec<&Object> = objs.iter().filter(|o| extract(o).as_deref() == Some(literal)).collect();
        match hits.len() {
            0 => Err(ReferenceError::NotFound { kind, name: literal.to_string() }),
            1 => {
                let o = hits.remove(0);
                Ok(Reference { name: o.metadata.name.clone(), namespace: o.metadata.namespace.clone() })
            }
            n => Err(ReferenceError::Ambiguous { kind, selector: format!("value={}", literal), matches: n }),
        }
    }
}

/// Fill in the defaulted namespace so bound references compare stably.
fn qualify(r: &Reference, default_ns: Option<&str>) -> Reference {
    Reference { name: r.name.clone(), namespace: r.namespace.clone().or_else(|| default_ns.map(|s| s.to_string())) }
}

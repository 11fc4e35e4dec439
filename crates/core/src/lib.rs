//! Tether core types: the declarative object model shared by store, resolver,
//! reconciler and converter.

#![forbid(unsafe_code)]

pub mod config;
pub mod kinds;
pub mod status;
pub mod v1alpha1;

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

pub use config::ControllerConfig;
pub use status::{BoundReference, Condition, ConditionStatus, ConditionType, ResourceStatus};

pub const GROUP: &str = "devops.tether.dev";
/// Hub version; the store persists objects at this version.
pub const STORAGE_VERSION: &str = "v1beta1";
pub const LEGACY_VERSION: &str = "v1alpha1";
pub const FINALIZER: &str = "devops.tether.dev/external-resource";

/// Closed set of resource kinds served under [`GROUP`].
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Kind {
    TeamProject,
    GitRepository,
    Pipeline,
    PipelinePermission,
    PullRequest,
    Policy,
    Feed,
    ConnectorConfig,
}

impl Kind {
    pub const ALL: [Kind; 8] = [
        Kind::TeamProject,
        Kind::GitRepository,
        Kind::Pipeline,
        Kind::PipelinePermission,
        Kind::PullRequest,
        Kind::Policy,
        Kind::Feed,
        Kind::ConnectorConfig,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Kind::TeamProject => "TeamProject",
            Kind::GitRepository => "GitRepository",
            Kind::Pipeline => "Pipeline",
            Kind::PipelinePermission => "PipelinePermission",
            Kind::PullRequest => "PullRequest",
            Kind::Policy => "Policy",
            Kind::Feed => "Feed",
            Kind::ConnectorConfig => "ConnectorConfig",
        }
    }

    pub fn plural(self) -> &'static str {
        match self {
            Kind::TeamProject => "teamprojects",
            Kind::GitRepository => "gitrepositories",
            Kind::Pipeline => "pipelines",
            Kind::PipelinePermission => "pipelinepermissions",
            Kind::PullRequest => "pullrequests",
            Kind::Policy => "policies",
            Kind::Feed => "feeds",
            Kind::ConnectorConfig => "connectorconfigs",
        }
    }

    /// Kinds that own an external resource and get a reconciler.
    pub fn is_managed(self) -> bool { !matches!(self, Kind::ConnectorConfig) }

    pub fn managed() -> impl Iterator<Item = Kind> { Kind::ALL.into_iter().filter(|k| k.is_managed()) }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown kind: {0}")]
pub struct UnknownKind(pub String);

impl FromStr for Kind {
    type Err = UnknownKind;

    /// Accepts the kind name or its plural, case-insensitively.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Kind::ALL
            .into_iter()
            .find(|k| k.as_str().eq_ignore_ascii_case(s) || k.plural().eq_ignore_ascii_case(s))
            .ok_or_else(|| UnknownKind(s.to_string()))
    }
}

/// `group/version` for one of our versions.
pub fn api_version(version: &str) -> String { format!("{}/{}", GROUP, version) }

/// Version part of an `apiVersion` string (`group/v1` -> `v1`, `v1` -> `v1`).
pub fn version_of(api_version: &str) -> &str {
    api_version.rsplit_once('/').map(|(_, v)| v).unwrap_or(api_version)
}

/// Unit of scheduling: one declarative record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ItemKey {
    pub kind: Kind,
    pub namespace: Option<String>,
    pub name: String,
}

impl ItemKey {
    pub fn new(kind: Kind, name: impl Into<String>, namespace: Option<&str>) -> Self {
        Self { kind, namespace: namespace.map(|s| s.to_string()), name: name.into() }
    }
}

impl fmt::Display for ItemKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}/{}", self.kind, ns, self.name),
            None => write!(f, "{}/{}", self.kind, self.name),
        }
    }
}

/// Subset of Kubernetes object metadata the core reads or writes.
/// Unknown metadata fields are ignored on decode.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generation: Option<i64>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub finalizers: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deletion_timestamp: Option<DateTime<Utc>>,
}

impl ObjectMeta {
    pub fn named(name: impl Into<String>, namespace: Option<&str>) -> Self {
        Self { name: name.into(), namespace: namespace.map(|s| s.to_string()), ..Default::default() }
    }

    pub fn is_deleting(&self) -> bool { self.deletion_timestamp.is_some() }

    pub fn has_finalizer(&self, f: &str) -> bool { self.finalizers.iter().any(|x| x == f) }
}

/// A declarative record as held by the store. `spec` stays untyped here; typed
/// views come from [`Object::spec_as`] so one object type serves every kind
/// and version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Object {
    pub api_version: String,
    pub kind: Kind,
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: Json,
    #[serde(default)]
    pub status: ResourceStatus,
}

impl Object {
    /// New object at the storage version.
    pub fn new(kind: Kind, metadata: ObjectMeta, spec: Json) -> Self {
        Self { api_version: api_version(STORAGE_VERSION), kind, metadata, spec, status: ResourceStatus::default() }
    }

    pub fn key(&self) -> ItemKey {
        ItemKey { kind: self.kind, namespace: self.metadata.namespace.clone(), name: self.metadata.name.clone() }
    }

    pub fn version(&self) -> &str { version_of(&self.api_version) }

    pub fn spec_as<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> { T::deserialize(&self.spec) }

    pub fn is_ready(&self) -> bool {
        self.status.condition(ConditionType::Ready).map(|c| c.status == ConditionStatus::True).unwrap_or(false)
    }
}

/// Symbolic pointer to another declarative record of a declared kind.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Reference {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

impl Reference {
    pub fn new(name: impl Into<String>, namespace: Option<&str>) -> Self {
        Self { name: name.into(), namespace: namespace.map(|s| s.to_string()) }
    }
}

/// Label query used when the target's name is not known up front.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Selector {
    #[serde(default)]
    pub match_labels: BTreeMap<String, String>,
}

impl Selector {
    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        self.match_labels.iter().all(|(k, v)| labels.get(k) == Some(v))
    }

    /// Kubernetes label selector string (`a=b,c=d`).
    pub fn to_query(&self) -> String {
        self.match_labels.iter().map(|(k, v)| format!("{}={}", k, v)).collect::<Vec<_>>().join(",")
    }
}

/// Per-resource switches consulted before every mutating external call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManagementPolicy {
    #[serde(default = "yes")]
    pub create: bool,
    #[serde(default = "yes")]
    pub update: bool,
    #[serde(default = "yes")]
    pub delete: bool,
}

fn yes() -> bool { true }

impl Default for ManagementPolicy {
    fn default() -> Self { Self { create: true, update: true, delete: true } }
}

/// Result of comparing desired against observed external state. Never persisted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExternalObservation {
    pub resource_exists: bool,
    pub resource_up_to_date: bool,
}

impl ExternalObservation {
    pub fn missing() -> Self { Self { resource_exists: false, resource_up_to_date: false } }
    pub fn found(up_to_date: bool) -> Self { Self { resource_exists: true, resource_up_to_date: up_to_date } }
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventType {
    Normal,
    Warning,
}

/// Human-readable record attached to a declarative object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub type_: EventType,
    pub reason: String,
    pub note: String,
    pub action: String,
}

impl Event {
    pub fn normal(reason: &str, action: &str, note: impl Into<String>) -> Self {
        Self { type_: EventType::Normal, reason: reason.to_string(), note: note.into(), action: action.to_string() }
    }

    pub fn warning(reason: &str, action: &str, note: impl Into<String>) -> Self {
        Self { type_: EventType::Warning, reason: reason.to_string(), note: note.into(), action: action.to_string() }
    }
}

/// Audit sink for events. Publishing is best effort; implementations log
/// their own failures.
#[async_trait::async_trait]
pub trait EventSink: Send + Sync {
    async fn publish(&self, on: &Object, event: Event);
}

/// Sink that only logs; used when no cluster event recorder is wired.
pub struct LogEvents;

#[async_trait::async_trait]
impl EventSink for LogEvents {
    async fn publish(&self, on: &Object, event: Event) {
        match event.type_ {
            EventType::Normal => tracing::info!(key = %on.key(), reason = %event.reason, "{}", event.note),
            EventType::Warning => tracing::warn!(key = %on.key(), reason = %event.reason, "{}", event.note),
        }
    }
}

/// Opaque credential lookup. Values are passed through untouched.
#[async_trait::async_trait]
pub trait SecretSource: Send + Sync {
    async fn secret_value(&self, name: &str, namespace: Option<&str>, key: &str) -> StoreResult<Option<Vec<u8>>>;
}

pub mod prelude {
    pub use super::{
        BoundReference, Condition, ConditionStatus, ConditionType, Event, EventSink, EventType, ExternalObservation, ItemKey,
        Kind, ManagementPolicy, Object, ObjectMeta, Reference, ResourceStatus, SecretSource, Selector, StoreError,
        StoreResult,
    };
}

//! Per-kind handlers behind one closed sum type.

mod feed;
mod permission;
mod pipeline;
mod policy;
mod project;
mod pullrequest;
mod repository;

use serde::de::DeserializeOwned;
use serde_json::Value as Json;
use tether_core::kinds::{
    FeedParams, GitRepositoryParams, Link, ManagedSpec, PipelineParams, PipelinePermissionParams, PolicyParams,
    PullRequestParams, TeamProjectParams,
};
use tether_core::{ExternalObservation, Kind, ManagementPolicy, Object, Reference, ResourceStatus};
use tether_resolve::{ExtractFn, ReferenceError, ResolutionRequest, Resolver};

use crate::compare::str_field;
use crate::error::{ReconcileError, ReconcileResult};
use crate::external::{id_string, DevOpsClient, ExternalError, Locator};

pub use feed::{feed_up_to_date, Feed};
pub use permission::{authorization_in_force, PipelinePermission};
pub use pipeline::{pipeline_up_to_date, Pipeline};
pub use policy::{policy_up_to_date, Policy, POLICY_COMPARED_FIELDS, POLICY_COMPARED_SETTINGS};
pub use project::{project_up_to_date, TeamProject};
pub use pullrequest::{normalize_ref, pull_request_up_to_date, PullRequest};
pub use repository::{repository_up_to_date, GitRepository};

/// Working state of one reconcile pass. Handlers read references through it
/// and write identity and observations into `status`.
pub struct Pass<'a> {
    pub client: &'a dyn DevOpsClient,
    pub resolver: &'a Resolver,
    pub namespace: Option<&'a str>,
    pub status: ResourceStatus,
    /// Fields whose spec reference changed after creation and was ignored.
    pub repointed: Vec<String>,
}

impl<'a> Pass<'a> {
    pub fn new(client: &'a dyn DevOpsClient, resolver: &'a Resolver, namespace: Option<&'a str>, status: ResourceStatus) -> Self {
        Self { client, resolver, namespace, status, repointed: Vec::new() }
    }

    /// Resolve `link` to the target's value, pinning it under `field`.
    pub async fn bind(&mut self, field: &str, kind: Kind, link: &Link, extract: ExtractFn) -> Result<String, ReferenceError> {
        let req = ResolutionRequest::for_link(link, kind, self.namespace, extract);
        let b = self.resolver.bind(&mut self.status, field, &req).await?;
        if b.repoint_ignored && !self.repointed.iter().any(|f| f == field) {
            self.repointed.push(field.to_string());
        }
        Ok(b.value)
    }

    pub fn external_id(&self) -> Option<String> { self.status.external_id.clone().filter(|s| !s.is_empty()) }

    pub fn require_id(&self) -> ReconcileResult<String> {
        self.external_id().ok_or_else(|| ReconcileError::External(ExternalError::NotFound("external id not recorded".into())))
    }

    /// Take identity and the observed document from `doc`.
    pub fn record(&mut self, doc: &Json, id_key: &str, name_key: Option<&str>) {
        if let Some(id) = doc.get(id_key).and_then(id_string) {
            self.status.external_id = Some(id);
        }
        if let Some(name) = name_key.map(|k| str_field(doc, k)).filter(|n| !n.is_empty()) {
            self.status.external_name = Some(name.to_string());
        }
        self.status.at_provider = doc.clone();
    }

    /// Fetch by recorded id, or when none is recorded yet, find by name in the
    /// collection so an earlier half-finished create is picked up.
    pub async fn find(&self, at: &Locator, name: &str) -> Result<Option<Json>, ExternalError> {
        match self.external_id() {
            Some(id) => self.client.get(&at.collection().id(id)).await,
            None => find_named(self.client, at, name).await,
        }
    }

    /// After a create conflict: adopt the existing resource if it can be found.
    pub async fn adopt_named(&mut self, at: &Locator, name: &str, id_key: &str) -> ReconcileResult<CreateOutcome> {
        match find_named(self.client, at, name).await? {
            Some(doc) => {
                self.record(&doc, id_key, Some("name"));
                Ok(CreateOutcome::Adopted)
            }
            None => Ok(CreateOutcome::Pending),
        }
    }
}

/// First document in the collection at `at` whose name matches, ignoring case.
pub async fn find_named(client: &dyn DevOpsClient, at: &Locator, name: &str) -> Result<Option<Json>, ExternalError> {
    Ok(client.list(&at.collection()).await?.into_iter().find(|d| str_field(d, "name").eq_ignore_ascii_case(name)))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateOutcome {
    Created,
    /// The resource already existed and its id was taken over.
    Adopted,
    /// The external system reported it exists but it is not visible yet.
    Pending,
}

#[async_trait::async_trait]
pub trait ExternalResource: Send + Sync {
    async fn observe(&self, cx: &mut Pass<'_>) -> ReconcileResult<ExternalObservation>;
    async fn create(&self, cx: &mut Pass<'_>) -> ReconcileResult<CreateOutcome>;
    async fn update(&self, cx: &mut Pass<'_>) -> ReconcileResult<()>;
    async fn delete(&self, cx: &mut Pass<'_>) -> ReconcileResult<()>;
}

/// A decoded managed object: its kind-specific handler plus the common fields.
pub enum Managed {
    TeamProject(TeamProject),
    GitRepository(GitRepository),
    Pipeline(Pipeline),
    PipelinePermission(PipelinePermission),
    PullRequest(PullRequest),
    Policy(Policy),
    Feed(Feed),
}

pub struct Decoded {
    pub resource: Managed,
    pub connector: Reference,
    pub policy: ManagementPolicy,
}

fn spec<P: DeserializeOwned>(obj: &Object) -> ReconcileResult<ManagedSpec<P>> {
    obj.spec_as::<ManagedSpec<P>>().map_err(|e| ReconcileError::InvalidSpec(format!("{}: {}", obj.key(), e)))
}

impl Managed {
    pub fn decode(obj: &Object) -> ReconcileResult<Decoded> {
        macro_rules! decoded {
            ($params:ty, $variant:ident) => {{
                let s = spec::<$params>(obj)?;
                Decoded { resource: Managed::$variant($variant(s.params)), connector: s.connector_config_ref, policy: s.management_policy }
            }};
        }
        Ok(match obj.kind {
            Kind::TeamProject => decoded!(TeamProjectParams, TeamProject),
            Kind::GitRepository => decoded!(GitRepositoryParams, GitRepository),
            Kind::Pipeline => decoded!(PipelineParams, Pipeline),
            Kind::PipelinePermission => decoded!(PipelinePermissionParams, PipelinePermission),
            Kind::PullRequest => decoded!(PullRequestParams, PullRequest),
            Kind::Policy => decoded!(PolicyParams, Policy),
            Kind::Feed => decoded!(FeedParams, Feed),
            Kind::ConnectorConfig => {
                return Err(ReconcileError::InvalidSpec("ConnectorConfig is not a managed kind".into()));
            }
        })
    }

    pub fn handler(&self) -> &dyn ExternalResource {
        match self {
            Managed::TeamProject(h) => h,
            Managed::GitRepository(h) => h,
            Managed::Pipeline(h) => h,
            Managed::PipelinePermission(h) => h,
            Managed::PullRequest(h) => h,
            Managed::Policy(h) => h,
            Managed::Feed(h) => h,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tether_core::ObjectMeta;

    #[test]
    fn decode_dispatches_on_kind_and_rejects_connector_config() {
        let obj = Object::new(
            Kind::GitRepository,
            ObjectMeta::named("r", Some("ns")),
            serde_json::json!({
                "connectorConfigRef": {"name": "org"},
                "managementPolicy": {"delete": false},
                "project": {"ref": {"name": "p"}},
                "name": "svc"
            }),
        );
        let d = Managed::decode(&obj).unwrap();
        assert!(matches!(d.resource, Managed::GitRepository(_)));
        assert_eq!(d.connector.name, "org");
        assert!(!d.policy.delete);

        let cfg = Object::new(Kind::ConnectorConfig, ObjectMeta::named("org", None), serde_json::json!({}));
        assert!(matches!(Managed::decode(&cfg), Err(ReconcileError::InvalidSpec(_))));
    }

    #[test]
    fn decode_reports_malformed_spec_as_invalid() {
        let obj = Object::new(Kind::Feed, ObjectMeta::named("f", None), serde_json::json!({"name": 3}));
        assert!(matches!(Managed::decode(&obj), Err(ReconcileError::InvalidSpec(_))));
    }
}
